//! `SKILL.md` manifest parsing.
//!
//! The manifest is the only wire contract with package authors: a
//! `---`-delimited block of `key: value` lines at the top of `SKILL.md`.
//! Parsing is pure text processing; nothing in the manifest is executed
//! here, and unknown keys are kept as opaque metadata.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VerifyError};

/// Fixed manifest filename at the package root.
pub const MANIFEST_FILE: &str = "SKILL.md";

/// Base environment used when the manifest does not name one.
pub const DEFAULT_BASE_ENVIRONMENT: &str = "alpine";

/// Test command used when the manifest does not declare one (no-op success).
pub const DEFAULT_TEST_COMMAND: &str = "true";

const DELIMITER: &str = "---";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub name: String,
    pub version: String,
    pub base_environment: String,
    pub setup_command: Option<String>,
    pub test_command: String,
    pub description: Option<String>,
    /// Keys this parser does not understand, preserved verbatim
    pub metadata: BTreeMap<String, String>,
}

/// The part of a manifest that is kept in job records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestSummary {
    pub name: String,
    pub version: String,
    pub base_environment: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Manifest {
    pub fn summary(&self) -> ManifestSummary {
        ManifestSummary {
            name: self.name.clone(),
            version: self.version.clone(),
            base_environment: self.base_environment.clone(),
            description: self.description.clone(),
        }
    }
}

/// Reads and parses `SKILL.md` from a package root.
pub fn load_manifest(package_root: &Path) -> Result<Manifest> {
    let path = package_root.join(MANIFEST_FILE);
    if !path.is_file() {
        return Err(VerifyError::Validation(format!(
            "no manifest found ({MANIFEST_FILE} missing)"
        )));
    }
    let content = std::fs::read_to_string(&path)
        .map_err(|e| VerifyError::Validation(format!("unreadable {MANIFEST_FILE}: {e}")))?;
    parse_manifest(&content)
}

/// Parses the header block of a manifest document.
pub fn parse_manifest(content: &str) -> Result<Manifest> {
    let fields = header_fields(content)
        .ok_or_else(|| VerifyError::Validation("no manifest found".to_string()))?;

    let mut name = None;
    let mut version = None;
    let mut base_environment = None;
    let mut setup_command = None;
    let mut test_command = None;
    let mut description = None;
    let mut metadata = BTreeMap::new();

    for (key, value) in fields {
        match normalize_key(&key).as_str() {
            "name" => name = non_empty(value),
            "version" => version = non_empty(value),
            "baseenvironment" => base_environment = non_empty(value),
            "setupcommand" => setup_command = non_empty(value),
            "testcommand" => test_command = non_empty(value),
            "description" => description = non_empty(value),
            _ => {
                metadata.insert(key, value);
            }
        }
    }

    let missing: Vec<&str> = [("name", name.is_none()), ("version", version.is_none())]
        .into_iter()
        .filter_map(|(field, absent)| absent.then_some(field))
        .collect();
    if !missing.is_empty() {
        return Err(VerifyError::Validation(format!(
            "manifest missing required field(s): {}",
            missing.join(", ")
        )));
    }

    Ok(Manifest {
        name: name.unwrap_or_default(),
        version: version.unwrap_or_default(),
        base_environment: base_environment
            .unwrap_or_else(|| DEFAULT_BASE_ENVIRONMENT.to_string()),
        setup_command,
        test_command: test_command.unwrap_or_else(|| DEFAULT_TEST_COMMAND.to_string()),
        description,
        metadata,
    })
}

/// Extracts `key: value` pairs from the leading `---` block.
/// Returns `None` when the block is absent or never closed.
fn header_fields(content: &str) -> Option<Vec<(String, String)>> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let mut lines = content.lines().skip_while(|l| l.trim().is_empty());

    if lines.next()?.trim() != DELIMITER {
        return None;
    }

    let mut fields = Vec::new();
    for line in lines {
        let trimmed = line.trim();
        if trimmed == DELIMITER {
            return Some(fields);
        }
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = trimmed.split_once(':') {
            let key = key.trim();
            if !key.is_empty() {
                fields.push((key.to_string(), unquote(value.trim()).to_string()));
            }
        }
    }
    None
}

/// `baseEnvironment`, `base_environment` and `base-environment` are one key.
fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

fn non_empty(value: String) -> Option<String> {
    let value = value.trim().to_string();
    (!value.is_empty()).then_some(value)
}
