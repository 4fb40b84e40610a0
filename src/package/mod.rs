//! Untrusted package intake: identifiers, archive validation and
//! extraction into per-job scratch directories.

pub mod archive;
pub mod extract;

#[cfg(test)]
pub(crate) mod fixtures;

use std::path::{Path, PathBuf};

use crate::error::{Result, VerifyError};

pub use archive::ArchiveLimits;
pub use extract::{extract, ExtractSource};

/// Archive suffixes stripped when deriving a package identifier.
const ARCHIVE_SUFFIXES: &[&str] = &[".tar.gz", ".tgz", ".tar"];

/// Where the package bytes come from.
#[derive(Debug, Clone)]
pub enum PackageSource {
    /// Raw tar / tar.gz bytes, e.g. an HTTP upload body
    Archive(Vec<u8>),
    /// Archive already on disk, owned by the caller (never deleted)
    ArchiveFile(PathBuf),
    /// Unpacked directory, owned by the caller (copied, never modified)
    Directory(PathBuf),
}

/// An untrusted submission awaiting verification.
#[derive(Debug, Clone)]
pub struct Package {
    /// Name hint (upload filename or directory name), sanitized into the
    /// package identifier
    pub name: String,
    pub source: PackageSource,
}

impl Package {
    pub fn archive(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            source: PackageSource::Archive(bytes),
        }
    }

    /// Builds a package from a filesystem path: directories are copied,
    /// anything else is treated as an archive file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let meta = std::fs::metadata(path).map_err(|e| {
            VerifyError::Validation(format!("cannot read package {}: {e}", path.display()))
        })?;
        let source = if meta.is_dir() {
            PackageSource::Directory(path.to_path_buf())
        } else {
            PackageSource::ArchiveFile(path.to_path_buf())
        };
        Ok(Self { name, source })
    }

    pub fn id(&self) -> Result<String> {
        package_id(&self.name)
    }
}

/// Derives a filesystem-safe package identifier from a name hint.
///
/// Keeps `[A-Za-z0-9._-]`, maps everything else to `_`, strips archive
/// suffixes, and rejects identifiers that are empty, `.` or `..`.
pub fn package_id(name: &str) -> Result<String> {
    let trimmed = name.trim();
    let lower = trimmed.to_ascii_lowercase();
    let stem = ARCHIVE_SUFFIXES
        .iter()
        .find(|suffix| lower.ends_with(*suffix) && lower.len() > suffix.len())
        .map(|suffix| &trimmed[..trimmed.len() - suffix.len()])
        .unwrap_or(trimmed);

    let id: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if id.is_empty() || id == "." || id == ".." {
        return Err(VerifyError::Validation(format!(
            "invalid package identifier derived from '{name}'"
        )));
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_package_id_keeps_safe_chars() {
        assert_eq!(package_id("my-skill_v1.2").unwrap(), "my-skill_v1.2");
    }

    #[test]
    fn test_package_id_strips_archive_suffix() {
        assert_eq!(package_id("weather.tar.gz").unwrap(), "weather");
        assert_eq!(package_id("weather.TGZ").unwrap(), "weather");
        assert_eq!(package_id("weather.tar").unwrap(), "weather");
    }

    #[test]
    fn test_package_id_replaces_unsafe_chars() {
        assert_eq!(package_id("a/b c$(x)").unwrap(), "a_b_c__x_");
        assert_eq!(package_id("../../etc").unwrap(), ".._.._etc");
    }

    #[test]
    fn test_package_id_rejects_dot_names() {
        assert!(package_id("").is_err());
        assert!(package_id("   ").is_err());
        assert!(package_id(".").is_err());
        assert!(package_id("..").is_err());
        // Suffix stripping must not smuggle in a parent reference
        assert!(package_id("...tar").is_err());
    }

    #[test]
    fn test_suffix_alone_is_not_stripped() {
        assert_eq!(package_id(".tar").unwrap(), ".tar");
    }

    #[test]
    fn test_from_path_detects_directory() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = Package::from_path(dir.path()).unwrap();
        assert!(matches!(pkg.source, PackageSource::Directory(_)));

        let file = dir.path().join("skill.tar");
        std::fs::write(&file, b"").unwrap();
        let pkg = Package::from_path(&file).unwrap();
        assert!(matches!(pkg.source, PackageSource::ArchiveFile(_)));
        assert_eq!(pkg.id().unwrap(), "skill");
    }

    #[test]
    fn test_from_path_missing_is_validation_error() {
        let err = Package::from_path(Path::new("/nonexistent/skill.tar")).unwrap_err();
        assert!(matches!(err, VerifyError::Validation(_)));
    }
}
