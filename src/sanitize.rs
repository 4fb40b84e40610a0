//! Static validation of manifest-declared commands.
//!
//! A command must be a single simple invocation: no pipelines, no
//! subshells, no redirections, nothing outside a small character set,
//! and none of the programs on the denylist. The accepted text is split
//! into a [`SafeCommand`] (program + argv) that is handed to the sandbox
//! runtime without ever going through a shell.
//!
//! The denylist is keyword-based and cannot be complete against
//! obfuscation; isolation is enforced by the sandbox runtime.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, VerifyError};

/// Shell metacharacters rejected even though some would otherwise be
/// harmless as plain bytes.
const SHELL_OPERATORS: &[char] = &[';', '&', '|', '`', '$', '(', ')', '{', '}', '<', '>', '!', '#'];

/// Punctuation allowed besides alphanumerics and blanks.
const ALLOWED_PUNCTUATION: &[char] = &['-', '_', '.', '/', '=', ',', ':', '"', '\'', '[', ']'];

/// Programs that may not appear anywhere in a command.
const DENIED_PROGRAMS: &[&str] = &[
    // network
    "curl", "wget", "nc", "ssh", "scp", "rsync",
    // privilege / ownership
    "chmod", "chown", "sudo", "su",
    // destructive / system
    "mount", "dd", "mkfs", "kill", "reboot",
];

/// A validated command: an executable and its arguments, never a shell string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafeCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl SafeCommand {
    /// Program followed by its arguments.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

impl std::fmt::Display for SafeCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.argv().join(" "))
    }
}

/// Returns the command unchanged if it passes every check.
pub fn sanitize_command(command: &str) -> Result<&str> {
    if command.trim().is_empty() {
        return Err(reject(command, "empty command".to_string()));
    }

    if command.contains("&&") || command.contains("||") {
        return Err(reject(command, "shell operator '&&'/'||' is not allowed".to_string()));
    }
    if let Some(op) = command.chars().find(|c| SHELL_OPERATORS.contains(c)) {
        return Err(reject(command, format!("shell operator '{op}' is not allowed")));
    }

    if let Some(bad) = command.chars().find(|c| !is_allowed_char(*c)) {
        return Err(reject(
            command,
            format!("character {bad:?} is not allowed"),
        ));
    }

    let lower = command.to_lowercase();
    if let Some(word) = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .find(|word| DENIED_PROGRAMS.contains(word))
    {
        return Err(reject(command, format!("program '{word}' is not allowed")));
    }

    Ok(command)
}

/// Sanitizes a command and splits it into program + arguments.
pub fn parse_command(command: &str) -> Result<SafeCommand> {
    let command = sanitize_command(command)?;
    let mut tokens = tokenize(command)
        .map_err(|reason| reject(command, reason.to_string()))?
        .into_iter();

    let program = tokens
        .next()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| reject(command, "missing program".to_string()))?;

    Ok(SafeCommand {
        program,
        args: tokens.collect(),
    })
}

fn is_allowed_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == ' ' || c == '\t' || ALLOWED_PUNCTUATION.contains(&c)
}

/// Splits on blanks, honoring single and double quotes. No escapes:
/// backslash never passes the character allowlist.
fn tokenize(command: &str) -> std::result::Result<Vec<String>, &'static str> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;

    for c in command.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_token = true;
            }
            None if c == ' ' || c == '\t' => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if quote.is_some() {
        return Err("unbalanced quote");
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

fn reject(command: &str, reason: String) -> VerifyError {
    warn!("Rejected command {command:?}: {reason}");
    VerifyError::Validation(format!("command rejected: {reason}"))
}
