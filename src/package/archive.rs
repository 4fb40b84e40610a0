/// Archive validation: inspects a tar / tar.gz table of contents
/// without writing anything to disk.
///
/// Every check here works from the archive's own per-entry headers, so a
/// bomb is rejected before the first byte is extracted.
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Component, Path};

use flate2::read::GzDecoder;
use tar::EntryType;
use tracing::debug;

use crate::error::{Result, VerifyError};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Caps applied to a package before extraction.
#[derive(Debug, Clone, Copy)]
pub struct ArchiveLimits {
    pub max_entries: usize,
    pub max_unpacked_bytes: u64,
}

impl From<&crate::config::LimitsConfig> for ArchiveLimits {
    fn from(limits: &crate::config::LimitsConfig) -> Self {
        Self {
            max_entries: limits.max_entries,
            max_unpacked_bytes: limits.max_unpacked_bytes,
        }
    }
}

/// What a successful validation saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub entries: usize,
    pub total_bytes: u64,
}

/// Opens a tar archive, transparently decompressing gzip input.
pub(crate) fn open_archive(path: &Path) -> Result<tar::Archive<Box<dyn Read>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let is_gzip = reader.fill_buf()?.starts_with(&GZIP_MAGIC);
    let reader: Box<dyn Read> = if is_gzip {
        Box::new(GzDecoder::new(reader))
    } else {
        Box::new(reader)
    };
    Ok(tar::Archive::new(reader))
}

/// Validates an archive's metadata. Never extracts.
pub fn validate_archive(path: &Path, limits: &ArchiveLimits) -> Result<ArchiveSummary> {
    let mut archive = open_archive(path)?;
    let mut counter = EntryCounter::new(*limits);

    for entry in archive.entries().map_err(malformed)? {
        let entry = entry.map_err(malformed)?;
        let entry_path = entry.path().map_err(malformed)?.into_owned();
        let name = entry_path.display().to_string();

        check_entry_type(&name, entry.header().entry_type())?;
        check_entry_path(&entry_path)?;
        counter.add(&name, entry.size())?;
        debug!("Archive entry ok: {name} ({} bytes)", entry.size());
    }

    Ok(counter.summary())
}

/// Running entry-count and cumulative-size totals.
pub(crate) struct EntryCounter {
    limits: ArchiveLimits,
    entries: usize,
    total_bytes: u64,
}

impl EntryCounter {
    pub(crate) fn new(limits: ArchiveLimits) -> Self {
        Self {
            limits,
            entries: 0,
            total_bytes: 0,
        }
    }

    pub(crate) fn add(&mut self, name: &str, size: u64) -> Result<()> {
        self.entries += 1;
        if self.entries > self.limits.max_entries {
            return Err(VerifyError::Validation(format!(
                "archive entry '{name}': too many entries (max {})",
                self.limits.max_entries
            )));
        }
        self.total_bytes = self.total_bytes.saturating_add(size);
        if self.total_bytes > self.limits.max_unpacked_bytes {
            return Err(VerifyError::Validation(format!(
                "archive entry '{name}': unpacked size exceeds {} bytes",
                self.limits.max_unpacked_bytes
            )));
        }
        Ok(())
    }

    pub(crate) fn summary(&self) -> ArchiveSummary {
        ArchiveSummary {
            entries: self.entries,
            total_bytes: self.total_bytes,
        }
    }
}

/// Only regular files and directories may be extracted.
pub(crate) fn check_entry_type(name: &str, kind: EntryType) -> Result<()> {
    match kind {
        EntryType::Regular
        | EntryType::Continuous
        | EntryType::Directory
        | EntryType::XGlobalHeader
        | EntryType::XHeader => Ok(()),
        EntryType::Symlink | EntryType::Link => Err(VerifyError::Validation(format!(
            "archive entry '{name}': links are not allowed"
        ))),
        other => Err(VerifyError::Validation(format!(
            "archive entry '{name}': unsupported entry type {other:?}"
        ))),
    }
}

/// Rejects absolute paths and `..` traversal.
pub(crate) fn check_entry_path(path: &Path) -> Result<()> {
    for component in path.components() {
        match component {
            Component::RootDir | Component::Prefix(_) => {
                return Err(VerifyError::Validation(format!(
                    "archive entry '{}': absolute paths are not allowed",
                    path.display()
                )));
            }
            Component::ParentDir => {
                return Err(VerifyError::Validation(format!(
                    "archive entry '{}': path traversal is not allowed",
                    path.display()
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }
    Ok(())
}

fn malformed(e: std::io::Error) -> VerifyError {
    VerifyError::Validation(format!("malformed archive: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::fixtures::*;

    const LIMITS: ArchiveLimits = ArchiveLimits {
        max_entries: 10,
        max_unpacked_bytes: 1024,
    };

    fn write_archive(bytes: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.tar");
        std::fs::write(&path, bytes).unwrap();
        (dir, path)
    }

    fn validation_message(result: Result<ArchiveSummary>) -> String {
        match result {
            Err(VerifyError::Validation(msg)) => msg,
            other => panic!("Expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_valid_archive_summary() {
        let (_dir, path) = write_archive(&tar_of(&[("a.txt", b"hello"), ("b/c.txt", b"world!")]));
        let summary = validate_archive(&path, &LIMITS).unwrap();
        assert_eq!(summary.entries, 2);
        assert_eq!(summary.total_bytes, 11);
    }

    #[test]
    fn test_gzip_archive_is_detected() {
        let (_dir, path) = write_archive(&gzip(&tar_of(&[("a.txt", b"hello")])));
        let summary = validate_archive(&path, &LIMITS).unwrap();
        assert_eq!(summary.entries, 1);
    }

    #[test]
    fn test_rejects_too_many_entries() {
        let names: Vec<String> = (0..11).map(|i| format!("f{i}.txt")).collect();
        let files: Vec<(&str, &[u8])> = names.iter().map(|n| (n.as_str(), &b"x"[..])).collect();
        let (_dir, path) = write_archive(&tar_of(&files));

        let msg = validation_message(validate_archive(&path, &LIMITS));
        assert!(msg.contains("too many entries"));
        assert!(msg.contains("f10.txt"));
    }

    #[test]
    fn test_rejects_cumulative_size_over_cap() {
        let chunk = vec![b'a'; 600];
        let (_dir, path) = write_archive(&tar_of(&[("one.bin", chunk.as_slice()), ("two.bin", chunk.as_slice())]));

        let msg = validation_message(validate_archive(&path, &LIMITS));
        assert!(msg.contains("two.bin"));
        assert!(msg.contains("unpacked size"));
    }

    #[test]
    fn test_rejects_parent_traversal() {
        let (_dir, path) = write_archive(&tar_with_raw_name(b"../../etc/passwd", b"root"));
        let msg = validation_message(validate_archive(&path, &LIMITS));
        assert!(msg.contains("traversal"));
        assert!(msg.contains("../../etc/passwd"));
    }

    #[test]
    fn test_rejects_absolute_path() {
        let (_dir, path) = write_archive(&tar_with_raw_name(b"/etc/passwd", b"root"));
        let msg = validation_message(validate_archive(&path, &LIMITS));
        assert!(msg.contains("absolute"));
    }

    #[test]
    fn test_rejects_symlink_entry() {
        let (_dir, path) =
            write_archive(&tar_with_link(tar::EntryType::Symlink, "readme.md", "/etc/shadow"));
        let msg = validation_message(validate_archive(&path, &LIMITS));
        assert!(msg.contains("links are not allowed"));
        assert!(msg.contains("readme.md"));
    }

    #[test]
    fn test_rejects_hard_link_entry() {
        let (_dir, path) =
            write_archive(&tar_with_link(tar::EntryType::Link, "copy", "original"));
        let msg = validation_message(validate_archive(&path, &LIMITS));
        assert!(msg.contains("links are not allowed"));
    }

    #[test]
    fn test_rejects_garbage_input() {
        let (_dir, path) = write_archive(&[0xffu8; 1024]);
        assert!(validate_archive(&path, &LIMITS).is_err());
    }

    #[test]
    fn test_check_entry_type_rejects_devices() {
        assert!(check_entry_type("dev", EntryType::Char).is_err());
        assert!(check_entry_type("dev", EntryType::Block).is_err());
        assert!(check_entry_type("pipe", EntryType::Fifo).is_err());
        assert!(check_entry_type("dir", EntryType::Directory).is_ok());
    }

    #[test]
    fn test_check_entry_path_allows_dot_segments() {
        assert!(check_entry_path(Path::new("./src/main.py")).is_ok());
        assert!(check_entry_path(Path::new("src/../../x")).is_err());
    }
}
