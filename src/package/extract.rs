/// Package extraction into a scoped working directory.
///
/// Archives are validated first (nothing touches the disk until the
/// table of contents passed), then every entry's destination is checked
/// against the canonical root again while unpacking. A final walk audits
/// symlinks that may exist regardless of how the tree was produced.
///
/// On any failure the destination directory is removed.
use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use super::archive::{
    check_entry_path, check_entry_type, open_archive, validate_archive, ArchiveLimits,
    EntryCounter,
};
use crate::error::{Result, VerifyError};
use crate::manifest::MANIFEST_FILE;

/// Input to [`extract`].
#[derive(Debug, Clone, Copy)]
pub enum ExtractSource<'a> {
    Archive(&'a Path),
    /// A directory to copy. It must neither contain nor sit inside any of
    /// the `protected` paths (the verifier's own storage roots).
    Directory {
        path: &'a Path,
        protected: &'a [PathBuf],
    },
}

/// Materializes a package under `dest` and returns the package root
/// (either `dest` or its single wrapping sub-directory).
pub fn extract(source: ExtractSource<'_>, dest: &Path, limits: &ArchiveLimits) -> Result<PathBuf> {
    let outcome = match source {
        ExtractSource::Archive(path) => unpack_archive(path, dest, limits),
        ExtractSource::Directory { path, protected } => {
            copy_directory(path, dest, protected, limits)
        }
    }
    .and_then(|()| audit_symlinks(dest));

    if let Err(e) = outcome {
        remove_partial(dest);
        return Err(e);
    }
    find_package_root(dest)
}

fn unpack_archive(archive_path: &Path, dest: &Path, limits: &ArchiveLimits) -> Result<()> {
    // Metadata pass first: a rejected archive never creates `dest`
    let summary = validate_archive(archive_path, limits)?;
    debug!(
        "Archive validated: {} entries, {} bytes",
        summary.entries, summary.total_bytes
    );

    fs::create_dir_all(dest)?;
    let root = dest.canonicalize()?;

    // The archive is read a second time; re-apply every check so a file
    // swapped between the two passes gains nothing.
    let mut archive = open_archive(archive_path)?;
    let mut counter = EntryCounter::new(*limits);
    for entry in archive.entries().map_err(malformed)? {
        let mut entry = entry.map_err(malformed)?;
        let relative = entry.path().map_err(malformed)?.into_owned();
        let name = relative.display().to_string();
        let kind = entry.header().entry_type();

        check_entry_type(&name, kind)?;
        check_entry_path(&relative)?;
        counter.add(&name, entry.size())?;
        if kind.is_pax_global_extensions() || kind.is_pax_local_extensions() {
            continue;
        }

        if let Some(parent) = relative.parent().filter(|p| !p.as_os_str().is_empty()) {
            let parent = root.join(parent);
            fs::create_dir_all(&parent)?;
            ensure_contained(&root, &parent.canonicalize()?, &name)?;
        }

        let unpacked = entry
            .unpack_in(&root)
            .map_err(|e| VerifyError::Validation(format!("archive entry '{name}': {e}")))?;
        if !unpacked {
            return Err(VerifyError::Validation(format!(
                "archive entry '{name}': escapes the extraction root"
            )));
        }
    }
    Ok(())
}

fn copy_directory(
    src: &Path,
    dest: &Path,
    protected: &[PathBuf],
    limits: &ArchiveLimits,
) -> Result<()> {
    let src_root = src.canonicalize().map_err(|e| {
        VerifyError::Validation(format!("cannot read package {}: {e}", src.display()))
    })?;
    check_not_overlapping(&src_root, protected)?;
    fs::create_dir_all(dest)?;

    let mut counter = EntryCounter::new(*limits);
    for entry in WalkDir::new(&src_root).follow_links(false).min_depth(1) {
        let entry = entry.map_err(|e| VerifyError::Validation(format!("cannot walk package: {e}")))?;
        let relative = entry
            .path()
            .strip_prefix(&src_root)
            .map_err(|e| VerifyError::Infrastructure(e.to_string()))?;
        let name = relative.display().to_string();
        let file_type = entry.file_type();
        let unreadable =
            |e: std::io::Error| VerifyError::Validation(format!("package entry '{name}': {e}"));

        if file_type.is_symlink() {
            return Err(VerifyError::Validation(format!(
                "package entry '{name}': links are not allowed"
            )));
        }

        let target = dest.join(relative);
        if file_type.is_dir() {
            counter.add(&name, 0)?;
            fs::create_dir_all(&target).map_err(unreadable)?;
        } else if file_type.is_file() {
            let size = entry
                .metadata()
                .map_err(|e| VerifyError::Validation(format!("package entry '{name}': {e}")))?
                .len();
            counter.add(&name, size)?;
            fs::copy(entry.path(), &target).map_err(unreadable)?;
        } else {
            return Err(VerifyError::Validation(format!(
                "package entry '{name}': unsupported file type"
            )));
        }
    }
    Ok(())
}

/// A package directory may not hold the verifier's storage, and may not
/// live inside it. Paths that do not exist yet cannot overlap.
fn check_not_overlapping(src_root: &Path, protected: &[PathBuf]) -> Result<()> {
    for path in protected {
        let Ok(path) = path.canonicalize() else {
            continue;
        };
        if path.starts_with(src_root) || src_root.starts_with(&path) {
            warn!(
                "Rejecting package {}: overlaps storage {}",
                src_root.display(),
                path.display()
            );
            return Err(VerifyError::Validation(format!(
                "package directory {} overlaps verifier storage {}",
                src_root.display(),
                path.display()
            )));
        }
    }
    Ok(())
}

/// Rejects any symlink under `root` whose target resolves outside it.
pub fn audit_symlinks(root: &Path) -> Result<()> {
    let root = root.canonicalize()?;
    for entry in WalkDir::new(&root).follow_links(false) {
        let entry = entry.map_err(|e| VerifyError::Validation(format!("cannot walk package: {e}")))?;
        if !entry.path_is_symlink() {
            continue;
        }

        let link = entry.path();
        let target = fs::read_link(link)?;
        let base = link.parent().unwrap_or(&root);
        let lexical = normalize(&base.join(&target));
        // Follow chains when the target exists; dangling links are judged lexically
        let resolved = lexical.canonicalize().unwrap_or(lexical);

        if !resolved.starts_with(&root) {
            let name = link.strip_prefix(&root).unwrap_or(link).display().to_string();
            warn!("Rejecting symlink {name} -> {}", target.display());
            return Err(VerifyError::Validation(format!(
                "symlink '{name}' points outside the package root"
            )));
        }
    }
    Ok(())
}

/// Resolves `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn ensure_contained(root: &Path, resolved: &Path, name: &str) -> Result<()> {
    if resolved.starts_with(root) {
        Ok(())
    } else {
        Err(VerifyError::Validation(format!(
            "archive entry '{name}': escapes the extraction root"
        )))
    }
}

/// Archives commonly wrap everything in one top-level folder.
fn find_package_root(dest: &Path) -> Result<PathBuf> {
    if dest.join(MANIFEST_FILE).is_file() {
        return Ok(dest.to_path_buf());
    }
    let entries: Vec<fs::DirEntry> = fs::read_dir(dest)?.collect::<std::io::Result<_>>()?;
    match entries.as_slice() {
        [only] if only.file_type()?.is_dir() => Ok(only.path()),
        _ => Ok(dest.to_path_buf()),
    }
}

fn remove_partial(dest: &Path) {
    match fs::remove_dir_all(dest) {
        Ok(()) => debug!("Removed partial extraction at {}", dest.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial extraction {}: {e}", dest.display()),
    }
}

fn malformed(e: std::io::Error) -> VerifyError {
    VerifyError::Validation(format!("malformed archive: {e}"))
}
