//! In-memory tar fixtures shared by package and orchestrator tests.

use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;

pub fn manifest(name: &str, version: &str, test_command: &str) -> String {
    format!("---\nname: {name}\nversion: {version}\ntestCommand: {test_command}\n---\n\n# {name}\n")
}

/// Builds a tar archive from `(path, contents)` pairs.
pub fn tar_of(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        builder.append_data(&mut header, path, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

pub fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}

/// Builds a tar with one entry whose name bytes are written verbatim,
/// bypassing the path checks `tar::Builder` applies.
pub fn tar_with_raw_name(name: &[u8], data: &[u8]) -> Vec<u8> {
    let mut header = tar::Header::new_old();
    header.as_old_mut().name[..name.len()].copy_from_slice(name);
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder.append(&header, data).unwrap();
    builder.into_inner().unwrap()
}

/// Builds a tar holding a single link entry.
pub fn tar_with_link(kind: tar::EntryType, name: &str, target: &str) -> Vec<u8> {
    let mut header = tar::Header::new_gnu();
    header.set_size(0);
    header.set_mode(0o777);
    header.set_entry_type(kind);
    header.set_link_name(target).unwrap();

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, name, std::io::empty()).unwrap();
    builder.into_inner().unwrap()
}

/// A minimal valid package: manifest plus a test script.
pub fn valid_package(test_command: &str) -> Vec<u8> {
    let manifest = manifest("t", "1.0.0", test_command);
    tar_of(&[
        ("SKILL.md", manifest.as_bytes()),
        ("test.sh", b"echo ok\n"),
    ])
}
