//! Helpers for building small tar streams in tests.
//!
//! Entries carry a fixed mtime and the current process's IDs, so trees
//! unpacked by an unprivileged test process stat back exactly as described.

use std::io::Write;

use crate::layers::WHITEOUT_PREFIX;

/// Fixed timestamp used by all test entries.
pub const TEST_MTIME: u64 = 1_700_000_000;

pub struct TestEntry {
    pub path: String,
    pub data: Vec<u8>,
    pub header: tar::Header,
}

fn base_header(entry_type: tar::EntryType, mode: u32, size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_size(size);
    header.set_mtime(TEST_MTIME);
    header.set_uid(u64::from(rustix::process::geteuid().as_raw()));
    header.set_gid(u64::from(rustix::process::getegid().as_raw()));
    header
}

pub fn file_entry(path: &str, data: &[u8], mode: u32) -> TestEntry {
    TestEntry {
        path: path.to_string(),
        data: data.to_vec(),
        header: base_header(tar::EntryType::Regular, mode, data.len() as u64),
    }
}

pub fn dir_entry(path: &str, mode: u32) -> TestEntry {
    TestEntry {
        path: format!("{path}/"),
        data: Vec::new(),
        header: base_header(tar::EntryType::Directory, mode, 0),
    }
}

/// A whiteout for `path`: deletes it from lower layers when applied.
pub fn whiteout_entry(path: &str) -> TestEntry {
    let (dir, name) = match path.rsplit_once('/') {
        Some((dir, name)) => (format!("{dir}/"), name),
        None => (String::new(), path),
    };
    file_entry(&format!("{dir}{WHITEOUT_PREFIX}{name}"), b"", 0o644)
}

/// Serialize entries into one tar stream.
pub fn tar_bytes(entries: &[TestEntry]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for entry in entries {
        let mut header = entry.header.clone();
        builder
            .append_data(&mut header, &entry.path, &entry.data[..])
            .expect("appending tar entry");
    }
    let mut out = builder.into_inner().expect("finishing tar stream");
    out.flush().expect("flushing tar stream");
    out
}
