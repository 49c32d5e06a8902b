//! Durable storage backends behind the cache tiers.
//!
//! - `DurableStore`: small items, synchronous access, strict byte quota
//! - `LargeItemStore`: larger items, asynchronous access
//!
//! Each trait has a file-backed implementation for real deployments and an
//! in-memory one for tests and for platforms without a writable disk.

pub mod durable;
pub mod large;

pub use durable::{DurableStore, FileStore, MemoryStore};
pub use large::{FileLargeStore, LargeItemStore, MemoryLargeStore};

/// File extension for stored records
const RECORD_EXTENSION: &str = "json";

/// Turn a store key into a portable file name.
/// Anything outside `[A-Za-z0-9_-]` is percent-encoded, so `.` never appears
/// in the stem and the mapping is reversible.
pub(crate) fn encode_file_name(key: &str) -> String {
    let mut name = String::with_capacity(key.len() + RECORD_EXTENSION.len() + 1);
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            name.push(byte as char);
        } else {
            name.push_str(&format!("%{:02X}", byte));
        }
    }
    name.push('.');
    name.push_str(RECORD_EXTENSION);
    name
}

/// Inverse of [`encode_file_name`]. Returns `None` for files we did not write.
pub(crate) fn decode_file_name(name: &str) -> Option<String> {
    let stem = name.strip_suffix(RECORD_EXTENSION)?.strip_suffix('.')?;
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = stem.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_encoding() {
        assert_eq!(encode_file_name("users:0af3"), "users%3A0af3.json");
        assert_eq!(
            decode_file_name("users%3A0af3.json").as_deref(),
            Some("users:0af3")
        );
        assert_eq!(
            decode_file_name(&encode_file_name("cours/é.x")).as_deref(),
            Some("cours/é.x")
        );
    }

    #[test]
    fn test_foreign_files_ignored() {
        assert_eq!(decode_file_name("notes.txt"), None);
        assert_eq!(decode_file_name("bad%4.json"), None);
    }
}
