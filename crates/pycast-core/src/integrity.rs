//! CRC-32 integrity verification for received files.
//!
//! The sender computes a CRC-32 (IEEE, seeded at 0) over the whole
//! file up front and carries it in the metadata record; the receiver
//! recomputes the same checksum over the reassembled bytes and
//! compares. Both sides stream through the file in fixed-size chunks
//! rather than holding it all in memory at once.

use std::io::Read;
use std::path::Path;

/// Size of each streaming read when hashing a file from disk.
const READ_CHUNK: usize = 64 * 1024;

/// Incremental CRC-32 hasher. Thin wrapper so call sites read the same
/// way regardless of which checksum algorithm backs them.
#[derive(Default)]
pub struct Hasher(crc32fast::Hasher);

impl Hasher {
    pub fn new() -> Self {
        Self(crc32fast::Hasher::new())
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    pub fn finalize(self) -> u32 {
        self.0.finalize()
    }
}

/// Compute the CRC-32 of a file's contents by streaming it in
/// `READ_CHUNK`-sized reads.
pub fn hash_file(path: &Path) -> std::io::Result<u32> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Hasher::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}
