use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;

use sha2::{Digest, Sha256};

const CHUNK: usize = 64 * 1024;

/// Content fingerprint of a file: lowercase hex SHA-256, streamed in 64KB chunks.
/// Stable across renames and moves, changes with any content change.
pub fn fingerprint_file(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::with_capacity(CHUNK, File::open(path)?);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Fingerprint of an in-memory buffer, identical to [`fingerprint_file`] on the same bytes.
pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}
