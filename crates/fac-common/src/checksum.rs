//! Checksum utilities for run artifacts
//!
//! Digests are computed by streaming the input, so multi-gigabyte merged
//! outputs can be fingerprinted without loading them.

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

const READ_BUFFER_BYTES: usize = 64 * 1024;

/// Hex SHA-256 of a file
pub fn compute_file_sha256(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    compute_sha256(&mut file)
}

/// Hex SHA-256 of any readable source
pub fn compute_sha256<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER_BYTES];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}
