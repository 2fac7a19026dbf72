//! BLAKE3 content fingerprints.
//!
//! The digest covers the exact bytes that go over the wire for a path:
//! the preprocessed representation when a file matches a preprocess
//! mask, the raw file bytes otherwise. Hex form, stable across runs and
//! platforms.

use berth_core::error::DeployResult;
use std::io::Read;
use std::path::Path;

/// Hash a byte slice in memory.
pub fn hash_bytes(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Hash a file from disk through the streaming interface.
pub fn hash_file(path: &Path) -> DeployResult<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}
