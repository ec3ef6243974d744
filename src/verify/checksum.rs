//! Streaming SHA-256 verification.

use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::core::errors::{DeployError, Result};

const READ_CHUNK: usize = 64 * 1024;

/// Outcome of the checksum gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChecksumOutcome {
    /// No expected digest configured for the entry.
    Skipped,
    Verified { digest: String },
}

/// Hex SHA-256 of a file, read in fixed-size chunks.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path).map_err(|source| DeployError::io(path, source))?;
    let mut reader = BufReader::with_capacity(READ_CHUNK, file);
    let mut hasher = Sha256::new();
    let mut buf = vec![0_u8; READ_CHUNK];
    loop {
        let n = reader
            .read(&mut buf)
            .map_err(|source| DeployError::io(path, source))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex_encode(&hasher.finalize()))
}

/// Compare the file's digest against `expected`, ignoring case and surrounding whitespace.
pub fn verify_checksum(path: &Path, expected: Option<&str>) -> Result<ChecksumOutcome> {
    let Some(expected) = expected.map(str::trim).filter(|e| !e.is_empty()) else {
        return Ok(ChecksumOutcome::Skipped);
    };
    let actual = sha256_file(path)?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(ChecksumOutcome::Verified { digest: actual })
    } else {
        Err(DeployError::ChecksumMismatch {
            expected: expected.to_ascii_lowercase(),
            actual,
        })
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
            let _ = write!(s, "{b:02x}");
            s
        })
}
