use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{ErrorKind, ReplicationError};
use crate::transfer::helpers::display_path;

const HASH_BUF: usize = 64 * 1024;

/// Lowercase hex SHA-256 of a file's contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

pub fn fingerprint_reader<R: Read>(mut reader: R) -> std::io::Result<Fingerprint> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(Fingerprint(to_hex(&hasher.finalize())))
}

/// Stream `path` through SHA-256.
///
/// A missing file is `Exist`, any other open failure `Open`, and a failure
/// while reading `Hash`.
pub fn fingerprint(path: &Path) -> Result<Fingerprint, ReplicationError> {
    let file = File::open(path).map_err(|e| {
        let kind =
            if e.kind() == std::io::ErrorKind::NotFound { ErrorKind::Exist } else { ErrorKind::Open };
        ReplicationError::io(kind, format!("cannot fingerprint {}", display_path(path)), e)
    })?;
    fingerprint_reader(file).map_err(|e| {
        ReplicationError::io(ErrorKind::Hash, format!("failed to hash {}", display_path(path)), e)
    })
}

/// Both digests known and equal.
pub fn digests_match(a: Option<&Fingerprint>, b: Option<&Fingerprint>) -> bool {
    matches!((a, b), (Some(x), Some(y)) if x == y)
}
