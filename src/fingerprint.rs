//! Trace file fingerprinting using Blake3

use blake3::Hasher as Blake3Hasher;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Blake3 digest of one trace file
///
/// Recorded into the timing summary at flush and re-checked at load so a
/// replay can tell whether it is running against the bytes the recorder
/// actually wrote. A mismatch is diagnostic only: the analyzer legitimately
/// rewrites traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceDigest(pub [u8; 32]);

impl fmt::Display for TraceDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl TraceDigest {
    /// Parse a digest from its hex rendering
    pub fn parse(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let bytes: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }
}

/// Compute the digest of a file's contents
pub fn file_digest(path: &Path) -> io::Result<TraceDigest> {
    let mut file = File::open(path)?;
    let mut hasher = Blake3Hasher::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(TraceDigest(*hasher.finalize().as_bytes()))
}

/// Compute the digest of in-memory trace bytes
pub fn bytes_digest(bytes: &[u8]) -> TraceDigest {
    let mut hasher = Blake3Hasher::new();
    hasher.update(bytes);
    TraceDigest(*hasher.finalize().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_digest_consistency() {
        let a = bytes_digest(b"C,1,2,3,S,4,t,main.rs:1\n");
        let b = bytes_digest(b"C,1,2,3,S,4,t,main.rs:1\n");
        assert_eq!(a, b);
    }

    #[test]
    fn test_digest_detects_change() {
        let a = bytes_digest(b"C,1,2,3,S,4,t,main.rs:1\n");
        let b = bytes_digest(b"C,1,2,3,R,4,t,main.rs:1\n");
        assert_ne!(a, b);
    }

    #[test]
    fn test_hex_round_trip() {
        let digest = bytes_digest(b"trace");
        let parsed = TraceDigest::parse(&digest.to_string()).unwrap();
        assert_eq!(parsed, digest);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(TraceDigest::parse("not hex").is_none());
        assert!(TraceDigest::parse("abcd").is_none());
    }

    #[test]
    fn test_file_digest_matches_bytes_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace_1.log");
        let mut file = File::create(&path).unwrap();
        file.write_all(b"G,1,2,3,main.rs:9\n").unwrap();
        drop(file);

        assert_eq!(
            file_digest(&path).unwrap(),
            bytes_digest(b"G,1,2,3,main.rs:9\n")
        );
    }
}
