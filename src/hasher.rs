//! Streaming content digests for artifacts
//!
//! The digest is the binding identity of an artifact: the manifest records it
//! at publish time and consumers re-hash downloaded bytes against it.
//!
//! Files are read in fixed-size chunks so peak memory stays bounded no matter
//! how large the artifact is.

use std::fmt;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

use crate::{Error, Result};

/// Read chunk size for streaming digests (64 KiB)
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Length of a digest rendered as lowercase hex
pub const HEX_LEN: usize = 64;

/// SHA-256 digest of an artifact.
///
/// Displays and serializes as 64 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Wrap raw digest bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering.
    #[must_use]
    pub fn to_hex(&self) -> String {
        self.to_string()
    }

    /// Digest of an in-memory byte slice.
    #[must_use]
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != HEX_LEN {
            return Err(Error::InvalidInput(format!(
                "digest must be {HEX_LEN} hex characters, got {}",
                s.len()
            )));
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let pair = std::str::from_utf8(chunk)
                .map_err(|_| Error::InvalidInput("digest is not ASCII".to_string()))?;
            if pair.chars().any(|c| c.is_ascii_uppercase()) {
                return Err(Error::InvalidInput("digest must be lowercase hex".to_string()));
            }
            bytes[i] = u8::from_str_radix(pair, 16)
                .map_err(|_| Error::InvalidInput(format!("invalid hex pair '{pair}' in digest")))?;
        }
        Ok(Self(bytes))
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Compute the digest of the file at `path`.
///
/// # Errors
///
/// Returns [`Error::NotFound`] if the path does not exist and [`Error::Io`]
/// if the file cannot be read.
pub fn digest(path: impl AsRef<Path>) -> Result<Digest> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => Error::not_found(path),
        _ => Error::Io(e),
    })?;
    let digest = digest_reader(file)?;
    tracing::debug!(path = %path.display(), %digest, "computed artifact digest");
    Ok(digest)
}

/// Compute the digest of everything `reader` yields, chunk by chunk.
///
/// # Errors
///
/// Returns [`Error::Io`] on read failure.
pub fn digest_reader<R: Read>(mut reader: R) -> Result<Digest> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        };
        hasher.update(&buf[..n]);
    }
    Ok(Digest(hasher.finalize().into()))
}

/// Re-hash `path` and compare against `expected`.
///
/// # Errors
///
/// Returns [`Error::ManifestMismatch`] when the bytes on disk no longer hash
/// to `expected`, and propagates [`digest`] failures unchanged.
pub fn verify(path: impl AsRef<Path>, expected: &Digest) -> Result<()> {
    let path = path.as_ref();
    let actual = digest(path)?;
    if &actual == expected {
        Ok(())
    } else {
        tracing::warn!(path = %path.display(), %expected, %actual, "artifact digest mismatch");
        Err(Error::ManifestMismatch {
            path: path.to_path_buf(),
            expected: expected.to_hex(),
            actual: actual.to_hex(),
        })
    }
}
