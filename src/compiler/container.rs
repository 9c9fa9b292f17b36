//! Versioned artifact container
//!
//! ## Layout (little-endian)
//!
//! ```text
//! offset  size  field
//! 0       4     magic "MPTE"
//! 4       2     format version
//! 6       2     flags (bit 0: int8 weights)
//! 8       8     payload length N
//! 16      N     payload (bincode-encoded LoweredProgram)
//! 16+N    32    SHA-256 of payload
//! ```
//!
//! Writes go to a temp file in the destination directory and are fsynced.
//! [`stage`] stops there so the caller can check the file first; committing
//! renames it into place. A failed write leaves the destination untouched.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use bincode::Options;

use super::program::LoweredProgram;
use super::quantize::QuantizationScheme;
use crate::hasher::Digest;
use crate::{Error, Result};

/// File magic
pub const MAGIC: [u8; 4] = *b"MPTE";

/// Current container format version
pub const FORMAT_VERSION: u16 = 1;

/// Conventional artifact file extension
pub const EXTENSION: &str = "pte";

const HEADER_LEN: usize = 16;
const TRAILER_LEN: usize = 32;
const FLAG_INT8: u16 = 1;

/// A serialized program persisted on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactFile {
    path: PathBuf,
    size_bytes: u64,
}

impl ArtifactFile {
    /// Artifact location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File size in bytes.
    #[must_use]
    pub const fn size_bytes(&self) -> u64 {
        self.size_bytes
    }
}

/// Encode `program` into container bytes.
///
/// # Errors
///
/// Returns [`Error::Serialization`] if the payload cannot be encoded.
pub fn encode(program: &LoweredProgram) -> Result<Vec<u8>> {
    let payload = bincode::serialize(program)
        .map_err(|e| Error::Serialization(format!("encode program: {e}")))?;
    let flags = if program.quantization == QuantizationScheme::Int8PerTensor {
        FLAG_INT8
    } else {
        0
    };
    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len() + TRAILER_LEN);
    bytes.extend_from_slice(&MAGIC);
    bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    bytes.extend_from_slice(&flags.to_le_bytes());
    bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    bytes.extend_from_slice(&payload);
    bytes.extend_from_slice(Digest::of_bytes(&payload).as_bytes());
    Ok(bytes)
}

/// Decode container bytes.
///
/// # Errors
///
/// Returns [`Error::Runtime`] for a bad magic, an unsupported version, a
/// truncated file, a checksum mismatch or an undecodable payload.
pub fn decode(bytes: &[u8]) -> Result<LoweredProgram> {
    if bytes.len() < HEADER_LEN + TRAILER_LEN {
        return Err(Error::Runtime(format!(
            "artifact truncated: {} bytes is smaller than the container header",
            bytes.len()
        )));
    }
    if bytes[..4] != MAGIC {
        return Err(Error::Runtime("not a program container (bad magic)".to_string()));
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != FORMAT_VERSION {
        return Err(Error::Runtime(format!(
            "unsupported container version {version} (this runtime reads {FORMAT_VERSION})"
        )));
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&bytes[8..16]);
    let payload_len = usize::try_from(u64::from_le_bytes(len_bytes))
        .map_err(|_| Error::Runtime("payload length overflows usize".to_string()))?;
    if bytes.len() != HEADER_LEN + payload_len + TRAILER_LEN {
        return Err(Error::Runtime(format!(
            "artifact length {} does not match declared payload length {payload_len}",
            bytes.len()
        )));
    }
    let payload = &bytes[HEADER_LEN..HEADER_LEN + payload_len];
    let trailer = &bytes[HEADER_LEN + payload_len..];
    if Digest::of_bytes(payload).as_bytes() != trailer {
        return Err(Error::Runtime("payload checksum mismatch".to_string()));
    }
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
        .with_limit(payload_len as u64)
        .deserialize(payload)
        .map_err(|e| Error::Runtime(format!("decode program: {e}")))
}

/// Serialize `program` to `path` atomically.
///
/// # Errors
///
/// Returns [`Error::Serialization`] if the destination directory is missing
/// or not writable, or the write fails part-way.
pub fn write_atomic(program: &LoweredProgram, path: &Path) -> Result<ArtifactFile> {
    stage(program, path)?.commit()
}

/// Container written next to its destination but not yet renamed into place.
///
/// Dropping a staged artifact deletes the temp file and leaves whatever
/// already sits at the destination untouched.
#[derive(Debug)]
pub struct StagedArtifact {
    tmp: tempfile::NamedTempFile,
    target: PathBuf,
    size_bytes: u64,
}

impl StagedArtifact {
    /// Path of the staged temp file.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.tmp.path()
    }

    /// Destination the artifact is committed to.
    #[must_use]
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Container size in bytes
    #[must_use]
    pub const fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Rename the staged file onto its destination.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the rename fails; the staged file
    /// is removed and the destination is left as it was.
    pub fn commit(self) -> Result<ArtifactFile> {
        let Self { tmp, target, size_bytes } = self;
        tmp.persist(&target).map_err(|e| {
            Error::Serialization(format!("rename into {}: {}", target.display(), e.error))
        })?;
        tracing::info!(path = %target.display(), bytes = size_bytes, "committed artifact");
        Ok(ArtifactFile {
            path: target,
            size_bytes,
        })
    }
}

/// Write `program` to a temp file in `path`'s directory without touching
/// `path` itself.
///
/// # Errors
///
/// Returns [`Error::Serialization`] if the destination directory is missing
/// or not writable, or the write fails part-way.
#[tracing::instrument(skip(program), fields(path = %path.display()))]
pub fn stage(program: &LoweredProgram, path: &Path) -> Result<StagedArtifact> {
    let bytes = encode(program)?;
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let fail = |what: &str, e: std::io::Error| {
        Error::Serialization(format!("{what} {}: {e}", path.display()))
    };

    let mut tmp = tempfile::NamedTempFile::new_in(&dir)
        .map_err(|e| fail("create temp file for", e))?;
    tmp.write_all(&bytes).map_err(|e| fail("write", e))?;
    tmp.as_file().sync_all().map_err(|e| fail("sync", e))?;

    tracing::info!(bytes = bytes.len(), "serialized program");
    Ok(StagedArtifact {
        tmp,
        target: path.to_path_buf(),
        size_bytes: bytes.len() as u64,
    })
}

/// Read and decode a container file.
///
/// # Errors
///
/// Returns [`Error::NotFound`] if the file is missing and [`Error::Runtime`]
/// if it is not a valid container.
pub fn read(path: &Path) -> Result<LoweredProgram> {
    let bytes = fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::not_found(path),
        _ => Error::Io(e),
    })?;
    decode(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn empty_program() -> LoweredProgram {
        LoweredProgram {
            model_name: "m".to_string(),
            quantization: QuantizationScheme::None,
            methods: vec![super::super::program::ProgramMethod {
                name: "forward".to_string(),
                values: vec![],
                inputs: vec![],
                outputs: vec![],
                constants: BTreeMap::new(),
                segments: vec![],
            }],
        }
    }

    #[test]
    fn test_header_layout() {
        let bytes = encode(&empty_program()).unwrap();
        assert_eq!(&bytes[..4], b"MPTE");
        assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), FORMAT_VERSION);
    }

    #[test]
    fn test_decode_rejects_corruption() {
        let mut bytes = encode(&empty_program()).unwrap();
        let mid = HEADER_LEN + 1;
        bytes[mid] ^= 0xff;
        assert!(matches!(decode(&bytes), Err(Error::Runtime(_))));
    }

    #[test]
    fn test_decode_rejects_future_version() {
        let mut bytes = encode(&empty_program()).unwrap();
        bytes[4] = 9;
        let err = decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("unsupported container version"));
    }

    #[test]
    fn test_write_atomic_missing_dir_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("model.pte");
        let err = write_atomic(&empty_program(), &path).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
        assert!(!path.exists());
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.pte");
        let artifact = write_atomic(&empty_program(), &path).unwrap();
        assert_eq!(artifact.size_bytes(), fs::metadata(&path).unwrap().len());
        assert_eq!(read(&path).unwrap(), empty_program());
        // only the artifact remains; no stray temp files
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_dropped_stage_keeps_previous_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.pte");
        fs::write(&path, b"previous").unwrap();

        let staged = stage(&empty_program(), &path).unwrap();
        assert_ne!(staged.path(), path.as_path());
        assert_eq!(read(staged.path()).unwrap(), empty_program());
        drop(staged);

        assert_eq!(fs::read(&path).unwrap(), b"previous");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_commit_replaces_destination() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.pte");
        fs::write(&path, b"previous").unwrap();

        let artifact = stage(&empty_program(), &path).unwrap().commit().unwrap();
        assert_eq!(artifact.path(), path.as_path());
        assert_eq!(read(&path).unwrap(), empty_program());
    }

    #[test]
    fn test_decode_rejects_oversized_length_prefix() {
        // model_name claims far more bytes than the payload holds
        let payload = (u64::MAX / 2).to_le_bytes();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&payload);
        bytes.extend_from_slice(Digest::of_bytes(&payload).as_bytes());

        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, Error::Runtime(_)));
        assert!(err.to_string().contains("decode program"));
    }
}
