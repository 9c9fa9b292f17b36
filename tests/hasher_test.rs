//! Content hasher integration tests

use std::fs;

use modelpack::hasher::{self, Digest};
use modelpack::Error;

#[test]
fn test_digest_matches_known_vector() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("abc.bin");
    fs::write(&path, b"abc").unwrap();

    let digest = hasher::digest(&path).unwrap();
    assert_eq!(
        digest.to_hex(),
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
    assert_eq!(digest, Digest::of_bytes(b"abc"));
}

#[test]
fn test_digest_of_large_file_matches_in_memory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("large.bin");
    let bytes: Vec<u8> = (0..3_000_000u32).map(|i| (i % 251) as u8).collect();
    fs::write(&path, &bytes).unwrap();

    assert_eq!(hasher::digest(&path).unwrap(), Digest::of_bytes(&bytes));
}

#[test]
fn test_digest_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let result = hasher::digest(dir.path().join("missing.pte"));
    assert!(matches!(result, Err(Error::NotFound { .. })));
}

#[test]
fn test_verify_detects_modification() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.pte");
    fs::write(&path, b"original").unwrap();
    let recorded = hasher::digest(&path).unwrap();

    hasher::verify(&path, &recorded).unwrap();

    fs::write(&path, b"modified").unwrap();
    match hasher::verify(&path, &recorded) {
        Err(Error::ManifestMismatch { expected, actual, .. }) => {
            assert_eq!(expected, recorded.to_hex());
            assert_ne!(actual, expected);
        }
        other => panic!("expected mismatch, got {other:?}"),
    }
}

#[test]
fn test_digest_display_round_trips_through_parse() {
    let digest = Digest::of_bytes(b"modelpack");
    let parsed: Digest = digest.to_string().parse().unwrap();
    assert_eq!(parsed, digest);
}
