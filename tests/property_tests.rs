//! Property-based tests for content digests and manifests
//!
//! - Test identity invariants of the digest
//! - Test operator shape inference against closed forms
//! - Run with ProptestConfig::with_cases(64)

use modelpack::compiler::Op;
use modelpack::hasher::{self, Digest};
use modelpack::manifest::Manifest;
use modelpack::tensor::TensorSpec;
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Streaming and in-memory digests agree for any content.
    #[test]
    fn prop_streaming_digest_matches_in_memory(
        bytes in proptest::collection::vec(any::<u8>(), 0..200_000)
    ) {
        let streamed = hasher::digest_reader(bytes.as_slice()).unwrap();
        prop_assert_eq!(streamed, Digest::of_bytes(&bytes));
    }

    /// Changing any single byte changes the digest.
    #[test]
    fn prop_single_byte_mutation_changes_digest(
        bytes in proptest::collection::vec(any::<u8>(), 1..4096),
        index in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let mut mutated = bytes.clone();
        let i = index.index(mutated.len());
        mutated[i] ^= flip;
        prop_assert_ne!(Digest::of_bytes(&bytes), Digest::of_bytes(&mutated));
    }

    /// Hex rendering is lowercase, fixed-width and parses back.
    #[test]
    fn prop_hex_round_trip(raw in any::<[u8; 32]>()) {
        let digest = Digest::from_bytes(raw);
        let hex = digest.to_hex();
        prop_assert_eq!(hex.len(), hasher::HEX_LEN);
        prop_assert!(hex.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
        prop_assert_eq!(hex.parse::<Digest>().unwrap(), digest);
    }

    /// Manifests with finite metrics survive JSON persistence unchanged.
    #[test]
    fn prop_manifest_json_preserves_metrics(
        metrics in proptest::collection::btree_map("[a-z_]{1,12}", -1.0e6f64..1.0e6, 0..8),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.pte");
        std::fs::write(&path, b"program").unwrap();

        let manifest = Manifest::build("M", "1.0.0", &path, metrics.clone()).unwrap();
        let back = Manifest::from_json(&manifest.to_json().unwrap()).unwrap();
        prop_assert_eq!(back.metrics().len(), metrics.len());
        for (key, value) in &metrics {
            prop_assert!((back.metrics()[key] - value).abs() <= value.abs() * 1e-12);
        }
    }

    /// Conv2d output dims follow `(in + 2p - k) / s + 1` and keep batch size.
    #[test]
    fn prop_conv2d_output_shape(
        n in 1usize..4,
        c in 1usize..8,
        o in 1usize..8,
        hw in 1usize..64,
        k in 1usize..6,
        stride in 1usize..4,
        padding in 0usize..3,
    ) {
        let op = Op::Conv2d { stride, padding };
        let x = TensorSpec::f32([n, c, hw, hw]);
        let w = TensorSpec::f32([o, c, k, k]);
        let b = TensorSpec::f32([o]);
        let result = op.infer(&[&x, &w, &b]);
        if hw + 2 * padding < k {
            prop_assert!(result.is_err());
        } else {
            let out = (hw + 2 * padding - k) / stride + 1;
            let spec = result.unwrap();
            prop_assert_eq!(spec.shape(), &[n, o, out, out]);
        }
    }

    /// Flatten keeps the batch axis and the element count.
    #[test]
    fn prop_flatten_preserves_numel(shape in proptest::collection::vec(1usize..6, 1..5)) {
        let x = TensorSpec::f32(shape.clone());
        let out = Op::Flatten.infer(&[&x]).unwrap();
        prop_assert_eq!(out.shape()[0], shape[0]);
        prop_assert_eq!(out.numel(), x.numel());
    }
}
