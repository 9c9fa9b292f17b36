//! # modelpack: Edge Model Compilation with Verifiable Provenance
//!
//! **Version**: 0.1.0
//!
//! modelpack turns a trained model into a validated, serialized artifact for
//! a resource-constrained device, then records that artifact, its manifest,
//! params and metrics as one sealed run in an experiment tracker.
//!
//! ## Design Principles (Toyota Way Aligned)
//!
//! - **Jidoka**: Every compiled artifact is reloaded and executed before it
//!   counts as built; a failed stage stops the line
//! - **Poka-Yoke safety**: Atomic writes, content hashes, write-once run
//!   keys and immutable sealed runs
//! - **Genchi Genbutsu**: Manifests are hashed from the bytes on disk, never
//!   from what the pipeline believes it wrote
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use modelpack::compiler::{compile, CompileOptions, OutputContract, QuantizationScheme};
//! use modelpack::models::ReferenceClassifier;
//! use modelpack::provenance::{ProvenanceRecorder, Publication};
//! use modelpack::tracking::MemoryTrackingStore;
//!
//! # async fn example() -> modelpack::Result<()> {
//! let model = ReferenceClassifier::default();
//! let options = CompileOptions::new()
//!     .with_quantization(QuantizationScheme::Int8PerTensor)
//!     .with_contract(OutputContract::single(model.output_shape()));
//! let artifact = compile(&model, vec![model.example_input()], "mv2.pte", options)?;
//!
//! let recorder = ProvenanceRecorder::new(MemoryTrackingStore::new(), "MobileNetV2");
//! let publication = Publication::new("nightly", artifact.path(), "PersonDetection", "1.0.0")
//!     .params(artifact.params())
//!     .metric("top1_accuracy", 0.85);
//! let run_id = recorder.record(publication).await?;
//! println!("recorded run {run_id}");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod compiler;
pub mod error;
pub mod hasher;
pub mod manifest;
pub mod models;
pub mod provenance;
pub mod tensor;
pub mod tracking;
pub mod workflow;

pub use error::{Error, Result, Stage};
