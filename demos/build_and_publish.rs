//! Build and Publish Example
//!
//! Compiles the reference classifier into a quantized artifact, then
//! records it with its manifest as one sealed run in an in-memory tracking
//! store. Swap `MemoryTrackingStore` for `MlflowClient` to publish to a
//! real tracking server.
//!
//! Run with: cargo run --example build_and_publish

use modelpack::compiler::{compile, CompileOptions, OutputContract, QuantizationScheme};
use modelpack::models::ReferenceClassifier;
use modelpack::provenance::{ProvenanceRecorder, Publication};
use modelpack::tracking::{MemoryTrackingStore, TrackingStore};
use modelpack::workflow::{DEFAULT_MODEL_NAME, DEFAULT_RUN_NAME, DEFAULT_VERSION};

#[tokio::main]
async fn main() -> modelpack::Result<()> {
    println!("=== modelpack: Build and Publish ===\n");

    // -------------------------------------------------------------------------
    // 1. Compile
    // -------------------------------------------------------------------------
    println!("1. Compiling reference classifier...");

    let workdir = tempfile::tempdir()?;
    let model = ReferenceClassifier::default().with_resolution(96);
    let options = CompileOptions::new()
        .with_quantization(QuantizationScheme::Int8PerTensor)
        .with_contract(OutputContract::single(model.output_shape()));
    let artifact = compile(
        &model,
        vec![model.example_input()],
        workdir.path().join("mv2_xnnpack.pte"),
        options,
    )?;

    println!("   Artifact: {}", artifact.path().display());
    println!("   Size: {} bytes", artifact.size_bytes());
    println!(
        "   Delegated ops: {}, portable ops: {}",
        artifact.partition().delegated_total(),
        artifact.partition().portable
    );
    println!("   Validation: {:?}\n", artifact.validation().elapsed);

    // -------------------------------------------------------------------------
    // 2. Publish
    // -------------------------------------------------------------------------
    println!("2. Publishing...");

    let recorder = ProvenanceRecorder::new(MemoryTrackingStore::new(), "MobileNetV2");
    let publication = Publication::new(DEFAULT_RUN_NAME, artifact.path(), DEFAULT_MODEL_NAME, DEFAULT_VERSION)
        .params(artifact.params())
        .metric("top1_accuracy", 0.85)
        .metric("inference_latency_ms", 25.0);
    let published = recorder.publish(publication).await?;

    println!("   Run ID: {}", published.run_id);
    println!("   sha256: {}", published.manifest.content_hash());
    for record in &published.artifacts {
        println!("   Uploaded: {} ({} bytes)", record.key(), record.size_bytes());
    }

    // -------------------------------------------------------------------------
    // 3. Inspect the sealed run
    // -------------------------------------------------------------------------
    println!("\n3. Sealed run:");

    let run = recorder.store().get_run(published.run_id.as_str()).await?;
    println!("   Status: {:?}", run.status());
    for (key, value) in run.params() {
        println!("   param  {key} = {value}");
    }
    for (key, value) in run.metrics() {
        println!("   metric {key} = {value}");
    }

    println!("\n=== Done ===");
    Ok(())
}
