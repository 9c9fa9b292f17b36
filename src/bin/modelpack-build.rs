//! `modelpack-build`: compile the reference classifier into an artifact
//!
//! Takes no flags. Writes `mv2_xnnpack.pte` (or `MODELPACK_OUTPUT`). Exits 0
//! once the artifact has been written and validated, 1 on any stage failure.

use std::path::PathBuf;
use std::process::ExitCode;

use modelpack::compiler::{compile, CompileOptions, OutputContract, QuantizationScheme, Runtime};
use modelpack::models::ReferenceClassifier;
use modelpack::workflow::{DEFAULT_BUILD_OUTPUT, ENV_OUTPUT};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let output = std::env::var(ENV_OUTPUT)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map_or_else(|| PathBuf::from(DEFAULT_BUILD_OUTPUT), PathBuf::from);

    let model = ReferenceClassifier::default();
    let options = CompileOptions::new()
        .with_quantization(QuantizationScheme::Int8PerTensor)
        .with_contract(OutputContract::single(model.output_shape()));

    tracing::info!(operators = Runtime::new().operator_names().len(), "runtime operator registry");

    match compile(&model, vec![model.example_input()], &output, options) {
        Ok(artifact) => {
            println!("{} ({} bytes)", artifact.path().display(), artifact.size_bytes());
            for (key, value) in artifact.params() {
                println!("  {key} = {value}");
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            match err.stage() {
                Some(stage) => eprintln!("error: {stage} stage failed: {err}"),
                None => eprintln!("error: {err}"),
            }
            ExitCode::FAILURE
        }
    }
}
