//! `modelpack`: publish a compiled artifact to the tracking server
//!
//! Takes no flags. Configuration comes from the environment
//! (`MLFLOW_TRACKING_URI`, `MLFLOW_S3_ENDPOINT_URL`, `AWS_ACCESS_KEY_ID`,
//! `AWS_SECRET_ACCESS_KEY`, `MODELPACK_EXPERIMENT`, `MODELPACK_MODEL_FILE`,
//! `MODELPACK_METRICS`).
//!
//! Exit codes: 0 published, 1 artifact missing (nothing recorded), 2 any
//! other failure.

use std::process::ExitCode;

use anyhow::Context;
use modelpack::provenance::{ProvenanceRecorder, PublishedRun};
use modelpack::tracking::{MlflowClient, TrackingConfig};
use modelpack::workflow::{self, ExitStatus, PublishSettings};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    match run().await {
        Ok(published) => {
            println!("{}", published.run_id);
            ExitCode::from(ExitStatus::Success.code())
        }
        Err(err) => {
            let status = err
                .downcast_ref::<modelpack::Error>()
                .map_or(ExitStatus::Failed, ExitStatus::for_error);
            eprintln!("error: {err:#}");
            ExitCode::from(status.code())
        }
    }
}

async fn run() -> anyhow::Result<PublishedRun> {
    let settings = PublishSettings::from_env().context("reading publish settings")?;
    // Checked before any client exists so a missing file never opens a run.
    workflow::check_artifact(&settings.model_file)?;

    let config = TrackingConfig::from_env().context("reading tracking configuration")?;
    let experiment = config.experiment_name().to_string();
    let client = MlflowClient::new(config).context("creating tracking client")?;
    let recorder = ProvenanceRecorder::new(client, experiment);

    let published = workflow::publish(&recorder, settings).await?;
    tracing::info!(
        run_id = %published.run_id,
        sha256 = %published.manifest.content_hash(),
        "published artifact"
    );
    Ok(published)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
