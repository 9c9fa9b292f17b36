//! MLflow REST client
//!
//! Speaks the `/api/2.0/mlflow` protocol with one `reqwest` client per
//! [`MlflowClient`]. Timeouts and certificate verification come from the
//! client's [`TransportConfig`](super::TransportConfig); nothing global is
//! touched.
//!
//! Error mapping: transport failures and timeouts become
//! [`Error::Connection`], non-2xx API replies become [`Error::Tracking`],
//! failed artifact transfers become [`Error::Upload`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Deserializer};
use serde_json::json;

use super::artifacts::{ArtifactDestination, ArtifactUploader};
use super::{
    artifact_key, ArtifactRecord, ExperimentRecord, MetricRecord, RunRecord, RunStatus,
    TrackingConfig, TrackingStore,
};
use crate::{Error, Result};

const RESOURCE_ALREADY_EXISTS: &str = "RESOURCE_ALREADY_EXISTS";
const RESOURCE_DOES_NOT_EXIST: &str = "RESOURCE_DOES_NOT_EXIST";

/// Client-side view of a run opened through this client.
#[derive(Debug, Default)]
struct LocalRun {
    artifact_uri: Option<String>,
    params: BTreeSet<String>,
    metrics: BTreeSet<String>,
    sealed: bool,
}

/// Tracking store backed by an MLflow server.
pub struct MlflowClient {
    http: reqwest::Client,
    config: TrackingConfig,
    uploader: ArtifactUploader,
    runs: DashMap<String, LocalRun>,
}

impl MlflowClient {
    /// Build a client for `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid or the HTTP
    /// client cannot be built.
    pub fn new(config: TrackingConfig) -> Result<Self> {
        config.validate()?;
        let transport = config.transport();
        if !transport.verify_tls {
            tracing::warn!(
                tracking_uri = config.tracking_uri(),
                "TLS certificate verification disabled for this tracking client"
            );
        }
        if config.uses_placeholder_credentials() {
            tracing::warn!("object store credentials are the local-development placeholders");
        }
        let http = reqwest::Client::builder()
            .timeout(transport.timeout)
            .connect_timeout(transport.connect_timeout)
            .danger_accept_invalid_certs(!transport.verify_tls)
            .build()
            .map_err(|e| Error::Config(format!("build HTTP client: {e}")))?;
        let uploader = ArtifactUploader::new(&config, http.clone());
        Ok(Self {
            http,
            config,
            uploader,
            runs: DashMap::new(),
        })
    }

    /// The client's configuration.
    #[must_use]
    pub const fn config(&self) -> &TrackingConfig {
        &self.config
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/api/2.0/mlflow/{endpoint}", self.config.tracking_uri())
    }

    /// Send a request; the inner result carries API-level rejections.
    async fn exchange<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        endpoint: &str,
    ) -> Result<std::result::Result<T, ApiFailure>> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Connection(format!("{endpoint}: request timed out: {e}"))
            } else {
                Error::Connection(format!("{endpoint}: {e}"))
            }
        })?;
        let status = response.status();
        if status.is_success() {
            let body = response
                .json::<T>()
                .await
                .map_err(|e| Error::Tracking(format!("{endpoint}: malformed response: {e}")))?;
            return Ok(Ok(body));
        }
        let text = response.text().await.unwrap_or_default();
        let body: ApiErrorBody = serde_json::from_str(&text).unwrap_or_else(|_| ApiErrorBody {
            error_code: String::new(),
            message: text.chars().take(200).collect(),
        });
        Ok(Err(ApiFailure {
            status: status.as_u16(),
            error_code: body.error_code,
            message: body.message,
        }))
    }

    async fn call<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        endpoint: &str,
    ) -> Result<T> {
        self.exchange(request, endpoint)
            .await?
            .map_err(|failure| failure.into_error(endpoint))
    }

    async fn post<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: serde_json::Value,
    ) -> Result<T> {
        self.call(self.http.post(self.url(endpoint)).json(&body), endpoint).await
    }

    async fn fetch_experiment(&self, name: &str) -> Result<Option<ExperimentRecord>> {
        let endpoint = "experiments/get-by-name";
        let request = self.http.get(self.url(endpoint)).query(&[("experiment_name", name)]);
        match self.exchange::<ExperimentEnvelope>(request, endpoint).await? {
            Ok(envelope) => Ok(Some(envelope.experiment.into_record())),
            Err(failure)
                if failure.error_code == RESOURCE_DOES_NOT_EXIST || failure.status == 404 =>
            {
                Ok(None)
            }
            Err(failure) => Err(failure.into_error(endpoint)),
        }
    }

    /// Fail fast on client-known violations before a round trip.
    fn check_local(&self, run_id: &str, kind: Option<(&'static str, &str)>) -> Result<()> {
        let Some(run) = self.runs.get(run_id) else {
            return Ok(());
        };
        if run.sealed {
            return Err(Error::RunSealed(run_id.to_string()));
        }
        if let Some((kind, key)) = kind {
            let seen = if kind == "param" { &run.params } else { &run.metrics };
            if seen.contains(key) {
                return Err(Error::DuplicateKey {
                    kind,
                    key: key.to_string(),
                    run_id: run_id.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn artifact_uri(&self, run_id: &str) -> Result<String> {
        let cached = self.runs.get(run_id).and_then(|r| r.artifact_uri.clone());
        if let Some(uri) = cached {
            return Ok(uri);
        }
        self.get_run(run_id)
            .await?
            .artifact_uri()
            .map(str::to_string)
            .ok_or_else(|| Error::Tracking(format!("run {run_id} has no artifact URI")))
    }
}

impl TrackingStore for MlflowClient {
    async fn get_or_create_experiment(&self, name: &str) -> Result<ExperimentRecord> {
        if let Some(existing) = self.fetch_experiment(name).await? {
            return Ok(existing);
        }
        let endpoint = "experiments/create";
        let request = self.http.post(self.url(endpoint)).json(&json!({ "name": name }));
        match self.exchange::<CreatedExperiment>(request, endpoint).await? {
            Ok(created) => {
                let id = &created.experiment_id;
                tracing::info!(experiment = name, id = %id, "created experiment");
            }
            // Lost a creation race; the other writer's experiment is fine.
            Err(failure) if failure.error_code == RESOURCE_ALREADY_EXISTS => {}
            Err(failure) => return Err(failure.into_error(endpoint)),
        }
        self.fetch_experiment(name)
            .await?
            .ok_or_else(|| {
                Error::Tracking(format!("experiment '{name}' missing right after creation"))
            })
    }

    async fn create_run(&self, experiment_id: &str, run_name: &str) -> Result<RunRecord> {
        let envelope: RunEnvelope = self
            .post(
                "runs/create",
                json!({
                    "experiment_id": experiment_id,
                    "run_name": run_name,
                    "start_time": Utc::now().timestamp_millis(),
                    "tags": [{ "key": "mlflow.runName", "value": run_name }],
                }),
            )
            .await?;
        let run = envelope.run.into_record()?;
        self.runs.insert(
            run.run_id().to_string(),
            LocalRun {
                artifact_uri: run.artifact_uri().map(str::to_string),
                ..LocalRun::default()
            },
        );
        tracing::debug!(run_id = run.run_id(), run_name, "opened run");
        Ok(run)
    }

    async fn log_param(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        self.check_local(run_id, Some(("param", key)))?;
        let _: IgnoredAny = self
            .post("runs/log-parameter", json!({ "run_id": run_id, "key": key, "value": value }))
            .await?;
        if let Some(mut run) = self.runs.get_mut(run_id) {
            run.params.insert(key.to_string());
        }
        Ok(())
    }

    async fn log_metric(&self, run_id: &str, key: &str, value: f64) -> Result<()> {
        self.check_local(run_id, Some(("metric", key)))?;
        if !value.is_finite() {
            return Err(Error::InvalidInput(format!("metric '{key}' is not finite: {value}")));
        }
        let record = MetricRecord::new(run_id, key, 0, value);
        let _: IgnoredAny = self
            .post(
                "runs/log-metric",
                json!({
                    "run_id": record.run_id(),
                    "key": record.key(),
                    "value": record.value(),
                    "timestamp": record.logged_at_millis(),
                    "step": record.step(),
                }),
            )
            .await?;
        if let Some(mut run) = self.runs.get_mut(run_id) {
            run.metrics.insert(key.to_string());
        }
        Ok(())
    }

    async fn log_artifact(
        &self,
        run_id: &str,
        local_path: &Path,
        subpath: &str,
    ) -> Result<ArtifactRecord> {
        self.check_local(run_id, None)?;
        let file_name = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                Error::InvalidInput(format!("{} has no file name", local_path.display()))
            })?;
        let key = artifact_key(subpath, file_name);
        let destination = ArtifactDestination::parse(&self.artifact_uri(run_id).await?)?;
        let record = ArtifactRecord::from_file(run_id, &key, local_path)?;
        self.uploader.upload(&destination, local_path, &key).await?;
        Ok(record)
    }

    async fn end_run(&self, run_id: &str, status: RunStatus) -> Result<()> {
        self.check_local(run_id, None)?;
        if !status.is_terminal() {
            return Err(Error::InvalidInput(format!(
                "cannot seal run {run_id} with non-terminal status {status:?}"
            )));
        }
        let _: IgnoredAny = self
            .post(
                "runs/update",
                json!({
                    "run_id": run_id,
                    "status": status.as_mlflow(),
                    "end_time": Utc::now().timestamp_millis(),
                }),
            )
            .await?;
        if let Some(mut run) = self.runs.get_mut(run_id) {
            run.sealed = true;
        }
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<RunRecord> {
        let endpoint = "runs/get";
        let request = self.http.get(self.url(endpoint)).query(&[("run_id", run_id)]);
        match self.exchange::<RunEnvelope>(request, endpoint).await? {
            Ok(envelope) => envelope.run.into_record(),
            Err(failure) if failure.error_code == RESOURCE_DOES_NOT_EXIST => {
                Err(Error::RunNotFound(run_id.to_string()))
            }
            Err(failure) => Err(failure.into_error(endpoint)),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug)]
struct ApiFailure {
    status: u16,
    error_code: String,
    message: String,
}

impl ApiFailure {
    fn into_error(self, endpoint: &str) -> Error {
        Error::Tracking(format!(
            "{endpoint} returned HTTP {}: {} {}",
            self.status, self.error_code, self.message
        ))
    }
}

#[derive(Debug, Deserialize)]
struct ExperimentEnvelope {
    experiment: WireExperiment,
}

#[derive(Debug, Deserialize)]
struct WireExperiment {
    experiment_id: String,
    name: String,
    #[serde(default)]
    artifact_location: Option<String>,
    #[serde(default, deserialize_with = "millis")]
    creation_time: Option<i64>,
}

impl WireExperiment {
    fn into_record(self) -> ExperimentRecord {
        let mut experiment = ExperimentRecord::new(self.experiment_id, self.name);
        if let Some(location) = self.artifact_location {
            experiment = experiment.with_artifact_location(location);
        }
        if let Some(created) = self.creation_time.and_then(DateTime::<Utc>::from_timestamp_millis) {
            experiment = experiment.with_created_at(created);
        }
        experiment
    }
}

#[derive(Debug, Deserialize)]
struct CreatedExperiment {
    experiment_id: String,
}

#[derive(Debug, Deserialize)]
struct RunEnvelope {
    run: WireRun,
}

#[derive(Debug, Deserialize)]
struct WireRun {
    info: WireRunInfo,
    #[serde(default)]
    data: WireRunData,
}

#[derive(Debug, Deserialize)]
struct WireRunInfo {
    run_id: String,
    experiment_id: String,
    #[serde(default)]
    run_name: Option<String>,
    status: String,
    #[serde(default, deserialize_with = "millis")]
    start_time: Option<i64>,
    #[serde(default, deserialize_with = "millis")]
    end_time: Option<i64>,
    #[serde(default)]
    artifact_uri: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireRunData {
    #[serde(default)]
    params: Vec<WireParam>,
    #[serde(default)]
    metrics: Vec<WireMetric>,
}

#[derive(Debug, Deserialize)]
struct WireParam {
    key: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct WireMetric {
    key: String,
    value: f64,
}

impl WireRun {
    fn into_record(self) -> Result<RunRecord> {
        let info = self.info;
        let status = RunStatus::from_mlflow(&info.status).ok_or_else(|| {
            Error::Tracking(format!("run {} has unknown status '{}'", info.run_id, info.status))
        })?;
        let params: BTreeMap<String, String> =
            self.data.params.into_iter().map(|p| (p.key, p.value)).collect();
        let metrics: BTreeMap<String, f64> =
            self.data.metrics.into_iter().map(|m| (m.key, m.value)).collect();

        let mut builder = RunRecord::builder(&info.run_id, info.experiment_id)
            .status(status)
            .times(
                info.start_time.and_then(DateTime::<Utc>::from_timestamp_millis),
                info.end_time.and_then(DateTime::<Utc>::from_timestamp_millis),
            )
            .params(params)
            .metrics(metrics);
        if let Some(name) = info.run_name {
            builder = builder.run_name(name);
        }
        if let Some(uri) = info.artifact_uri {
            builder = builder.artifact_uri(uri);
        }
        Ok(builder.build())
    }
}

/// Epoch milliseconds sent either as a JSON number or a string.
fn millis<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Millis {
        Number(i64),
        Text(String),
    }
    Ok(match Option::<Millis>::deserialize(deserializer)? {
        Some(Millis::Number(n)) => Some(n),
        Some(Millis::Text(s)) => s.parse().ok(),
        None => None,
    })
}
