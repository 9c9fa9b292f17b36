//! Tracking store configuration
//!
//! Endpoints and credentials are passed explicitly to each client. Nothing
//! here reads or writes process-wide state except [`TrackingConfig::from_env`],
//! which only reads.

use std::time::Duration;

use crate::{Error, Result};

/// Tracking server URL variable.
pub const ENV_TRACKING_URI: &str = "MLFLOW_TRACKING_URI";
/// Object store endpoint variable.
pub const ENV_S3_ENDPOINT_URL: &str = "MLFLOW_S3_ENDPOINT_URL";
/// Object store access key variable.
pub const ENV_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
/// Object store secret key variable.
pub const ENV_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
/// Experiment name variable.
pub const ENV_EXPERIMENT: &str = "MODELPACK_EXPERIMENT";

/// Local development tracking server.
pub const DEFAULT_TRACKING_URI: &str = "http://localhost:5001";
/// Local development object store (MinIO).
pub const DEFAULT_S3_ENDPOINT_URL: &str = "http://localhost:9000";
/// Placeholder access key; replace outside local development.
pub const DEFAULT_ACCESS_KEY_ID: &str = "CHANGE_ME_MINIO_ACCESS_KEY";
/// Placeholder secret key; replace outside local development.
pub const DEFAULT_SECRET_ACCESS_KEY: &str = "CHANGE_ME_MINIO_SECRET_KEY";
/// Default experiment grouping published runs.
pub const DEFAULT_EXPERIMENT: &str = "MobileNetV2-HapticMat-Quantized";

/// Per-client transport settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Whole-request timeout
    pub timeout: Duration,
    /// TCP/TLS connect timeout
    pub connect_timeout: Duration,
    /// Verify server certificates
    pub verify_tls: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            verify_tls: true,
        }
    }
}

/// Tracking server and artifact store configuration.
#[derive(Clone, PartialEq, Eq)]
pub struct TrackingConfig {
    tracking_uri: String,
    s3_endpoint_url: String,
    access_key_id: String,
    secret_access_key: String,
    experiment_name: String,
    transport: TransportConfig,
}

impl TrackingConfig {
    /// Configuration with every documented default.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tracking_uri: DEFAULT_TRACKING_URI.to_string(),
            s3_endpoint_url: DEFAULT_S3_ENDPOINT_URL.to_string(),
            access_key_id: DEFAULT_ACCESS_KEY_ID.to_string(),
            secret_access_key: DEFAULT_SECRET_ACCESS_KEY.to_string(),
            experiment_name: DEFAULT_EXPERIMENT.to_string(),
            transport: TransportConfig::default(),
        }
    }

    /// Read from the process environment, falling back to defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a URL variable is set but malformed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read through `lookup`, falling back to defaults for absent or empty
    /// values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a URL value is malformed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str, default: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        let config = Self {
            tracking_uri: get(ENV_TRACKING_URI, DEFAULT_TRACKING_URI),
            s3_endpoint_url: get(ENV_S3_ENDPOINT_URL, DEFAULT_S3_ENDPOINT_URL),
            access_key_id: get(ENV_ACCESS_KEY_ID, DEFAULT_ACCESS_KEY_ID),
            secret_access_key: get(ENV_SECRET_ACCESS_KEY, DEFAULT_SECRET_ACCESS_KEY),
            experiment_name: get(ENV_EXPERIMENT, DEFAULT_EXPERIMENT),
            transport: TransportConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check endpoint URLs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a non-http(s) endpoint or an empty
    /// experiment name.
    pub fn validate(&self) -> Result<()> {
        for (name, url) in [
            (ENV_TRACKING_URI, &self.tracking_uri),
            (ENV_S3_ENDPOINT_URL, &self.s3_endpoint_url),
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(Error::Config(format!(
                    "{name}='{url}' is not an http(s) URL"
                )));
            }
        }
        if self.experiment_name.trim().is_empty() {
            return Err(Error::Config("experiment name must not be empty".to_string()));
        }
        Ok(())
    }

    /// Set the tracking server URL.
    #[must_use]
    pub fn with_tracking_uri(mut self, uri: impl Into<String>) -> Self {
        self.tracking_uri = uri.into();
        self
    }

    /// Set the object store endpoint.
    #[must_use]
    pub fn with_s3_endpoint_url(mut self, url: impl Into<String>) -> Self {
        self.s3_endpoint_url = url.into();
        self
    }

    /// Set object store credentials.
    #[must_use]
    pub fn with_credentials(
        mut self,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
    ) -> Self {
        self.access_key_id = access_key_id.into();
        self.secret_access_key = secret_access_key.into();
        self
    }

    /// Set the experiment name.
    #[must_use]
    pub fn with_experiment_name(mut self, name: impl Into<String>) -> Self {
        self.experiment_name = name.into();
        self
    }

    /// Set transport settings.
    #[must_use]
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Tracking server URL without a trailing slash.
    #[must_use]
    pub fn tracking_uri(&self) -> &str {
        self.tracking_uri.trim_end_matches('/')
    }

    /// Object store endpoint.
    #[must_use]
    pub fn s3_endpoint_url(&self) -> &str {
        &self.s3_endpoint_url
    }

    /// Object store access key.
    #[must_use]
    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }

    /// Object store secret key.
    #[must_use]
    pub fn secret_access_key(&self) -> &str {
        &self.secret_access_key
    }

    /// Experiment name.
    #[must_use]
    pub fn experiment_name(&self) -> &str {
        &self.experiment_name
    }

    /// Transport settings.
    #[must_use]
    pub const fn transport(&self) -> &TransportConfig {
        &self.transport
    }

    /// Whether the object store credentials are still the placeholders.
    #[must_use]
    pub fn uses_placeholder_credentials(&self) -> bool {
        self.access_key_id == DEFAULT_ACCESS_KEY_ID
            || self.secret_access_key == DEFAULT_SECRET_ACCESS_KEY
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self::new()
    }
}

// Keep the secret out of logs.
impl std::fmt::Debug for TrackingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackingConfig")
            .field("tracking_uri", &self.tracking_uri)
            .field("s3_endpoint_url", &self.s3_endpoint_url)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("experiment_name", &self.experiment_name)
            .field("transport", &self.transport)
            .finish()
    }
}
