//! Artifact destinations
//!
//! A run's artifact URI decides where its files go:
//!
//! | URI                         | Transfer                                   |
//! |-----------------------------|--------------------------------------------|
//! | `s3://bucket/prefix`        | direct object-store `PutObject`            |
//! | `mlflow-artifacts:/path`    | `PUT` through the tracking server's proxy  |
//! | `file:///dir` or `/dir`     | local copy                                 |

use std::path::{Path, PathBuf};

use super::TrackingConfig;
use crate::{Error, Result};

/// Proxied artifact endpoint, relative to the tracking server.
pub const PROXY_ENDPOINT: &str = "api/2.0/mlflow-artifacts/artifacts";

/// Where a run's artifacts are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactDestination {
    /// S3-compatible object store.
    S3 {
        /// Bucket name
        bucket: String,
        /// Key prefix of the run namespace (no leading/trailing slash)
        prefix: String,
    },
    /// Tracking-server artifact proxy.
    Proxied {
        /// Path of the run namespace under the proxy root
        path: String,
    },
    /// Local filesystem.
    Local {
        /// Directory of the run namespace
        root: PathBuf,
    },
}

impl ArtifactDestination {
    /// Parse a run artifact URI.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an unsupported scheme or a URI without
    /// a bucket.
    pub fn parse(uri: &str) -> Result<Self> {
        if let Some(rest) = uri.strip_prefix("s3://") {
            let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
            if bucket.is_empty() {
                return Err(Error::Config(format!("artifact URI '{uri}' has no bucket")));
            }
            return Ok(Self::S3 {
                bucket: bucket.to_string(),
                prefix: prefix.trim_matches('/').to_string(),
            });
        }
        if let Some(rest) = uri.strip_prefix("mlflow-artifacts:") {
            // Optional authority: mlflow-artifacts://host:port/path
            let path = match rest.strip_prefix("//") {
                Some(with_host) => with_host.split_once('/').map_or("", |(_, p)| p),
                None => rest,
            };
            return Ok(Self::Proxied {
                path: path.trim_matches('/').to_string(),
            });
        }
        if let Some(rest) = uri.strip_prefix("file://") {
            return Ok(Self::Local { root: PathBuf::from(rest) });
        }
        if uri.starts_with('/') {
            return Ok(Self::Local { root: PathBuf::from(uri) });
        }
        Err(Error::Config(format!("unsupported artifact URI scheme in '{uri}'")))
    }

    /// Full location of `key` inside this namespace, for logs and errors.
    #[must_use]
    pub fn describe(&self, key: &str) -> String {
        match self {
            Self::S3 { bucket, prefix } => format!("s3://{bucket}/{}", join(prefix, key)),
            Self::Proxied { path } => format!("mlflow-artifacts:/{}", join(path, key)),
            Self::Local { root } => root.join(key).display().to_string(),
        }
    }
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}/{key}")
    }
}

/// Moves local files into artifact destinations.
pub(crate) struct ArtifactUploader {
    http: reqwest::Client,
    tracking_uri: String,
    #[cfg(feature = "s3")]
    s3: aws_sdk_s3::Client,
}

impl ArtifactUploader {
    pub(crate) fn new(config: &TrackingConfig, http: reqwest::Client) -> Self {
        Self {
            http,
            tracking_uri: config.tracking_uri().to_string(),
            #[cfg(feature = "s3")]
            s3: s3_client(config),
        }
    }

    /// Transfer `local_path` to `key` inside `destination`.
    pub(crate) async fn upload(
        &self,
        destination: &ArtifactDestination,
        local_path: &Path,
        key: &str,
    ) -> Result<()> {
        let target = destination.describe(key);
        let bytes = tokio::fs::read(local_path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::not_found(local_path),
            _ => Error::Io(e),
        })?;
        let size = bytes.len();

        match destination {
            ArtifactDestination::S3 { bucket, prefix } => {
                self.put_s3(bucket, &join(prefix, key), bytes, &target).await?;
            }
            ArtifactDestination::Proxied { path } => {
                let url = format!("{}/{PROXY_ENDPOINT}/{}", self.tracking_uri, join(path, key));
                let response = self
                    .http
                    .put(&url)
                    .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                    .body(bytes)
                    .send()
                    .await
                    .map_err(|e| Error::Connection(format!("{target}: {e}")))?;
                if !response.status().is_success() {
                    let status = response.status();
                    return Err(Error::Upload(format!("{target}: server returned {status}")));
                }
            }
            ArtifactDestination::Local { root } => {
                let dest = root.join(key);
                if let Some(parent) = dest.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| Error::Upload(format!("{target}: {e}")))?;
                }
                tokio::fs::write(&dest, bytes)
                    .await
                    .map_err(|e| Error::Upload(format!("{target}: {e}")))?;
            }
        }
        tracing::info!(target = %target, bytes = size, "uploaded artifact");
        Ok(())
    }

    #[cfg(feature = "s3")]
    async fn put_s3(&self, bucket: &str, key: &str, bytes: Vec<u8>, target: &str) -> Result<()> {
        use aws_sdk_s3::error::DisplayErrorContext;
        use aws_sdk_s3::primitives::ByteStream;

        self.s3
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| Error::Upload(format!("{target}: {}", DisplayErrorContext(&e))))?;
        Ok(())
    }

    #[cfg(not(feature = "s3"))]
    async fn put_s3(&self, _bucket: &str, _key: &str, _bytes: Vec<u8>, target: &str) -> Result<()> {
        Err(Error::Config(format!(
            "{target}: built without the `s3` feature; object-store uploads are unavailable"
        )))
    }
}

/// Object-store client scoped to this configuration: path-style addressing
/// against the configured endpoint with static credentials.
#[cfg(feature = "s3")]
fn s3_client(config: &TrackingConfig) -> aws_sdk_s3::Client {
    use aws_sdk_s3::config::timeout::TimeoutConfig;
    use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};

    let transport = config.transport();
    let credentials = Credentials::new(
        config.access_key_id(),
        config.secret_access_key(),
        None,
        None,
        "modelpack",
    );
    let conf = aws_sdk_s3::Config::builder()
        .behavior_version(BehaviorVersion::latest())
        .region(Region::new("us-east-1"))
        .endpoint_url(config.s3_endpoint_url())
        .credentials_provider(credentials)
        .force_path_style(true)
        .timeout_config(
            TimeoutConfig::builder()
                .connect_timeout(transport.connect_timeout)
                .operation_timeout(transport.timeout)
                .build(),
        )
        .build();
    aws_sdk_s3::Client::from_conf(conf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_s3() {
        let dest = ArtifactDestination::parse("s3://mlflow/1/abc/artifacts").unwrap();
        assert_eq!(
            dest,
            ArtifactDestination::S3 {
                bucket: "mlflow".to_string(),
                prefix: "1/abc/artifacts".to_string()
            }
        );
        assert_eq!(
            dest.describe("model_files/m.pte"),
            "s3://mlflow/1/abc/artifacts/model_files/m.pte"
        );
    }

    #[test]
    fn test_parse_bucket_only() {
        let dest = ArtifactDestination::parse("s3://mlflow").unwrap();
        assert_eq!(dest.describe("a"), "s3://mlflow/a");
    }

    #[test]
    fn test_parse_proxied() {
        let uris = [
            "mlflow-artifacts:/1/abc/artifacts",
            "mlflow-artifacts://host:5001/1/abc/artifacts",
        ];
        for uri in uris {
            assert_eq!(
                ArtifactDestination::parse(uri).unwrap(),
                ArtifactDestination::Proxied {
                    path: "1/abc/artifacts".to_string()
                }
            );
        }
    }

    #[test]
    fn test_parse_local() {
        let dest = ArtifactDestination::parse("file:///tmp/mlruns/1").unwrap();
        assert_eq!(dest, ArtifactDestination::Local { root: PathBuf::from("/tmp/mlruns/1") });
    }

    #[test]
    fn test_parse_rejects_unknown_scheme() {
        assert!(matches!(ArtifactDestination::parse("gs://bucket/x"), Err(Error::Config(_))));
        assert!(matches!(ArtifactDestination::parse("s3:///x"), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_local_upload_copies_file() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("m.pte");
        std::fs::write(&src, b"payload").unwrap();

        let uploader = ArtifactUploader::new(&TrackingConfig::new(), reqwest::Client::new());
        let dest = ArtifactDestination::Local {
            root: dst_dir.path().to_path_buf(),
        };
        uploader.upload(&dest, &src, "model_files/m.pte").await.unwrap();
        assert_eq!(std::fs::read(dst_dir.path().join("model_files/m.pte")).unwrap(), b"payload");
    }
}
