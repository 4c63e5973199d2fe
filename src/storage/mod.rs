use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::operation::create_bucket::CreateBucketError;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use aws_sdk_s3::Client;
use log::{debug, info, warn};
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::config::StorageConfig;
use crate::error::{Error, Result};

/// Presigned download links stay valid for a week.
const PRESIGNED_LINK_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Budget for one liveness probe against the storage server.
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Durable home for clips too large to attach directly.
#[async_trait]
pub trait ClipArchive: Send + Sync {
    /// Store the file under `key` and return a presigned download URL.
    /// The URL is only produced once the object is fully stored.
    async fn upload(&self, key: &str, file: &Path) -> Result<String>;
}

/// Connection health as seen by the most recent probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Healthy,
    Unhealthy,
    Reconnecting,
}

pub struct ArchiveStore {
    config: StorageConfig,
    client: Mutex<Client>,
    state: Mutex<ConnState>,
}

impl ArchiveStore {
    /// Build a client and verify the server answers a liveness probe.
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        let store = Self {
            client: Mutex::new(build_client(config)),
            state: Mutex::new(ConnState::Healthy),
            config: config.clone(),
        };
        if !store.is_healthy().await {
            *store.state.lock().await = ConnState::Unhealthy;
            return Err(Error::Storage(format!(
                "Object storage at {} is unreachable",
                store.config.endpoint
            )));
        }
        Ok(store)
    }

    /// Probe the server with a short deadline.
    pub async fn is_healthy(&self) -> bool {
        let client = self.client.lock().await.clone();
        matches!(
            tokio::time::timeout(HEALTH_PROBE_TIMEOUT, client.list_buckets().send()).await,
            Ok(Ok(_))
        )
    }

    pub async fn connection_state(&self) -> ConnState {
        *self.state.lock().await
    }

    /// Probe and, when the probe fails, rebuild the client and probe
    /// again. Errors only when the rebuilt client is unreachable too.
    pub async fn ensure_connected(&self) -> Result<()> {
        if self.is_healthy().await {
            *self.state.lock().await = ConnState::Healthy;
            return Ok(());
        }

        *self.state.lock().await = ConnState::Unhealthy;
        warn!("storage health probe failed, rebuilding client");

        *self.state.lock().await = ConnState::Reconnecting;
        *self.client.lock().await = build_client(&self.config);

        if self.is_healthy().await {
            *self.state.lock().await = ConnState::Healthy;
            info!("storage connection restored");
            Ok(())
        } else {
            *self.state.lock().await = ConnState::Unhealthy;
            Err(Error::Storage(format!(
                "Object storage at {} still unreachable after reconnect",
                self.config.endpoint
            )))
        }
    }

    /// Create the configured bucket if it does not exist yet. A bucket
    /// name held by another account is a setup error, not an existing
    /// bucket.
    pub async fn ensure_bucket(&self) -> Result<()> {
        let client = self.client.lock().await.clone();
        let mut request = client.create_bucket().bucket(&self.config.bucket);
        if self.config.region != "us-east-1" {
            let constraint = BucketLocationConstraint::from(self.config.region.as_str());
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(constraint)
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => {
                info!("created bucket {}", self.config.bucket);
                Ok(())
            }
            Err(err) => {
                let err = err.into_service_error();
                if already_owned(&err) {
                    debug!("bucket {} already exists", self.config.bucket);
                    Ok(())
                } else {
                    Err(Error::Storage(format!(
                        "Failed to create bucket {}: {}",
                        self.config.bucket, err
                    )))
                }
            }
        }
    }
}

#[async_trait]
impl ClipArchive for ArchiveStore {
    async fn upload(&self, key: &str, file: &Path) -> Result<String> {
        self.ensure_connected().await?;
        let client = self.client.lock().await.clone();

        let body = ByteStream::from_path(file).await.map_err(|e| {
            Error::Storage(format!(
                "Failed to read {} for upload: {}",
                file.display(),
                e
            ))
        })?;
        client
            .put_object()
            .bucket(&self.config.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Storage(format!("Failed to upload {}: {}", key, e)))?;
        debug!("uploaded {} to bucket {}", key, self.config.bucket);

        let presign = PresigningConfig::expires_in(PRESIGNED_LINK_TTL)
            .map_err(|e| Error::Storage(format!("Invalid presign expiry: {}", e)))?;
        let request = client
            .get_object()
            .bucket(&self.config.bucket)
            .key(key)
            .presigned(presign)
            .await
            .map_err(|e| Error::Storage(format!("Failed to presign {}: {}", key, e)))?;

        Ok(request.uri().to_string())
    }
}

/// Endpoints without a scheme default to HTTPS.
fn endpoint_url(endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("https://{}", endpoint)
    }
}

/// Only a bucket this credential already owns counts as existing.
/// `BucketAlreadyExists` means the name is taken by another account.
fn already_owned(err: &CreateBucketError) -> bool {
    err.is_bucket_already_owned_by_you()
}

fn build_client(config: &StorageConfig) -> Client {
    let credentials = Credentials::new(
        config.access_key.clone(),
        config.secret_key.clone(),
        None,
        None,
        "frigate-relay",
    );
    let conf = aws_sdk_s3::Config::builder()
        .behavior_version(BehaviorVersion::latest())
        .region(Region::new(config.region.clone()))
        .endpoint_url(endpoint_url(&config.endpoint))
        .credentials_provider(credentials)
        .force_path_style(true)
        .build();
    Client::from_conf(conf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use anyhow::Result;
    use std::io::Write;

    #[test]
    fn endpoint_scheme_defaults_to_https() {
        assert_eq!(endpoint_url("play.min.io"), "https://play.min.io");
        assert_eq!(endpoint_url("http://localhost:9000"), "http://localhost:9000");
        assert_eq!(endpoint_url("https://s3.example.com"), "https://s3.example.com");
    }

    #[test]
    fn only_an_owned_bucket_counts_as_existing() {
        use aws_sdk_s3::types::error::{BucketAlreadyExists, BucketAlreadyOwnedByYou};

        let owned = CreateBucketError::BucketAlreadyOwnedByYou(
            BucketAlreadyOwnedByYou::builder().build(),
        );
        assert!(already_owned(&owned));

        // The name being taken by another account must fail setup
        let taken =
            CreateBucketError::BucketAlreadyExists(BucketAlreadyExists::builder().build());
        assert!(!already_owned(&taken));
    }

    // Full upload and presign pass against a real server
    #[tokio::test]
    async fn test_upload_returns_presigned_url() -> Result<()> {
        // Skip test if no object storage is available
        if std::env::var("TEST_S3").is_err() {
            println!("Skipping object storage test. Set TEST_S3=1 to run.");
            return Ok(());
        }

        let config = StorageConfig {
            bucket: format!("relay-test-{}", uuid::Uuid::new_v4()),
            ..Config::from_env().storage
        };
        let store = ArchiveStore::connect(&config).await?;
        assert_eq!(store.connection_state().await, ConnState::Healthy);
        store.ensure_bucket().await?;

        let mut clip = tempfile::NamedTempFile::new()?;
        clip.write_all(b"not really an mp4")?;
        let url = store
            .upload("Rua/2023-11-14 22:13:20-person.mp4", clip.path())
            .await?;
        assert!(url.contains(&config.bucket));
        assert!(url.contains("X-Amz-Signature"));
        Ok(())
    }
}
