use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::Client;

use crate::core::config::S3Settings;
use crate::progress::UrlPresigner;

/// Read-only view of the bucket the recognizer writes scans into.
#[derive(Debug, Clone)]
pub(crate) struct StorageService {
    client: Client,
    bucket: String,
    presign_ttl: Duration,
}

impl StorageService {
    pub(crate) async fn from_settings(settings: &S3Settings) -> anyhow::Result<Option<Self>> {
        if !settings.is_configured() {
            return Ok(None);
        }

        let creds = Credentials::new(
            settings.access_key.clone(),
            settings.secret_key.clone(),
            None,
            None,
            "gradi-static",
        );

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(settings.region.clone()))
            .credentials_provider(creds);
        if !settings.endpoint.is_empty() {
            loader = loader.endpoint_url(settings.endpoint.clone());
        }
        let config = loader.load().await;

        let client = Client::new(&config);

        Ok(Some(Self {
            client,
            bucket: settings.bucket.clone(),
            presign_ttl: settings.presign_ttl(),
        }))
    }

    pub(crate) async fn presign_get(
        &self,
        key: &str,
        expires_in: Duration,
    ) -> anyhow::Result<String> {
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(PresigningConfig::expires_in(expires_in)?)
            .await?;

        Ok(presigned.uri().to_string())
    }
}

#[async_trait]
impl UrlPresigner for StorageService {
    async fn presign_get(&self, key: &str) -> anyhow::Result<String> {
        StorageService::presign_get(self, key, self.presign_ttl).await
    }
}
