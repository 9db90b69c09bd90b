use crate::config::NotifierConfig;
use crate::environment::EnvironmentBinding;
use async_trait::async_trait;
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Metadata request failed: {0}")]
    Request(String),

    #[error("Metadata API responded with {status}: {body}")]
    Status { status: u16, body: String },
}

/// Payload field carrying the uploaded object's own filename
pub const ORIGINAL_FILENAME_FIELD: &str = "originalFilename";

/// Body of the metadata update: the original filename plus one
/// `{label}Filename` field per derivative, in profile order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataPayload {
    pub original_filename: String,
    derivatives: Vec<(String, String)>,
}

impl MetadataPayload {
    pub fn new(original_filename: impl Into<String>) -> Self {
        Self {
            original_filename: original_filename.into(),
            derivatives: Vec::new(),
        }
    }

    /// Record a derivative under its metadata field name
    pub fn push(&mut self, field: impl Into<String>, filename: impl Into<String>) {
        self.derivatives.push((field.into(), filename.into()));
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.derivatives
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, filename)| filename.as_str())
    }

    pub fn derivative_count(&self) -> usize {
        self.derivatives.len()
    }
}

impl Serialize for MetadataPayload {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.derivatives.len() + 1))?;
        map.serialize_entry(ORIGINAL_FILENAME_FIELD, &self.original_filename)?;
        for (field, filename) in &self.derivatives {
            map.serialize_entry(field, filename)?;
        }
        map.end()
    }
}

/// Receiver of the single metadata update sent per processed upload
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetadataNotifier: Send + Sync {
    async fn notify(
        &self,
        binding: &EnvironmentBinding,
        metadata_path: &str,
        payload: &MetadataPayload,
    ) -> Result<(), NotifyError>;
}

/// Sends the update as `PATCH {api_base_url}{metadata_path}` with bearer auth
pub struct HttpMetadataNotifier {
    client: reqwest::Client,
}

impl HttpMetadataNotifier {
    pub fn new(config: &NotifierConfig) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| NotifyError::Request(e.to_string()))?;

        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MetadataNotifier for HttpMetadataNotifier {
    #[instrument(skip(self, binding, payload), fields(api = %binding.api_base_url))]
    async fn notify(
        &self,
        binding: &EnvironmentBinding,
        metadata_path: &str,
        payload: &MetadataPayload,
    ) -> Result<(), NotifyError> {
        let url = format!("{}{}", binding.api_base_url, metadata_path);

        let response = self
            .client
            .patch(&url)
            .bearer_auth(&binding.bearer_token)
            .json(payload)
            .send()
            .await
            .map_err(|e| NotifyError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Status {
                status: status.as_u16(),
                body,
            });
        }

        debug!(status = status.as_u16(), "Metadata updated");
        Ok(())
    }
}
