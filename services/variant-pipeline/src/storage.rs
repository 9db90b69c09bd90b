use crate::config::S3Config;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Credentials};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors from the object storage backend
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("Storage request failed: {0}")]
    Request(String),

    #[error("Failed to read object body: {0}")]
    Body(String),
}

/// Object storage operations used by the pipeline
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch the complete object body as one contiguous buffer
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, StorageError>;

    /// Write an object, replacing any existing object at the key
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError>;

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StorageError>;
}

/// S3 (or S3-compatible) object store
pub struct S3ObjectStore {
    client: S3Client,
    cache_control: Option<String>,
}

impl S3ObjectStore {
    /// Create a store from configuration
    pub async fn new(config: &S3Config) -> anyhow::Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Static credentials override the default provider chain
        if let (Some(access_key_id), Some(secret_access_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            s3_config_builder = s3_config_builder.credentials_provider(Credentials::new(
                access_key_id,
                secret_access_key,
                None,
                None,
                "variant-pipeline-config",
            ));
        }

        // Custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            region = %config.region,
            endpoint = config.endpoint_url.as_deref().unwrap_or("default"),
            "S3 object store initialized"
        );

        Ok(Self {
            client,
            cache_control: config.cache_control.clone(),
        })
    }

    pub fn client(&self) -> &S3Client {
        &self.client
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self))]
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, StorageError> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    StorageError::NotFound {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    }
                } else {
                    StorageError::Request(e.to_string())
                }
            })?;

        // Drain the streamed body; the codec needs the whole buffer
        let body = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Body(e.to_string()))?
            .into_bytes();

        debug!(size_bytes = body.len(), "Fetched object");
        Ok(body)
    }

    #[instrument(skip(self, data), fields(size_bytes = data.len()))]
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let mut request = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(data))
            .content_type(content_type);

        if let Some(ref cache_control) = self.cache_control {
            request = request.cache_control(cache_control);
        }

        request
            .send()
            .await
            .map_err(|e| StorageError::Request(e.to_string()))?;

        debug!("Object written");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::Request(e.to_string()))?;

        debug!("Object deleted");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory store recording every call, with per-key write failures
    #[derive(Default)]
    pub(crate) struct MemoryObjectStore {
        objects: Mutex<HashMap<(String, String), Bytes>>,
        failing_puts: Mutex<Vec<String>>,
        pub(crate) gets: Mutex<Vec<String>>,
        pub(crate) puts: Mutex<Vec<String>>,
        pub(crate) deletes: Mutex<Vec<String>>,
    }

    impl MemoryObjectStore {
        pub(crate) fn with_object(bucket: &str, key: &str, data: Vec<u8>) -> Self {
            let store = Self::default();
            store
                .objects
                .lock()
                .unwrap()
                .insert((bucket.to_string(), key.to_string()), Bytes::from(data));
            store
        }

        pub(crate) fn fail_puts_to(&self, key: &str) {
            self.failing_puts.lock().unwrap().push(key.to_string());
        }

        pub(crate) fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
            self.objects
                .lock()
                .unwrap()
                .get(&(bucket.to_string(), key.to_string()))
                .cloned()
        }

        pub(crate) fn len(&self) -> usize {
            self.objects.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ObjectStore for MemoryObjectStore {
        async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, StorageError> {
            self.gets.lock().unwrap().push(key.to_string());
            self.object(bucket, key).ok_or_else(|| StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
        }

        async fn put_object(
            &self,
            bucket: &str,
            key: &str,
            data: Bytes,
            _content_type: &str,
        ) -> Result<(), StorageError> {
            self.puts.lock().unwrap().push(key.to_string());
            if self.failing_puts.lock().unwrap().iter().any(|k| k == key) {
                return Err(StorageError::Request(format!("injected failure for {key}")));
            }
            self.objects
                .lock()
                .unwrap()
                .insert((bucket.to_string(), key.to_string()), data);
            Ok(())
        }

        async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
            self.deletes.lock().unwrap().push(key.to_string());
            self.objects
                .lock()
                .unwrap()
                .remove(&(bucket.to_string(), key.to_string()));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryObjectStore;
    use super::*;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryObjectStore::default();
        store
            .put_object("b", "k", Bytes::from_static(b"data"), "image/jpeg")
            .await
            .unwrap();

        assert_eq!(store.get_object("b", "k").await.unwrap(), Bytes::from_static(b"data"));
        store.delete_object("b", "k").await.unwrap();
        assert!(matches!(
            store.get_object("b", "k").await,
            Err(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_memory_store_injected_failure() {
        let store = MemoryObjectStore::default();
        store.fail_puts_to("bad");

        let result = store
            .put_object("b", "bad", Bytes::new(), "image/jpeg")
            .await;
        assert!(matches!(result, Err(StorageError::Request(_))));
        assert_eq!(store.len(), 0);
    }
}
