//! Storage-change notification decoding.
//!
//! Notifications follow the S3 event document layout (`Records[].s3.bucket.name`,
//! `Records[].s3.object.key`). Object keys arrive URL-encoded with `+` standing
//! in for spaces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while decoding a notification document
#[derive(Debug, Error)]
pub enum EventError {
    #[error("Failed to parse notification: {0}")]
    Malformed(String),

    #[error("Notification contains no records")]
    NoRecords,

    #[error("Notification record is missing the {0}")]
    MissingField(&'static str),
}

/// Storage-change notification as delivered by the bucket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Event {
    #[serde(rename = "Records", default)]
    pub records: Vec<S3EventRecord>,
}

/// A single record of a (possibly batched) notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3EventRecord {
    #[serde(rename = "eventName", default)]
    pub event_name: Option<String>,
    #[serde(rename = "eventTime", default)]
    pub event_time: Option<DateTime<Utc>>,
    pub s3: S3Entity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Entity {
    pub bucket: S3Bucket,
    pub object: S3Object,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Bucket {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Object {
    pub key: String,
    #[serde(default)]
    pub size: Option<u64>,
}

/// Decoded bucket/key pair for one pipeline invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    /// Source bucket name
    pub bucket: String,
    /// Decoded object key, used verbatim as the storage identifier
    pub key: String,
    /// Event name from the record (e.g. `ObjectCreated:Put`)
    pub event_name: Option<String>,
    /// Object size reported by the notification
    pub size: Option<u64>,
}

impl StorageEvent {
    /// Build an event from an already-decoded bucket and key
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            event_name: None,
            size: None,
        }
    }

    /// Whether the record describes an object creation.
    ///
    /// Records without an event name are treated as creations.
    pub fn is_object_created(&self) -> bool {
        self.event_name
            .as_deref()
            .map(|name| name.contains("ObjectCreated"))
            .unwrap_or(true)
    }
}

impl S3Event {
    /// Parse a notification document from raw JSON bytes
    pub fn from_slice(payload: &[u8]) -> Result<Self, EventError> {
        serde_json::from_slice(payload).map_err(|e| EventError::Malformed(e.to_string()))
    }

    /// Decode the first record. Remaining records of a batch are ignored.
    pub fn decode(&self) -> Result<StorageEvent, EventError> {
        let record = self.records.first().ok_or(EventError::NoRecords)?;

        let bucket = record.s3.bucket.name.trim();
        if bucket.is_empty() {
            return Err(EventError::MissingField("bucket name"));
        }
        if record.s3.object.key.is_empty() {
            return Err(EventError::MissingField("object key"));
        }

        Ok(StorageEvent {
            bucket: bucket.to_string(),
            key: decode_key(&record.s3.object.key),
            event_name: record.event_name.clone(),
            size: record.s3.object.size,
        })
    }
}

/// Decode a notification object key.
///
/// `+` must become a space before percent-decoding, otherwise an encoded
/// `%2B` would be turned into a space as well.
pub fn decode_key(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|s| s.into_owned())
        .unwrap_or(spaced)
}
