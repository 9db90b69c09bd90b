//! Invocation outcomes and the failure taxonomy.
//!
//! Skips are outcomes, not errors. Every failure carries a kind so bindings,
//! logs and metrics can tell the stages apart.

use crate::event::EventError;
use crate::generator::GenerationError;
use crate::notifier::NotifyError;
use crate::storage::StorageError;
use serde::Serialize;
use thiserror::Error;

/// Generic message reported for every failed invocation
pub const FAILURE_MESSAGE: &str = "Error processing the image.";

/// A fatal failure of one invocation
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid notification: {0}")]
    Event(#[from] EventError),

    #[error("Failed to fetch {key}: {source}")]
    Fetch {
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("Image generation failed at {stage}: {source}")]
    Generation {
        /// `decode`, or the label of the failing variant
        stage: String,
        #[source]
        source: GenerationError,
    },

    #[error("Failed to upload {key}: {source}")]
    Upload {
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("Failed to update metadata: {0}")]
    Notify(#[from] NotifyError),
}

impl PipelineError {
    /// Stable identifier of the failing stage
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Event(_) => "event",
            PipelineError::Fetch { .. } => "fetch",
            PipelineError::Generation { .. } => "generation",
            PipelineError::Upload { .. } => "upload",
            PipelineError::Notify(_) => "notify",
        }
    }
}

/// Why an invocation ended without side effects
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// The record is not an object creation (e.g. a delete)
    NotObjectCreated { event_name: String },
    /// The object is a variant written by this profile
    Derivative { profile: String },
    /// No profile covers the bucket/key
    NoProfile,
    /// The filename's extension is not accepted by the profile
    UnsupportedExtension { filename: String, profile: String },
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NotObjectCreated { .. } => "not_object_created",
            SkipReason::Derivative { .. } => "derivative",
            SkipReason::NoProfile => "no_profile",
            SkipReason::UnsupportedExtension { .. } => "unsupported_extension",
        }
    }
}

/// One derivative that was written to storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WrittenVariant {
    pub label: String,
    pub key: String,
    pub filename: String,
    pub width: u32,
    pub height: u32,
    pub size_bytes: usize,
}

/// Result of an invocation that did not fail
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InvocationOutcome {
    Completed {
        profile: String,
        original_filename: String,
        variants: Vec<WrittenVariant>,
    },
    Skipped {
        #[serde(flatten)]
        reason: SkipReason,
    },
}

impl InvocationOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, InvocationOutcome::Skipped { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_kinds() {
        let fetch = PipelineError::Fetch {
            key: "k".to_string(),
            source: StorageError::Request("denied".to_string()),
        };
        assert_eq!(fetch.kind(), "fetch");
        assert!(fetch.to_string().contains("denied"));

        assert_eq!(PipelineError::from(EventError::NoRecords).kind(), "event");
        assert_eq!(
            PipelineError::from(NotifyError::Request("x".to_string())).kind(),
            "notify"
        );
        assert_eq!(
            PipelineError::Generation {
                stage: "small".to_string(),
                source: GenerationError::UnknownFormat,
            }
            .kind(),
            "generation"
        );
    }

    #[test]
    fn test_skipped_outcome_serialization() {
        let outcome = InvocationOutcome::Skipped {
            reason: SkipReason::UnsupportedExtension {
                filename: "a.webp".to_string(),
                profile: "places".to_string(),
            },
        };

        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            json!({
                "status": "skipped",
                "reason": "unsupported_extension",
                "filename": "a.webp",
                "profile": "places"
            })
        );
        assert!(outcome.is_skipped());

        let derivative = InvocationOutcome::Skipped {
            reason: SkipReason::Derivative {
                profile: "places".to_string(),
            },
        };
        assert_eq!(
            serde_json::to_value(&derivative).unwrap(),
            json!({ "status": "skipped", "reason": "derivative", "profile": "places" })
        );
    }
}
