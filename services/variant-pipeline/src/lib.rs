//! Variant Pipeline Service
//!
//! Turns every image uploaded to a bucket into a fixed, profile-defined set of
//! resized derivatives and tells the metadata API which filenames were written.
//!
//! ## Features
//!
//! - **Profile table**: accepted extensions, variant sizes/encodings, key layout
//!   and metadata endpoint selected per bucket and key prefix
//! - **Concurrent generation**: every variant is resized and uploaded in
//!   parallel from one shared decoded source
//! - **Typed outcomes**: skips are not errors; failures carry the stage that
//!   failed (`event`, `fetch`, `generation`, `upload`, `notify`)
//! - **Two delivery bindings**: Kafka topic consumer and HTTP webhook
//!
//! ## Architecture
//!
//! ```text
//! Bucket notification          S3 Bucket                   Metadata API
//! ┌──────────────┐            ┌────────────────────┐      ┌──────────────┐
//! │ Kafka topic  │            │ places/original/   │      │ PATCH        │
//! │  or webhook  │            │ places/small/      │      │ /…/metadata  │
//! └──────────────┘            │ places/medium/     │      └──────────────┘
//!        │                    └────────────────────┘             ▲
//!        ▼                       ▲           │                   │
//! ┌──────────────┐  fetch        │           │            ┌──────────────┐
//! │ Profile      │───────────────┼───────────┘            │ Metadata     │
//! │ Resolver     │               │ upload                 │ Notifier     │
//! └──────────────┘               │                        └──────────────┘
//!        │                ┌──────────────┐                       ▲
//!        └───────────────▶│ Variant      │───────────────────────┘
//!                         │ Generator    │
//!                         └──────────────┘
//! ```

pub mod api;
pub mod config;
pub mod environment;
pub mod error;
pub mod event;
pub mod generator;
pub mod kafka_consumer;
pub mod naming;
pub mod notifier;
pub mod pipeline;
pub mod profile;
pub mod storage;

pub use config::{Config, ConfigError};
pub use environment::{EnvironmentBinding, EnvironmentTable};
pub use error::{InvocationOutcome, PipelineError, SkipReason, WrittenVariant};
pub use event::{S3Event, StorageEvent};
pub use generator::{GeneratedVariant, GenerationError};
pub use kafka_consumer::NotificationConsumer;
pub use notifier::{HttpMetadataNotifier, MetadataNotifier, MetadataPayload, NotifyError};
pub use pipeline::{PartialWritePolicy, VariantPipeline};
pub use profile::{OutputFormat, ProfileTable, VariantProfile, VariantSpec};
pub use storage::{ObjectStore, S3ObjectStore, StorageError};
