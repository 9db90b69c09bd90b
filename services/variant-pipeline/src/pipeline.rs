//! The variant pipeline: one uploaded object in, a profile-defined set of
//! derivative objects plus one metadata notification out.
//!
//! ```text
//! notification ─▶ decode ─▶ resolve profile ─▶ classify ─▶ fetch
//!                                                            │
//!                  ┌─────────────── per variant ─────────────┤
//!                  ▼                                          ▼
//!            generate ─▶ upload                        generate ─▶ upload
//!                  └──────────────────┬───────────────────────┘
//!                                     ▼
//!                        resolve environment ─▶ notify
//! ```

use crate::environment::EnvironmentTable;
use crate::error::{InvocationOutcome, PipelineError, SkipReason, WrittenVariant, FAILURE_MESSAGE};
use crate::event::{S3Event, StorageEvent};
use crate::generator::{self, SourceImage};
use crate::naming::{derivative_filename, destination_key, ObjectKey};
use crate::notifier::{MetadataNotifier, MetadataPayload};
use crate::profile::{ProfileTable, VariantProfile, VariantSpec};
use crate::storage::ObjectStore;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Handling of variants already written when a sibling upload fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialWritePolicy {
    /// Leave written variants in place (no notification is sent)
    #[default]
    Retain,
    /// Delete written variants, best effort
    RollBack,
}

/// Parameterized variant pipeline.
///
/// Clients and lookup tables are constructed once at startup and shared by
/// every invocation; invocations hold no state of their own.
pub struct VariantPipeline {
    store: Arc<dyn ObjectStore>,
    notifier: Arc<dyn MetadataNotifier>,
    profiles: Arc<ProfileTable>,
    environments: Arc<EnvironmentTable>,
    partial_write_policy: PartialWritePolicy,
}

impl VariantPipeline {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        notifier: Arc<dyn MetadataNotifier>,
        profiles: ProfileTable,
        environments: EnvironmentTable,
    ) -> Self {
        Self {
            store,
            notifier,
            profiles: Arc::new(profiles),
            environments: Arc::new(environments),
            partial_write_policy: PartialWritePolicy::default(),
        }
    }

    pub fn with_partial_write_policy(mut self, policy: PartialWritePolicy) -> Self {
        self.partial_write_policy = policy;
        self
    }

    pub fn profiles(&self) -> &ProfileTable {
        &self.profiles
    }

    /// Handle a raw notification document
    pub async fn handle_payload(&self, payload: &[u8]) -> Result<InvocationOutcome, PipelineError> {
        let notification = S3Event::from_slice(payload).map_err(|e| {
            let e = PipelineError::from(e);
            record_failure(&e);
            e
        })?;
        self.handle_notification(&notification).await
    }

    /// Handle a parsed notification; only its first record is processed
    pub async fn handle_notification(
        &self,
        notification: &S3Event,
    ) -> Result<InvocationOutcome, PipelineError> {
        let event = notification.decode().map_err(|e| {
            let e = PipelineError::from(e);
            record_failure(&e);
            e
        })?;
        self.process(event).await
    }

    /// Run one invocation for a decoded event
    #[instrument(skip(self, event), fields(bucket = %event.bucket, key = %event.key))]
    pub async fn process(&self, event: StorageEvent) -> Result<InvocationOutcome, PipelineError> {
        let started = Instant::now();
        let result = self.run(&event).await;

        metrics::histogram!("variants.invocation.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        match &result {
            Ok(InvocationOutcome::Completed { profile, variants, .. }) => {
                metrics::counter!("variants.invocations.completed").increment(1);
                info!(
                    profile = %profile,
                    variant_count = variants.len(),
                    "Variants created and metadata updated"
                );
            }
            Ok(InvocationOutcome::Skipped { reason }) => {
                metrics::counter!("variants.invocations.skipped", "reason" => reason.as_str())
                    .increment(1);
                info!(reason = reason.as_str(), "Skipping object");
            }
            Err(e) => record_failure(e),
        }

        result
    }

    async fn run(&self, event: &StorageEvent) -> Result<InvocationOutcome, PipelineError> {
        if !event.is_object_created() {
            return Ok(skipped(SkipReason::NotObjectCreated {
                event_name: event.event_name.clone().unwrap_or_default(),
            }));
        }

        if let Some(owner) = self.profiles.derivative_owner(&event.bucket, &event.key) {
            return Ok(skipped(SkipReason::Derivative {
                profile: owner.name.clone(),
            }));
        }

        let Some(profile) = self.profiles.resolve(&event.bucket, &event.key) else {
            return Ok(skipped(SkipReason::NoProfile));
        };

        let object_key = ObjectKey::new(&event.key);
        let filename = object_key.filename_with_extension();

        if !profile.accepts(filename) {
            debug!(filename = %filename, profile = %profile.name, "Object is not an accepted image");
            return Ok(skipped(SkipReason::UnsupportedExtension {
                filename: filename.to_string(),
                profile: profile.name.clone(),
            }));
        }

        let source_bytes = self
            .store
            .get_object(&event.bucket, &event.key)
            .await
            .map_err(|source| PipelineError::Fetch {
                key: event.key.clone(),
                source,
            })?;

        let source = generator::decode_source(
            source_bytes,
            object_key.extension().map(str::to_string),
        )
        .await
        .map_err(|source| PipelineError::Generation {
            stage: "decode".to_string(),
            source,
        })?;

        let written = self
            .write_variants(event, profile, object_key.base_filename(), source)
            .await?;

        let mut payload = MetadataPayload::new(filename);
        for (spec, variant) in profile.variants.iter().zip(&written) {
            payload.push(spec.metadata_field(), variant.filename.clone());
        }

        let binding = self.environments.resolve(&event.bucket);
        self.notifier
            .notify(&binding, &profile.metadata_path, &payload)
            .await?;

        Ok(InvocationOutcome::Completed {
            profile: profile.name.clone(),
            original_filename: filename.to_string(),
            variants: written,
        })
    }

    /// Generate and upload every variant concurrently, then apply the
    /// partial-write policy if any branch failed.
    async fn write_variants(
        &self,
        event: &StorageEvent,
        profile: &VariantProfile,
        base_filename: &str,
        source: Arc<SourceImage>,
    ) -> Result<Vec<WrittenVariant>, PipelineError> {
        let branches = profile.variants.iter().map(|spec| {
            self.write_variant(event, profile, base_filename, source.clone(), spec)
        });

        let mut written = Vec::with_capacity(profile.variants.len());
        let mut first_error = None;

        for result in join_all(branches).await {
            match result {
                Ok(variant) => written.push(variant),
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        let Some(error) = first_error else {
            return Ok(written);
        };

        if !written.is_empty() {
            match self.partial_write_policy {
                PartialWritePolicy::Retain => {
                    warn!(
                        written = ?written.iter().map(|v| v.key.as_str()).collect::<Vec<_>>(),
                        "Variant set incomplete; leaving written variants in storage"
                    );
                }
                PartialWritePolicy::RollBack => self.roll_back(&event.bucket, &written).await,
            }
        }

        Err(error)
    }

    #[instrument(skip(self, event, profile, base_filename, source, spec), fields(label = %spec.label))]
    async fn write_variant(
        &self,
        event: &StorageEvent,
        profile: &VariantProfile,
        base_filename: &str,
        source: Arc<SourceImage>,
        spec: &VariantSpec,
    ) -> Result<WrittenVariant, PipelineError> {
        let variant = generator::generate_variant(source, spec.clone())
            .await
            .map_err(|source| PipelineError::Generation {
                stage: spec.label.clone(),
                source,
            })?;

        let filename = derivative_filename(&spec.label, base_filename, &variant.extension);
        let key = destination_key(&profile.root_prefix, &spec.label, &filename);
        let size_bytes = variant.data.len();

        self.store
            .put_object(&event.bucket, &key, variant.data, variant.content_type)
            .await
            .map_err(|source| PipelineError::Upload {
                key: key.clone(),
                source,
            })?;

        metrics::counter!("variants.uploads").increment(1);
        metrics::counter!("variants.bytes.uploaded").increment(size_bytes as u64);

        info!(key = %key, size_bytes = size_bytes, "Variant uploaded");

        Ok(WrittenVariant {
            label: spec.label.clone(),
            key,
            filename,
            width: variant.width,
            height: variant.height,
            size_bytes,
        })
    }

    async fn roll_back(&self, bucket: &str, written: &[WrittenVariant]) {
        let deletions = written.iter().map(|variant| async move {
            match self.store.delete_object(bucket, &variant.key).await {
                Ok(()) => info!(key = %variant.key, "Rolled back variant"),
                Err(e) => error!(key = %variant.key, error = %e, "Failed to roll back variant"),
            }
        });
        join_all(deletions).await;
    }
}

fn skipped(reason: SkipReason) -> InvocationOutcome {
    InvocationOutcome::Skipped { reason }
}

fn record_failure(e: &PipelineError) {
    metrics::counter!("variants.invocations.failed", "kind" => e.kind()).increment(1);
    error!(kind = e.kind(), error = %e, "{}", FAILURE_MESSAGE);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::EnvironmentBinding;
    use crate::generator::tests::sample_image;
    use crate::notifier::{MockMetadataNotifier, NotifyError};
    use crate::storage::memory::MemoryObjectStore;
    use image::{GenericImageView, ImageFormat, ImageOutputFormat};
    use serde_json::json;

    const BUCKET: &str = "jn-foo-production";

    fn environments() -> EnvironmentTable {
        let mut table = EnvironmentTable::default();
        table.insert(
            "production",
            BUCKET,
            EnvironmentBinding::new("https://api.example.com", "production-token"),
        );
        table
    }

    fn pipeline(store: Arc<MemoryObjectStore>, notifier: MockMetadataNotifier) -> VariantPipeline {
        VariantPipeline::new(
            store,
            Arc::new(notifier),
            ProfileTable::builtin(),
            environments(),
        )
    }

    fn places_store() -> Arc<MemoryObjectStore> {
        Arc::new(MemoryObjectStore::with_object(
            BUCKET,
            "places/original/IMG01.jpg",
            sample_image(1000, 750, ImageOutputFormat::Jpeg(90)),
        ))
    }

    fn silent_notifier() -> MockMetadataNotifier {
        let mut notifier = MockMetadataNotifier::new();
        notifier.expect_notify().never();
        notifier
    }

    #[tokio::test]
    async fn test_places_production_scenario() {
        let store = places_store();

        let mut expected = MetadataPayload::new("IMG01.jpg");
        expected.push("smallFilename", "small-IMG01.jpeg");
        expected.push("mediumFilename", "medium-IMG01.jpeg");

        let mut notifier = MockMetadataNotifier::new();
        notifier
            .expect_notify()
            .withf(move |binding, path, payload| {
                *binding == EnvironmentBinding::new("https://api.example.com", "production-token")
                    && path == "/place-photos/metadata"
                    && *payload == expected
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let outcome = pipeline(store.clone(), notifier)
            .process(StorageEvent::new(BUCKET, "places/original/IMG01.jpg"))
            .await
            .unwrap();

        let (profile, original_filename, variants) = match outcome {
            InvocationOutcome::Completed {
                profile,
                original_filename,
                variants,
            } => (profile, original_filename, variants),
            other => panic!("Expected completed outcome, got {:?}", other),
        };
        assert_eq!(profile, "places");
        assert_eq!(original_filename, "IMG01.jpg");

        let keys: Vec<&str> = variants.iter().map(|v| v.key.as_str()).collect();
        assert_eq!(keys, vec!["places/small/small-IMG01.jpeg", "places/medium/medium-IMG01.jpeg"]);
        assert_eq!(store.puts.lock().unwrap().len(), 2);

        for (key, width, height) in [
            ("places/small/small-IMG01.jpeg", 350, 263),
            ("places/medium/medium-IMG01.jpeg", 650, 488),
        ] {
            let data = store.object(BUCKET, key).unwrap();
            assert_eq!(image::guess_format(&data).unwrap(), ImageFormat::Jpeg);
            assert_eq!(image::load_from_memory(&data).unwrap().dimensions(), (width, height));
        }
    }

    #[tokio::test]
    async fn test_unsupported_extension_has_no_side_effects() {
        let store = Arc::new(MemoryObjectStore::with_object(
            BUCKET,
            "places/original/photo.webp",
            vec![1, 2, 3],
        ));

        let outcome = pipeline(store.clone(), silent_notifier())
            .process(StorageEvent::new(BUCKET, "places/original/photo.webp"))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            InvocationOutcome::Skipped {
                reason: SkipReason::UnsupportedExtension {
                    filename: "photo.webp".to_string(),
                    profile: "places".to_string(),
                }
            }
        );
        assert!(store.gets.lock().unwrap().is_empty());
        assert!(store.puts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_accepted_extensions_any_case() {
        for key in ["places/original/a.JPG", "places/original/b.Jpeg", "places/original/c.PNG"] {
            let format = if key.ends_with("PNG") {
                ImageOutputFormat::Png
            } else {
                ImageOutputFormat::Jpeg(90)
            };
            let store = Arc::new(MemoryObjectStore::with_object(
                BUCKET,
                key,
                sample_image(64, 48, format),
            ));

            let mut notifier = MockMetadataNotifier::new();
            notifier.expect_notify().times(1).returning(|_, _, _| Ok(()));

            let outcome = pipeline(store.clone(), notifier)
                .process(StorageEvent::new(BUCKET, key))
                .await
                .unwrap();

            assert!(!outcome.is_skipped(), "{key} should be processed");
            assert_eq!(store.puts.lock().unwrap().len(), 2);
        }
    }

    #[tokio::test]
    async fn test_no_profile_skips_quietly() {
        let store = Arc::new(MemoryObjectStore::default());

        let outcome = pipeline(store.clone(), silent_notifier())
            .process(StorageEvent::new(BUCKET, "uploads/IMG01.jpg"))
            .await
            .unwrap();

        assert_eq!(outcome, InvocationOutcome::Skipped { reason: SkipReason::NoProfile });
        assert!(store.gets.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_removed_object_is_skipped() {
        let store = places_store();
        let mut event = StorageEvent::new(BUCKET, "places/original/IMG01.jpg");
        event.event_name = Some("ObjectRemoved:Delete".to_string());

        let outcome = pipeline(store.clone(), silent_notifier())
            .process(event)
            .await
            .unwrap();

        assert!(outcome.is_skipped());
        assert!(store.gets.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_written_variants_are_not_reprocessed() {
        let store = places_store();

        let mut notifier = MockMetadataNotifier::new();
        notifier.expect_notify().times(1).returning(|_, _, _| Ok(()));
        let pipeline = pipeline(store.clone(), notifier);

        pipeline
            .process(StorageEvent::new(BUCKET, "places/original/IMG01.jpg"))
            .await
            .unwrap();

        // The bucket notifies again for every variant written
        for key in ["places/small/small-IMG01.jpeg", "places/medium/medium-IMG01.jpeg"] {
            let outcome = pipeline.process(StorageEvent::new(BUCKET, key)).await.unwrap();
            assert_eq!(
                outcome,
                InvocationOutcome::Skipped {
                    reason: SkipReason::Derivative {
                        profile: "places".to_string()
                    }
                }
            );
        }
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_bucket_keyed_profile_does_not_loop() {
        let mut avatars = ProfileTable::builtin().profiles()[1].clone();
        avatars.buckets = vec![BUCKET.to_string()];
        avatars.prefix = None;

        let store = Arc::new(MemoryObjectStore::with_object(
            BUCKET,
            "uploads/me.png",
            sample_image(300, 300, ImageOutputFormat::Png),
        ));
        let mut notifier = MockMetadataNotifier::new();
        notifier.expect_notify().times(1).returning(|_, _, _| Ok(()));

        let pipeline = VariantPipeline::new(
            store.clone(),
            Arc::new(notifier),
            ProfileTable::new(vec![avatars]).unwrap(),
            environments(),
        );

        pipeline
            .process(StorageEvent::new(BUCKET, "uploads/me.png"))
            .await
            .unwrap();
        let outcome = pipeline
            .process(StorageEvent::new(BUCKET, "avatars/thumbnail/thumbnail-me.jpeg"))
            .await
            .unwrap();

        assert!(outcome.is_skipped());
        assert!(store
            .object(BUCKET, "avatars/thumbnail/thumbnail-thumbnail-me.jpeg")
            .is_none());
        assert_eq!(store.len(), 2);
        assert_eq!(store.gets.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_partial_upload_failure_retains_written_variant() {
        let store = places_store();
        store.fail_puts_to("places/medium/medium-IMG01.jpeg");

        let error = pipeline(store.clone(), silent_notifier())
            .process(StorageEvent::new(BUCKET, "places/original/IMG01.jpg"))
            .await
            .unwrap_err();

        assert_eq!(error.kind(), "upload");
        assert!(matches!(
            &error,
            PipelineError::Upload { key, .. } if key == "places/medium/medium-IMG01.jpeg"
        ));
        // Known gap: the sibling stays behind and the metadata never learns about it
        assert!(store.object(BUCKET, "places/small/small-IMG01.jpeg").is_some());
        assert!(store.deletes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partial_upload_failure_roll_back() {
        let store = places_store();
        store.fail_puts_to("places/medium/medium-IMG01.jpeg");

        let error = pipeline(store.clone(), silent_notifier())
            .with_partial_write_policy(PartialWritePolicy::RollBack)
            .process(StorageEvent::new(BUCKET, "places/original/IMG01.jpg"))
            .await
            .unwrap_err();

        assert_eq!(error.kind(), "upload");
        assert!(store.object(BUCKET, "places/small/small-IMG01.jpeg").is_none());
        assert_eq!(
            *store.deletes.lock().unwrap(),
            vec!["places/small/small-IMG01.jpeg".to_string()]
        );
        // The original is untouched
        assert!(store.object(BUCKET, "places/original/IMG01.jpg").is_some());
    }

    #[tokio::test]
    async fn test_missing_object_is_fetch_failure() {
        let store = Arc::new(MemoryObjectStore::default());

        let error = pipeline(store.clone(), silent_notifier())
            .process(StorageEvent::new(BUCKET, "places/original/IMG01.jpg"))
            .await
            .unwrap_err();

        assert_eq!(error.kind(), "fetch");
        assert!(store.puts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_image_is_generation_failure() {
        let store = Arc::new(MemoryObjectStore::with_object(
            BUCKET,
            "places/original/IMG01.jpg",
            b"not really a jpeg".to_vec(),
        ));

        let error = pipeline(store.clone(), silent_notifier())
            .process(StorageEvent::new(BUCKET, "places/original/IMG01.jpg"))
            .await
            .unwrap_err();

        assert!(matches!(&error, PipelineError::Generation { stage, .. } if stage == "decode"));
        assert!(store.puts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_notify_failure_keeps_variants() {
        let store = places_store();

        let mut notifier = MockMetadataNotifier::new();
        notifier
            .expect_notify()
            .times(1)
            .returning(|_, _, _| Err(NotifyError::Status { status: 502, body: String::new() }));

        let error = pipeline(store.clone(), notifier)
            .process(StorageEvent::new(BUCKET, "places/original/IMG01.jpg"))
            .await
            .unwrap_err();

        assert_eq!(error.kind(), "notify");
        assert!(store.object(BUCKET, "places/small/small-IMG01.jpeg").is_some());
        assert!(store.object(BUCKET, "places/medium/medium-IMG01.jpeg").is_some());
    }

    #[tokio::test]
    async fn test_unknown_bucket_notifies_with_empty_binding() {
        let store = Arc::new(MemoryObjectStore::with_object(
            "unknown-bucket",
            "avatars/original/me.png",
            sample_image(300, 300, ImageOutputFormat::Png),
        ));

        let mut notifier = MockMetadataNotifier::new();
        notifier
            .expect_notify()
            .withf(|binding, path, payload| {
                binding.is_empty()
                    && path == "/avatars/metadata"
                    && payload.get("thumbnailFilename") == Some("thumbnail-me.jpeg")
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let outcome = pipeline(store.clone(), notifier)
            .process(StorageEvent::new("unknown-bucket", "avatars/original/me.png"))
            .await
            .unwrap();

        assert!(!outcome.is_skipped());
        assert!(store
            .object("unknown-bucket", "avatars/thumbnail/thumbnail-me.jpeg")
            .is_some());
    }

    #[tokio::test]
    async fn test_repeat_invocation_overwrites_identical_variants() {
        let store = places_store();

        let mut notifier = MockMetadataNotifier::new();
        notifier.expect_notify().times(2).returning(|_, _, _| Ok(()));
        let pipeline = pipeline(store.clone(), notifier);

        pipeline
            .process(StorageEvent::new(BUCKET, "places/original/IMG01.jpg"))
            .await
            .unwrap();
        let first = store.object(BUCKET, "places/small/small-IMG01.jpeg").unwrap();

        pipeline
            .process(StorageEvent::new(BUCKET, "places/original/IMG01.jpg"))
            .await
            .unwrap();
        let second = store.object(BUCKET, "places/small/small-IMG01.jpeg").unwrap();

        assert_eq!(first, second);
        // Original plus two variants, no duplicates
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_same_as_source_profile_keeps_extension() {
        let store = Arc::new(MemoryObjectStore::with_object(
            BUCKET,
            "place-photos/original/map.png",
            sample_image(800, 400, ImageOutputFormat::Png),
        ));

        let mut notifier = MockMetadataNotifier::new();
        notifier
            .expect_notify()
            .withf(|_, _, payload| {
                serde_json::to_value(payload).unwrap()
                    == json!({
                        "originalFilename": "map.png",
                        "smallFilename": "small-map.png",
                        "mediumFilename": "medium-map.png"
                    })
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        pipeline(store.clone(), notifier)
            .process(StorageEvent::new(BUCKET, "place-photos/original/map.png"))
            .await
            .unwrap();

        let small = store.object(BUCKET, "places/small/small-map.png").unwrap();
        assert_eq!(image::guess_format(&small).unwrap(), ImageFormat::Png);
        assert_eq!(image::load_from_memory(&small).unwrap().dimensions(), (400, 200));
    }

    #[tokio::test]
    async fn test_handle_payload_decodes_key() {
        let store = Arc::new(MemoryObjectStore::with_object(
            BUCKET,
            "places/original/my photo.jpg",
            sample_image(200, 100, ImageOutputFormat::Jpeg(90)),
        ));

        let mut notifier = MockMetadataNotifier::new();
        notifier
            .expect_notify()
            .withf(|_, _, payload| payload.original_filename == "my photo.jpg")
            .times(1)
            .returning(|_, _, _| Ok(()));

        let payload = json!({
            "Records": [{
                "eventName": "ObjectCreated:Put",
                "s3": {
                    "bucket": { "name": BUCKET },
                    "object": { "key": "places/original/my+photo.jpg", "size": 1024 }
                }
            }]
        });

        pipeline(store.clone(), notifier)
            .handle_payload(payload.to_string().as_bytes())
            .await
            .unwrap();

        assert!(store.object(BUCKET, "places/small/small-my photo.jpeg").is_some());
    }

    #[tokio::test]
    async fn test_handle_payload_rejects_malformed() {
        let store = Arc::new(MemoryObjectStore::default());

        let error = pipeline(store, silent_notifier())
            .handle_payload(b"{}")
            .await
            .unwrap_err();

        assert_eq!(error.kind(), "event");
    }
}
