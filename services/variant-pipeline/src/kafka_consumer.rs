use crate::config::KafkaConfig;
use crate::error::{InvocationOutcome, PipelineError};
use crate::pipeline::VariantPipeline;
use anyhow::{Context, Result};
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

/// Kafka consumer for bucket notifications.
///
/// S3-compatible stores publish one notification document per message. Each
/// message is one pipeline invocation; failures are reported and not retried.
pub struct NotificationConsumer {
    consumer: StreamConsumer,
    pipeline: Arc<VariantPipeline>,
}

impl NotificationConsumer {
    /// Create a new Kafka consumer for bucket notifications
    pub fn new(config: &KafkaConfig, pipeline: Arc<VariantPipeline>) -> Result<Self> {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", &config.consumer_group)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("max.poll.interval.ms", config.max_poll_interval_ms.to_string());

        // Configure SSL if enabled
        if config.ssl_enabled {
            client_config.set("security.protocol", "SASL_SSL");
            if let Some(ref ca_location) = config.ssl_ca_location {
                client_config.set("ssl.ca.location", ca_location);
            }
        }

        // Configure SASL if credentials provided
        if let (Some(ref username), Some(ref password)) =
            (&config.sasl_username, &config.sasl_password)
        {
            client_config
                .set("sasl.mechanisms", "PLAIN")
                .set("sasl.username", username)
                .set("sasl.password", password);
        }

        let consumer: StreamConsumer = client_config
            .create()
            .context("Failed to create Kafka consumer")?;

        consumer
            .subscribe(&[&config.notification_topic])
            .context("Failed to subscribe to notification topic")?;

        info!(
            topic = %config.notification_topic,
            group = %config.consumer_group,
            "Subscribed to Kafka topic"
        );

        Ok(Self { consumer, pipeline })
    }

    /// Consume notifications until `shutdown` is cancelled.
    ///
    /// A notification that is already being processed runs to completion.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!("Starting notification consumer");

        let mut message_stream = self.consumer.stream();

        loop {
            let message_result = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Notification consumer stopping");
                    break;
                }
                next = message_stream.next() => match next {
                    Some(result) => result,
                    None => break,
                },
            };

            match message_result {
                Ok(message) => {
                    self.process_message(&message).await;

                    // Failed invocations are not redelivered
                    if let Err(e) = self.consumer.commit_message(&message, CommitMode::Async) {
                        warn!(error = %e, "Failed to commit offset");
                    }
                }
                Err(e) => {
                    error!(error = %e, "Kafka consumer error");
                    metrics::counter!("variants.kafka.errors").increment(1);
                }
            }
        }

        Ok(())
    }

    /// Run one invocation for a Kafka message
    async fn process_message(&self, message: &BorrowedMessage<'_>) {
        let invocation_id = Uuid::new_v4();
        let span = info_span!(
            "invocation",
            %invocation_id,
            source = "kafka",
            partition = message.partition(),
            offset = message.offset()
        );

        async {
            match invoke(&self.pipeline, message.payload()).await {
                None => warn!("Message has no payload"),
                Some(Ok(InvocationOutcome::Completed { variants, .. })) => {
                    debug!(variant_count = variants.len(), "Notification processed");
                }
                Some(Ok(InvocationOutcome::Skipped { reason })) => {
                    debug!(reason = reason.as_str(), "Notification skipped");
                }
                // Logged and counted by the pipeline itself
                Some(Err(_)) => {}
            }
        }
        .instrument(span)
        .await
    }
}

/// Run the pipeline for one message payload; `None` for an empty message
async fn invoke(
    pipeline: &VariantPipeline,
    payload: Option<&[u8]>,
) -> Option<Result<InvocationOutcome, PipelineError>> {
    let payload = payload?;
    Some(pipeline.handle_payload(payload).await)
}
