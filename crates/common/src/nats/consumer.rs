use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_nats::jetstream;
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::{debug, error, info};

use crate::nats::{JetStreamConsumer, PullConsumer};
use crate::queue::{Batch, BatchProcessor, BatchReport, Decoded, HandlerError, MessageDecoder};
use crate::scope::BindingContext;

/// Where and how a [`QueueConsumer`] pulls its batches
#[derive(Debug, Clone)]
pub struct QueueConsumerConfig {
    pub stream_name: String,
    pub consumer_name: String,
    pub subject_filter: String,
    pub batch_size: usize,
    pub max_wait: Duration,
}

/// Pulls batches from a durable JetStream consumer and hands each one to a
/// [`BatchProcessor`] with a fresh binding context.
pub struct QueueConsumer<D, H> {
    consumer: Box<dyn PullConsumer>,
    config: QueueConsumerConfig,
    processor: BatchProcessor<D, H>,
    bindings: Arc<HashMap<String, String>>,
}

impl<D, H> QueueConsumer<D, H>
where
    D: MessageDecoder,
    H: Service<Decoded<D::Output>, Response = (), Error = HandlerError>
        + Clone
        + Send
        + Sync
        + 'static,
    H::Future: Send + 'static,
{
    pub async fn new(
        jetstream: Arc<dyn JetStreamConsumer>,
        config: QueueConsumerConfig,
        processor: BatchProcessor<D, H>,
        bindings: HashMap<String, String>,
    ) -> Result<Self> {
        debug!(
            stream = %config.stream_name,
            consumer = %config.consumer_name,
            filter_subject = %config.subject_filter,
            "creating queue consumer"
        );

        let pull_config = jetstream::consumer::pull::Config {
            name: Some(config.consumer_name.clone()),
            durable_name: Some(config.consumer_name.clone()),
            filter_subject: config.subject_filter.clone(),
            ack_policy: jetstream::consumer::AckPolicy::Explicit,
            ..Default::default()
        };

        let consumer = jetstream
            .create_consumer(pull_config, &config.stream_name)
            .await
            .context("failed to create consumer")?;

        Ok(Self {
            consumer,
            config,
            processor,
            bindings: Arc::new(bindings),
        })
    }

    /// Run the consumer loop until cancellation.
    ///
    /// A batch in progress when `ctx` fires is stopped through the processor,
    /// so unfinished messages are redelivered and batch resources released.
    pub async fn run(self, ctx: CancellationToken) -> Result<()> {
        info!(
            stream = %self.config.stream_name,
            consumer = %self.config.consumer_name,
            "starting queue consumer"
        );

        while !ctx.is_cancelled() {
            if let Err(e) = self.fetch_and_process_batch(&ctx).await {
                error!(
                    stream = %self.config.stream_name,
                    consumer = %self.config.consumer_name,
                    error = %format!("{e:#}"),
                    "error fetching batch"
                );
                tokio::select! {
                    _ = ctx.cancelled() => {}
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
        }

        info!(
            stream = %self.config.stream_name,
            consumer = %self.config.consumer_name,
            "queue consumer stopped gracefully"
        );
        Ok(())
    }

    async fn fetch_and_process_batch(&self, ctx: &CancellationToken) -> Result<Option<BatchReport>> {
        let messages = tokio::select! {
            _ = ctx.cancelled() => return Ok(None),
            fetched = self.consumer.fetch_batch(self.config.batch_size, self.config.max_wait) => fetched?,
        };

        if messages.is_empty() {
            debug!("no messages in batch");
            return Ok(None);
        }

        debug!(message_count = messages.len(), "received message batch");

        let batch = Batch::new(self.config.stream_name.clone(), messages);
        let bindings = BindingContext::new(self.bindings.clone());
        let report = self
            .processor
            .process_until(batch, bindings, ctx.child_token())
            .await;

        Ok(Some(report))
    }
}
