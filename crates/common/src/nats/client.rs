use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_nats::jetstream::{self, stream::Config as StreamConfig, AckKind};
use async_nats::HeaderMap;
use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, error, info, instrument, warn};

use crate::nats::traits::{JetStreamConsumer, JetStreamPublisher, PullConsumer};
use crate::queue::{MessageControls, RawMessage};

pub struct NatsClient {
    jetstream: jetstream::Context,
}

impl NatsClient {
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        info!(url = %url, timeout_ms = timeout.as_millis() as u64, "connecting to nats");

        let client = async_nats::ConnectOptions::new()
            .connection_timeout(timeout)
            .connect(url)
            .await
            .context("failed to connect to nats")?;

        info!("connected to nats");
        Ok(Self {
            jetstream: jetstream::new(client),
        })
    }

    /// Create `stream_name` capturing `subjects` unless it already exists
    pub async fn ensure_stream(&self, stream_name: &str, subjects: Vec<String>) -> Result<()> {
        if self.jetstream.get_stream(stream_name).await.is_ok() {
            debug!(stream = %stream_name, "stream already exists");
            return Ok(());
        }

        let config = StreamConfig {
            name: stream_name.to_string(),
            subjects,
            description: Some("Queue worker input stream".to_string()),
            ..Default::default()
        };
        self.jetstream
            .create_stream(config)
            .await
            .context("failed to create stream")?;

        info!(stream = %stream_name, "created stream");
        Ok(())
    }

    pub fn create_consumer_client(&self) -> Arc<dyn JetStreamConsumer> {
        Arc::new(NatsJetStreamConsumer::new(self.jetstream.clone()))
    }

    pub fn create_publisher_client(&self) -> Arc<dyn JetStreamPublisher> {
        Arc::new(NatsJetStreamPublisher::new(self.jetstream.clone()))
    }

    pub async fn close(self) {
        info!("closing nats connection");
    }
}

/// [`JetStreamConsumer`] backed by async-nats
pub struct NatsJetStreamConsumer {
    context: jetstream::Context,
}

impl NatsJetStreamConsumer {
    pub fn new(context: jetstream::Context) -> Self {
        Self { context }
    }
}

#[async_trait]
impl JetStreamConsumer for NatsJetStreamConsumer {
    async fn create_consumer(
        &self,
        config: jetstream::consumer::pull::Config,
        stream_name: &str,
    ) -> Result<Box<dyn PullConsumer>> {
        let consumer = self
            .context
            .create_consumer_on_stream(config, stream_name)
            .await
            .context("failed to create consumer")?;

        Ok(Box::new(NatsPullConsumer { consumer }))
    }
}

/// [`PullConsumer`] backed by async-nats
pub struct NatsPullConsumer {
    consumer: jetstream::consumer::PullConsumer,
}

#[async_trait]
impl PullConsumer for NatsPullConsumer {
    async fn fetch_batch(&self, max_messages: usize, expires: Duration) -> Result<Vec<RawMessage>> {
        let mut messages = self
            .consumer
            .fetch()
            .max_messages(max_messages)
            .expires(expires)
            .messages()
            .await
            .context("failed to fetch messages")?;

        let mut batch = Vec::new();
        while let Some(msg) = messages.next().await {
            match msg {
                Ok(message) => batch.push(raw_message(message)),
                Err(e) => {
                    error!(error = %e, "error receiving message");
                }
            }
        }
        Ok(batch)
    }
}

/// Wrap a JetStream message, keeping its ack handle as the message controls.
fn raw_message(message: jetstream::Message) -> RawMessage {
    let subject = message.subject.to_string();
    let (id, attempts) = match message.info() {
        Ok(info) => (
            format!("{}:{}", subject, info.stream_sequence),
            u32::try_from(info.delivered).unwrap_or(1).max(1),
        ),
        Err(e) => {
            warn!(subject = %subject, error = %e, "message has no jetstream metadata");
            (format!("{}:{}", subject, xid::new()), 1)
        }
    };
    let headers = message
        .headers
        .as_ref()
        .map(header_map)
        .unwrap_or_default();
    let body = message.payload.clone();

    RawMessage::new(id, body, Box::new(JetStreamControls { message }))
        .with_attempts(attempts)
        .with_headers(headers)
}

/// Flatten NATS headers, keeping the first value of each.
pub fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, values)| {
            values
                .first()
                .map(|value| (name.to_string(), value.as_str().to_string()))
        })
        .collect()
}

fn to_nats_headers(headers: &HashMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(name.as_str(), value.as_str());
    }
    map
}

/// Acknowledge/redelivery controls for one JetStream message.
struct JetStreamControls {
    message: jetstream::Message,
}

#[async_trait]
impl MessageControls for JetStreamControls {
    async fn ack(&self) -> Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| anyhow!("failed to acknowledge message: {e}"))
    }

    async fn retry(&self, delay: Option<Duration>) -> Result<()> {
        self.message
            .ack_with(AckKind::Nak(delay))
            .await
            .map_err(|e| anyhow!("failed to reject message: {e}"))
    }
}

/// [`JetStreamPublisher`] backed by async-nats
pub struct NatsJetStreamPublisher {
    context: jetstream::Context,
}

impl NatsJetStreamPublisher {
    pub fn new(context: jetstream::Context) -> Self {
        Self { context }
    }
}

#[async_trait]
impl JetStreamPublisher for NatsJetStreamPublisher {
    async fn get_stream(&self, stream_name: &str) -> Result<()> {
        self.context
            .get_stream(stream_name)
            .await
            .context("failed to get stream")?;
        Ok(())
    }

    async fn create_stream(&self, config: jetstream::stream::Config) -> Result<()> {
        self.context
            .create_stream(config)
            .await
            .context("failed to create stream")?;
        Ok(())
    }

    #[instrument(skip(self, headers, payload), fields(subject = %subject, payload_size = payload.len()))]
    async fn publish(
        &self,
        subject: String,
        headers: HashMap<String, String>,
        payload: bytes::Bytes,
    ) -> Result<()> {
        let ack = self
            .context
            .publish_with_headers(subject, to_nats_headers(&headers), payload)
            .await
            .context("failed to publish message to jetstream")?;

        ack.await
            .context("failed to receive jetstream acknowledgment")?;
        Ok(())
    }
}
