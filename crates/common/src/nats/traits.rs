use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_nats::jetstream;
use async_trait::async_trait;

use crate::queue::RawMessage;

/// Trait for JetStream consumer operations
/// Abstracts creation of a durable pull consumer on a stream
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait JetStreamConsumer: Send + Sync {
    /// Create (or bind to) a durable pull consumer on a stream
    async fn create_consumer(
        &self,
        config: jetstream::consumer::pull::Config,
        stream_name: &str,
    ) -> Result<Box<dyn PullConsumer>>;
}

/// Trait for pull consumer operations
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait PullConsumer: Send + Sync {
    /// Fetch up to `max_messages`, waiting at most `expires`.
    /// Each message carries its own acknowledge/redelivery controls.
    async fn fetch_batch(&self, max_messages: usize, expires: Duration) -> Result<Vec<RawMessage>>;
}

/// Trait for JetStream publisher operations
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait JetStreamPublisher: Send + Sync {
    /// Get an existing stream by name
    async fn get_stream(&self, stream_name: &str) -> Result<()>;

    /// Create a new stream with the given configuration
    async fn create_stream(&self, config: jetstream::stream::Config) -> Result<()>;

    /// Publish a message with headers and await the JetStream acknowledgment
    async fn publish(
        &self,
        subject: String,
        headers: HashMap<String, String>,
        payload: bytes::Bytes,
    ) -> Result<()>;
}
