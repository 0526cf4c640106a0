use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

/// Broker-side controls for one delivered message.
///
/// Implementations talk to the broker; the batch processor calls exactly one
/// of these methods, exactly once, per message.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait MessageControls: Send + Sync {
    /// Remove the message from the queue.
    async fn ack(&self) -> anyhow::Result<()>;

    /// Ask the broker to deliver the message again, optionally after `delay`.
    async fn retry(&self, delay: Option<Duration>) -> anyhow::Result<()>;
}

/// The broker-independent part of a delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    /// Broker-assigned identifier, used in every log line about the message
    pub id: String,
    /// Undecoded payload
    pub body: Bytes,
    /// Delivery attempt reported by the broker, starting at 1
    pub attempts: u32,
    /// Transport headers (trace context and similar)
    pub headers: HashMap<String, String>,
}

/// A message as delivered by the broker, paired with its acknowledge/retry controls.
///
/// Acknowledging or requesting redelivery consumes the message, so neither can
/// happen twice.
pub struct RawMessage {
    envelope: MessageEnvelope,
    controls: Box<dyn MessageControls>,
}

impl RawMessage {
    pub fn new(
        id: impl Into<String>,
        body: impl Into<Bytes>,
        controls: Box<dyn MessageControls>,
    ) -> Self {
        Self {
            envelope: MessageEnvelope {
                id: id.into(),
                body: body.into(),
                attempts: 1,
                headers: HashMap::new(),
            },
            controls,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.envelope.attempts = attempts;
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.envelope.headers = headers;
        self
    }

    pub fn id(&self) -> &str {
        &self.envelope.id
    }

    pub fn body(&self) -> &Bytes {
        &self.envelope.body
    }

    pub fn attempts(&self) -> u32 {
        self.envelope.attempts
    }

    pub fn envelope(&self) -> &MessageEnvelope {
        &self.envelope
    }

    pub async fn acknowledge(self) -> anyhow::Result<()> {
        self.controls.ack().await
    }

    pub async fn request_redelivery(self, delay: Option<Duration>) -> anyhow::Result<()> {
        self.controls.retry(delay).await
    }
}

impl std::fmt::Debug for RawMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawMessage")
            .field("id", &self.envelope.id)
            .field("body_bytes", &self.envelope.body.len())
            .field("attempts", &self.envelope.attempts)
            .finish()
    }
}

/// Messages delivered together by the broker. One batch shares one scope.
#[derive(Debug)]
pub struct Batch {
    queue: String,
    messages: Vec<RawMessage>,
}

impl Batch {
    pub fn new(queue: impl Into<String>, messages: Vec<RawMessage>) -> Self {
        Self {
            queue: queue.into(),
            messages,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[RawMessage] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<RawMessage> {
        self.messages
    }
}

/// A message body that passed decoding, handed to the handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded<T> {
    pub id: String,
    pub attempts: u32,
    pub headers: HashMap<String, String>,
    pub body: T,
}

impl<T> Decoded<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Decoded<U> {
        Decoded {
            id: self.id,
            attempts: self.attempts,
            headers: self.headers,
            body: f(self.body),
        }
    }
}
