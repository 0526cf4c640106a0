use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{field, info_span, Instrument, Span};

use crate::nats::JetStreamPublisher;
use crate::telemetry::inject_current_context;

/// Publishes JSON messages to JetStream, carrying the current trace context
/// in the message headers.
#[derive(Clone)]
pub struct QueueProducer {
    publisher: Arc<dyn JetStreamPublisher>,
    service_name: String,
}

impl QueueProducer {
    pub fn new(publisher: Arc<dyn JetStreamPublisher>, service_name: impl Into<String>) -> Self {
        Self {
            publisher,
            service_name: service_name.into(),
        }
    }

    pub async fn publish_json<T>(&self, subject: &str, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(value).context("failed to serialize message")?;

        let span = info_span!(
            target: "queue",
            "queue_publish",
            otel.name = "queue_publish",
            otel.kind = "producer",
            messaging.system = "nats",
            messaging.operation = "publish",
            messaging.destination.name = %subject,
            messaging.message.body.size = payload.len(),
            service.name = %self.service_name,
            otel.status_code = field::Empty,
        );

        async {
            let mut headers = HashMap::new();
            inject_current_context(&mut headers);

            let result = self
                .publisher
                .publish(subject.to_string(), headers, payload.into())
                .await;

            match &result {
                Ok(()) => {
                    Span::current().record("otel.status_code", "OK");
                }
                Err(e) => {
                    Span::current().record("otel.status_code", "ERROR");
                    tracing::error!(error = %e, "publish failed");
                }
            }
            result
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nats::MockJetStreamPublisher;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_json_serializes_body() {
        let mut publisher = MockJetStreamPublisher::new();
        publisher
            .expect_publish()
            .withf(|subject, _headers, payload| {
                let body: serde_json::Value = serde_json::from_slice(payload).unwrap();
                subject == "audit.login" && body["actor"] == "ada"
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let producer = QueueProducer::new(Arc::new(publisher), "test");
        producer
            .publish_json("audit.login", &json!({ "actor": "ada" }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_publish_failure_propagates() {
        let mut publisher = MockJetStreamPublisher::new();
        publisher
            .expect_publish()
            .times(1)
            .returning(|_, _, _| Err(anyhow::anyhow!("no responders")));

        let producer = QueueProducer::new(Arc::new(publisher), "test");
        let err = producer
            .publish_json("audit.login", &json!({}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no responders"));
    }
}
