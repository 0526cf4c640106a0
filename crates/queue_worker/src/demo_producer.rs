use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::nats::{JetStreamPublisher, QueueProducer};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::AuditEvent;

const KINDS: [&str; 3] = ["user.login", "document.viewed", "user.logout"];
const ACTORS: [&str; 2] = ["alice", "bob"];

/// Every this many events the previous event is published again, so the
/// duplicate-delivery path gets exercised too.
const DUPLICATE_EVERY: u64 = 10;

/// Publishes sample audit events on an interval, for local development.
pub struct DemoProducer {
    producer: QueueProducer,
    subject: String,
    interval: Duration,
}

impl DemoProducer {
    pub fn new(publisher: Arc<dyn JetStreamPublisher>, subject: String, interval: Duration) -> Self {
        Self {
            producer: QueueProducer::new(publisher, "queue-worker-demo"),
            subject,
            interval,
        }
    }

    pub async fn run(self, ctx: CancellationToken) -> anyhow::Result<()> {
        info!(subject = %self.subject, interval_ms = self.interval.as_millis() as u64, "starting demo producer");

        let mut ticker = tokio::time::interval(self.interval);
        let mut previous: Option<AuditEvent> = None;
        let mut sequence = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => break,
                _ = ticker.tick() => {}
            }

            sequence += 1;
            let event = match previous.take() {
                Some(event) if sequence % DUPLICATE_EVERY == 0 => event,
                _ => sample_event(sequence),
            };

            match self.producer.publish_json(&self.subject, &event).await {
                Ok(()) => debug!(event_id = %event.event_id, "demo event published"),
                Err(e) => warn!(error = %format!("{e:#}"), "failed to publish demo event"),
            }
            previous = Some(event);
        }

        info!("demo producer stopped");
        Ok(())
    }
}

fn sample_event(sequence: u64) -> AuditEvent {
    let index = sequence as usize;
    let mut attributes = serde_json::Map::new();
    attributes.insert("sequence".to_string(), sequence.into());

    AuditEvent {
        event_id: xid::new().to_string(),
        kind: KINDS[index % KINDS.len()].to_string(),
        actor: ACTORS[index % ACTORS.len()].to_string(),
        occurred_at: Utc::now(),
        attributes,
    }
}
