use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::queue::{OutcomeKind, ProcessingOutcome, RawMessage};

/// What to do with a message whose body could not be decoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecodeErrorPolicy {
    /// Acknowledge and drop the message.
    #[default]
    DeadLetter,
    /// Ask the broker to deliver it again.
    Retry,
}

impl FromStr for DecodeErrorPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dead-letter" | "dead_letter" | "deadletter" => Ok(Self::DeadLetter),
            "retry" => Ok(Self::Retry),
            other => anyhow::bail!("unknown decode error policy: {other}"),
        }
    }
}

/// Broker action chosen for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerAction {
    Acknowledge,
    Redeliver { delay: Option<Duration> },
}

impl BrokerAction {
    pub fn is_acknowledge(&self) -> bool {
        matches!(self, BrokerAction::Acknowledge)
    }
}

/// Result of applying a routing decision to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedAction {
    pub action: BrokerAction,
    /// `false` when the broker call itself failed. The broker redelivers such
    /// messages once its ack wait expires.
    pub delivered: bool,
}

/// Maps a [`ProcessingOutcome`] to exactly one broker action.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutcomeRouter {
    on_decode_error: DecodeErrorPolicy,
    retry_delay: Option<Duration>,
}

impl OutcomeRouter {
    pub fn new(on_decode_error: DecodeErrorPolicy, retry_delay: Option<Duration>) -> Self {
        Self {
            on_decode_error,
            retry_delay,
        }
    }

    pub fn route(&self, outcome: &ProcessingOutcome) -> BrokerAction {
        let redeliver = BrokerAction::Redeliver {
            delay: self.retry_delay,
        };

        match outcome.kind() {
            OutcomeKind::Success | OutcomeKind::Fatal => BrokerAction::Acknowledge,
            OutcomeKind::Decode => match self.on_decode_error {
                DecodeErrorPolicy::DeadLetter => BrokerAction::Acknowledge,
                DecodeErrorPolicy::Retry => redeliver,
            },
            OutcomeKind::Retryable | OutcomeKind::Unexpected | OutcomeKind::Aborted => redeliver,
        }
    }

    /// Log the decision for `message`, then signal it to the broker.
    pub async fn apply(&self, message: RawMessage, outcome: &ProcessingOutcome) -> AppliedAction {
        let action = self.route(outcome);
        log_decision(&message, outcome, action);

        let message_id = message.id().to_string();
        let result = match action {
            BrokerAction::Acknowledge => message.acknowledge().await,
            BrokerAction::Redeliver { delay } => message.request_redelivery(delay).await,
        };

        let delivered = match result {
            Ok(()) => true,
            Err(e) => {
                error!(
                    message_id = %message_id,
                    action = ?action,
                    error = %format!("{e:#}"),
                    "failed to signal broker"
                );
                false
            }
        };

        AppliedAction { action, delivered }
    }
}

fn log_decision(message: &RawMessage, outcome: &ProcessingOutcome, action: BrokerAction) {
    let message_id = message.id();
    let attempts = message.attempts();
    let kind = outcome.kind();
    let reason = outcome.reason().unwrap_or_default();
    let decision = if action.is_acknowledge() {
        "acknowledge"
    } else {
        "redeliver"
    };

    match kind {
        OutcomeKind::Success => {
            debug!(message_id = %message_id, attempts, outcome = %kind, decision, "message processed");
        }
        OutcomeKind::Retryable => {
            warn!(message_id = %message_id, attempts, outcome = %kind, decision, reason, "retryable failure, requesting redelivery");
        }
        OutcomeKind::Fatal => {
            error!(message_id = %message_id, attempts, outcome = %kind, decision, reason, "fatal failure, dead-lettering message");
        }
        OutcomeKind::Decode => {
            warn!(message_id = %message_id, attempts, outcome = %kind, decision, reason, "message failed to decode");
        }
        OutcomeKind::Unexpected => {
            error!(message_id = %message_id, attempts, outcome = %kind, decision, reason, "unexpected handler failure, requesting redelivery");
        }
        OutcomeKind::Aborted => {
            warn!(message_id = %message_id, attempts, outcome = %kind, decision, reason, "message not processed, requesting redelivery");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MockMessageControls;

    fn outcome(kind: OutcomeKind) -> ProcessingOutcome {
        let reason = "boom".to_string();
        match kind {
            OutcomeKind::Success => ProcessingOutcome::Success,
            OutcomeKind::Retryable => ProcessingOutcome::RetryableFailure { reason },
            OutcomeKind::Fatal => ProcessingOutcome::FatalFailure { reason },
            OutcomeKind::Decode => ProcessingOutcome::DecodeFailure { reason },
            OutcomeKind::Unexpected => ProcessingOutcome::UnexpectedFailure { reason },
            OutcomeKind::Aborted => ProcessingOutcome::Aborted { reason },
        }
    }

    #[test]
    fn test_routing_table() {
        let router = OutcomeRouter::default();
        let redeliver = BrokerAction::Redeliver { delay: None };

        assert_eq!(router.route(&outcome(OutcomeKind::Success)), BrokerAction::Acknowledge);
        assert_eq!(router.route(&outcome(OutcomeKind::Retryable)), redeliver);
        assert_eq!(router.route(&outcome(OutcomeKind::Fatal)), BrokerAction::Acknowledge);
        assert_eq!(router.route(&outcome(OutcomeKind::Decode)), BrokerAction::Acknowledge);
        assert_eq!(router.route(&outcome(OutcomeKind::Unexpected)), redeliver);
        assert_eq!(router.route(&outcome(OutcomeKind::Aborted)), redeliver);
    }

    #[test]
    fn test_decode_retry_policy_uses_delay() {
        let delay = Some(Duration::from_secs(5));
        let router = OutcomeRouter::new(DecodeErrorPolicy::Retry, delay);

        assert_eq!(
            router.route(&outcome(OutcomeKind::Decode)),
            BrokerAction::Redeliver { delay }
        );
        assert_eq!(
            router.route(&outcome(OutcomeKind::Retryable)),
            BrokerAction::Redeliver { delay }
        );
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!(
            "dead-letter".parse::<DecodeErrorPolicy>().unwrap(),
            DecodeErrorPolicy::DeadLetter
        );
        assert_eq!(
            " Retry ".parse::<DecodeErrorPolicy>().unwrap(),
            DecodeErrorPolicy::Retry
        );
        assert!("drop".parse::<DecodeErrorPolicy>().is_err());

        let policy: DecodeErrorPolicy = serde_json::from_str("\"dead-letter\"").unwrap();
        assert_eq!(policy, DecodeErrorPolicy::DeadLetter);
    }

    #[tokio::test]
    async fn test_apply_acknowledges_fatal_once() {
        let mut controls = MockMessageControls::new();
        controls.expect_ack().times(1).returning(|| Ok(()));
        controls.expect_retry().times(0);

        let message = RawMessage::new("orders:3", "{}", Box::new(controls));
        let applied = OutcomeRouter::default()
            .apply(message, &outcome(OutcomeKind::Fatal))
            .await;

        assert_eq!(applied.action, BrokerAction::Acknowledge);
        assert!(applied.delivered);
    }

    #[tokio::test]
    async fn test_apply_reports_broker_failure() {
        let mut controls = MockMessageControls::new();
        controls.expect_ack().times(0);
        controls
            .expect_retry()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("connection closed")));

        let message = RawMessage::new("orders:4", "{}", Box::new(controls));
        let applied = OutcomeRouter::default()
            .apply(message, &outcome(OutcomeKind::Unexpected))
            .await;

        assert!(!applied.action.is_acknowledge());
        assert!(!applied.delivered);
    }
}
