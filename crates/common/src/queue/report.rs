use std::collections::BTreeMap;

use crate::queue::{AppliedAction, OutcomeKind, ProcessingOutcome};

/// Summary of one processed batch. Purely observational.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub total: usize,
    pub acknowledged: usize,
    pub redelivered: usize,
    /// Broker calls (ack or redelivery) that returned an error
    pub control_failures: usize,
    /// Resource release actions that failed or panicked
    pub release_failures: usize,
    outcomes: BTreeMap<OutcomeKind, usize>,
}

impl BatchReport {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    pub(crate) fn record(&mut self, outcome: &ProcessingOutcome, applied: AppliedAction) {
        *self.outcomes.entry(outcome.kind()).or_default() += 1;

        if applied.action.is_acknowledge() {
            self.acknowledged += 1;
        } else {
            self.redelivered += 1;
        }
        if !applied.delivered {
            self.control_failures += 1;
        }
    }

    /// Number of messages that ended with the given outcome.
    pub fn count(&self, kind: OutcomeKind) -> usize {
        self.outcomes.get(&kind).copied().unwrap_or(0)
    }

    pub fn outcomes(&self) -> impl Iterator<Item = (OutcomeKind, usize)> + '_ {
        self.outcomes.iter().map(|(kind, count)| (*kind, *count))
    }

    pub fn processed(&self) -> usize {
        self.acknowledged + self.redelivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::BrokerAction;

    #[test]
    fn test_record_counts() {
        let mut report = BatchReport::new(3);
        let ack = AppliedAction {
            action: BrokerAction::Acknowledge,
            delivered: true,
        };
        let failed_redeliver = AppliedAction {
            action: BrokerAction::Redeliver { delay: None },
            delivered: false,
        };

        report.record(&ProcessingOutcome::Success, ack);
        report.record(&ProcessingOutcome::Success, ack);
        report.record(
            &ProcessingOutcome::RetryableFailure {
                reason: "timeout".to_string(),
            },
            failed_redeliver,
        );

        assert_eq!(report.count(OutcomeKind::Success), 2);
        assert_eq!(report.count(OutcomeKind::Retryable), 1);
        assert_eq!(report.count(OutcomeKind::Fatal), 0);
        assert_eq!(report.acknowledged, 2);
        assert_eq!(report.redelivered, 1);
        assert_eq!(report.control_failures, 1);
        assert_eq!(report.processed(), report.total);
    }
}
