use std::fmt;

use crate::queue::HandlerError;

/// Terminal result of processing one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingOutcome {
    Success,
    RetryableFailure { reason: String },
    FatalFailure { reason: String },
    DecodeFailure { reason: String },
    /// An unclassified error or a panic escaped the handler.
    UnexpectedFailure { reason: String },
    /// The message never reached its handler because the batch could not
    /// continue: a batch resource failed to construct, or the batch was cancelled.
    Aborted { reason: String },
}

/// Outcome classification without the payload, for logs and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OutcomeKind {
    Success,
    Retryable,
    Fatal,
    Decode,
    Unexpected,
    Aborted,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Success => "success",
            OutcomeKind::Retryable => "retryable",
            OutcomeKind::Fatal => "fatal",
            OutcomeKind::Decode => "decode",
            OutcomeKind::Unexpected => "unexpected",
            OutcomeKind::Aborted => "aborted",
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ProcessingOutcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            ProcessingOutcome::Success => OutcomeKind::Success,
            ProcessingOutcome::RetryableFailure { .. } => OutcomeKind::Retryable,
            ProcessingOutcome::FatalFailure { .. } => OutcomeKind::Fatal,
            ProcessingOutcome::DecodeFailure { .. } => OutcomeKind::Decode,
            ProcessingOutcome::UnexpectedFailure { .. } => OutcomeKind::Unexpected,
            ProcessingOutcome::Aborted { .. } => OutcomeKind::Aborted,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            ProcessingOutcome::Success => None,
            ProcessingOutcome::RetryableFailure { reason }
            | ProcessingOutcome::FatalFailure { reason }
            | ProcessingOutcome::DecodeFailure { reason }
            | ProcessingOutcome::UnexpectedFailure { reason }
            | ProcessingOutcome::Aborted { reason } => Some(reason),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProcessingOutcome::Success)
    }
}

impl From<HandlerError> for ProcessingOutcome {
    fn from(error: HandlerError) -> Self {
        match error {
            HandlerError::Retryable(e) => ProcessingOutcome::RetryableFailure {
                reason: format!("{e:#}"),
            },
            HandlerError::Fatal(e) => ProcessingOutcome::FatalFailure {
                reason: format!("{e:#}"),
            },
            HandlerError::Unexpected(e) => ProcessingOutcome::UnexpectedFailure {
                reason: format!("{e:#}"),
            },
        }
    }
}

impl From<Result<(), HandlerError>> for ProcessingOutcome {
    fn from(result: Result<(), HandlerError>) -> Self {
        match result {
            Ok(()) => ProcessingOutcome::Success,
            Err(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_handler_result_mapping() {
        assert_eq!(ProcessingOutcome::from(Ok(())), ProcessingOutcome::Success);

        let retry: ProcessingOutcome =
            Err(HandlerError::retryable(anyhow::anyhow!("timed out"))).into();
        assert_eq!(retry.kind(), OutcomeKind::Retryable);
        assert_eq!(retry.reason(), Some("timed out"));

        let fatal: ProcessingOutcome = HandlerError::fatal(anyhow::anyhow!("bad sku")).into();
        assert_eq!(fatal.kind(), OutcomeKind::Fatal);

        let unexpected: ProcessingOutcome = HandlerError::from(anyhow::anyhow!("boom")).into();
        assert_eq!(unexpected.kind(), OutcomeKind::Unexpected);
    }

    #[test]
    fn test_reason_keeps_error_chain() {
        let err: anyhow::Result<()> = Err(anyhow::anyhow!("connection reset"));
        let err = err.context("insert audit event").unwrap_err();

        let outcome: ProcessingOutcome = HandlerError::retryable(err).into();
        assert_eq!(
            outcome.reason(),
            Some("insert audit event: connection reset")
        );
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(OutcomeKind::Decode.to_string(), "decode");
        assert_eq!(OutcomeKind::Aborted.as_str(), "aborted");
    }
}
