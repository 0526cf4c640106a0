use thiserror::Error;

/// Failure returned by a message handler.
///
/// Handlers classify their own failures; anything converted with `?` from an
/// arbitrary error ends up as [`HandlerError::Unexpected`], which is retried.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Transient condition; the message should be delivered again.
    #[error("retryable failure: {0:#}")]
    Retryable(anyhow::Error),

    /// The message can never be processed; it is acknowledged and dropped.
    #[error("fatal failure: {0:#}")]
    Fatal(anyhow::Error),

    /// Unclassified error escaping the handler.
    #[error("unexpected failure: {0:#}")]
    Unexpected(anyhow::Error),
}

impl HandlerError {
    pub fn retryable(error: impl Into<anyhow::Error>) -> Self {
        Self::Retryable(error.into())
    }

    pub fn fatal(error: impl Into<anyhow::Error>) -> Self {
        Self::Fatal(error.into())
    }

    /// Business failure with an explicit retry decision.
    pub fn processing(retryable: bool, error: impl Into<anyhow::Error>) -> Self {
        if retryable {
            Self::retryable(error)
        } else {
            Self::fatal(error)
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(error: anyhow::Error) -> Self {
        Self::Unexpected(error)
    }
}

/// Why a body could not be decoded. Carries no message identity; see [`DecodeFailure`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{diagnostic}")]
pub struct DecodeError {
    pub diagnostic: String,
}

impl DecodeError {
    pub fn new(diagnostic: impl Into<String>) -> Self {
        Self {
            diagnostic: diagnostic.into(),
        }
    }
}

/// A [`DecodeError`] tied to the message it came from.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("message {message_id} failed to decode: {diagnostic}")]
pub struct DecodeFailure {
    pub message_id: String,
    pub diagnostic: String,
}

/// A schema document that cannot be used for validation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid message schema: {0}")]
pub struct SchemaError(pub String);
