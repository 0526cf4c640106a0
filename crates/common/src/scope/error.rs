use thiserror::Error;

/// Errors raised when reading ambient scope values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScopeError {
    /// Scoped values were requested from a task that is not running inside a scope.
    /// This is a wiring bug, never a transient condition.
    #[error("no scope is installed for the current task; scoped values are only available inside a request or batch scope")]
    ContextUnavailable,

    #[error("resource {0} has not been acquired in the current scope")]
    ResourceNotAcquired(&'static str),

    #[error("binding {0} is not set")]
    MissingBinding(String),
}

/// Errors raised while acquiring a scoped resource.
///
/// `Clone` so a failed construction can be memoized and handed to every
/// caller waiting on the same scope.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResourceError {
    #[error("failed to acquire resource {resource}: {message}")]
    Acquisition {
        resource: &'static str,
        message: String,
    },

    #[error("resource {resource} requested after its scope was closed")]
    ScopeClosed { resource: &'static str },

    #[error(transparent)]
    Scope(#[from] ScopeError),
}
