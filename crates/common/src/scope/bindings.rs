use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::scope::{try_current, ScopeError};

/// Handle for work that should run after the handler that scheduled it has
/// returned, but before the owning scope releases its resources.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    tracker: TaskTracker,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
        }
    }

    /// Schedule `future` in the background. When called from inside a scope the
    /// spawned task sees the same scope through [`crate::scope::current`].
    pub fn wait_until<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.tracker.is_closed() {
            warn!("wait_until called after the scope started closing; work is tracked but may outlive resources");
        }

        match try_current() {
            Ok(scope) => {
                self.tracker.spawn(scope.run(future));
            }
            Err(_) => {
                self.tracker.spawn(future);
            }
        }
    }

    /// Number of scheduled tasks that have not finished yet.
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting work and wait for what is already scheduled.
    /// Returns `false` when `timeout` elapsed first.
    pub(crate) async fn drain(&self, timeout: Duration) -> bool {
        self.tracker.close();
        if self.tracker.is_empty() {
            return true;
        }

        debug!(pending = self.tracker.len(), "waiting for background work");
        tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok()
    }
}

/// Immutable snapshot of the platform values for one request or batch:
/// configuration/secret bindings plus an [`ExecutionContext`].
#[derive(Clone)]
pub struct BindingContext {
    vars: Arc<HashMap<String, String>>,
    execution: ExecutionContext,
}

impl BindingContext {
    /// Create a context with a fresh execution context.
    pub fn new(vars: impl Into<Arc<HashMap<String, String>>>) -> Self {
        Self {
            vars: vars.into(),
            execution: ExecutionContext::new(),
        }
    }

    pub fn empty() -> Self {
        Self::new(HashMap::new())
    }

    /// Same bindings, fresh execution context. Every scope gets its own so
    /// closing one never waits on work scheduled by another.
    pub fn for_scope(&self) -> Self {
        Self {
            vars: self.vars.clone(),
            execution: ExecutionContext::new(),
        }
    }

    pub fn var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn require_var(&self, key: &str) -> Result<&str, ScopeError> {
        self.var(key)
            .ok_or_else(|| ScopeError::MissingBinding(key.to_string()))
    }

    pub fn vars(&self) -> &HashMap<String, String> {
        &self.vars
    }

    pub fn execution(&self) -> &ExecutionContext {
        &self.execution
    }
}

// Values may be secrets; only keys are printed.
impl std::fmt::Debug for BindingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<&str> = self.vars.keys().map(String::as_str).collect();
        keys.sort_unstable();
        f.debug_struct("BindingContext")
            .field("keys", &keys)
            .field("pending_background_tasks", &self.execution.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn bindings() -> BindingContext {
        BindingContext::new(HashMap::from([
            ("environment".to_string(), "staging".to_string()),
            ("api_token".to_string(), "s3cr3t".to_string()),
        ]))
    }

    #[test]
    fn test_var_lookup() {
        let ctx = bindings();
        assert_eq!(ctx.var("environment"), Some("staging"));
        assert_eq!(ctx.var("missing"), None);
    }

    #[test]
    fn test_require_var_missing() {
        let ctx = bindings();
        let err = ctx.require_var("database_url").unwrap_err();
        assert_eq!(err, ScopeError::MissingBinding("database_url".to_string()));
    }

    #[test]
    fn test_debug_hides_values() {
        let rendered = format!("{:?}", bindings());
        assert!(rendered.contains("api_token"));
        assert!(!rendered.contains("s3cr3t"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_for_scope_does_not_share_background_work() {
        let shared = bindings();
        let first = shared.for_scope();
        let second = shared.for_scope();

        first.execution().wait_until(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        assert_eq!(first.execution().pending(), 1);
        assert_eq!(second.execution().pending(), 0);
        assert_eq!(second.var("environment"), Some("staging"));
        assert!(second.execution().drain(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_drain_waits_for_background_work() {
        let ctx = ExecutionContext::new();
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();

        ctx.wait_until(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            flag.store(true, Ordering::SeqCst);
        });

        assert!(ctx.drain(Duration::from_secs(1)).await);
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(ctx.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_times_out() {
        let ctx = ExecutionContext::new();
        ctx.wait_until(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        assert!(!ctx.drain(Duration::from_secs(1)).await);
    }
}
