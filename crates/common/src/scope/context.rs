use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::scope::{BindingContext, ReleaseOutcome, ResourceScope, ScopeError};

tokio::task_local! {
    static CURRENT_SCOPE: Scope;
}

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

/// Ambient values for one request or one batch.
///
/// Cloning is cheap; all clones refer to the same bindings and resources.
#[derive(Debug, Clone)]
pub struct Scope {
    id: u64,
    bindings: BindingContext,
    resources: ResourceScope,
}

impl Scope {
    /// The scope shares `bindings`' values but gets its own execution context.
    pub fn new(bindings: BindingContext) -> Self {
        Self {
            id: NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed),
            bindings: bindings.for_scope(),
            resources: ResourceScope::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn bindings(&self) -> &BindingContext {
        &self.bindings
    }

    pub fn resources(&self) -> &ResourceScope {
        &self.resources
    }

    /// Run `future` with this scope installed. Everything polled as part of
    /// `future` (including futures it joins or buffers) sees the scope through
    /// [`current`]; tasks spawned with [`spawn`] inherit it too.
    pub async fn run<F>(self, future: F) -> F::Output
    where
        F: Future,
    {
        CURRENT_SCOPE.scope(self, future).await
    }

    /// Close the scope: wait for background work scheduled through the
    /// execution context, then release every acquired resource.
    pub async fn close(&self, background_timeout: Duration) -> ReleaseOutcome {
        if !self.bindings.execution().drain(background_timeout).await {
            warn!(
                scope_id = self.id,
                timeout_ms = background_timeout.as_millis() as u64,
                "background work did not finish before scope close"
            );
        }
        self.resources.release().await
    }

    /// Guard that releases this scope's resources if it is dropped before
    /// [`ScopeGuard::disarm`] is called, e.g. when the owning future is cancelled.
    pub fn guard(&self) -> ScopeGuard {
        ScopeGuard {
            scope: Some(self.clone()),
        }
    }
}

/// Returns the scope installed for the current task.
pub fn try_current() -> Result<Scope, ScopeError> {
    CURRENT_SCOPE
        .try_with(Scope::clone)
        .map_err(|_| ScopeError::ContextUnavailable)
}

/// Returns the scope installed for the current task.
///
/// # Panics
///
/// Panics when called outside a scope. Reaching for ambient values outside a
/// request or batch is a wiring bug and is not papered over with defaults.
pub fn current() -> Scope {
    try_current().unwrap_or_else(|e| panic!("{e}"))
}

/// Binding context of the current scope. Panics outside a scope, see [`current`].
pub fn bindings() -> BindingContext {
    current().bindings().clone()
}

/// A resource of type `T` already acquired in the current scope.
pub fn resource<T>() -> Result<Arc<T>, ScopeError>
where
    T: Send + Sync + 'static,
{
    let scope = try_current()?;
    scope
        .resources()
        .get::<T>()
        .ok_or(ScopeError::ResourceNotAcquired(std::any::type_name::<T>()))
}

/// Spawn a child task that inherits the current scope, if there is one.
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match try_current() {
        Ok(scope) => tokio::spawn(scope.run(future)),
        Err(_) => tokio::spawn(future),
    }
}

/// See [`Scope::guard`].
#[must_use = "dropping the guard immediately schedules the release"]
pub struct ScopeGuard {
    scope: Option<Scope>,
}

impl ScopeGuard {
    pub fn disarm(mut self) {
        self.scope = None;
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let Some(scope) = self.scope.take() else {
            return;
        };
        if scope.resources().is_closed() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(
                    scope_id = scope.id(),
                    "scope dropped before close, releasing resources in the background"
                );
                handle.spawn(async move {
                    let outcome = scope.resources().release().await;
                    debug!(
                        scope_id = scope.id(),
                        released = outcome.released,
                        failed = outcome.failed,
                        "background release finished"
                    );
                });
            }
            Err(_) => {
                error!(
                    scope_id = scope.id(),
                    "scope dropped outside a runtime, resources cannot be released"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn scope_with(env: &str) -> Scope {
        Scope::new(BindingContext::new(HashMap::from([(
            "environment".to_string(),
            env.to_string(),
        )])))
    }

    #[tokio::test]
    async fn test_current_inside_scope() {
        let scope = scope_with("production");
        let id = scope.id();

        let seen = scope
            .run(async {
                let current = current();
                (current.id(), current.bindings().var("environment").map(str::to_string))
            })
            .await;

        assert_eq!(seen, (id, Some("production".to_string())));
    }

    #[tokio::test]
    async fn test_try_current_outside_scope() {
        assert_eq!(try_current().unwrap_err(), ScopeError::ContextUnavailable);
    }

    #[tokio::test]
    #[should_panic(expected = "no scope is installed")]
    async fn test_current_outside_scope_panics() {
        let _ = current();
    }

    #[tokio::test]
    async fn test_concurrent_scopes_are_isolated() {
        let a = scope_with("a");
        let b = scope_with("b");

        let read_after_yield = || async {
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }
            bindings().var("environment").map(str::to_string)
        };

        let (seen_a, seen_b) = tokio::join!(a.run(read_after_yield()), b.run(read_after_yield()));

        assert_eq!(seen_a.as_deref(), Some("a"));
        assert_eq!(seen_b.as_deref(), Some("b"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_spawned_child_inherits_scope() {
        let scope = scope_with("child");

        let seen = scope
            .run(async {
                spawn(async { bindings().var("environment").map(str::to_string) })
                    .await
                    .unwrap()
            })
            .await;

        assert_eq!(seen.as_deref(), Some("child"));
    }

    #[tokio::test]
    async fn test_plain_spawn_does_not_leak_scope() {
        let scope = scope_with("leak");

        let seen = scope
            .run(async { tokio::spawn(async { try_current().is_ok() }).await.unwrap() })
            .await;

        assert!(!seen);
    }

    #[tokio::test]
    async fn test_resource_not_acquired() {
        let scope = scope_with("x");
        let err = scope.run(async { resource::<String>() }).await.unwrap_err();
        assert!(matches!(err, ScopeError::ResourceNotAcquired(_)));
    }
}
