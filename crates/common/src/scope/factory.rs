use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::scope::{try_current, Acquired, BindingContext, ResourceError, Scope};

/// Type alias for a function that builds a scoped resource from the scope's bindings.
pub type ResourceConstructor<T> =
    Arc<dyn Fn(BindingContext) -> BoxFuture<'static, anyhow::Result<Acquired<T>>> + Send + Sync>;

/// Declares how to build one kind of scoped resource.
///
/// The factory itself is long-lived and shared; the resource it builds lives
/// only as long as the scope it was first requested in.
///
/// # Example
/// ```ignore
/// let factory = ScopedFactory::new("http-client", |bindings| async move {
///     let base_url = bindings.require_var("upstream_url")?.to_string();
///     Ok(Acquired::new(UpstreamClient::new(base_url)))
/// });
///
/// // inside a scope
/// let client = factory.get().await?;
/// ```
pub struct ScopedFactory<T> {
    name: &'static str,
    constructor: ResourceConstructor<T>,
}

impl<T> Clone for ScopedFactory<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            constructor: self.constructor.clone(),
        }
    }
}

impl<T> std::fmt::Debug for ScopedFactory<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedFactory")
            .field("name", &self.name)
            .finish()
    }
}

impl<T> ScopedFactory<T>
where
    T: Send + Sync + 'static,
{
    pub fn new<F, Fut>(name: &'static str, constructor: F) -> Self
    where
        F: Fn(BindingContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Acquired<T>>> + Send + 'static,
    {
        Self {
            name,
            constructor: Arc::new(
                move |bindings| -> BoxFuture<'static, anyhow::Result<Acquired<T>>> {
                    Box::pin(constructor(bindings))
                },
            ),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Acquire the resource in `scope`, constructing it if this is the first request.
    pub async fn acquire_in(&self, scope: &Scope) -> Result<Arc<T>, ResourceError> {
        let bindings = scope.bindings().clone();
        let constructor = self.constructor.clone();
        scope
            .resources()
            .acquire(self.name, move || constructor(bindings))
            .await
    }

    /// Acquire the resource in the scope of the current task.
    pub async fn get(&self) -> Result<Arc<T>, ResourceError> {
        let scope = try_current()?;
        self.acquire_in(&scope).await
    }
}

/// A resource the batch processor makes available before any handler runs.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Make sure the resource exists in `scope`.
    async fn provide(&self, scope: &Scope) -> Result<(), ResourceError>;
}

#[async_trait]
impl<T> ResourceProvider for ScopedFactory<T>
where
    T: Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        self.name
    }

    async fn provide(&self, scope: &Scope) -> Result<(), ResourceError> {
        self.acquire_in(scope).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::{resource, ScopeError};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Upstream {
        base_url: String,
    }

    fn factory(constructed: Arc<AtomicUsize>) -> ScopedFactory<Upstream> {
        ScopedFactory::new("upstream", move |bindings| {
            let constructed = constructed.clone();
            async move {
                constructed.fetch_add(1, Ordering::SeqCst);
                let base_url = bindings.require_var("upstream_url")?.to_string();
                Ok(Acquired::new(Upstream { base_url }))
            }
        })
    }

    fn scope() -> Scope {
        Scope::new(BindingContext::new(HashMap::from([(
            "upstream_url".to_string(),
            "http://upstream.internal".to_string(),
        )])))
    }

    #[tokio::test]
    async fn test_get_builds_from_scope_bindings() {
        let constructed = Arc::new(AtomicUsize::new(0));
        let factory = factory(constructed.clone());

        let (first, second, via_bridge) = scope()
            .run(async {
                let first = factory.get().await.unwrap();
                let second = factory.get().await.unwrap();
                let via_bridge = resource::<Upstream>().unwrap();
                (first, second, via_bridge)
            })
            .await;

        assert_eq!(first.base_url, "http://upstream.internal");
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &via_bridge));
        assert_eq!(constructed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_outside_scope() {
        let factory = factory(Arc::new(AtomicUsize::new(0)));
        let err = factory.get().await.unwrap_err();
        assert_eq!(err, ResourceError::Scope(ScopeError::ContextUnavailable));
    }

    #[tokio::test]
    async fn test_missing_binding_is_acquisition_error() {
        let factory = factory(Arc::new(AtomicUsize::new(0)));
        let scope = Scope::new(BindingContext::empty());

        let err = factory.provide(&scope).await.unwrap_err();
        assert!(matches!(
            err,
            ResourceError::Acquisition {
                resource: "upstream",
                ..
            }
        ));
    }
}
