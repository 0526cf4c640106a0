use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::OnceCell;
use tracing::{debug, error};

use crate::scope::ResourceError;

type ReleaseFn = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;
type TypedReleaseFn<T> = Box<dyn FnOnce(Arc<T>) -> BoxFuture<'static, anyhow::Result<()>> + Send>;
type Slot<T> = OnceCell<Result<Arc<T>, ResourceError>>;

/// A freshly constructed resource paired with the action that releases it.
pub struct Acquired<T> {
    value: T,
    release: Option<TypedReleaseFn<T>>,
}

impl<T> Acquired<T>
where
    T: Send + Sync + 'static,
{
    /// A resource with nothing to release beyond dropping it.
    pub fn new(value: T) -> Self {
        Self {
            value,
            release: None,
        }
    }

    pub fn with_release<F, Fut>(mut self, release: F) -> Self
    where
        F: FnOnce(Arc<T>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.release = Some(Box::new(
            move |value| -> BoxFuture<'static, anyhow::Result<()>> { Box::pin(release(value)) },
        ));
        self
    }
}

struct Registration {
    resource: &'static str,
    release: ReleaseFn,
}

/// Result of closing a [`ResourceScope`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseOutcome {
    pub released: usize,
    pub failed: usize,
}

/// Resources acquired on behalf of one scope.
///
/// Each resource type is constructed at most once per scope, the first time
/// someone asks for it; concurrent callers wait for the same construction.
/// [`ResourceScope::release`] runs the registered release actions once, in
/// reverse acquisition order.
#[derive(Clone, Default)]
pub struct ResourceScope {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    slots: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
    releases: Mutex<Vec<Registration>>,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ResourceScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Returns the `T` for this scope, constructing it on first use.
    ///
    /// A constructor error is memoized: later callers in the same scope get the
    /// same [`ResourceError::Acquisition`] without a second attempt, and no
    /// release action is registered.
    pub async fn acquire<T, F, Fut>(
        &self,
        resource: &'static str,
        constructor: F,
    ) -> Result<Arc<T>, ResourceError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Acquired<T>>>,
    {
        if self.is_closed() {
            return Err(ResourceError::ScopeClosed { resource });
        }

        let slot = self.slot::<T>();
        slot.get_or_init(|| self.construct(resource, constructor))
            .await
            .clone()
    }

    /// Returns the `T` for this scope if it was already acquired successfully.
    pub fn get<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let slot = lock(&self.inner.slots).get(&TypeId::of::<T>()).cloned()?;
        let slot = slot.downcast::<Slot<T>>().ok()?;
        match slot.get() {
            Some(Ok(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Run every registered release action, most recent first.
    ///
    /// Only the first call does anything. A failing or panicking release is
    /// logged and does not stop the remaining ones.
    pub async fn release(&self) -> ReleaseOutcome {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return ReleaseOutcome::default();
        }

        // Drop the scope's own handles first so release actions hold the last reference.
        lock(&self.inner.slots).clear();
        let registrations = std::mem::take(&mut *lock(&self.inner.releases));

        let mut outcome = ReleaseOutcome::default();
        for registration in registrations.into_iter().rev() {
            if run_release(registration).await {
                outcome.released += 1;
            } else {
                outcome.failed += 1;
            }
        }
        outcome
    }

    async fn construct<T, F, Fut>(
        &self,
        resource: &'static str,
        constructor: F,
    ) -> Result<Arc<T>, ResourceError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Acquired<T>>>,
    {
        debug!(resource, "acquiring scoped resource");

        let constructed = AssertUnwindSafe(async move { constructor().await })
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(anyhow::anyhow!(
                    "constructor panicked: {}",
                    panic_message(panic.as_ref())
                ))
            });

        let acquired = constructed.map_err(|e| {
            error!(resource, error = %format!("{e:#}"), "failed to acquire scoped resource");
            ResourceError::Acquisition {
                resource,
                message: format!("{e:#}"),
            }
        })?;

        let value = Arc::new(acquired.value);
        if let Some(release) = acquired.release {
            let held = value.clone();
            let registration = Registration {
                resource,
                release: Box::new(move || release(held)),
            };

            // The scope closed while we were constructing: nobody will release
            // this later, so do it now and refuse the value.
            if let Some(orphan) = self.register(registration) {
                run_release(orphan).await;
                return Err(ResourceError::ScopeClosed { resource });
            }
        }

        debug!(resource, "scoped resource acquired");
        Ok(value)
    }

    fn register(&self, registration: Registration) -> Option<Registration> {
        let mut releases = lock(&self.inner.releases);
        if self.is_closed() {
            return Some(registration);
        }
        releases.push(registration);
        None
    }

    fn slot<T>(&self) -> Arc<Slot<T>>
    where
        T: Send + Sync + 'static,
    {
        let entry = lock(&self.inner.slots)
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Arc::new(Slot::<T>::new()) as Arc<dyn Any + Send + Sync>)
            .clone();

        match entry.downcast::<Slot<T>>() {
            Ok(slot) => slot,
            Err(_) => unreachable!("slots are keyed by the TypeId of their value"),
        }
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

async fn run_release(registration: Registration) -> bool {
    let resource = registration.resource;
    match AssertUnwindSafe((registration.release)())
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => {
            debug!(resource, "released scoped resource");
            true
        }
        Ok(Err(e)) => {
            error!(resource, error = %format!("{e:#}"), "failed to release scoped resource");
            false
        }
        Err(_) => {
            error!(resource, "scoped resource release panicked");
            false
        }
    }
}

impl std::fmt::Debug for ResourceScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceScope")
            .field("acquired", &lock(&self.inner.releases).len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
