use async_trait::async_trait;

use crate::domain::{DomainResult, StoreAuditEventInput, TouchActorInput};

/// Storage for audit events.
///
/// Implementations are called from inside a batch scope and may use the
/// resources acquired for it.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait AuditEventRepository: Send + Sync {
    /// Store one event. Returns [`crate::domain::DomainError::DuplicateEvent`]
    /// when an event with the same id is already stored.
    async fn store_event(&self, input: StoreAuditEventInput) -> DomainResult<()>;

    /// Record that `actor` was active at `seen_at`, keeping the latest time.
    async fn touch_actor(&self, input: TouchActorInput) -> DomainResult<()>;
}
