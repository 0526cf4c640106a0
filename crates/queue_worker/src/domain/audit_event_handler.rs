use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::Utc;
use common::queue::{Decoded, HandlerError};
use common::scope;
use futures::future::BoxFuture;
use tower::Service;
use tracing::{debug, warn};

use crate::domain::{
    AuditEvent, AuditEventRepository, DomainError, DomainResult, StoreAuditEventInput,
    TouchActorInput,
};

/// Binding that tags stored rows with the deployment they were received in.
pub const ENVIRONMENT_BINDING: &str = "environment";
const DEFAULT_ENVIRONMENT: &str = "default";

/// Stores decoded audit events.
///
/// Must be called inside a batch scope: it reads the batch bindings, and the
/// repository uses the batch's database connection.
#[derive(Clone)]
pub struct AuditEventHandler {
    repository: Arc<dyn AuditEventRepository>,
    max_clock_skew: chrono::Duration,
}

impl AuditEventHandler {
    pub fn new(repository: Arc<dyn AuditEventRepository>) -> Self {
        Self {
            repository,
            max_clock_skew: chrono::Duration::minutes(5),
        }
    }

    /// Events stamped further than `skew` in the future are rejected.
    pub fn with_max_clock_skew(mut self, skew: chrono::Duration) -> Self {
        self.max_clock_skew = skew;
        self
    }

    pub async fn handle(&self, message: Decoded<AuditEvent>) -> Result<(), HandlerError> {
        let bindings = scope::bindings();
        let environment = bindings
            .var(ENVIRONMENT_BINDING)
            .unwrap_or(DEFAULT_ENVIRONMENT)
            .to_string();

        let Decoded {
            id,
            attempts,
            body: event,
            ..
        } = message;

        self.validate(&event).map_err(HandlerError::fatal)?;

        let touch = TouchActorInput {
            actor: event.actor.clone(),
            environment: environment.clone(),
            seen_at: event.occurred_at,
        };
        let input = StoreAuditEventInput {
            event,
            environment,
            message_id: id.clone(),
            delivery_attempts: attempts,
        };

        match self.repository.store_event(input).await {
            Ok(()) => debug!(message_id = %id, "audit event stored"),
            Err(DomainError::DuplicateEvent(event_id)) => {
                debug!(message_id = %id, event_id = %event_id, "audit event already stored");
                return Ok(());
            }
            Err(e @ (DomainError::ConstraintViolation(_) | DomainError::InvalidEvent(_))) => {
                return Err(HandlerError::fatal(e));
            }
            Err(e) => return Err(HandlerError::retryable(e)),
        }

        // Runs after the message is acknowledged, before the batch connection is released
        let repository = self.repository.clone();
        bindings.execution().wait_until(async move {
            let actor = touch.actor.clone();
            if let Err(e) = repository.touch_actor(touch).await {
                warn!(actor = %actor, error = %e, "failed to record actor activity");
            }
        });

        Ok(())
    }

    fn validate(&self, event: &AuditEvent) -> DomainResult<()> {
        if event.occurred_at > Utc::now() + self.max_clock_skew {
            return Err(DomainError::InvalidEvent(format!(
                "event {} occurred in the future ({})",
                event.event_id, event.occurred_at
            )));
        }
        Ok(())
    }
}

impl Service<Decoded<AuditEvent>> for AuditEventHandler {
    type Response = ();
    type Error = HandlerError;
    type Future = BoxFuture<'static, Result<(), HandlerError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, message: Decoded<AuditEvent>) -> Self::Future {
        let handler = self.clone();
        Box::pin(async move { handler.handle(message).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MockAuditEventRepository;
    use chrono::TimeZone;
    use common::scope::{BindingContext, Scope};
    use std::collections::HashMap;
    use std::time::Duration;
    use tower::ServiceExt;

    fn message(event_id: &str) -> Decoded<AuditEvent> {
        Decoded {
            id: format!("audit.events:{event_id}"),
            attempts: 1,
            headers: HashMap::new(),
            body: AuditEvent {
                event_id: event_id.to_string(),
                kind: "user.login".to_string(),
                actor: "alice".to_string(),
                occurred_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
                attributes: serde_json::Map::new(),
            },
        }
    }

    fn staging_scope() -> Scope {
        Scope::new(BindingContext::new(HashMap::from([(
            ENVIRONMENT_BINDING.to_string(),
            "staging".to_string(),
        )])))
    }

    #[tokio::test]
    async fn test_stores_event_tagged_with_environment() {
        let mut repo = MockAuditEventRepository::new();
        repo.expect_store_event()
            .withf(|input: &StoreAuditEventInput| {
                input.environment == "staging"
                    && input.message_id == "audit.events:ev-1"
                    && input.delivery_attempts == 1
            })
            .times(1)
            .returning(|_| Ok(()));
        repo.expect_touch_actor()
            .withf(|input: &TouchActorInput| input.actor == "alice")
            .times(1)
            .returning(|_| Ok(()));

        let handler = AuditEventHandler::new(Arc::new(repo));
        let scope = staging_scope();

        let result = scope.clone().run(handler.oneshot(message("ev-1"))).await;
        assert!(result.is_ok());

        // Background work finishes before release
        let released = scope.close(Duration::from_secs(1)).await;
        assert_eq!(released.failed, 0);
        assert_eq!(scope.bindings().execution().pending(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_event_is_success() {
        let mut repo = MockAuditEventRepository::new();
        repo.expect_store_event()
            .times(1)
            .returning(|input| Err(DomainError::DuplicateEvent(input.event.event_id)));
        repo.expect_touch_actor().times(0);

        let handler = AuditEventHandler::new(Arc::new(repo));
        let result = staging_scope().run(handler.handle(message("ev-1"))).await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_constraint_violation_is_fatal() {
        let mut repo = MockAuditEventRepository::new();
        repo.expect_store_event()
            .times(1)
            .returning(|_| Err(DomainError::ConstraintViolation("kind_not_empty".to_string())));

        let handler = AuditEventHandler::new(Arc::new(repo));
        let err = staging_scope()
            .run(handler.handle(message("ev-1")))
            .await
            .unwrap_err();

        assert!(matches!(err, HandlerError::Fatal(_)));
    }

    #[tokio::test]
    async fn test_connection_error_is_retryable() {
        let mut repo = MockAuditEventRepository::new();
        repo.expect_store_event()
            .times(1)
            .returning(|_| Err(DomainError::RepositoryError(anyhow::anyhow!("connection reset"))));

        let handler = AuditEventHandler::new(Arc::new(repo));
        let err = staging_scope()
            .run(handler.handle(message("ev-1")))
            .await
            .unwrap_err();

        assert!(matches!(err, HandlerError::Retryable(_)));
    }

    #[tokio::test]
    async fn test_future_event_is_rejected_without_storing() {
        let mut repo = MockAuditEventRepository::new();
        repo.expect_store_event().times(0);

        let handler = AuditEventHandler::new(Arc::new(repo));
        let mut msg = message("ev-9");
        msg.body.occurred_at = Utc::now() + chrono::Duration::hours(1);

        let err = staging_scope().run(handler.handle(msg)).await.unwrap_err();
        assert!(matches!(err, HandlerError::Fatal(_)));
    }

    #[tokio::test]
    async fn test_missing_environment_binding_uses_default() {
        let mut repo = MockAuditEventRepository::new();
        repo.expect_store_event()
            .withf(|input: &StoreAuditEventInput| input.environment == "default")
            .times(1)
            .returning(|_| Ok(()));
        repo.expect_touch_actor().returning(|_| Ok(()));

        let handler = AuditEventHandler::new(Arc::new(repo));
        let scope = Scope::new(BindingContext::empty());

        assert!(scope.clone().run(handler.handle(message("ev-1"))).await.is_ok());
        scope.close(Duration::from_secs(1)).await;
    }
}
