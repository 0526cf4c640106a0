use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use common::postgres::{PostgresClient, PostgresConnection};
use common::scope::{self, ScopeError};
use tracing::{debug, info};

use crate::domain::{
    AuditEventRepository, DomainError, DomainResult, StoreAuditEventInput, TouchActorInput,
};

const AUDIT_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS audit_events (
    event_id          TEXT PRIMARY KEY,
    kind              TEXT NOT NULL CONSTRAINT audit_events_kind_not_empty CHECK (kind <> ''),
    actor             TEXT NOT NULL,
    occurred_at       TIMESTAMPTZ NOT NULL,
    attributes        JSONB NOT NULL DEFAULT '{}'::jsonb,
    environment       TEXT NOT NULL,
    message_id        TEXT NOT NULL,
    delivery_attempts INTEGER NOT NULL,
    stored_at         TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS audit_events_actor_idx ON audit_events (actor, occurred_at);

CREATE TABLE IF NOT EXISTS audit_actors (
    actor        TEXT NOT NULL,
    environment  TEXT NOT NULL,
    last_seen_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (actor, environment)
);
";

/// Create the audit tables if they do not exist yet.
pub async fn ensure_audit_schema(client: &PostgresClient) -> anyhow::Result<()> {
    let conn = client.get_connection().await?;
    conn.batch_execute(AUDIT_SCHEMA)
        .await
        .context("failed to create audit schema")?;
    info!("audit schema ready");
    Ok(())
}

/// PostgreSQL implementation of [`AuditEventRepository`].
///
/// Holds no connection of its own: every call uses the
/// [`PostgresConnection`] acquired for the current batch scope.
#[derive(Clone, Default)]
pub struct PostgresAuditEventRepository;

impl PostgresAuditEventRepository {
    pub fn new() -> Self {
        Self
    }

    /// The batch's connection. Panics outside a scope, like [`scope::current`]:
    /// that is a wiring bug and redelivering would only repeat it.
    fn connection(&self) -> DomainResult<Arc<PostgresConnection>> {
        match scope::resource::<PostgresConnection>() {
            Ok(conn) => Ok(conn),
            Err(e @ ScopeError::ContextUnavailable) => panic!("{e}"),
            Err(e) => Err(DomainError::ConnectionUnavailable(e.to_string())),
        }
    }
}

#[async_trait]
impl AuditEventRepository for PostgresAuditEventRepository {
    async fn store_event(&self, input: StoreAuditEventInput) -> DomainResult<()> {
        let conn = self.connection()?;
        let event = &input.event;
        let attributes = serde_json::Value::Object(event.attributes.clone());
        let attempts = i32::try_from(input.delivery_attempts).unwrap_or(i32::MAX);

        let result = conn
            .client()
            .execute(
                "INSERT INTO audit_events
                    (event_id, kind, actor, occurred_at, attributes, environment, message_id, delivery_attempts)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                &[
                    &event.event_id,
                    &event.kind,
                    &event.actor,
                    &event.occurred_at,
                    &attributes,
                    &input.environment,
                    &input.message_id,
                    &attempts,
                ],
            )
            .await;

        if let Err(e) = result {
            if let Some(db_err) = e.as_db_error() {
                if let Some(err) =
                    error_for_sql_state(db_err.code().code(), &event.event_id, db_err.message())
                {
                    return Err(err);
                }
            }
            return Err(DomainError::RepositoryError(e.into()));
        }

        debug!(event_id = %event.event_id, kind = %event.kind, "audit event inserted");
        Ok(())
    }

    async fn touch_actor(&self, input: TouchActorInput) -> DomainResult<()> {
        let conn = self.connection()?;

        conn.client()
            .execute(
                "INSERT INTO audit_actors (actor, environment, last_seen_at)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (actor, environment)
                 DO UPDATE SET last_seen_at = GREATEST(audit_actors.last_seen_at, EXCLUDED.last_seen_at)",
                &[&input.actor, &input.environment, &input.seen_at],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        Ok(())
    }
}

/// Domain error for the constraint classes the handler treats specially.
fn error_for_sql_state(code: &str, event_id: &str, message: &str) -> Option<DomainError> {
    match code {
        // unique_violation
        "23505" => Some(DomainError::DuplicateEvent(event_id.to_string())),
        // check_violation, foreign_key_violation
        "23514" | "23503" => Some(DomainError::ConstraintViolation(message.to_string())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::scope::{BindingContext, Scope};

    #[test]
    fn test_sql_state_classification() {
        assert!(matches!(
            error_for_sql_state("23505", "ev-1", "duplicate key"),
            Some(DomainError::DuplicateEvent(id)) if id == "ev-1"
        ));
        assert!(matches!(
            error_for_sql_state("23514", "ev-1", "violates check constraint"),
            Some(DomainError::ConstraintViolation(_))
        ));
        assert!(matches!(
            error_for_sql_state("23503", "ev-1", "violates foreign key"),
            Some(DomainError::ConstraintViolation(_))
        ));
        assert!(error_for_sql_state("08006", "ev-1", "connection failure").is_none());
    }

    #[tokio::test]
    async fn test_missing_batch_connection() {
        let repo = PostgresAuditEventRepository::new();
        let input = TouchActorInput {
            actor: "alice".to_string(),
            environment: "test".to_string(),
            seen_at: Utc::now(),
        };

        let err = Scope::new(BindingContext::empty())
            .run(repo.touch_actor(input))
            .await
            .unwrap_err();

        assert!(matches!(err, DomainError::ConnectionUnavailable(_)));
    }

    #[tokio::test]
    #[should_panic(expected = "no scope is installed")]
    async fn test_touch_actor_outside_scope_panics() {
        let repo = PostgresAuditEventRepository::new();
        let input = TouchActorInput {
            actor: "alice".to_string(),
            environment: "test".to_string(),
            seen_at: Utc::now(),
        };

        let _ = repo.touch_actor(input).await;
    }
}
