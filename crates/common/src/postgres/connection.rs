use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tracing::{debug, warn};

use crate::postgres::PostgresClient;
use crate::scope::{Acquired, ScopedFactory};

/// One pooled connection held for the lifetime of a batch scope.
///
/// Shared by every handler of the batch. `tokio_postgres` pipelines
/// concurrent queries on a single connection, so no extra locking is needed;
/// transactions need `&mut` and are therefore not available on a shared
/// connection.
pub struct PostgresConnection {
    client: deadpool_postgres::Client,
    acquired_at: Instant,
}

impl PostgresConnection {
    pub fn new(client: deadpool_postgres::Client) -> Self {
        Self {
            client,
            acquired_at: Instant::now(),
        }
    }

    pub fn client(&self) -> &deadpool_postgres::Client {
        &self.client
    }

    pub fn held_for_ms(&self) -> u64 {
        self.acquired_at.elapsed().as_millis() as u64
    }
}

/// Factory for the batch-scoped [`PostgresConnection`].
///
/// The connection is checked out and pinged the first time a batch needs it.
/// Closing the scope hands it back to the pool.
pub fn postgres_connection_factory(client: PostgresClient) -> ScopedFactory<PostgresConnection> {
    ScopedFactory::new("postgres", move |_bindings| {
        let client = client.clone();
        async move {
            let conn = client.get_connection().await?;
            conn.execute("SELECT 1", &[])
                .await
                .context("postgres connection failed health check")?;
            debug!("postgres connection checked out for batch");

            Ok(Acquired::new(PostgresConnection::new(conn)).with_release(return_to_pool))
        }
    })
}

async fn return_to_pool(conn: Arc<PostgresConnection>) -> anyhow::Result<()> {
    let held_ms = conn.held_for_ms();
    match Arc::try_unwrap(conn) {
        Ok(conn) => {
            drop(conn);
            debug!(held_ms, "postgres connection returned to pool");
        }
        Err(shared) => {
            // Returned once the last handle (e.g. a leaked background task) drops
            warn!(
                held_ms,
                handles = Arc::strong_count(&shared),
                "postgres connection still referenced at scope close"
            );
        }
    }
    Ok(())
}
