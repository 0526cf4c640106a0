use std::collections::HashMap;
use std::sync::Arc;

use common::nats::{JetStreamConsumer, QueueConsumer, QueueConsumerConfig};
use common::postgres::{postgres_connection_factory, PostgresClient};
use common::queue::middleware::{
    HandlerLoggingLayer, HandlerLoggingService, HandlerTracingLayer, HandlerTracingService,
};
use common::queue::{BatchProcessor, JsonSchemaDecoder, ProcessorConfig};
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tracing::info;

use crate::domain::{AuditEvent, AuditEventHandler, AuditEventRepository, AUDIT_EVENT_SCHEMA};

pub struct QueueWorkerConfig {
    pub consumer: QueueConsumerConfig,
    pub processor: ProcessorConfig,
    /// Bindings handed to every batch
    pub bindings: HashMap<String, String>,
}

type AuditEventService = HandlerTracingService<HandlerLoggingService<AuditEventHandler>>;

/// Consumes audit events and stores them, one batch scope per fetched batch.
pub struct QueueWorker {
    consumer: QueueConsumer<JsonSchemaDecoder<AuditEvent>, AuditEventService>,
}

impl QueueWorker {
    pub async fn new(
        jetstream: Arc<dyn JetStreamConsumer>,
        postgres_client: PostgresClient,
        repository: Arc<dyn AuditEventRepository>,
        config: QueueWorkerConfig,
    ) -> anyhow::Result<Self> {
        info!(
            stream = %config.consumer.stream_name,
            concurrency = config.processor.concurrency.get(),
            bindings = config.bindings.len(),
            "initializing queue worker"
        );

        let decoder = JsonSchemaDecoder::<AuditEvent>::new(AUDIT_EVENT_SCHEMA)?;
        let handler = ServiceBuilder::new()
            .layer(HandlerTracingLayer::new(config.consumer.stream_name.clone()))
            .layer(HandlerLoggingLayer::new())
            .service(AuditEventHandler::new(repository));

        let processor = BatchProcessor::with_config(decoder, handler, config.processor)
            .with_resource(postgres_connection_factory(postgres_client));

        let consumer =
            QueueConsumer::new(jetstream, config.consumer, processor, config.bindings).await?;

        Ok(Self { consumer })
    }

    pub fn into_runner_process(
        self,
    ) -> impl FnOnce(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> {
        move |ctx| Box::pin(async move { self.consumer.run(ctx).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MockAuditEventRepository;
    use common::nats::{MockJetStreamConsumer, MockPullConsumer};
    use common::postgres::PostgresConfig;
    use common::queue::{MockMessageControls, RawMessage};
    use std::time::Duration;

    fn config() -> QueueWorkerConfig {
        QueueWorkerConfig {
            consumer: QueueConsumerConfig {
                stream_name: "audit_events".to_string(),
                consumer_name: "queue-worker".to_string(),
                subject_filter: "audit.events.>".to_string(),
                batch_size: 10,
                max_wait: Duration::from_millis(100),
            },
            processor: ProcessorConfig::default(),
            bindings: HashMap::from([("environment".to_string(), "test".to_string())]),
        }
    }

    #[tokio::test]
    async fn test_undecodable_event_is_dead_lettered_without_database() {
        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();

        let mut pull = MockPullConsumer::new();
        pull.expect_fetch_batch().times(1).returning(move |_, _| {
            let stop = stop.clone();
            let mut controls = MockMessageControls::new();
            controls.expect_ack().times(1).returning(move || {
                stop.cancel();
                Ok(())
            });
            controls.expect_retry().times(0);

            Ok(vec![RawMessage::new(
                "audit.events.demo:1",
                r#"{"event_id":"ev-1"}"#,
                Box::new(controls),
            )])
        });

        let mut pull = Some(pull);
        let mut jetstream = MockJetStreamConsumer::new();
        jetstream
            .expect_create_consumer()
            .times(1)
            .returning(move |_, _| Ok(Box::new(pull.take().unwrap_or_default())));

        let mut repository = MockAuditEventRepository::new();
        repository.expect_store_event().times(0);

        // The pool never connects: decoding fails before the connection is needed
        let postgres = PostgresClient::new(&PostgresConfig::default()).unwrap();
        let worker = QueueWorker::new(Arc::new(jetstream), postgres, Arc::new(repository), config())
            .await
            .unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            (worker.into_runner_process())(shutdown),
        )
        .await
        .unwrap();
        assert!(result.is_ok());
    }
}
