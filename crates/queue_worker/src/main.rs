use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use common::nats::NatsClient;
use common::postgres::PostgresClient;
use common::telemetry::{init_telemetry, shutdown_telemetry, TelemetryProviders};
use queue_runner::Runner;
use queue_worker::config::ServiceConfig;
use queue_worker::demo_producer::DemoProducer;
use queue_worker::postgres::{ensure_audit_schema, PostgresAuditEventRepository};
use queue_worker::{QueueWorker, QueueWorkerConfig};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let telemetry_providers: Option<TelemetryProviders> =
        match init_telemetry(&config.telemetry_config()) {
            Ok(providers) => providers,
            Err(e) => {
                eprintln!("Failed to initialize telemetry: {:#}", e);
                std::process::exit(1);
            }
        };

    info!(
        otel_enabled = config.otel_enabled,
        stream = %config.nats_stream,
        subject = %config.nats_subject,
        concurrency = config.processor_concurrency,
        "starting queue worker service"
    );

    let processor_config = match config.processor_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "invalid processor configuration");
            std::process::exit(1);
        }
    };

    let (postgres_client, nats_client) = match initialize_shared_dependencies(&config).await {
        Ok(deps) => deps,
        Err(e) => {
            error!(error = %format!("{e:#}"), "failed to initialize shared dependencies");
            std::process::exit(1);
        }
    };

    // Only the names are logged; values may be secrets
    let bindings = ServiceConfig::binding_vars();
    info!(binding_keys = ?bindings.keys().collect::<Vec<_>>(), "batch bindings loaded");

    let worker = match QueueWorker::new(
        nats_client.create_consumer_client(),
        postgres_client,
        Arc::new(PostgresAuditEventRepository::new()),
        QueueWorkerConfig {
            consumer: config.consumer_config(),
            processor: processor_config,
            bindings,
        },
    )
    .await
    {
        Ok(worker) => worker,
        Err(e) => {
            error!(error = %format!("{e:#}"), "failed to initialize queue worker");
            std::process::exit(1);
        }
    };

    let mut runner = Runner::new().with_app_process("queue_worker", worker.into_runner_process());

    if config.demo_producer_enabled {
        let producer = DemoProducer::new(
            nats_client.create_publisher_client(),
            config.demo_producer_subject.clone(),
            Duration::from_millis(config.demo_producer_interval_ms),
        );
        runner = runner.with_app_process("demo_producer", move |ctx| producer.run(ctx));
    }

    // Closers run in reverse: NATS first, telemetry last so shutdown is still logged
    runner = runner
        .with_closer("telemetry", move || async move {
            shutdown_telemetry(telemetry_providers);
            Ok(())
        })
        .with_closer("nats", {
            let nats_for_close = Arc::clone(&nats_client);
            move || async move {
                if let Ok(client) = Arc::try_unwrap(nats_for_close) {
                    client.close().await;
                }
                Ok(())
            }
        })
        .with_closer_timeout(Duration::from_secs(10));
    drop(nats_client);

    if let Err(e) = runner.run().await {
        eprintln!("queue worker stopped with error: {:#}", e);
        std::process::exit(1);
    }
}

async fn initialize_shared_dependencies(
    config: &ServiceConfig,
) -> anyhow::Result<(PostgresClient, Arc<NatsClient>)> {
    let startup_timeout = Duration::from_secs(config.startup_timeout_secs);

    info!("initializing postgres");
    let postgres_client = PostgresClient::new(&config.postgres_config())?;
    tokio::time::timeout(startup_timeout, ensure_audit_schema(&postgres_client))
        .await
        .context("timed out preparing audit schema")??;

    info!("initializing nats");
    let nats_client = Arc::new(NatsClient::connect(&config.nats_url, startup_timeout).await?);
    nats_client
        .ensure_stream(&config.nats_stream, vec![config.nats_subject.clone()])
        .await?;

    Ok((postgres_client, nats_client))
}
