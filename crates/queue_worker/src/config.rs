use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::Duration;

use anyhow::Context;
use common::nats::QueueConsumerConfig;
use common::postgres::PostgresConfig;
use common::queue::{DecodeErrorPolicy, ProcessorConfig};
use common::telemetry::{LogFormat, TelemetryConfig};
use config::{Config, ConfigError, Environment};
use serde::Deserialize;

const ENV_PREFIX: &str = "QUEUE_WORKER";

/// Variables with this prefix become batch bindings, e.g.
/// `QUEUE_WORKER_BINDING_ENVIRONMENT=prod` binds `environment = prod`.
pub const BINDING_PREFIX: &str = "QUEUE_WORKER_BINDING_";

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Stdout log format (json, pretty)
    #[serde(default)]
    pub log_format: LogFormat,

    // NATS configuration
    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    /// JetStream stream holding audit events
    #[serde(default = "default_nats_stream")]
    pub nats_stream: String,

    /// Subject filter of the durable consumer
    #[serde(default = "default_nats_subject")]
    pub nats_subject: String,

    #[serde(default = "default_nats_consumer_name")]
    pub nats_consumer_name: String,

    /// Maximum messages per fetched batch
    #[serde(default = "default_nats_batch_size")]
    pub nats_batch_size: usize,

    /// Max wait time for a batch in seconds
    #[serde(default = "default_nats_batch_wait_secs")]
    pub nats_batch_wait_secs: u64,

    // Batch processor configuration
    /// Messages handled concurrently within one batch
    #[serde(default = "default_processor_concurrency")]
    pub processor_concurrency: usize,

    /// What to do with undecodable messages (dead-letter, retry)
    #[serde(default)]
    pub processor_on_decode_error: DecodeErrorPolicy,

    /// Delay requested from the broker on redelivery
    #[serde(default)]
    pub processor_retry_delay_ms: Option<u64>,

    /// Stop a batch that has not finished after this many seconds
    #[serde(default)]
    pub processor_batch_deadline_secs: Option<u64>,

    /// How long closing a batch waits for background work
    #[serde(default = "default_processor_background_timeout_secs")]
    pub processor_background_timeout_secs: u64,

    // PostgreSQL configuration
    #[serde(default = "default_postgres_host")]
    pub postgres_host: String,

    #[serde(default = "default_postgres_port")]
    pub postgres_port: u16,

    #[serde(default = "default_postgres_database")]
    pub postgres_database: String,

    #[serde(default = "default_postgres_username")]
    pub postgres_username: String,

    #[serde(default = "default_postgres_password")]
    pub postgres_password: String,

    #[serde(default = "default_postgres_max_pool_size")]
    pub postgres_max_pool_size: usize,

    // OpenTelemetry configuration
    #[serde(default = "default_otel_enabled")]
    pub otel_enabled: bool,

    #[serde(default = "default_otel_endpoint")]
    pub otel_endpoint: String,

    #[serde(default = "default_otel_service_name")]
    pub otel_service_name: String,

    /// Startup timeout for initialization operations in seconds
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,

    // Demo producer
    #[serde(default)]
    pub demo_producer_enabled: bool,

    #[serde(default = "default_demo_producer_interval_ms")]
    pub demo_producer_interval_ms: u64,

    #[serde(default = "default_demo_producer_subject")]
    pub demo_producer_subject: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_nats_stream() -> String {
    "audit_events".to_string()
}

fn default_nats_subject() -> String {
    "audit.events.>".to_string()
}

fn default_nats_consumer_name() -> String {
    "queue-worker".to_string()
}

fn default_nats_batch_size() -> usize {
    30
}

fn default_nats_batch_wait_secs() -> u64 {
    5
}

fn default_processor_concurrency() -> usize {
    1
}

fn default_processor_background_timeout_secs() -> u64 {
    30
}

fn default_postgres_host() -> String {
    "localhost".to_string()
}

fn default_postgres_port() -> u16 {
    5432
}

fn default_postgres_database() -> String {
    "queue_worker".to_string()
}

fn default_postgres_username() -> String {
    "queue_worker".to_string()
}

fn default_postgres_password() -> String {
    "queue_worker".to_string()
}

fn default_postgres_max_pool_size() -> usize {
    10
}

fn default_otel_enabled() -> bool {
    false
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_otel_service_name() -> String {
    "queue-worker".to_string()
}

fn default_startup_timeout_secs() -> u64 {
    30
}

fn default_demo_producer_interval_ms() -> u64 {
    1000
}

fn default_demo_producer_subject() -> String {
    "audit.events.demo".to_string()
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Environment::with_prefix(ENV_PREFIX))
    }

    fn load(environment: Environment) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(environment)
            .build()?
            .try_deserialize()
    }

    /// Binding values for every batch, read from `QUEUE_WORKER_BINDING_*`.
    pub fn binding_vars() -> HashMap<String, String> {
        collect_bindings(std::env::vars())
    }

    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            service_name: self.otel_service_name.clone(),
            otel_endpoint: self.otel_endpoint.clone(),
            otel_enabled: self.otel_enabled,
            log_level: self.log_level.clone(),
            log_format: self.log_format,
        }
    }

    pub fn postgres_config(&self) -> PostgresConfig {
        PostgresConfig {
            host: self.postgres_host.clone(),
            port: self.postgres_port,
            database: self.postgres_database.clone(),
            username: self.postgres_username.clone(),
            password: self.postgres_password.clone(),
            max_pool_size: self.postgres_max_pool_size,
        }
    }

    pub fn processor_config(&self) -> anyhow::Result<ProcessorConfig> {
        let concurrency = NonZeroUsize::new(self.processor_concurrency)
            .context("processor_concurrency must be at least 1")?;

        Ok(ProcessorConfig {
            concurrency,
            on_decode_error: self.processor_on_decode_error,
            retry_delay: self.processor_retry_delay_ms.map(Duration::from_millis),
            background_timeout: Duration::from_secs(self.processor_background_timeout_secs),
            batch_deadline: self.processor_batch_deadline_secs.map(Duration::from_secs),
        })
    }

    pub fn consumer_config(&self) -> QueueConsumerConfig {
        QueueConsumerConfig {
            stream_name: self.nats_stream.clone(),
            consumer_name: self.nats_consumer_name.clone(),
            subject_filter: self.nats_subject.clone(),
            batch_size: self.nats_batch_size,
            max_wait: Duration::from_secs(self.nats_batch_wait_secs),
        }
    }
}

fn collect_bindings(vars: impl IntoIterator<Item = (String, String)>) -> HashMap<String, String> {
    vars.into_iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(BINDING_PREFIX)
                .filter(|name| !name.is_empty())
                .map(|name| (name.to_ascii_lowercase(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_vars(vars: &[(&str, &str)]) -> Result<ServiceConfig, ConfigError> {
        let source = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServiceConfig::load(Environment::with_prefix(ENV_PREFIX).source(Some(source)))
    }

    #[test]
    fn test_default_config() {
        let config = from_vars(&[]).unwrap();

        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.nats_stream, "audit_events");
        assert_eq!(config.processor_concurrency, 1);
        assert_eq!(config.processor_on_decode_error, DecodeErrorPolicy::DeadLetter);
        assert_eq!(config.processor_retry_delay_ms, None);
        assert!(!config.demo_producer_enabled);
    }

    #[test]
    fn test_overrides() {
        let config = from_vars(&[
            ("QUEUE_WORKER_LOG_FORMAT", "pretty"),
            ("QUEUE_WORKER_NATS_BATCH_SIZE", "100"),
            ("QUEUE_WORKER_PROCESSOR_CONCURRENCY", "8"),
            ("QUEUE_WORKER_PROCESSOR_ON_DECODE_ERROR", "retry"),
            ("QUEUE_WORKER_PROCESSOR_RETRY_DELAY_MS", "2500"),
            ("QUEUE_WORKER_PROCESSOR_BATCH_DEADLINE_SECS", "60"),
            ("QUEUE_WORKER_POSTGRES_PORT", "6543"),
        ])
        .unwrap();

        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.nats_batch_size, 100);
        assert_eq!(config.postgres_port, 6543);

        let processor = config.processor_config().unwrap();
        assert_eq!(processor.concurrency.get(), 8);
        assert_eq!(processor.on_decode_error, DecodeErrorPolicy::Retry);
        assert_eq!(processor.retry_delay, Some(Duration::from_millis(2500)));
        assert_eq!(processor.batch_deadline, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let config = from_vars(&[("QUEUE_WORKER_PROCESSOR_CONCURRENCY", "0")]).unwrap();
        assert!(config.processor_config().is_err());
    }

    #[test]
    fn test_unknown_decode_policy_fails() {
        assert!(from_vars(&[("QUEUE_WORKER_PROCESSOR_ON_DECODE_ERROR", "drop")]).is_err());
    }

    #[test]
    fn test_collect_bindings() {
        let bindings = collect_bindings(vec![
            ("QUEUE_WORKER_BINDING_ENVIRONMENT".to_string(), "prod".to_string()),
            ("QUEUE_WORKER_BINDING_REGION".to_string(), "eu-west".to_string()),
            ("QUEUE_WORKER_BINDING_".to_string(), "ignored".to_string()),
            ("QUEUE_WORKER_NATS_URL".to_string(), "nats://x".to_string()),
            ("HOME".to_string(), "/root".to_string()),
        ]);

        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings["environment"], "prod");
        assert_eq!(bindings["region"], "eu-west");
    }

    #[test]
    fn test_conversions() {
        let config = from_vars(&[
            ("QUEUE_WORKER_POSTGRES_HOST", "db"),
            ("QUEUE_WORKER_NATS_BATCH_WAIT_SECS", "2"),
            ("QUEUE_WORKER_OTEL_ENABLED", "true"),
        ])
        .unwrap();

        assert_eq!(config.postgres_config().host, "db");
        assert_eq!(config.consumer_config().max_wait, Duration::from_secs(2));
        assert!(config.telemetry_config().otel_enabled);
    }
}
