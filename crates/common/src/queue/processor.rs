use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{stream, FutureExt, StreamExt};
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceExt};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::queue::{
    decode_message, Batch, BatchReport, DecodeErrorPolicy, Decoded, HandlerError, MessageDecoder,
    MessageEnvelope, OutcomeRouter, ProcessingOutcome, RawMessage,
};
use crate::scope::{panic_message, BindingContext, ResourceError, ResourceProvider, Scope};

/// Tuning for a [`BatchProcessor`].
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Maximum number of messages being decoded or handled at once
    pub concurrency: NonZeroUsize,
    pub on_decode_error: DecodeErrorPolicy,
    /// Delay passed to the broker with every redelivery request
    pub retry_delay: Option<Duration>,
    /// How long scope close waits for `wait_until` work before releasing resources
    pub background_timeout: Duration,
    /// Cancel the batch if it has not finished after this long
    pub batch_deadline: Option<Duration>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            concurrency: NonZeroUsize::MIN,
            on_decode_error: DecodeErrorPolicy::default(),
            retry_delay: None,
            background_timeout: Duration::from_secs(30),
            batch_deadline: None,
        }
    }
}

/// Drives decode, handle and acknowledge/redeliver for every message of a
/// batch, inside one scope shared by the whole batch.
///
/// The handler is a [`tower::Service`] so logging and tracing can be layered
/// onto it; closures can be adapted with [`tower::service_fn`].
///
/// ```ignore
/// let processor = BatchProcessor::with_config(
///     JsonDecoder::<Order>::new(),
///     service_fn(|order: Decoded<Order>| async move { store(order).await }),
///     ProcessorConfig { concurrency: NonZeroUsize::new(4).unwrap(), ..Default::default() },
/// )
/// .with_resource(postgres_connection_factory(client));
///
/// let report = processor.process(batch, bindings).await;
/// ```
pub struct BatchProcessor<D, H> {
    decoder: Arc<D>,
    handler: H,
    config: ProcessorConfig,
    router: OutcomeRouter,
    resources: Vec<Arc<dyn ResourceProvider>>,
}

impl<D, H> BatchProcessor<D, H>
where
    D: MessageDecoder,
    H: Service<Decoded<D::Output>, Response = (), Error = HandlerError>
        + Clone
        + Send
        + Sync
        + 'static,
    H::Future: Send + 'static,
{
    pub fn new(decoder: D, handler: H) -> Self {
        Self::with_config(decoder, handler, ProcessorConfig::default())
    }

    pub fn with_config(decoder: D, handler: H, config: ProcessorConfig) -> Self {
        let router = OutcomeRouter::new(config.on_decode_error, config.retry_delay);
        Self {
            decoder: Arc::new(decoder),
            handler,
            config,
            router,
            resources: Vec::new(),
        }
    }

    /// Make a scoped resource available to every handler of a batch. It is
    /// acquired when the first decoded message is about to be handled.
    pub fn with_resource(mut self, provider: impl ResourceProvider + 'static) -> Self {
        self.resources.push(Arc::new(provider));
        self
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Process `batch` to completion. Returns once every message has been
    /// acknowledged or redelivered and the batch scope has been released.
    pub async fn process(&self, batch: Batch, bindings: BindingContext) -> BatchReport {
        self.process_until(batch, bindings, CancellationToken::new())
            .await
    }

    /// Like [`BatchProcessor::process`], but stops early when `cancel` fires
    /// or the configured batch deadline elapses. Messages without an outcome
    /// at that point are redelivered; resources are still released.
    pub async fn process_until(
        &self,
        batch: Batch,
        bindings: BindingContext,
        cancel: CancellationToken,
    ) -> BatchReport {
        let scope = Scope::new(bindings);
        let span = info_span!(
            "process_batch",
            queue = %batch.queue(),
            scope_id = scope.id(),
            batch_size = batch.len()
        );

        self.run_batch(batch, scope, cancel).instrument(span).await
    }

    async fn run_batch(&self, batch: Batch, scope: Scope, cancel: CancellationToken) -> BatchReport {
        let started = Instant::now();
        let guard = scope.guard();
        let mut report = BatchReport::new(batch.len());

        let envelopes: Vec<MessageEnvelope> =
            batch.messages().iter().map(|m| m.envelope().clone()).collect();
        let mut pending: Vec<Option<RawMessage>> =
            batch.into_messages().into_iter().map(Some).collect();

        debug!(
            concurrency = self.config.concurrency.get(),
            "processing batch"
        );

        let aborted = AtomicBool::new(false);
        let jobs = envelopes.into_iter().enumerate().map(|(index, envelope)| {
            let job = self.process_one(&scope, envelope, &aborted);
            scope.clone().run(job.map(move |outcome| (index, outcome)))
        });
        let mut in_flight = stream::iter(jobs).buffer_unordered(self.config.concurrency.get());

        let deadline = async {
            match self.config.batch_deadline {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!("batch cancelled, abandoning in-flight messages");
                    break;
                }
                _ = &mut deadline => {
                    warn!(
                        deadline_ms = self.config.batch_deadline.map(|d| d.as_millis() as u64),
                        "batch deadline elapsed, abandoning in-flight messages"
                    );
                    break;
                }
                next = in_flight.next() => match next {
                    Some((index, outcome)) => {
                        if let Some(message) = pending[index].take() {
                            let applied = self.router.apply(message, &outcome).await;
                            report.record(&outcome, applied);
                        }
                    }
                    None => break,
                },
            }
        }
        drop(in_flight);

        for message in pending.into_iter().flatten() {
            let outcome = ProcessingOutcome::Aborted {
                reason: "batch stopped before the message completed".to_string(),
            };
            let applied = self.router.apply(message, &outcome).await;
            report.record(&outcome, applied);
        }

        let released = scope.close(self.config.background_timeout).await;
        guard.disarm();
        report.release_failures = released.failed;

        info!(
            total = report.total,
            acknowledged = report.acknowledged,
            redelivered = report.redelivered,
            control_failures = report.control_failures,
            resources_released = released.released,
            release_failures = released.failed,
            duration_ms = started.elapsed().as_millis() as u64,
            "batch processed"
        );

        report
    }

    async fn process_one(
        &self,
        scope: &Scope,
        envelope: MessageEnvelope,
        aborted: &AtomicBool,
    ) -> ProcessingOutcome {
        if aborted.load(Ordering::Acquire) {
            return ProcessingOutcome::Aborted {
                reason: "batch resources unavailable".to_string(),
            };
        }

        let decoded = match decode_message(self.decoder.as_ref(), &envelope) {
            Ok(decoded) => decoded,
            Err(failure) => {
                return ProcessingOutcome::DecodeFailure {
                    reason: failure.diagnostic,
                }
            }
        };

        for provider in &self.resources {
            let provided = AssertUnwindSafe(provider.provide(scope))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(ResourceError::Acquisition {
                        resource: provider.name(),
                        message: format!("provider panicked: {}", panic_message(panic.as_ref())),
                    })
                });
            if let Err(e) = provided {
                if !aborted.swap(true, Ordering::AcqRel) {
                    error!(
                        resource = provider.name(),
                        error = %e,
                        "batch resource unavailable, redelivering remaining messages"
                    );
                }
                return ProcessingOutcome::Aborted {
                    reason: e.to_string(),
                };
            }
        }

        let mut handler = self.handler.clone();
        let handled = AssertUnwindSafe(async move {
            handler.ready().await?;
            handler.call(decoded).await
        })
        .catch_unwind()
        .await;

        match handled {
            Ok(result) => result.into(),
            Err(panic) => ProcessingOutcome::UnexpectedFailure {
                reason: format!("handler panicked: {}", panic_message(panic.as_ref())),
            },
        }
    }
}
