use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tower::{Layer, Service};
use tracing::{field, info_span, Instrument, Span};

use crate::queue::{Decoded, HandlerError};
use crate::telemetry::set_parent_from_headers;

/// Tower layer that runs every handler call in its own span, parented to the
/// trace propagated in the message headers.
#[derive(Clone, Debug)]
pub struct HandlerTracingLayer {
    queue: String,
}

impl HandlerTracingLayer {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
        }
    }
}

impl<S> Layer<S> for HandlerTracingLayer {
    type Service = HandlerTracingService<S>;

    fn layer(&self, service: S) -> Self::Service {
        HandlerTracingService {
            inner: service,
            queue: self.queue.clone(),
        }
    }
}

#[derive(Clone)]
pub struct HandlerTracingService<S> {
    inner: S,
    queue: String,
}

impl<S, T> Service<Decoded<T>> for HandlerTracingService<S>
where
    S: Service<Decoded<T>, Response = (), Error = HandlerError> + Clone + Send + 'static,
    S::Future: Send + 'static,
    T: Send + 'static,
{
    type Response = ();
    type Error = HandlerError;
    type Future = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Decoded<T>) -> Self::Future {
        let span = info_span!(
            target: "queue",
            "handle_message",
            otel.name = "handle_message",
            otel.kind = "consumer",
            messaging.operation = "process",
            messaging.destination.name = %self.queue,
            messaging.message.id = %req.id,
            messaging.message.delivery_attempt = req.attempts,
            otel.status_code = field::Empty,
            handler.retryable = field::Empty,
        );
        set_parent_from_headers(&span, &req.headers);

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(
            async move {
                let result = inner.call(req).await;

                let span = Span::current();
                match &result {
                    Ok(()) => {
                        span.record("otel.status_code", "OK");
                    }
                    Err(e) => {
                        span.record("otel.status_code", "ERROR");
                        span.record("handler.retryable", e.is_retryable());
                    }
                }

                result
            }
            .instrument(span),
        )
    }
}
