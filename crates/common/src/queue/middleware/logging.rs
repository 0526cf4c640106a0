use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tower::{Layer, Service};
use tracing::{debug, warn, Instrument, Span};

use crate::queue::{Decoded, HandlerError};

/// Tower layer that logs the duration and result of every handler call
#[derive(Clone, Default)]
pub struct HandlerLoggingLayer;

impl HandlerLoggingLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for HandlerLoggingLayer {
    type Service = HandlerLoggingService<S>;

    fn layer(&self, service: S) -> Self::Service {
        HandlerLoggingService { inner: service }
    }
}

#[derive(Clone)]
pub struct HandlerLoggingService<S> {
    inner: S,
}

impl<S, T> Service<Decoded<T>> for HandlerLoggingService<S>
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
        let message_id = req.id.clone();
        let attempts = req.attempts;
        let start = Instant::now();

        // Take the ready clone, leave a fresh one behind
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(
            async move {
                let result = inner.call(req).await;
                let duration_ms = start.elapsed().as_millis();

                match &result {
                    Ok(()) => {
                        debug!(
                            message_id = %message_id,
                            attempts,
                            duration_ms = %duration_ms,
                            "handled {message_id} in {duration_ms}ms"
                        );
                    }
                    Err(e) => {
                        warn!(
                            message_id = %message_id,
                            attempts,
                            duration_ms = %duration_ms,
                            retryable = e.is_retryable(),
                            error = %e,
                            "handler failed for {message_id} in {duration_ms}ms: {e}"
                        );
                    }
                }

                result
            }
            .instrument(Span::current()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tower::{service_fn, ServiceExt};

    fn decoded(body: i32) -> Decoded<i32> {
        Decoded {
            id: "numbers:1".to_string(),
            attempts: 1,
            headers: HashMap::new(),
            body,
        }
    }

    #[tokio::test]
    async fn test_logging_passes_result_through() {
        let service = HandlerLoggingLayer::new().layer(service_fn(|msg: Decoded<i32>| async move {
            if msg.body < 0 {
                Err(HandlerError::fatal(anyhow::anyhow!("negative")))
            } else {
                Ok(())
            }
        }));

        assert!(service.clone().oneshot(decoded(1)).await.is_ok());
        let err = service.oneshot(decoded(-1)).await.unwrap_err();
        assert!(matches!(err, HandlerError::Fatal(_)));
    }
}
