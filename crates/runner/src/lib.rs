//! Supervises the long-running processes of a service and shuts them down
//! together.
//!
//! - Named app processes run concurrently on the same cancellation token
//! - SIGINT/SIGTERM, or the first process failure, cancels all of them
//! - Closers then run one at a time, most recently registered first, under a
//!   shared timeout
//! - [`Runner::run`] returns the first process error so the binary decides the exit code
//!
//! # Example
//!
//! ```no_run
//! use queue_runner::Runner;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     Runner::new()
//!         .with_app_process("ticker", |ctx| async move {
//!             while !ctx.is_cancelled() {
//!                 tokio::select! {
//!                     _ = ctx.cancelled() => {}
//!                     _ = tokio::time::sleep(Duration::from_secs(1)) => tracing::info!("tick"),
//!                 }
//!             }
//!             Ok(())
//!         })
//!         .with_closer("flush", || async move { Ok(()) })
//!         .with_closer_timeout(Duration::from_secs(5))
//!         .run()
//!         .await
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use anyhow::anyhow;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type BoxedResultFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A long-running process. Receives the shared cancellation token.
pub type AppProcess = Box<dyn FnOnce(CancellationToken) -> BoxedResultFuture + Send>;

/// Cleanup run after every process has stopped.
pub type Closer = Box<dyn FnOnce() -> BoxedResultFuture + Send>;

struct Named<T> {
    name: &'static str,
    inner: T,
}

pub struct Runner {
    app_processes: Vec<Named<AppProcess>>,
    closers: Vec<Named<Closer>>,
    closer_timeout: Duration,
    cancellation_token: CancellationToken,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    /// A runner with no processes and a 10 second closer timeout.
    pub fn new() -> Self {
        Self {
            app_processes: Vec::new(),
            closers: Vec::new(),
            closer_timeout: Duration::from_secs(10),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Add a process. A process returning an error cancels all the others.
    pub fn with_app_process<F, Fut>(mut self, name: &'static str, process: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.app_processes.push(Named {
            name,
            inner: Box::new(move |token| -> BoxedResultFuture { Box::pin(process(token)) }),
        });
        self
    }

    /// Add a closer. Closers run in reverse registration order, so resources
    /// opened first are closed last.
    pub fn with_closer<F, Fut>(mut self, name: &'static str, closer: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.closers.push(Named {
            name,
            inner: Box::new(move || -> BoxedResultFuture { Box::pin(closer()) }),
        });
        self
    }

    /// Total time allowed for all closers. Default is 10 seconds.
    pub fn with_closer_timeout(mut self, timeout: Duration) -> Self {
        self.closer_timeout = timeout;
        self
    }

    /// Use an externally controlled cancellation token.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    /// Run every process until one fails or shutdown is requested, then run
    /// the closers. Returns the first process failure, if any.
    pub async fn run(self) -> anyhow::Result<()> {
        let token = self.cancellation_token;
        spawn_signal_handlers(token.clone());

        let mut join_set = JoinSet::new();
        for process in self.app_processes {
            let process_token = token.clone();
            let name = process.name;
            join_set.spawn(async move { (name, (process.inner)(process_token).await) });
        }

        let mut first_error = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((name, Ok(()))) => {
                    debug!(process = name, "app process completed");
                }
                Ok((name, Err(err))) => {
                    error!(process = name, error = %format!("{err:#}"), "app process failed");
                    if first_error.is_none() {
                        first_error = Some(err.context(format!("process {name} failed")));
                    }
                    token.cancel();
                }
                Err(err) => {
                    error!(error = %err, "app process panicked");
                    if first_error.is_none() {
                        first_error = Some(anyhow!("app process panicked: {err}"));
                    }
                    token.cancel();
                }
            }
        }

        run_closers(self.closers, self.closer_timeout).await;

        match first_error {
            Some(err) => Err(err),
            None => {
                info!("all app processes stopped");
                Ok(())
            }
        }
    }
}

fn spawn_signal_handlers(token: CancellationToken) {
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = ctrl_c_token.cancelled() => {}
            signal = tokio::signal::ctrl_c() => match signal {
                Ok(()) => {
                    info!("received SIGINT, shutting down");
                    ctrl_c_token.cancel();
                }
                Err(err) => error!(error = %err, "failed to listen for SIGINT"),
            },
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                return;
            }
        };
        tokio::select! {
            _ = token.cancelled() => {}
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                token.cancel();
            }
        }
    });
}

/// Run closers newest first. A failing closer is logged and does not stop the rest.
async fn run_closers(closers: Vec<Named<Closer>>, timeout: Duration) {
    if closers.is_empty() {
        return;
    }
    info!(timeout_ms = timeout.as_millis() as u64, "running closers");

    let run_all = async {
        for closer in closers.into_iter().rev() {
            match (closer.inner)().await {
                Ok(()) => debug!(closer = closer.name, "closer completed"),
                Err(err) => {
                    error!(closer = closer.name, error = %format!("{err:#}"), "closer failed")
                }
            }
        }
    };

    if tokio::time::timeout(timeout, run_all).await.is_err() {
        warn!(timeout_ms = timeout.as_millis() as u64, "closers timed out");
    }
}
