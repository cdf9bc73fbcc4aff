//! Worker pool
//!
//! A fixed number of tokio tasks pull job ids from the queue's shared
//! receiver, execute the registered handler and settle the outcome.

pub mod http;
pub mod runner;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::queue::broker::QueueShared;

pub use http::{HttpClientConfig, HttpRequest, HttpResponse, ResilientHttpClient};

/// Handles to the running workers
pub struct WorkerPool {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn spawn(count: usize, shared: Arc<QueueShared>) -> Self {
        let shutdown = CancellationToken::new();
        let handles = (0..count)
            .map(|worker_id| {
                let shared = shared.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { worker_loop(worker_id, shared, shutdown).await })
            })
            .collect();

        info!(workers = count, "Worker pool started");
        Self { shutdown, handles }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Signal every worker and wait up to `grace` for them to exit
    pub async fn shutdown(self, grace: Duration) {
        self.shutdown.cancel();

        let mut handles = self.handles;
        let joined = tokio::time::timeout(grace, async {
            for handle in handles.iter_mut() {
                if let Err(e) = handle.await {
                    if e.is_panic() {
                        warn!(error = %e, "Worker panicked");
                    }
                }
            }
        })
        .await;

        if joined.is_err() {
            warn!(grace_ms = grace.as_millis() as u64, "Workers did not stop in time, aborting");
            for handle in &handles {
                handle.abort();
            }
        }
        info!("Worker pool stopped");
    }
}

async fn worker_loop(worker_id: usize, shared: Arc<QueueShared>, shutdown: CancellationToken) {
    debug!(worker_id, "Worker started");

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            id = async { shared.rx.lock().await.recv().await } => id,
        };

        let Some(id) = next else {
            // every sender dropped
            break;
        };

        runner::run_job(worker_id, &shared, id).await;
    }

    debug!(worker_id, "Worker stopped");
}
