//! Executes one claimed job

use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info_span};
use uuid::Uuid;

use crate::error::ResilienceError;
use crate::handlers::JobContext;
use crate::queue::broker::QueueShared;

pub(crate) async fn run_job(worker_id: usize, shared: &Arc<QueueShared>, id: Uuid) {
    let token = CancellationToken::new();
    // registered before the claim so a concurrent cancel always finds it
    shared.running.lock().insert(id, token.clone());

    let Some(job) = shared.store.claim(&id) else {
        shared.running.lock().remove(&id);
        shared.stale.lock().remove(&id);
        debug!(worker_id, job_id = %id, "Skipping job that is no longer pending");
        return;
    };

    let span = info_span!("job", job_id = %id, job = %job.name, attempt = job.attempt, worker_id);
    let outcome = execute(shared, &job.name, &job.payload, JobContext {
        job_id: id,
        name: job.name.clone(),
        attempt: job.attempt,
        max_attempts: job.max_attempts,
        cancellation: token,
    })
    .instrument(span)
    .await;

    shared.running.lock().remove(&id);
    shared.settle(&job, outcome);
}

async fn execute(
    shared: &QueueShared,
    name: &str,
    payload: &Value,
    ctx: JobContext,
) -> Result<Value, ResilienceError> {
    let Some(handler) = shared.handlers.get(name) else {
        return Err(ResilienceError::validation(format!(
            "no handler registered for job '{name}'"
        )));
    };

    let token = ctx.cancellation.clone();
    let payload = payload.clone();
    let mut task = tokio::spawn(async move { handler.run(&ctx, &payload).await });

    let timeout = async {
        match shared.options.job_timeout {
            Some(limit) => {
                tokio::time::sleep(limit).await;
                limit
            }
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        joined = &mut task => match joined {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => {
                error!(error = %e, "Job handler panicked");
                Err(ResilienceError::dependency(name, "handler panicked"))
            }
            Err(_) => Err(ResilienceError::Cancelled("handler task aborted".into())),
        },
        _ = token.cancelled() => {
            task.abort();
            Err(ResilienceError::Cancelled(format!("job '{name}' cancelled while running")))
        }
        limit = timeout => {
            task.abort();
            token.cancel();
            Err(ResilienceError::Timeout(limit))
        }
    }
}
