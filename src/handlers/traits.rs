use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::ResilienceError;
use crate::work::UnitOfWork;

/// Per-execution context handed to a job handler
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub name: String,
    /// 1-based attempt number
    pub attempt: u32,
    pub max_attempts: u32,
    /// Fired when the job is cancelled or the queue gives up on it
    pub cancellation: CancellationToken,
}

impl JobContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// `Err(Cancelled)` once cancellation was requested
    pub fn ensure_active(&self) -> Result<(), ResilienceError> {
        if self.is_cancelled() {
            return Err(ResilienceError::Cancelled(format!("job {}", self.job_id)));
        }
        Ok(())
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Work executed by the queue for jobs of one name
///
/// Errors are recorded on the job record; retryable errors reschedule the
/// job until its attempt cap.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: &JobContext, payload: &Value) -> Result<Value, ResilienceError>;
}

/// Handler backed by an async closure
pub struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

/// Wrap `f(ctx, payload)` as a [`JobHandler`]
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F, Fut>
where
    F: Fn(JobContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ResilienceError>> + Send,
{
    FnHandler {
        f,
        _fut: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F, Fut>
where
    F: Fn(JobContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ResilienceError>> + Send,
{
    async fn run(&self, ctx: &JobContext, payload: &Value) -> Result<Value, ResilienceError> {
        (self.f)(ctx.clone(), payload.clone()).await
    }
}

/// Runs a payload-free [`UnitOfWork`] as a job
pub struct WorkHandler<W>(pub W);

#[async_trait]
impl<W> JobHandler for WorkHandler<W>
where
    W: UnitOfWork<Output = Value>,
{
    async fn run(&self, ctx: &JobContext, _payload: &Value) -> Result<Value, ResilienceError> {
        ctx.ensure_active()?;
        self.0.execute().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> JobContext {
        JobContext {
            job_id: Uuid::now_v7(),
            name: "test".into(),
            attempt: 1,
            max_attempts: 3,
            cancellation: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_handler_fn_receives_payload() {
        let handler = handler_fn(|ctx: JobContext, payload: Value| async move {
            Ok(json!({ "attempt": ctx.attempt, "echo": payload }))
        });

        let out = handler.run(&ctx(), &json!({"a": 1})).await.unwrap();
        assert_eq!(out, json!({ "attempt": 1, "echo": {"a": 1} }));
    }

    #[tokio::test]
    async fn test_work_handler_honours_cancellation() {
        let handler = WorkHandler(|| async { Ok::<_, ResilienceError>(json!("done")) });
        let ctx = ctx();

        assert_eq!(handler.run(&ctx, &Value::Null).await.unwrap(), json!("done"));

        ctx.cancellation.cancel();
        assert!(matches!(
            handler.run(&ctx, &Value::Null).await,
            Err(ResilienceError::Cancelled(_))
        ));
    }
}
