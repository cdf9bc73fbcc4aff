//! The unit-of-work abstraction shared by the breaker, the retry executor and
//! the job queue.
//!
//! Any `Fn() -> impl Future<Output = Result<T, ResilienceError>>` closure is a
//! unit of work, so call sites usually pass a closure:
//!
//! ```rust,ignore
//! let breaker = registry.get("billing");
//! let invoice = breaker.call(&|| client.fetch_invoice(id)).await?;
//! ```

use std::future::Future;

use crate::error::ResilienceError;

/// A zero-argument operation that may be executed more than once
pub trait UnitOfWork: Send + Sync {
    type Output: Send;

    fn execute(&self) -> impl Future<Output = Result<Self::Output, ResilienceError>> + Send;
}

impl<F, Fut, T> UnitOfWork for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, ResilienceError>> + Send,
    T: Send,
{
    type Output = T;

    fn execute(&self) -> impl Future<Output = Result<T, ResilienceError>> + Send {
        (self)()
    }
}
