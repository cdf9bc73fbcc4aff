//! Job handlers
//!
//! A [`JobHandler`] is the work the queue runs for every job of one name.
//! Handlers live in a [`HandlerRegistry`] shared by the queue (which rejects
//! submissions for unknown names) and the workers.
//!
//! ```rust,ignore
//! let registry = HandlerRegistry::new();
//! registry.register("echo", Arc::new(EchoHandler));
//! registry.register("resize", Arc::new(handler_fn(|ctx, payload| async move {
//!     ctx.ensure_active()?;
//!     Ok(payload)
//! })));
//! ```

mod builtin;
mod registry;
mod traits;

pub use builtin::{EchoHandler, HttpFetchHandler};
pub use registry::HandlerRegistry;
pub use traits::{FnHandler, JobContext, JobHandler, WorkHandler, handler_fn};
