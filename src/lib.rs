pub mod api;
pub mod batch;
pub mod breaker;
pub mod cache;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod humanize;
pub mod observability;
pub mod queue;
pub mod retry;
pub mod work;
pub mod worker;

pub use engine::Engine;
pub use error::{ResilienceError, Result};
