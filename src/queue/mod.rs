pub mod broker;
pub mod scheduler;
pub mod store;
pub mod types;

pub use broker::{JobQueue, QueueOptions};
pub use scheduler::{Scheduler, TaskInfo};
pub use store::JobStore;
pub use types::{
    CancelOutcome, Job, JobError, JobStats, JobStatus, JobTemplate, ShutdownReport,
};
