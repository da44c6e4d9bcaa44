//! Job admission, the worker pool and startup recovery.

/// Admission, submission and startup recovery
pub mod dispatcher;
/// Bounded queue and the workers that run claimed jobs
pub mod pool;
/// Validated scan requests
pub mod request;

pub use dispatcher::{JobDispatcher, RecoveryReport};
pub use pool::{JobQueue, JobRunner, WorkerPool};
pub use request::NewScan;
