//! Result row storage port.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{JobId, SubTaskResult};

/// Per-plugin results keyed by `(job_id, subtask)`.
#[async_trait]
pub trait SubTaskResultRepository: Send + Sync {
    /// Insert or replace the row for `(job_id, subtask)`. Repeating the same
    /// upsert leaves exactly one identical row.
    async fn upsert(&self, result: &SubTaskResult) -> Result<()>;

    /// All rows for a job ordered by sub-task name.
    async fn list_for_job(&self, job_id: JobId) -> Result<Vec<SubTaskResult>>;
}
