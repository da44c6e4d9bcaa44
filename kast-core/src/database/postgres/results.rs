use async_trait::async_trait;
use sqlx::{PgPool, postgres::PgRow};

use super::{column, path_text, text_path};
use crate::database::ports::SubTaskResultRepository;
use crate::error::{Result, ScanError};
use crate::types::{JobId, SubTaskResult};

/// [`SubTaskResultRepository`] over the `subtask_results` table.
#[derive(Debug, Clone)]
pub struct PostgresSubTaskResultRepository {
    pool: PgPool,
}

impl PostgresSubTaskResultRepository {
    /// Repository over `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_row(row: &PgRow) -> Result<SubTaskResult> {
        let disposition: String = column(row, "disposition")?;
        let finding_count: i32 = column(row, "finding_count")?;
        let processed: String = column(row, "processed_artifact")?;

        Ok(SubTaskResult {
            job_id: JobId(column(row, "job_id")?),
            subtask: column(row, "subtask")?,
            disposition: disposition.parse()?,
            finding_count: finding_count.max(0) as u32,
            raw_artifact: text_path(column(row, "raw_artifact")?),
            processed_artifact: processed.into(),
            error_detail: column(row, "error_detail")?,
            observed_at: column(row, "observed_at")?,
        })
    }
}

#[async_trait]
impl SubTaskResultRepository for PostgresSubTaskResultRepository {
    async fn upsert(&self, result: &SubTaskResult) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scan_subtask_results (
                job_id, subtask, disposition, finding_count, raw_artifact,
                processed_artifact, error_detail, observed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (job_id, subtask) DO UPDATE SET
                disposition = EXCLUDED.disposition,
                finding_count = EXCLUDED.finding_count,
                raw_artifact = EXCLUDED.raw_artifact,
                processed_artifact = EXCLUDED.processed_artifact,
                error_detail = EXCLUDED.error_detail,
                observed_at = EXCLUDED.observed_at
            "#,
        )
        .bind(result.job_id.as_uuid())
        .bind(&result.subtask)
        .bind(result.disposition.as_str())
        .bind(i32::try_from(result.finding_count).unwrap_or(i32::MAX))
        .bind(result.raw_artifact.as_deref().map(path_text))
        .bind(path_text(&result.processed_artifact))
        .bind(&result.error_detail)
        .bind(result.observed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            ScanError::Storage(format!(
                "Failed to upsert result {} for scan {}: {e}",
                result.subtask, result.job_id
            ))
        })?;
        Ok(())
    }

    async fn list_for_job(&self, job_id: JobId) -> Result<Vec<SubTaskResult>> {
        let rows = sqlx::query(
            r#"
            SELECT job_id, subtask, disposition, finding_count, raw_artifact,
                   processed_artifact, error_detail, observed_at
            FROM scan_subtask_results
            WHERE job_id = $1
            ORDER BY subtask ASC
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ScanError::Storage(format!("Failed to load results for scan {job_id}: {e}")))?;

        rows.iter().map(Self::map_row).collect()
    }
}
