use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use super::{column, path_text, text_path};
use crate::database::ports::ScanJobRepository;
use crate::error::{Result, ScanError};
use crate::types::{
    JobFilter, JobId, JobPage, JobStats, JobStatus, PageRequest, PrincipalId, ScanJob,
    ScanOptions, StatusTransition,
};

const ACTIVE_RERUN_INDEX: &str = "uq_scan_jobs_active_rerun";

const JOB_COLUMNS: &str = r#"
    id, owner_id, target, mode, status, plugins, options, artifact_dir,
    task_handle, rerun_of, transcript_path, exit_code, last_error,
    created_at, started_at, completed_at
"#;

/// [`ScanJobRepository`] over the `scan_jobs` table.
#[derive(Debug, Clone)]
pub struct PostgresScanJobRepository {
    pool: PgPool,
}

impl PostgresScanJobRepository {
    /// Repository over `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_row(row: &PgRow) -> Result<ScanJob> {
        let mode: String = column(row, "mode")?;
        let status: String = column(row, "status")?;
        let options: Json<ScanOptions> = column(row, "options")?;
        let artifact_dir: String = column(row, "artifact_dir")?;
        let rerun_of: Option<Uuid> = column(row, "rerun_of")?;

        Ok(ScanJob {
            id: JobId(column(row, "id")?),
            owner_id: PrincipalId(column(row, "owner_id")?),
            target: column(row, "target")?,
            mode: mode.parse()?,
            status: status.parse()?,
            plugins: column(row, "plugins")?,
            options: options.0,
            artifact_dir: PathBuf::from(artifact_dir),
            task_handle: column(row, "task_handle")?,
            rerun_of: rerun_of.map(JobId),
            transcript_path: text_path(column(row, "transcript_path")?),
            exit_code: column(row, "exit_code")?,
            last_error: column(row, "last_error")?,
            created_at: column(row, "created_at")?,
            started_at: column(row, "started_at")?,
            completed_at: column(row, "completed_at")?,
        })
    }
}

#[async_trait]
impl ScanJobRepository for PostgresScanJobRepository {
    async fn insert(&self, job: &ScanJob) -> Result<()> {
        let outcome = sqlx::query(
            r#"
            INSERT INTO scan_jobs (
                id, owner_id, target, mode, status, plugins, options, artifact_dir,
                task_handle, rerun_of, transcript_path, exit_code, last_error,
                created_at, started_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.owner_id.as_uuid())
        .bind(&job.target)
        .bind(job.mode.as_str())
        .bind(job.status.as_str())
        .bind(&job.plugins)
        .bind(Json(&job.options))
        .bind(path_text(&job.artifact_dir))
        .bind(&job.task_handle)
        .bind(job.rerun_of.map(|id| id.as_uuid()))
        .bind(job.transcript_path.as_deref().map(path_text))
        .bind(job.exit_code)
        .bind(&job.last_error)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await;

        match outcome {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.constraint() == Some(ACTIVE_RERUN_INDEX) => {
                let source = job.rerun_of.unwrap_or(job.id);
                let status = self
                    .find_active_rerun(source)
                    .await?
                    .map_or(JobStatus::Pending, |active| active.status);
                Err(ScanError::DispatchConflict {
                    job_id: source,
                    status,
                })
            }
            Err(e) => Err(ScanError::Storage(format!("Failed to insert scan {}: {e}", job.id))),
        }
    }

    async fn get(&self, id: JobId) -> Result<Option<ScanJob>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM scan_jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ScanError::Storage(format!("Failed to load scan {id}: {e}")))?;

        row.as_ref().map(Self::map_row).transpose()
    }

    async fn find_by_artifact_dir(&self, dir: &Path) -> Result<Option<ScanJob>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM scan_jobs WHERE artifact_dir = $1 LIMIT 1"
        ))
        .bind(path_text(dir))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            ScanError::Storage(format!("Failed to look up scan for {}: {e}", dir.display()))
        })?;

        row.as_ref().map(Self::map_row).transpose()
    }

    async fn list(&self, filter: &JobFilter, page: PageRequest) -> Result<JobPage> {
        let owner = filter.owner.map(|id| id.as_uuid());
        let status = filter.status.map(|s| s.as_str());
        let target = filter.target_contains.as_deref();

        let where_clause = r#"
            WHERE ($1::uuid IS NULL OR owner_id = $1)
              AND ($2::text IS NULL OR status = $2)
              AND ($3::text IS NULL OR strpos(target, $3) > 0)
        "#;

        let total: i64 = sqlx::query(&format!("SELECT COUNT(*) AS total FROM scan_jobs {where_clause}"))
            .bind(owner)
            .bind(status)
            .bind(target)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| ScanError::Storage(format!("Failed to count scans: {e}")))?
            .try_get("total")
            .map_err(|e| ScanError::Storage(format!("Failed to read scan count: {e}")))?;

        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM scan_jobs {where_clause} \
             ORDER BY created_at DESC, id DESC LIMIT $4 OFFSET $5"
        ))
        .bind(owner)
        .bind(status)
        .bind(target)
        .bind(i64::from(page.per_page))
        .bind(page.offset() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ScanError::Storage(format!("Failed to list scans: {e}")))?;

        Ok(JobPage {
            jobs: rows.iter().map(Self::map_row).collect::<Result<_>>()?,
            total: total.max(0) as u64,
            page: page.page,
            per_page: page.per_page,
        })
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<ScanJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM scan_jobs WHERE status = $1 ORDER BY created_at ASC"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ScanError::Storage(format!("Failed to list {status} scans: {e}")))?;

        rows.iter().map(Self::map_row).collect()
    }

    async fn find_active_rerun(&self, source: JobId) -> Result<Option<ScanJob>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM scan_jobs \
             WHERE rerun_of = $1 AND status IN ('pending', 'running') LIMIT 1"
        ))
        .bind(source.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ScanError::Storage(format!("Failed to look up reruns of {source}: {e}")))?;

        row.as_ref().map(Self::map_row).transpose()
    }

    async fn transition(
        &self,
        id: JobId,
        transition: &StatusTransition,
    ) -> Result<Option<ScanJob>> {
        transition.ensure_forward(id)?;
        let row = sqlx::query(&format!(
            r#"
            UPDATE scan_jobs
            SET status = $3,
                started_at = CASE WHEN $3 = 'running' THEN $4 ELSE started_at END,
                completed_at = CASE WHEN $3 IN ('completed', 'failed') THEN $4 ELSE completed_at END,
                last_error = COALESCE($5, last_error),
                exit_code = COALESCE($6, exit_code),
                transcript_path = COALESCE($7, transcript_path),
                task_handle = COALESCE($8, task_handle)
            WHERE id = $1 AND status = $2
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(transition.from.as_str())
        .bind(transition.to.as_str())
        .bind(transition.at)
        .bind(&transition.error)
        .bind(transition.exit_code)
        .bind(transition.transcript_path.as_deref().map(path_text))
        .bind(&transition.task_handle)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            ScanError::Storage(format!(
                "Failed to move scan {id} from {} to {}: {e}",
                transition.from, transition.to
            ))
        })?;

        row.as_ref().map(Self::map_row).transpose()
    }

    async fn delete(&self, id: JobId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM scan_jobs WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| ScanError::Storage(format!("Failed to delete scan {id}: {e}")))?;
        Ok(result.rows_affected() > 0)
    }

    async fn stats(&self, owner: Option<PrincipalId>) -> Result<JobStats> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count
            FROM scan_jobs
            WHERE ($1::uuid IS NULL OR owner_id = $1)
            GROUP BY status
            "#,
        )
        .bind(owner.map(|id| id.as_uuid()))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ScanError::Storage(format!("Failed to compute scan stats: {e}")))?;

        let mut stats = JobStats::default();
        for row in &rows {
            let status: String = column(row, "status")?;
            let count: i64 = column(row, "count")?;
            stats.record(status.parse()?, count.max(0) as u64);
        }
        Ok(stats)
    }
}
