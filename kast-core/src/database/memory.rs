//! In-memory implementation of every repository port.
//!
//! Mirrors the Postgres constraints that matter to callers: the
//! `(job_id, subtask)` upsert key, the single active re-run per source job,
//! compare-and-set status transitions and cascading job deletion.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::database::ports::{
    AuditRepository, PrincipalRepository, ScanJobRepository, ShareGrantRepository,
    SubTaskResultRepository,
};
use crate::error::{Result, ScanError};
use crate::types::{
    AuditRecord, JobFilter, JobId, JobPage, JobStats, JobStatus, PageRequest, Principal,
    PrincipalId, ScanJob, ShareGrant, ShareId, StatusTransition, SubTaskResult,
};

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, ScanJob>,
    results: HashMap<(JobId, String), SubTaskResult>,
    shares: HashMap<ShareId, ShareGrant>,
    audit: Vec<AuditRecord>,
    principals: HashMap<PrincipalId, (Principal, String)>,
}

/// Shared in-memory state behind every port. Clones see the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of audit records currently held.
    pub async fn audit_len(&self) -> usize {
        self.state.lock().await.audit.len()
    }
}

#[async_trait]
impl ScanJobRepository for MemoryStore {
    async fn insert(&self, job: &ScanJob) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.jobs.contains_key(&job.id) {
            return Err(ScanError::Storage(format!("duplicate scan id {}", job.id)));
        }
        if let Some(source) = job.rerun_of
            && job.status.is_active()
            && let Some(active) = state
                .jobs
                .values()
                .find(|existing| existing.rerun_of == Some(source) && existing.status.is_active())
        {
            return Err(ScanError::DispatchConflict {
                job_id: source,
                status: active.status,
            });
        }
        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<ScanJob>> {
        Ok(self.state.lock().await.jobs.get(&id).cloned())
    }

    async fn list(&self, filter: &JobFilter, page: PageRequest) -> Result<JobPage> {
        let state = self.state.lock().await;
        let mut matching: Vec<ScanJob> = state
            .jobs
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = matching.len() as u64;
        let jobs = matching
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.per_page as usize)
            .collect();
        Ok(JobPage {
            jobs,
            total,
            page: page.page,
            per_page: page.per_page,
        })
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<ScanJob>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<ScanJob> = state
            .jobs
            .values()
            .filter(|job| job.status == status)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn find_active_rerun(&self, source: JobId) -> Result<Option<ScanJob>> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .find(|job| job.rerun_of == Some(source) && job.status.is_active())
            .cloned())
    }

    async fn find_by_artifact_dir(&self, dir: &Path) -> Result<Option<ScanJob>> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .find(|job| job.artifact_dir == dir)
            .cloned())
    }

    async fn transition(
        &self,
        id: JobId,
        transition: &StatusTransition,
    ) -> Result<Option<ScanJob>> {
        transition.ensure_forward(id)?;
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        if job.status != transition.from {
            return Ok(None);
        }
        apply_transition(job, transition);
        Ok(Some(job.clone()))
    }

    async fn delete(&self, id: JobId) -> Result<bool> {
        let mut state = self.state.lock().await;
        let removed = state.jobs.remove(&id).is_some();
        if removed {
            state.results.retain(|(job_id, _), _| *job_id != id);
            state.shares.retain(|_, grant| grant.job_id != id);
            for job in state.jobs.values_mut() {
                if job.rerun_of == Some(id) {
                    job.rerun_of = None;
                }
            }
        }
        Ok(removed)
    }

    async fn stats(&self, owner: Option<PrincipalId>) -> Result<JobStats> {
        let state = self.state.lock().await;
        let mut stats = JobStats::default();
        for job in state
            .jobs
            .values()
            .filter(|job| owner.is_none_or(|owner| job.owner_id == owner))
        {
            stats.record(job.status, 1);
        }
        Ok(stats)
    }
}

/// Field updates shared with the Postgres adapter's `UPDATE`.
pub(crate) fn apply_transition(job: &mut ScanJob, transition: &StatusTransition) {
    job.status = transition.to;
    match transition.to {
        JobStatus::Running => job.started_at = Some(transition.at),
        JobStatus::Completed | JobStatus::Failed => job.completed_at = Some(transition.at),
        JobStatus::Pending => {}
    }
    if transition.error.is_some() {
        job.last_error = transition.error.clone();
    }
    if transition.exit_code.is_some() {
        job.exit_code = transition.exit_code;
    }
    if transition.transcript_path.is_some() {
        job.transcript_path = transition.transcript_path.clone();
    }
    if transition.task_handle.is_some() {
        job.task_handle = transition.task_handle.clone();
    }
}

#[async_trait]
impl SubTaskResultRepository for MemoryStore {
    async fn upsert(&self, result: &SubTaskResult) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.jobs.contains_key(&result.job_id) {
            return Err(ScanError::Storage(format!(
                "scan {} does not exist",
                result.job_id
            )));
        }
        state
            .results
            .insert((result.job_id, result.subtask.clone()), result.clone());
        Ok(())
    }

    async fn list_for_job(&self, job_id: JobId) -> Result<Vec<SubTaskResult>> {
        let state = self.state.lock().await;
        let mut rows: Vec<SubTaskResult> = state
            .results
            .iter()
            .filter(|((id, _), _)| *id == job_id)
            .map(|(_, row)| row.clone())
            .collect();
        rows.sort_by(|a, b| a.subtask.cmp(&b.subtask));
        Ok(rows)
    }
}

#[async_trait]
impl ShareGrantRepository for MemoryStore {
    async fn insert(&self, grant: &ShareGrant) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(hash) = grant.token_hash()
            && state
                .shares
                .values()
                .any(|existing| existing.token_hash() == Some(hash))
        {
            return Err(ScanError::Storage("duplicate share token".into()));
        }
        state.shares.insert(grant.id, grant.clone());
        Ok(())
    }

    async fn get(&self, id: ShareId) -> Result<Option<ShareGrant>> {
        Ok(self.state.lock().await.shares.get(&id).cloned())
    }

    async fn list_for_job(&self, job_id: JobId) -> Result<Vec<ShareGrant>> {
        let state = self.state.lock().await;
        let mut grants: Vec<ShareGrant> = state
            .shares
            .values()
            .filter(|grant| grant.job_id == job_id)
            .cloned()
            .collect();
        grants.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(grants)
    }

    async fn revoke(
        &self,
        job_id: JobId,
        id: ShareId,
        now: DateTime<Utc>,
    ) -> Result<Option<ShareGrant>> {
        let mut state = self.state.lock().await;
        match state.shares.get_mut(&id) {
            Some(grant) if grant.job_id == job_id && grant.revoked_at.is_none() => {
                grant.revoked_at = Some(now);
                Ok(Some(grant.clone()))
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl AuditRepository for MemoryStore {
    async fn append(&self, record: &AuditRecord) -> Result<()> {
        self.state.lock().await.audit.push(record.clone());
        Ok(())
    }

    async fn recent(&self, limit: u32) -> Result<Vec<AuditRecord>> {
        let state = self.state.lock().await;
        let mut records = state.audit.clone();
        records.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        records.truncate(limit as usize);
        Ok(records)
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.audit.len();
        state.audit.retain(|record| record.recorded_at >= cutoff);
        Ok((before - state.audit.len()) as u64)
    }
}

#[async_trait]
impl PrincipalRepository for MemoryStore {
    async fn create(&self, principal: &Principal, api_key_hash: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let clash = state.principals.values().any(|(existing, hash)| {
            existing.username == principal.username || hash == api_key_hash
        });
        if clash {
            return Err(ScanError::Storage(format!(
                "principal '{}' already exists",
                principal.username
            )));
        }
        state
            .principals
            .insert(principal.id, (principal.clone(), api_key_hash.to_string()));
        Ok(())
    }

    async fn get(&self, id: PrincipalId) -> Result<Option<Principal>> {
        Ok(self
            .state
            .lock()
            .await
            .principals
            .get(&id)
            .map(|(principal, _)| principal.clone()))
    }

    async fn find_by_api_key_hash(&self, api_key_hash: &str) -> Result<Option<Principal>> {
        let state = self.state.lock().await;
        Ok(state
            .principals
            .values()
            .find(|(principal, hash)| principal.is_active && hash == api_key_hash)
            .map(|(principal, _)| principal.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ScanMode, ScanOptions};
    use std::path::PathBuf;

    fn job(status: JobStatus) -> ScanJob {
        ScanJob {
            id: JobId::new(),
            owner_id: PrincipalId::new(),
            target: "example.com".into(),
            mode: ScanMode::Passive,
            status,
            plugins: Vec::new(),
            options: ScanOptions::default(),
            artifact_dir: PathBuf::from("/tmp/kast/example.com"),
            task_handle: None,
            rerun_of: None,
            transcript_path: None,
            exit_code: None,
            last_error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn backward_transitions_leave_the_job_untouched() {
        let store = MemoryStore::new();
        let completed = job(JobStatus::Completed);
        let running = job(JobStatus::Running);
        ScanJobRepository::insert(&store, &completed).await.unwrap();
        ScanJobRepository::insert(&store, &running).await.unwrap();

        let err = store
            .transition(
                completed.id,
                &StatusTransition::new(JobStatus::Completed, JobStatus::Running, Utc::now()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::InvalidTransition { .. }));

        let err = store
            .transition(
                running.id,
                &StatusTransition::new(JobStatus::Running, JobStatus::Pending, Utc::now()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::InvalidTransition { .. }));

        assert_eq!(ScanJobRepository::get(&store, completed.id).await.unwrap().unwrap(), completed);
        assert_eq!(ScanJobRepository::get(&store, running.id).await.unwrap().unwrap(), running);
    }

    #[tokio::test]
    async fn claim_records_the_run_handle() {
        let store = MemoryStore::new();
        let pending = job(JobStatus::Pending);
        ScanJobRepository::insert(&store, &pending).await.unwrap();

        let claimed = store
            .transition(
                pending.id,
                &StatusTransition::new(JobStatus::Pending, JobStatus::Running, Utc::now())
                    .with_task_handle("run-1"),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.task_handle.as_deref(), Some("run-1"));
        assert!(claimed.started_at.is_some());

        let finished = store
            .transition(
                pending.id,
                &StatusTransition::new(JobStatus::Running, JobStatus::Completed, Utc::now()),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(finished.task_handle.as_deref(), Some("run-1"));
    }
}
