#![cfg(feature = "postgres-tests")]

use std::path::PathBuf;

use anyhow::Result;
use chrono::{Duration, SubsecRound, Utc};
use kast_core::application::ScanUnitOfWork;
use kast_core::error::ScanError;
use kast_core::types::{
    Disposition, JobFilter, JobId, JobStatus, PageRequest, Principal, PrincipalRole, ScanJob,
    ScanMode, ScanOptions, ShareGrant, SharePermission, StatusTransition, SubTaskResult,
};
use sqlx::PgPool;

async fn seed_principal(uow: &ScanUnitOfWork, name: &str) -> Result<Principal> {
    let principal = Principal::new(name, PrincipalRole::User);
    uow.principals
        .create(&principal, &format!("digest-{name}"))
        .await?;
    Ok(principal)
}

fn job(owner: &Principal, status: JobStatus, rerun_of: Option<JobId>) -> ScanJob {
    let id = JobId::new();
    ScanJob {
        id,
        owner_id: owner.id,
        target: "example.com".into(),
        mode: ScanMode::Active,
        status,
        plugins: vec!["whatweb".into(), "wafw00f".into()],
        options: ScanOptions {
            parallel: true,
            max_workers: Some(4),
            ..ScanOptions::default()
        },
        artifact_dir: PathBuf::from(format!("/tmp/kast/{id}")),
        task_handle: None,
        rerun_of,
        transcript_path: None,
        exit_code: None,
        last_error: None,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
    }
}

#[sqlx::test(migrator = "kast_core::MIGRATOR")]
async fn status_transitions_are_compare_and_set(pool: PgPool) -> Result<()> {
    let uow = ScanUnitOfWork::postgres(pool);
    let owner = seed_principal(&uow, "owner").await?;
    let scan = job(&owner, JobStatus::Pending, None);
    uow.jobs.insert(&scan).await?;

    let stored = uow.jobs.get(scan.id).await?.expect("job inserted");
    assert_eq!(stored.plugins, scan.plugins);
    assert_eq!(stored.options, scan.options);
    assert_eq!(stored.task_handle, None);

    let start = StatusTransition::new(JobStatus::Pending, JobStatus::Running, Utc::now())
        .with_task_handle("run-1");
    let running = uow.jobs.transition(scan.id, &start).await?.expect("claimed");
    assert_eq!(running.status, JobStatus::Running);
    assert_eq!(running.task_handle.as_deref(), Some("run-1"));
    assert!(running.started_at.is_some());

    let backwards = StatusTransition::new(JobStatus::Running, JobStatus::Pending, Utc::now());
    let err = uow.jobs.transition(scan.id, &backwards).await.unwrap_err();
    assert!(matches!(err, ScanError::InvalidTransition { .. }));

    // A second claim loses.
    assert!(uow.jobs.transition(scan.id, &start).await?.is_none());

    let fail = StatusTransition::new(JobStatus::Running, JobStatus::Failed, Utc::now())
        .with_error("scan exited with status 2")
        .with_exit_code(Some(2));
    let failed = uow.jobs.transition(scan.id, &fail).await?.expect("finished");
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.exit_code, Some(2));
    assert_eq!(failed.last_error.as_deref(), Some("scan exited with status 2"));
    assert!(failed.completed_at.is_some());
    assert_eq!(failed.task_handle.as_deref(), Some("run-1"));

    let reopen = StatusTransition::new(JobStatus::Failed, JobStatus::Running, Utc::now());
    assert!(uow.jobs.transition(scan.id, &reopen).await.is_err());

    let stats = uow.jobs.stats(Some(owner.id)).await?;
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.total, 1);
    Ok(())
}

#[sqlx::test(migrator = "kast_core::MIGRATOR")]
async fn only_one_active_rerun_per_source(pool: PgPool) -> Result<()> {
    let uow = ScanUnitOfWork::postgres(pool);
    let owner = seed_principal(&uow, "owner").await?;
    let source = job(&owner, JobStatus::Completed, None);
    uow.jobs.insert(&source).await?;

    let first = job(&owner, JobStatus::Pending, Some(source.id));
    uow.jobs.insert(&first).await?;

    let second = job(&owner, JobStatus::Pending, Some(source.id));
    let err = uow.jobs.insert(&second).await.unwrap_err();
    assert!(matches!(err, ScanError::DispatchConflict { .. }));

    let active = uow.jobs.find_active_rerun(source.id).await?.expect("active rerun");
    assert_eq!(active.id, first.id);
    Ok(())
}

#[sqlx::test(migrator = "kast_core::MIGRATOR")]
async fn results_upsert_keeps_one_row_and_cascades(pool: PgPool) -> Result<()> {
    let uow = ScanUnitOfWork::postgres(pool);
    let owner = seed_principal(&uow, "owner").await?;
    let scan = job(&owner, JobStatus::Completed, None);
    uow.jobs.insert(&scan).await?;

    let observed_at = Utc::now().trunc_subsecs(6);
    let mut row = SubTaskResult {
        job_id: scan.id,
        subtask: "whatweb".into(),
        disposition: Disposition::Success,
        finding_count: 3,
        raw_artifact: Some(scan.artifact_dir.join("whatweb.json")),
        processed_artifact: scan.artifact_dir.join("whatweb_processed.json"),
        error_detail: None,
        observed_at,
    };
    uow.results.upsert(&row).await?;
    row.finding_count = 5;
    row.disposition = Disposition::Failure;
    row.error_detail = Some("rate limited".into());
    uow.results.upsert(&row).await?;

    let rows = uow.results.list_for_job(scan.id).await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].finding_count, 5);
    assert_eq!(rows[0].disposition, Disposition::Failure);
    assert_eq!(rows[0].observed_at, observed_at);

    let grant = ShareGrant::public_link(
        scan.id,
        "f".repeat(64),
        owner.id,
        Utc::now() + Duration::hours(1),
    );
    uow.shares.insert(&grant).await?;

    assert!(uow.jobs.delete(scan.id).await?);
    assert!(uow.results.list_for_job(scan.id).await?.is_empty());
    assert!(uow.shares.get(grant.id).await?.is_none());
    Ok(())
}

#[sqlx::test(migrator = "kast_core::MIGRATOR")]
async fn revocation_keeps_grants_listed(pool: PgPool) -> Result<()> {
    let uow = ScanUnitOfWork::postgres(pool);
    let owner = seed_principal(&uow, "owner").await?;
    let friend = seed_principal(&uow, "friend").await?;
    let scan = job(&owner, JobStatus::Completed, None);
    uow.jobs.insert(&scan).await?;

    let grant =
        ShareGrant::for_principal(scan.id, friend.id, SharePermission::Edit, owner.id, None);
    uow.shares.insert(&grant).await?;

    let revoked = uow
        .shares
        .revoke(scan.id, grant.id, Utc::now())
        .await?
        .expect("revoked");
    assert!(revoked.revoked_at.is_some());
    assert!(uow.shares.revoke(scan.id, grant.id, Utc::now()).await?.is_none());

    let listed = uow.shares.list_for_job(scan.id).await?;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].grantee(), Some(friend.id));
    Ok(())
}

#[sqlx::test(migrator = "kast_core::MIGRATOR")]
async fn listing_filters_by_status_and_target(pool: PgPool) -> Result<()> {
    let uow = ScanUnitOfWork::postgres(pool);
    let owner = seed_principal(&uow, "owner").await?;
    for status in [JobStatus::Completed, JobStatus::Completed, JobStatus::Failed] {
        uow.jobs.insert(&job(&owner, status, None)).await?;
    }

    let filter = JobFilter {
        owner: Some(owner.id),
        status: Some(JobStatus::Completed),
        target_contains: Some("example".into()),
    };
    let page = uow.jobs.list(&filter, PageRequest::new(Some(1), Some(1))).await?;
    assert_eq!(page.total, 2);
    assert_eq!(page.jobs.len(), 1);
    assert_eq!(page.pages(), 2);
    Ok(())
}
