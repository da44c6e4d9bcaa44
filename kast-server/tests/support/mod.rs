#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use axum_test::TestServer;
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use kast_core::application::ScanUnitOfWork;
use kast_core::database::memory::MemoryStore;
use kast_core::dispatch::WorkerPool;
use kast_core::execution::{
    ExecutionDisposition, ExecutionOutcome, ExecutionRequest, PluginInfo, ScanExecutor,
};
use kast_core::types::{Principal, PrincipalRole};
use kast_server::{AppState, build_app_state, config::Config, routes};

pub fn bearer(token: &str) -> String {
    format!("Bearer {}", token)
}

/// Stands in for the kast CLI. Writes a processed artifact per requested
/// plugin plus the HTML report, then exits with the configured disposition.
/// Each run first takes one permit from `gate`.
pub struct FakeExecutor {
    gate: Semaphore,
    disposition: ExecutionDisposition,
    calls: AtomicUsize,
}

impl FakeExecutor {
    pub fn open() -> Self {
        Self {
            gate: Semaphore::new(Semaphore::MAX_PERMITS),
            disposition: ExecutionDisposition::Success,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn gated() -> Self {
        Self {
            gate: Semaphore::new(0),
            ..Self::open()
        }
    }

    pub fn failing() -> Self {
        Self {
            disposition: ExecutionDisposition::Failure,
            ..Self::open()
        }
    }

    pub fn release(&self, runs: usize) {
        self.gate.add_permits(runs);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScanExecutor for FakeExecutor {
    async fn execute(&self, request: &ExecutionRequest) -> kast_core::Result<ExecutionOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(permit) = self.gate.acquire().await {
            permit.forget();
        }
        tokio::fs::create_dir_all(&request.output_dir).await?;
        for plugin in &request.plugins {
            tokio::fs::write(
                request.output_dir.join(format!("{plugin}_processed.json")),
                r#"{"findings": {"results": ["a", "b", "c"]}}"#,
            )
            .await?;
        }
        tokio::fs::write(
            request.output_dir.join("kast_report.html"),
            format!("<html><body>report for {}</body></html>", request.target),
        )
        .await?;
        let transcript = request.output_dir.join("kast_execution.log");
        tokio::fs::write(&transcript, "=== kast execution ===\n").await?;

        let (exit_code, stderr_tail) = match self.disposition {
            ExecutionDisposition::Success => (Some(0), String::new()),
            ExecutionDisposition::Failure => (Some(1), "dns resolution failed".to_string()),
            ExecutionDisposition::Timeout => (None, String::new()),
        };
        Ok(ExecutionOutcome {
            disposition: self.disposition,
            exit_code,
            transcript_path: Some(transcript),
            stderr_tail,
        })
    }

    async fn list_plugins(&self) -> kast_core::Result<Vec<PluginInfo>> {
        Ok(vec![
            PluginInfo {
                name: "subfinder".into(),
                description: None,
                available: true,
                priority: Some(1),
                kind: Some("passive".into()),
            },
            PluginInfo {
                name: "wafw00f".into(),
                description: None,
                available: false,
                priority: Some(5),
                kind: Some("active".into()),
            },
        ])
    }
}

pub struct TestApp {
    pub server: TestServer,
    pub state: AppState,
    pub store: MemoryStore,
    pub executor: Arc<FakeExecutor>,
    pub admin_key: String,
    pub alice: Principal,
    pub alice_key: String,
    pub bob: Principal,
    pub bob_key: String,
    shutdown: CancellationToken,
    _workers: WorkerPool,
    _tempdir: TempDir,
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub async fn build_test_app(executor: FakeExecutor) -> Result<TestApp> {
    let tempdir = TempDir::new()?;
    let results_dir = tempdir.path().join("results");

    let mut env = HashMap::new();
    env.insert("KAST_TOKEN_KEY", "integration-test-key".to_string());
    env.insert("KAST_RESULTS_DIR", results_dir.display().to_string());
    env.insert("KAST_WORKERS", "2".to_string());
    let config = Config::from_lookup(|key| env.get(key).cloned())?;

    let (uow, store) = ScanUnitOfWork::in_memory();
    let executor = Arc::new(executor);
    let shutdown = CancellationToken::new();
    let (state, workers) = build_app_state(
        Arc::new(config),
        uow,
        executor.clone(),
        shutdown.clone(),
    )?;

    let (_, admin_key) = state
        .access
        .create_principal("admin", PrincipalRole::Admin)
        .await?;
    let (alice, alice_key) = state
        .access
        .create_principal("alice", PrincipalRole::User)
        .await?;
    let (bob, bob_key) = state
        .access
        .create_principal("bob", PrincipalRole::User)
        .await?;

    let router = routes::create_app(state.clone());
    let make_service = router.into_make_service_with_connect_info::<SocketAddr>();
    let server = TestServer::builder()
        .http_transport()
        .build(make_service)
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;

    Ok(TestApp {
        server,
        state,
        store,
        executor,
        admin_key,
        alice,
        alice_key,
        bob,
        bob_key,
        shutdown,
        _workers: workers,
        _tempdir: tempdir,
    })
}

impl TestApp {
    /// Poll the status endpoint until the job reaches `status`.
    pub async fn wait_for_status(&self, key: &str, job_id: &str, status: &str) -> Value {
        for _ in 0..200 {
            let response = self
                .server
                .get(&format!("/api/v1/scans/{job_id}/status"))
                .add_header("Authorization", bearer(key))
                .await;
            let body: Value = response.json();
            if body["data"]["status"] == status {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("scan {job_id} never reached {status}");
    }
}
