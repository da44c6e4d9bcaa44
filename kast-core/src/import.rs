//! Recording scans the `kast` CLI ran outside the server.
//!
//! An import directory must sit under the results root and hold at least one
//! processed artifact. Its target, mode, plugins and timestamps are read back
//! from the directory name and the artifacts themselves; the scan is then
//! recorded as completed and aggregated like any other finished job.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::access::Caller;
use crate::artifacts::{ArtifactLayout, ArtifactName};
use crate::audit::{AuditService, scan_resource};
use crate::database::ports::{PrincipalRepository, ScanJobRepository};
use crate::dispatch::NewScan;
use crate::error::{Result, ScanError};
use crate::progress::ResultsAggregator;
use crate::progress::inference::to_utc;
use crate::types::{
    AuditAction, JobId, JobStatus, PrincipalId, ScanJob, ScanMode, ScanOptions, StatusTransition,
};

/// Plugins that only run in active mode.
const ACTIVE_PLUGINS: [&str; 4] = ["nmap", "nuclei", "nikto", "sqlmap"];

/// `<target>-<YYYYmmdd>-<HHMMSS>`, optionally followed by the job suffix the
/// server appends to the directories it allocates.
const DIR_NAME_PATTERN: &str = r"^(.+?)-\d{8}-\d{6}(?:-[0-9a-f]+)?$";

/// Body of an import request.
#[derive(Clone, Debug, Deserialize)]
pub struct ImportRequest {
    /// Relative to the results root, or absolute inside it.
    pub directory: String,
    /// Defaults to the importing principal.
    #[serde(default)]
    pub owner_id: Option<PrincipalId>,
}

/// What a directory would be recorded as.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ImportMetadata {
    /// Target parsed from the directory name or the artifacts.
    pub target: String,
    /// `active` when any active plugin ran.
    pub mode: ScanMode,
    /// Plugins with a processed artifact, sorted.
    pub plugins: Vec<String>,
    /// Oldest processed artifact mtime.
    pub started_at: DateTime<Utc>,
    /// Newest processed artifact mtime.
    pub completed_at: DateTime<Utc>,
}

/// Outcome of validating an import directory without recording it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ImportPreview {
    /// The directory as requested.
    pub directory: String,
    /// Whether `import` would accept the directory.
    pub valid: bool,
    /// Why the directory cannot be imported.
    pub error: Option<String>,
    /// Present when the directory is valid.
    pub metadata: Option<ImportMetadata>,
    /// Processed artifact file names, sorted.
    pub files: Vec<String>,
}

struct Inspection {
    dir: PathBuf,
    metadata: ImportMetadata,
    files: Vec<String>,
}

/// Admin-only recording of CLI result directories as completed scans.
#[derive(Clone)]
pub struct ScanImporter {
    jobs: Arc<dyn ScanJobRepository>,
    principals: Arc<dyn PrincipalRepository>,
    layout: Arc<ArtifactLayout>,
    aggregator: ResultsAggregator,
    audit: AuditService,
    dir_name: Regex,
}

impl std::fmt::Debug for ScanImporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanImporter")
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl ScanImporter {
    /// Fails only if the directory name pattern does not compile.
    pub fn new(
        jobs: Arc<dyn ScanJobRepository>,
        principals: Arc<dyn PrincipalRepository>,
        layout: Arc<ArtifactLayout>,
        aggregator: ResultsAggregator,
        audit: AuditService,
    ) -> Result<Self> {
        let dir_name = Regex::new(DIR_NAME_PATTERN)
            .map_err(|e| ScanError::Internal(format!("invalid directory name pattern: {e}")))?;
        Ok(Self {
            jobs,
            principals,
            layout,
            aggregator,
            audit,
            dir_name,
        })
    }

    /// Validate `directory` and report what importing it would record.
    /// Validation problems come back in the preview rather than as errors.
    pub async fn preview(&self, caller: &Caller, directory: &str) -> Result<ImportPreview> {
        require_admin(caller)?;
        let outcome = self.inspect(directory).await;
        let outcome = match outcome {
            Ok(inspection) => self
                .ensure_not_recorded(&inspection.dir)
                .await
                .map(|()| inspection),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(inspection) => Ok(ImportPreview {
                directory: directory.to_string(),
                valid: true,
                error: None,
                metadata: Some(inspection.metadata),
                files: inspection.files,
            }),
            Err(e @ (ScanError::InvalidInput(_) | ScanError::AlreadyImported { .. })) => {
                Ok(ImportPreview {
                    directory: directory.to_string(),
                    valid: false,
                    error: Some(e.to_string()),
                    metadata: None,
                    files: Vec::new(),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Record the directory as a completed scan and aggregate its results.
    /// Nothing is left behind when any step fails.
    pub async fn import(&self, caller: &Caller, request: &ImportRequest) -> Result<ScanJob> {
        require_admin(caller)?;
        match self.record(caller, request).await {
            Ok(job) => {
                self.audit
                    .record(
                        caller.principal_id(),
                        AuditAction::ScanImported,
                        scan_resource(job.id),
                        Some(format!(
                            "dir={} owner={}",
                            job.artifact_dir.display(),
                            job.owner_id
                        )),
                        &caller.origin,
                    )
                    .await;
                Ok(job)
            }
            Err(e) => {
                warn!(directory = %request.directory, error = %e, "scan import failed");
                self.audit
                    .record(
                        caller.principal_id(),
                        AuditAction::ScanImportFailed,
                        format!("import:{}", request.directory),
                        Some(e.to_string()),
                        &caller.origin,
                    )
                    .await;
                Err(e)
            }
        }
    }

    async fn record(&self, caller: &Caller, request: &ImportRequest) -> Result<ScanJob> {
        let inspection = self.inspect(&request.directory).await?;
        self.ensure_not_recorded(&inspection.dir).await?;

        let owner = request
            .owner_id
            .or_else(|| caller.principal_id())
            .ok_or(ScanError::Forbidden)?;
        if self.principals.get(owner).await?.is_none() {
            return Err(ScanError::InvalidInput(format!("unknown owner {owner}")));
        }

        let metadata = inspection.metadata;
        let job = ScanJob {
            id: JobId::new(),
            owner_id: owner,
            target: metadata.target,
            mode: metadata.mode,
            status: JobStatus::Pending,
            plugins: metadata.plugins,
            options: ScanOptions::default(),
            artifact_dir: inspection.dir,
            task_handle: None,
            rerun_of: None,
            transcript_path: None,
            exit_code: None,
            last_error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        self.jobs.insert(&job).await?;

        match self
            .complete(job.id, metadata.started_at, metadata.completed_at)
            .await
        {
            Ok(job) => {
                info!(
                    job_id = %job.id,
                    target = %job.target,
                    plugins = job.plugins.len(),
                    "scan imported"
                );
                Ok(job)
            }
            Err(e) => {
                if let Err(cleanup) = self.jobs.delete(job.id).await {
                    warn!(job_id = %job.id, error = %cleanup, "failed to roll back scan import");
                }
                Err(e)
            }
        }
    }

    /// Walk the new job through the lifecycle at the observed timestamps,
    /// then fold its artifacts into results.
    async fn complete(
        &self,
        id: JobId,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> Result<ScanJob> {
        let steps = [
            StatusTransition::new(JobStatus::Pending, JobStatus::Running, started_at),
            StatusTransition::new(JobStatus::Running, JobStatus::Completed, completed_at),
        ];
        let mut current = None;
        for step in &steps {
            current = self.jobs.transition(id, step).await?;
            if current.is_none() {
                return Err(ScanError::Internal(format!(
                    "imported scan {id} left {} during import",
                    step.from
                )));
            }
        }
        let job = current.ok_or_else(|| ScanError::NotFound(format!("scan {id}")))?;

        let report = self.aggregator.aggregate_job(&job).await?;
        if !report.is_clean() {
            warn!(
                job_id = %job.id,
                failed = report.failed.len(),
                "some imported artifacts could not be parsed"
            );
        }
        Ok(job)
    }

    async fn ensure_not_recorded(&self, dir: &Path) -> Result<()> {
        match self.jobs.find_by_artifact_dir(dir).await? {
            Some(existing) => Err(ScanError::AlreadyImported {
                job_id: existing.id,
            }),
            None => Ok(()),
        }
    }

    async fn inspect(&self, directory: &str) -> Result<Inspection> {
        let dir = self.resolve(directory).await?;

        let mut entries = fs::read_dir(&dir).await.map_err(|e| {
            ScanError::InvalidInput(format!("directory {directory} is not readable: {e}"))
        })?;
        let mut processed = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let Some(ArtifactName::Processed(plugin)) = self.layout.classify(file_name) else {
                continue;
            };
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().ok().map(to_utc);
            processed.push((plugin, file_name.to_string(), entry.path(), modified));
        }
        if processed.is_empty() {
            return Err(ScanError::InvalidInput(format!(
                "no processed artifacts found in {directory}"
            )));
        }
        processed.sort_by(|a, b| a.0.cmp(&b.0));

        let mut mode = if processed
            .iter()
            .any(|(plugin, ..)| ACTIVE_PLUGINS.contains(&plugin.to_lowercase().as_str()))
        {
            ScanMode::Active
        } else {
            ScanMode::Passive
        };
        let mut artifact_target = None;
        for (_, _, path, _) in &processed {
            let Some(hints) = read_hints(path).await else {
                continue;
            };
            if hints.active {
                mode = ScanMode::Active;
            }
            if artifact_target.is_none() {
                artifact_target = hints.target;
            }
        }

        let dir_name = dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let target = self
            .dir_name
            .captures(&dir_name)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .or(artifact_target)
            .unwrap_or(dir_name);

        let mut times: Vec<DateTime<Utc>> = processed.iter().filter_map(|p| p.3).collect();
        if times.is_empty() {
            times.push(to_utc(fs::metadata(&dir).await?.modified()?));
        }
        times.sort();
        let started_at = times[0];
        let completed_at = times[times.len() - 1];

        let plugins: Vec<String> = processed.iter().map(|p| p.0.clone()).collect();
        let scan = NewScan::new(target, mode).with_plugins(plugins).validated()?;
        debug!(
            directory = %dir.display(),
            target = %scan.target,
            plugins = scan.plugins.len(),
            "inspected import directory"
        );

        Ok(Inspection {
            dir,
            metadata: ImportMetadata {
                target: scan.target,
                mode: scan.mode,
                plugins: scan.plugins,
                started_at,
                completed_at,
            },
            files: processed.into_iter().map(|p| p.1).collect(),
        })
    }

    /// Map the requested directory onto `<results root>/<relative path>`,
    /// the same shape allocated directories have. Symlinks may not lead
    /// outside the root.
    async fn resolve(&self, directory: &str) -> Result<PathBuf> {
        let directory = directory.trim();
        if directory.is_empty() {
            return Err(ScanError::InvalidInput(
                "import directory must not be empty".into(),
            ));
        }
        let outside = || {
            ScanError::InvalidInput(format!(
                "{directory} is not a directory under the results root"
            ))
        };
        let missing = |e: std::io::Error| {
            ScanError::InvalidInput(format!("directory {directory} does not exist: {e}"))
        };

        let root = fs::canonicalize(self.layout.results_root())
            .await
            .map_err(|e| {
                ScanError::InvalidInput(format!(
                    "results root {} is not accessible: {e}",
                    self.layout.results_root().display()
                ))
            })?;

        let requested = Path::new(directory);
        let relative = if requested.is_absolute() {
            let canonical = fs::canonicalize(requested).await.map_err(missing)?;
            canonical
                .strip_prefix(&root)
                .map_err(|_| outside())?
                .to_path_buf()
        } else {
            normalise_relative(requested).ok_or_else(outside)?
        };
        if relative.as_os_str().is_empty() {
            return Err(outside());
        }

        let dir = self.layout.results_root().join(&relative);
        let canonical = fs::canonicalize(&dir).await.map_err(missing)?;
        if !canonical.starts_with(&root) {
            return Err(outside());
        }
        if !fs::metadata(&canonical).await?.is_dir() {
            return Err(ScanError::InvalidInput(format!(
                "{directory} is not a directory"
            )));
        }
        Ok(dir)
    }
}

fn require_admin(caller: &Caller) -> Result<()> {
    if caller.is_admin() {
        Ok(())
    } else {
        Err(ScanError::Forbidden)
    }
}

/// `None` when the path climbs out of, or is rooted outside, its base.
fn normalise_relative(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => out.push(part),
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

struct ArtifactHints {
    target: Option<String>,
    active: bool,
}

/// Best-effort read of the `target` and `scan_mode` fields some plugins
/// write into their processed output.
async fn read_hints(path: &Path) -> Option<ArtifactHints> {
    let body = match fs::read(path).await {
        Ok(body) => body,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "could not read processed artifact");
            return None;
        }
    };
    let value: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "could not parse processed artifact");
            return None;
        }
    };
    Some(ArtifactHints {
        target: value
            .get("target")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string),
        active: value.get("scan_mode").and_then(Value::as_str) == Some("active"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ScanUnitOfWork;
    use crate::config::{AggregatorConfig, ArtifactConfig};
    use crate::database::memory::MemoryStore;
    use crate::progress::PluginStateInferencer;
    use crate::types::{Principal, PrincipalRole};
    use tempfile::TempDir;

    struct Fixture {
        tmp: TempDir,
        uow: ScanUnitOfWork,
        store: MemoryStore,
        importer: ScanImporter,
        admin: Caller,
        user: Principal,
    }

    async fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("results");
        std::fs::create_dir_all(&root).unwrap();
        let layout = Arc::new(
            ArtifactLayout::new(&ArtifactConfig {
                results_root: root,
                ..ArtifactConfig::default()
            })
            .unwrap(),
        );
        let (uow, store) = ScanUnitOfWork::in_memory();
        let admin = Principal::new("admin", PrincipalRole::Admin);
        let user = Principal::new("alice", PrincipalRole::User);
        uow.principals.create(&admin, "digest-admin").await.unwrap();
        uow.principals.create(&user, "digest-alice").await.unwrap();

        let aggregator = ResultsAggregator::new(
            PluginStateInferencer::new(Arc::clone(&layout)),
            uow.results.clone(),
            AggregatorConfig::default(),
        );
        let importer = ScanImporter::new(
            uow.jobs.clone(),
            uow.principals.clone(),
            layout,
            aggregator,
            AuditService::new(uow.audit.clone()),
        )
        .unwrap();
        Fixture {
            tmp,
            uow,
            store,
            importer,
            admin: Caller::principal(admin),
            user,
        }
    }

    impl Fixture {
        fn scan_dir(&self, name: &str, files: &[(&str, &str)]) -> PathBuf {
            let dir = self.tmp.path().join("results").join(name);
            std::fs::create_dir_all(&dir).unwrap();
            for (file, body) in files {
                std::fs::write(dir.join(file), body).unwrap();
            }
            dir
        }
    }

    fn request(directory: &str) -> ImportRequest {
        ImportRequest {
            directory: directory.to_string(),
            owner_id: None,
        }
    }

    #[tokio::test]
    async fn preview_reads_metadata_from_name_and_artifacts() {
        let fx = fixture().await;
        fx.scan_dir(
            "example.com-20250301-123000",
            &[
                ("subfinder.json", "{}"),
                ("subfinder_processed.json", r#"{"findings": [1, 2]}"#),
                ("nmap_processed.json", r#"{"findings": []}"#),
                ("kast_report.html", "<html></html>"),
            ],
        );

        let preview = fx
            .importer
            .preview(&fx.admin, "example.com-20250301-123000")
            .await
            .unwrap();
        assert!(preview.valid, "{:?}", preview.error);
        let metadata = preview.metadata.unwrap();
        assert_eq!(metadata.target, "example.com");
        assert_eq!(metadata.mode, ScanMode::Active);
        assert_eq!(metadata.plugins, vec!["nmap", "subfinder"]);
        assert!(metadata.started_at <= metadata.completed_at);
        assert_eq!(
            preview.files,
            vec!["nmap_processed.json", "subfinder_processed.json"]
        );
        assert_eq!(fx.store.audit_len().await, 0);
    }

    #[tokio::test]
    async fn target_falls_back_to_artifact_then_directory_name() {
        let fx = fixture().await;
        fx.scan_dir(
            "manual-run",
            &[(
                "whatweb_processed.json",
                r#"{"target": "shop.example.org", "scan_mode": "active"}"#,
            )],
        );
        fx.scan_dir("bare", &[("whatweb_processed.json", "not json")]);

        let from_artifact = fx.importer.preview(&fx.admin, "manual-run").await.unwrap();
        let metadata = from_artifact.metadata.unwrap();
        assert_eq!(metadata.target, "shop.example.org");
        assert_eq!(metadata.mode, ScanMode::Active);

        let from_name = fx.importer.preview(&fx.admin, "./bare").await.unwrap();
        let metadata = from_name.metadata.unwrap();
        assert_eq!(metadata.target, "bare");
        assert_eq!(metadata.mode, ScanMode::Passive);
    }

    #[tokio::test]
    async fn invalid_directories_are_reported_in_the_preview() {
        let fx = fixture().await;
        fx.scan_dir("empty-20250301-123000", &[("subfinder.json", "{}")]);
        std::fs::create_dir_all(fx.tmp.path().join("elsewhere")).unwrap();

        for directory in [
            "empty-20250301-123000",
            "missing",
            "../elsewhere",
            "",
        ] {
            let preview = fx.importer.preview(&fx.admin, directory).await.unwrap();
            assert!(!preview.valid, "{directory} should be rejected");
            assert!(preview.error.is_some());
            assert!(preview.metadata.is_none());
        }

        let outside = fx.tmp.path().join("elsewhere");
        let preview = fx
            .importer
            .preview(&fx.admin, &outside.display().to_string())
            .await
            .unwrap();
        assert!(!preview.valid);
    }

    #[tokio::test]
    async fn import_records_a_completed_scan_with_results() {
        let fx = fixture().await;
        let dir = fx.scan_dir(
            "example.com-20250301-123000",
            &[
                ("subfinder_processed.json", r#"{"findings": {"results": [1, 2, 3]}}"#),
                ("wafw00f_processed.json", r#"{"error": "blocked"}"#),
            ],
        );

        let job = fx
            .importer
            .import(
                &fx.admin,
                &ImportRequest {
                    directory: dir.display().to_string(),
                    owner_id: Some(fx.user.id),
                },
            )
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.owner_id, fx.user.id);
        assert_eq!(job.target, "example.com");
        assert_eq!(job.mode, ScanMode::Passive);
        assert!(job.task_handle.is_none());
        assert_eq!(
            job.artifact_dir,
            fx.tmp.path().join("results").join("example.com-20250301-123000")
        );
        assert!(job.started_at.unwrap() <= job.completed_at.unwrap());

        let rows = fx.uow.results.list_for_job(job.id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].subtask, "subfinder");
        assert_eq!(rows[0].finding_count, 3);
        assert_eq!(rows[1].error_detail.as_deref(), Some("blocked"));

        let audit = fx.uow.audit.recent(10).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, "scan_imported");
    }

    #[tokio::test]
    async fn a_directory_is_imported_once() {
        let fx = fixture().await;
        fx.scan_dir(
            "example.com-20250301-123000",
            &[("subfinder_processed.json", "{}")],
        );

        let first = fx
            .importer
            .import(&fx.admin, &request("example.com-20250301-123000"))
            .await
            .unwrap();
        let err = fx
            .importer
            .import(&fx.admin, &request("./example.com-20250301-123000/"))
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::AlreadyImported { job_id } if job_id == first.id));

        let preview = fx
            .importer
            .preview(&fx.admin, "example.com-20250301-123000")
            .await
            .unwrap();
        assert!(!preview.valid);

        let audit = fx.uow.audit.recent(10).await.unwrap();
        assert!(audit.iter().any(|r| r.action == "scan_import_failed"));
    }

    #[tokio::test]
    async fn non_admins_and_unknown_owners_are_rejected() {
        let fx = fixture().await;
        fx.scan_dir(
            "example.com-20250301-123000",
            &[("subfinder_processed.json", "{}")],
        );
        let user = Caller::principal(fx.user.clone());

        let err = fx
            .importer
            .preview(&user, "example.com-20250301-123000")
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::Forbidden));
        let err = fx
            .importer
            .import(&user, &request("example.com-20250301-123000"))
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::Forbidden));

        let err = fx
            .importer
            .import(
                &fx.admin,
                &ImportRequest {
                    directory: "example.com-20250301-123000".into(),
                    owner_id: Some(PrincipalId::new()),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::InvalidInput(_)));
        let page = fx
            .uow
            .jobs
            .list(&Default::default(), Default::default())
            .await
            .unwrap();
        assert_eq!(page.total, 0);
    }
}
