//! Folding processed artifacts into persisted sub-task results.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use super::inference::{PluginObservation, PluginSelection, PluginState, PluginStateInferencer};
use crate::config::AggregatorConfig;
use crate::database::ports::SubTaskResultRepository;
use crate::error::{Result, ScanError};
use crate::types::{Disposition, ScanJob, SubTaskResult};

/// What one processed artifact says about its plugin.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactSummary {
    /// `disposition` from the artifact.
    pub disposition: Disposition,
    /// Length of `findings.results`, or of `findings` when it is a list.
    pub finding_count: u32,
    /// First non-empty error field, in configured priority order.
    pub error_detail: Option<String>,
}

/// Extract the summary from a processed artifact body. Only JSON objects are
/// accepted.
pub fn summarize_artifact(
    body: &[u8],
    policy: &AggregatorConfig,
) -> std::result::Result<ArtifactSummary, String> {
    let value: Value = serde_json::from_slice(body).map_err(|e| e.to_string())?;
    let Value::Object(_) = &value else {
        return Err("processed artifact is not a JSON object".to_string());
    };

    let finding_count = match value.get("findings") {
        Some(Value::Object(findings)) => findings
            .get("results")
            .and_then(Value::as_array)
            .map_or(0, Vec::len),
        Some(Value::Array(findings)) => findings.len(),
        _ => 0,
    };
    let finding_count = u32::try_from(finding_count).unwrap_or(u32::MAX);

    let error_detail = policy
        .error_fields
        .iter()
        .find_map(|path| error_at(&value, path))
        .map(|message| truncate_chars(&message, policy.max_error_chars));

    let disposition = value
        .get("disposition")
        .and_then(Value::as_str)
        .and_then(Disposition::from_artifact)
        .unwrap_or(if error_detail.is_some() {
            Disposition::Failure
        } else {
            Disposition::Success
        });

    Ok(ArtifactSummary {
        disposition,
        finding_count,
        error_detail,
    })
}

/// A non-empty message at a dotted path. Strings are used as-is; other
/// non-null scalars and containers are rendered as JSON.
fn error_at(value: &Value, path: &str) -> Option<String> {
    let found = path
        .split('.')
        .try_fold(value, |node, key| node.as_object()?.get(key))?;
    match found {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.trim().to_string()),
        Value::Array(items) if items.is_empty() => None,
        Value::Object(map) if map.is_empty() => None,
        other => Some(other.to_string()),
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}

/// Per-pass bookkeeping. Parse failures leave the sub-task untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AggregationReport {
    /// Sub-tasks whose rows were written in this pass.
    pub upserted: Vec<String>,
    /// Sub-tasks whose artifacts had not changed.
    pub unchanged: Vec<String>,
    /// Sub-tasks that could not be recorded, with the reason.
    pub failed: Vec<(String, String)>,
}

impl AggregationReport {
    /// No sub-task failed to record.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Turns completed plugin observations into [`SubTaskResult`] rows.
#[derive(Clone)]
pub struct ResultsAggregator {
    inferencer: PluginStateInferencer,
    results: Arc<dyn SubTaskResultRepository>,
    policy: AggregatorConfig,
}

impl std::fmt::Debug for ResultsAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultsAggregator")
            .field("inferencer", &self.inferencer)
            .field("results", &std::any::type_name_of_val(self.results.as_ref()))
            .field("policy", &self.policy)
            .finish()
    }
}

impl ResultsAggregator {
    /// Aggregator writing through `results`.
    pub fn new(
        inferencer: PluginStateInferencer,
        results: Arc<dyn SubTaskResultRepository>,
        policy: AggregatorConfig,
    ) -> Self {
        Self {
            inferencer,
            results,
            policy,
        }
    }

    /// Full pass over the job's directory. Used once after the job finishes.
    pub async fn aggregate_job(&self, job: &ScanJob) -> Result<AggregationReport> {
        let observations = self.observe(job).await?;
        let known = self.known_results(job).await?;
        self.aggregate_observed(job, &observations, &known).await
    }

    /// Run the inferencer off the async runtime.
    pub async fn observe(&self, job: &ScanJob) -> Result<Vec<PluginObservation>> {
        let inferencer = self.inferencer.clone();
        let dir = job.artifact_dir.clone();
        let plugins = job.plugins.clone();
        tokio::task::spawn_blocking(move || {
            inferencer.infer(&dir, PluginSelection::for_requested(&plugins))
        })
        .await
        .map_err(|e| ScanError::Internal(format!("artifact inference task failed: {e}")))?
    }

    /// Persisted rows for the job, keyed by sub-task name.
    pub async fn known_results(&self, job: &ScanJob) -> Result<HashMap<String, SubTaskResult>> {
        Ok(self
            .results
            .list_for_job(job.id)
            .await?
            .into_iter()
            .map(|row| (row.subtask.clone(), row))
            .collect())
    }

    /// Upsert every completed observation whose artifact changed since the
    /// persisted row was written.
    pub async fn aggregate_observed(
        &self,
        job: &ScanJob,
        observations: &[PluginObservation],
        known: &HashMap<String, SubTaskResult>,
    ) -> Result<AggregationReport> {
        let mut report = AggregationReport::default();

        for observation in observations {
            if observation.state != PluginState::Completed {
                continue;
            }
            let Some(processed) = observation.processed_artifact.as_deref() else {
                continue;
            };
            // Without an mtime there is nothing to order the row by.
            let Some(modified) = observation.processed_modified else {
                warn!(
                    job_id = %job.id,
                    subtask = %observation.name,
                    path = %processed.display(),
                    "processed artifact has no modification time; not recorded"
                );
                report.failed.push((
                    observation.name.clone(),
                    "processed artifact has no modification time".to_string(),
                ));
                continue;
            };

            if let Some(row) = known.get(&observation.name)
                && row.observed_at == modified
                && row.processed_artifact == processed
            {
                report.unchanged.push(observation.name.clone());
                continue;
            }

            match self.read_summary(processed).await {
                Ok(summary) => {
                    let row = SubTaskResult {
                        job_id: job.id,
                        subtask: observation.name.clone(),
                        disposition: summary.disposition,
                        finding_count: summary.finding_count,
                        raw_artifact: observation.raw_artifact.clone(),
                        processed_artifact: processed.to_path_buf(),
                        error_detail: summary.error_detail,
                        observed_at: modified,
                    };
                    self.results.upsert(&row).await?;
                    debug!(
                        job_id = %job.id,
                        subtask = %observation.name,
                        disposition = %row.disposition,
                        findings = row.finding_count,
                        "sub-task result recorded"
                    );
                    report.upserted.push(observation.name.clone());
                }
                Err(ScanError::ArtifactParse { path, message }) => {
                    warn!(
                        job_id = %job.id,
                        subtask = %observation.name,
                        path = %path,
                        error = %message,
                        "skipping unparseable processed artifact"
                    );
                    report.failed.push((observation.name.clone(), message));
                }
                Err(e) => return Err(e),
            }
        }

        Ok(report)
    }

    async fn read_summary(&self, path: &Path) -> Result<ArtifactSummary> {
        let parse_error = |message: String| ScanError::ArtifactParse {
            path: path.display().to_string(),
            message,
        };
        // A vanished file is a racy read, not a storage failure.
        let body = tokio::fs::read(path)
            .await
            .map_err(|e| parse_error(e.to_string()))?;
        summarize_artifact(&body, &self.policy).map_err(parse_error)
    }
}
