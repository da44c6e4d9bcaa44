//! Per-plugin result rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use super::ids::JobId;
use crate::error::ScanError;

/// Outcome a plugin recorded in its processed artifact.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    /// The plugin ran and reported success.
    Success,
    /// The plugin ran and reported an error.
    Failure,
    /// The plugin decided it had nothing to do.
    Skipped,
}

impl Disposition {
    /// Lowercase name used in storage and JSON.
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Success => "success",
            Disposition::Failure => "failure",
            Disposition::Skipped => "skipped",
        }
    }

    /// Lenient mapping of the tool's free-form disposition strings.
    pub fn from_artifact(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "success" | "succeeded" | "ok" | "pass" | "passed" => {
                Some(Disposition::Success)
            }
            "fail" | "failure" | "failed" | "error" => Some(Disposition::Failure),
            "skip" | "skipped" => Some(Disposition::Skipped),
            _ => None,
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Disposition {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Disposition::Success),
            "failure" => Ok(Disposition::Failure),
            "skipped" => Ok(Disposition::Skipped),
            other => Err(ScanError::InvalidInput(format!(
                "unknown disposition '{other}'"
            ))),
        }
    }
}

/// One row per (job, plugin). Only the results aggregator writes these.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubTaskResult {
    /// Owning job.
    pub job_id: JobId,
    /// Plugin name.
    pub subtask: String,
    /// Outcome the plugin reported.
    pub disposition: Disposition,
    /// Number of findings in the artifact.
    pub finding_count: u32,
    /// Raw artifact, if it was still present.
    pub raw_artifact: Option<PathBuf>,
    /// Processed artifact the row was read from.
    pub processed_artifact: PathBuf,
    /// Error the plugin reported, if any.
    pub error_detail: Option<String>,
    /// Modification time of the processed artifact.
    pub observed_at: DateTime<Utc>,
}
