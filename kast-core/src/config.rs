//! Engine tuning passed explicitly into the core services.
//!
//! Nothing in `kast-core` reads ambient process state; the server builds an
//! [`EngineConfig`] once (environment + optional file) and hands the relevant
//! section to each service.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Everything the engine services are configured with.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Process supervision.
    pub executor: ExecutorConfig,
    /// Artifact naming and locations.
    pub artifacts: ArtifactConfig,
    /// Processed artifact parsing.
    pub aggregator: AggregatorConfig,
    /// Queue and worker sizing.
    pub dispatcher: DispatcherConfig,
}

/// How the external tool is invoked.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Path of the `kast` executable.
    pub cli_path: PathBuf,
    /// Hard wall-clock limit for one tool invocation.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// Limit for the short `--list-plugins` call.
    #[serde(with = "duration_secs")]
    pub list_plugins_timeout: Duration,
    /// File name of the transcript written into each job directory.
    pub transcript_file: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            cli_path: PathBuf::from("/usr/local/bin/kast"),
            timeout: Duration::from_secs(3600),
            list_plugins_timeout: Duration::from_secs(10),
            transcript_file: "kast_execution.log".to_string(),
        }
    }
}

/// Artifact directory contract shared with the external tool.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    /// Root under which one directory per job is allocated.
    pub results_root: PathBuf,
    /// Extension of both raw and processed artifacts, without the dot.
    pub extension: String,
    /// Suffix inserted before the extension for processed artifacts.
    pub processed_suffix: String,
    /// File name of the tool's final HTML report.
    pub report_file: String,
    /// Regexes matched against file names that are never plugins.
    pub denylist: Vec<String>,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            results_root: PathBuf::from("./kast_results"),
            extension: "json".to_string(),
            processed_suffix: "_processed".to_string(),
            report_file: "kast_report.html".to_string(),
            denylist: vec![
                r"^kast_report\..*$".to_string(),
                r"^kast_execution\.log$".to_string(),
                r".*_tmp\.json$".to_string(),
            ],
        }
    }
}

/// Policy for extracting detail from processed artifacts.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Dotted JSON paths checked in order for an error message. The order is
    /// policy, not a contract.
    pub error_fields: Vec<String>,
    /// Maximum stored error detail, in characters.
    pub max_error_chars: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            error_fields: [
                "error",
                "error_message",
                "message",
                "details.error",
                "details.message",
                "findings.error",
                "reason",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            max_error_chars: 2000,
        }
    }
}

/// Worker pool sizing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Number of jobs that may run concurrently.
    pub workers: usize,
    /// Jobs that may wait in the queue before `submit` backs off.
    pub queue_capacity: usize,
    /// How long shutdown waits for in-flight jobs before aborting them.
    #[serde(with = "duration_secs")]
    pub shutdown_grace: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 256,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
