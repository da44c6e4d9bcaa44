//! The artifact directory contract.
//!
//! Each job owns one directory under the results root. The external tool
//! writes `<plugin>.<ext>` when a plugin starts producing output and
//! `<plugin><processed_suffix>.<ext>` once the plugin's output is processed.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::path::{Path, PathBuf};

use crate::config::ArtifactConfig;
use crate::error::{Result, ScanError};
use crate::types::JobId;

/// A directory entry recognised as belonging to a plugin.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArtifactName {
    /// `<plugin>.<ext>`: the plugin started writing.
    Raw(String),
    /// `<plugin><suffix>.<ext>`: the plugin's output is final.
    Processed(String),
}

/// Naming rules for artifact directories and the files inside them.
#[derive(Clone, Debug)]
pub struct ArtifactLayout {
    results_root: PathBuf,
    raw_ext: String,
    processed_tail: String,
    report_file: String,
    denylist: Vec<Regex>,
}

impl ArtifactLayout {
    /// Compile the denylist. Fails on an empty extension or processed suffix.
    pub fn new(config: &ArtifactConfig) -> Result<Self> {
        let denylist = config
            .denylist
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    ScanError::InvalidInput(format!(
                        "invalid artifact denylist pattern '{pattern}': {e}"
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let ext = config.extension.trim_start_matches('.');
        if ext.is_empty() {
            return Err(ScanError::InvalidInput(
                "artifact extension must not be empty".into(),
            ));
        }
        if config.processed_suffix.is_empty() {
            return Err(ScanError::InvalidInput(
                "processed artifact suffix must not be empty".into(),
            ));
        }

        Ok(Self {
            results_root: config.results_root.clone(),
            raw_ext: format!(".{ext}"),
            processed_tail: format!("{}.{ext}", config.processed_suffix),
            report_file: config.report_file.clone(),
            denylist,
        })
    }

    /// Directory every job directory is created under.
    pub fn results_root(&self) -> &Path {
        &self.results_root
    }

    /// Directory for a new job: `<root>/<target>-<timestamp>-<job prefix>`.
    /// The job prefix keeps two submissions in the same second apart.
    pub fn allocate_dir(&self, target: &str, job_id: JobId, now: DateTime<Utc>) -> PathBuf {
        let id = job_id.to_string();
        let short = id.rsplit('-').next().unwrap_or(&id);
        self.results_root.join(format!(
            "{}-{}-{}",
            sanitize_component(target),
            now.format("%Y%m%d-%H%M%S"),
            short
        ))
    }

    /// Where `subtask` writes its raw output.
    pub fn raw_path(&self, dir: &Path, subtask: &str) -> PathBuf {
        dir.join(format!("{subtask}{}", self.raw_ext))
    }

    /// Where `subtask` writes its final output.
    pub fn processed_path(&self, dir: &Path, subtask: &str) -> PathBuf {
        dir.join(format!("{subtask}{}", self.processed_tail))
    }

    /// The tool's HTML report inside `dir`.
    pub fn report_path(&self, dir: &Path) -> PathBuf {
        dir.join(&self.report_file)
    }

    /// True for files that are never treated as artifacts.
    pub fn is_denied(&self, file_name: &str) -> bool {
        self.denylist.iter().any(|re| re.is_match(file_name))
    }

    /// Map a file name onto the naming contract. Denylisted names and files
    /// with other extensions are not artifacts.
    pub fn classify(&self, file_name: &str) -> Option<ArtifactName> {
        if self.is_denied(file_name) {
            return None;
        }
        if let Some(stem) = file_name.strip_suffix(&self.processed_tail) {
            return (!stem.is_empty()).then(|| ArtifactName::Processed(stem.to_string()));
        }
        if let Some(stem) = file_name.strip_suffix(&self.raw_ext) {
            return (!stem.is_empty()).then(|| ArtifactName::Raw(stem.to_string()));
        }
        None
    }
}

fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.');
    if cleaned.is_empty() {
        "target".to_string()
    } else {
        cleaned.to_string()
    }
}
