use serde::Deserialize;

use crate::error::{Result, ScanError};
use crate::types::{ScanMode, ScanOptions};

/// Longest accepted target; matches the DNS name limit.
const MAX_TARGET_LEN: usize = 253;
const MAX_PLUGINS: usize = 64;
const MAX_PARALLEL_WORKERS: u16 = 64;

/// A scan submission before it becomes a job.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct NewScan {
    /// Host, domain or URL to scan.
    pub target: String,
    /// Defaults to passive.
    #[serde(default)]
    pub mode: ScanMode,
    /// Empty means every plugin the tool enables by default.
    #[serde(default)]
    pub plugins: Vec<String>,
    /// Flags passed through to the tool.
    #[serde(default)]
    pub options: ScanOptions,
}

impl NewScan {
    /// A scan of `target` in `mode` with no plugin filter.
    pub fn new(target: impl Into<String>, mode: ScanMode) -> Self {
        Self {
            target: target.into(),
            mode,
            plugins: Vec::new(),
            options: ScanOptions::default(),
        }
    }

    /// Restrict the run to `plugins`.
    pub fn with_plugins<I, S>(mut self, plugins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.plugins = plugins.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the tool flags.
    pub fn with_options(mut self, options: ScanOptions) -> Self {
        self.options = options;
        self
    }

    /// Normalise and check every field that ends up on the tool's command
    /// line. Plugin names are trimmed and deduplicated in request order.
    pub fn validated(mut self) -> Result<Self> {
        self.target = self.target.trim().to_string();
        validate_target(&self.target)?;

        let mut plugins: Vec<String> = Vec::with_capacity(self.plugins.len());
        for raw in &self.plugins {
            let name = raw.trim();
            if name.is_empty() {
                continue;
            }
            if !is_plugin_name(name) {
                return Err(ScanError::InvalidInput(format!(
                    "invalid plugin name '{name}'"
                )));
            }
            if !plugins.iter().any(|p| p == name) {
                plugins.push(name.to_string());
            }
        }
        if plugins.len() > MAX_PLUGINS {
            return Err(ScanError::InvalidInput(format!(
                "at most {MAX_PLUGINS} plugins may be requested"
            )));
        }
        self.plugins = plugins;

        if let Some(workers) = self.options.max_workers
            && !(1..=MAX_PARALLEL_WORKERS).contains(&workers)
        {
            return Err(ScanError::InvalidInput(format!(
                "max_workers must be between 1 and {MAX_PARALLEL_WORKERS}"
            )));
        }
        if !self.options.parallel {
            self.options.max_workers = None;
        }

        Ok(self)
    }
}

fn validate_target(target: &str) -> Result<()> {
    if target.is_empty() {
        return Err(ScanError::InvalidInput("target must not be empty".into()));
    }
    if target.chars().count() > MAX_TARGET_LEN {
        return Err(ScanError::InvalidInput(format!(
            "target must be at most {MAX_TARGET_LEN} characters"
        )));
    }
    if target.starts_with('-') {
        return Err(ScanError::InvalidInput(
            "target must not start with '-'".into(),
        ));
    }
    if target.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err(ScanError::InvalidInput(
            "target must not contain whitespace or control characters".into(),
        ));
    }
    Ok(())
}

fn is_plugin_name(name: &str) -> bool {
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
