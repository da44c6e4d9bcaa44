//! Plugin lifecycle inferred from artifact presence.
//!
//! The external tool never signals progress; the only evidence is the files it
//! leaves behind. For plugin `X`:
//!
//! | `X.json` | `X_processed.json` | state         |
//! |----------|--------------------|---------------|
//! | absent   | absent             | `pending`     |
//! | present  | absent             | `in_progress` |
//! | any      | present            | `completed`   |
//!
//! Reads race with the writer. No locking is attempted: the tool is expected
//! to publish files by rename, and a half-written processed artifact is caught
//! later when the aggregator fails to parse it.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

use crate::artifacts::{ArtifactLayout, ArtifactName};
use crate::error::Result;

/// Where a plugin is in its run, as far as the files show.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    /// No artifact yet.
    Pending,
    /// Raw artifact only.
    InProgress,
    /// Processed artifact present.
    Completed,
}

impl PluginState {
    /// Name reported in status snapshots.
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginState::Pending => "pending",
            PluginState::InProgress => "in_progress",
            PluginState::Completed => "completed",
        }
    }
}

/// Which plugins to report on.
#[derive(Clone, Copy, Debug)]
pub enum PluginSelection<'a> {
    /// Exactly these plugins, in this order.
    Explicit(&'a [String]),
    /// Whatever artifacts the directory holds.
    Discover,
}

impl<'a> PluginSelection<'a> {
    /// An empty requested set means "whatever the tool produced".
    pub fn for_requested(plugins: &'a [String]) -> Self {
        if plugins.is_empty() {
            PluginSelection::Discover
        } else {
            PluginSelection::Explicit(plugins)
        }
    }
}

/// One plugin's state and the artifacts behind it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PluginObservation {
    /// Plugin name.
    pub name: String,
    /// Inferred state.
    pub state: PluginState,
    /// Raw artifact, if present.
    pub raw_artifact: Option<PathBuf>,
    /// Processed artifact, if present.
    pub processed_artifact: Option<PathBuf>,
    /// Modification time of the processed artifact when present.
    pub processed_modified: Option<DateTime<Utc>>,
}

impl PluginObservation {
    fn from_presence(
        name: String,
        raw: Option<PathBuf>,
        processed: Option<(PathBuf, Option<DateTime<Utc>>)>,
    ) -> Self {
        let state = match (&raw, &processed) {
            (_, Some(_)) => PluginState::Completed,
            (Some(_), None) => PluginState::InProgress,
            (None, None) => PluginState::Pending,
        };
        let (processed_artifact, processed_modified) = match processed {
            Some((path, modified)) => (Some(path), modified),
            None => (None, None),
        };
        Self {
            name,
            state,
            raw_artifact: raw,
            processed_artifact,
            processed_modified,
        }
    }
}

/// Maps a directory listing onto per-plugin states. Never writes.
#[derive(Clone, Debug)]
pub struct PluginStateInferencer {
    layout: Arc<ArtifactLayout>,
}

impl PluginStateInferencer {
    /// Inferencer using the naming rules in `layout`.
    pub fn new(layout: Arc<ArtifactLayout>) -> Self {
        Self { layout }
    }

    /// Observe every selected plugin in `dir`. A missing directory means the
    /// tool has not started writing yet.
    pub fn infer(
        &self,
        dir: &Path,
        selection: PluginSelection<'_>,
    ) -> Result<Vec<PluginObservation>> {
        match selection {
            PluginSelection::Explicit(names) => Ok(self.infer_explicit(dir, names)),
            PluginSelection::Discover => self.discover(dir),
        }
    }

    fn infer_explicit(&self, dir: &Path, names: &[String]) -> Vec<PluginObservation> {
        let mut seen = HashSet::new();
        names
            .iter()
            .filter(|name| seen.insert(name.as_str()))
            .map(|name| {
                let raw_path = self.layout.raw_path(dir, name);
                let raw = stat_artifact(&raw_path).map(|_| raw_path);
                let processed_path = self.layout.processed_path(dir, name);
                let processed = stat_artifact(&processed_path)
                    .map(|modified| (processed_path, modified));
                PluginObservation::from_presence(name.clone(), raw, processed)
            })
            .collect()
    }

    fn discover(&self, dir: &Path) -> Result<Vec<PluginObservation>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut raw = BTreeSet::new();
        let mut processed = BTreeMap::new();
        for entry in entries {
            // Entries can vanish between listing and inspection.
            let Ok(entry) = entry else { continue };
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            match self.layout.classify(file_name) {
                Some(ArtifactName::Processed(stem)) => {
                    let modified = entry
                        .metadata()
                        .ok()
                        .and_then(|meta| meta.modified().ok())
                        .map(to_utc);
                    processed.insert(stem, modified);
                }
                Some(ArtifactName::Raw(stem)) => {
                    raw.insert(stem);
                }
                None => {}
            }
        }

        // Raw-only files with underscores are scratch output (e.g.
        // `subfinder_hosts.json`), not plugins.
        let names: BTreeSet<String> = processed
            .keys()
            .cloned()
            .chain(raw.iter().filter(|stem| !stem.contains('_')).cloned())
            .collect();

        Ok(names
            .into_iter()
            .map(|name| {
                let raw_artifact = raw
                    .contains(&name)
                    .then(|| self.layout.raw_path(dir, &name));
                let processed_artifact = processed
                    .get(&name)
                    .map(|modified| (self.layout.processed_path(dir, &name), *modified));
                PluginObservation::from_presence(name, raw_artifact, processed_artifact)
            })
            .collect())
    }
}

/// `Some(mtime)` when the file exists. Errors other than "not found" are
/// treated as absence: the next poll will see the file.
fn stat_artifact(path: &Path) -> Option<Option<DateTime<Utc>>> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => Some(meta.modified().ok().map(to_utc)),
        Ok(_) => None,
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                debug!(path = %path.display(), error = %e, "artifact stat failed");
            }
            None
        }
    }
}

/// Truncated to microseconds so values survive a Postgres round trip and
/// compare equal on the next poll.
pub(crate) fn to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time).trunc_subsecs(6)
}
