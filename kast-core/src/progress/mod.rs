//! Artifact-derived progress: inference, aggregation and status snapshots.

pub mod aggregator;
pub mod inference;
pub mod status;

pub use aggregator::{AggregationReport, ArtifactSummary, ResultsAggregator, summarize_artifact};
pub use inference::{PluginObservation, PluginSelection, PluginState, PluginStateInferencer};
pub use status::{StatusService, StatusSnapshot, StatusSummary, SubTaskStatus};
