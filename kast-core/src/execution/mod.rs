//! Running the external scanning tool.

/// Job to tool invocation mapping
pub mod command;
/// Runs the tool as a supervised child process
pub mod executor;
/// Plugin listing as reported by the tool
pub mod plugins;

pub use command::ExecutionRequest;
pub use executor::{ExecutionDisposition, ExecutionOutcome, KastCliExecutor, ScanExecutor};
pub use plugins::{PluginInfo, parse_plugin_listing};
