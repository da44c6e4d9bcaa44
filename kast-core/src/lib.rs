//! # Kast Core
//!
//! Scan execution and status aggregation for the kast web scanner.
//!
//! ## Overview
//!
//! `kast-core` runs the external `kast` tool as a subprocess, one job per
//! worker, and derives each plugin's progress purely from the files the tool
//! leaves in the job's artifact directory:
//!
//! - **Dispatch**: admission control, a bounded worker pool and startup recovery
//! - **Execution**: subprocess invocation with a hard timeout and a full transcript
//! - **Progress**: file-presence inference, idempotent result aggregation and
//!   consistent status snapshots
//! - **Import**: CLI result directories recorded as completed scans
//! - **Access**: owner, admin, per-principal grants and expiring public links
//!   resolved by one pure function
//! - **Database**: repository ports with Postgres adapters and embedded migrations
//!
//! ## Feature Flags
//!
//! - `test-support`: in-memory repository adapters for tests
//! - `postgres-tests`: run the Postgres-backed test suites
//!
//! ## Examples
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use kast_core::artifacts::ArtifactLayout;
//! use kast_core::config::ArtifactConfig;
//! use kast_core::progress::{PluginSelection, PluginStateInferencer};
//!
//! fn print_progress(dir: &Path) -> kast_core::Result<()> {
//!     let layout = Arc::new(ArtifactLayout::new(&ArtifactConfig::default())?);
//!     let inferencer = PluginStateInferencer::new(layout);
//!     for plugin in inferencer.infer(dir, PluginSelection::Discover)? {
//!         println!("{}: {}", plugin.name, plugin.state.as_str());
//!     }
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

/// Ownership, grants and public links
pub mod access;
/// Service wiring over the repository ports
/// The bundle of repository ports services are built from
pub mod application;
/// The artifact directory naming contract
pub mod artifacts;
pub mod audit;
pub mod catalog;
/// Engine configuration passed explicitly into services
pub mod config;
/// Repository ports and their adapters
pub mod database;
pub mod dispatch;
pub mod error;
pub mod execution;
/// Recording CLI result directories as completed scans
pub mod import;
pub mod progress;
pub mod types;

pub use error::{Result, ScanError};

/// Embedded schema migrations.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
