//! # Kast Server
//!
//! HTTP API in front of `kast-core`: submit scans, poll their per-plugin
//! progress, download reports and share results with other principals or
//! through expiring public links.

pub mod auth;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod maintenance;
pub mod routes;
pub mod state;

pub use state::{AppState, build_app_state};
