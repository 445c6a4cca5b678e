//! Collector for browser Content-Security-Policy violation reports.
//!
//! Reports are validated, reduced to their host, path, policy and violated
//! directive, and stored once per distinct value in SQLite.
pub mod config;
pub mod error;
mod ingest;
mod metrics;
pub mod normalize;
pub mod report;
mod serve;
pub mod storage;
pub mod validate;

pub use config::{AppConfig, parse_whitelist};
pub use serve::{AppState, Args, Error, Result, app, run};
