//! Runnable host for the grpc call engine.
//!
//! Runs a server with a pool of handler threads and drives it with an
//! in-process load client, reporting how calls finished and how many were
//! ever active at once.

pub mod config;
pub mod logging;
pub mod metrics;
pub mod signal;
pub mod workers;

pub use config::{Config, ConfigError};
pub use workers::{Summary, run};
