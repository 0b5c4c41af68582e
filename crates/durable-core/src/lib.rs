//! `durable-core` — configuration and shared error types for the durable
//! job workspace.

pub mod config;
pub mod error;

pub use config::{AlertsConfig, DatabaseConfig, DurableConfig, DurableJobsConfig};
pub use error::{CoreError, Result};
