//! Metadata Depot - Backend Library
//!
//! Keeps a queryable cache of published project artifacts in sync with the
//! source repository: a durable notification queue, a refresh orchestrator
//! guarded by per-version leases, retention policies and a reconciliation
//! sweep, all driven by a lease-aware scheduler.

pub mod config;
pub mod depot;
pub mod error;
pub mod models;
pub mod services;
pub mod storage;
pub mod telemetry;

pub use config::Config;
pub use depot::Depot;
pub use error::{AppError, Result};
