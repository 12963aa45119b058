#![forbid(unsafe_code)]

//! condensat-lib: shared functionality for Condensat services.
//!
//! - Configuration management with hierarchical overrides
//! - Tracing subscriber initialisation
//! - Data models for process telemetry and log entries
//! - Durable key/value storage behind the [`storage::Storage`] trait

pub mod config;
pub mod logging;
pub mod models;
pub mod storage;
