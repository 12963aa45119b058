//! Service telemetry for Condensat.
//!
//! Every service periodically publishes a [`ProcessInfo`] sample on
//! `Condensat.Monitor.Inbound`. The monitor keeps the latest sample per
//! host and a bounded history per application, and answers two queries:
//!
//! - `Condensat.Monitor.Stack.List`: latest status of every recently seen service
//! - `Condensat.Monitor.Stack.ServiceHistory`: bucketed history of one service
//!
//! [`ProcessInfo`]: condensat_lib::models::ProcessInfo

#![forbid(unsafe_code)]

pub mod aggregator;
pub mod client;
pub mod error;
pub mod handlers;
pub mod reporter;

pub use aggregator::{Aggregator, AggregatorSettings};
pub use client::MonitorClient;
pub use error::{MonitorError, Result};
pub use reporter::{ProcessInfoReporter, local_hostname};
