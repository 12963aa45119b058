//! Durable log transport for Condensat services.
//!
//! Producers push [`LogEntry`] records into a redis list through
//! [`QueueLogger`] or the [`QueueLayer`] tracing layer. A single
//! [`Grabber`] drains the list into one or more [`LogSink`]s with
//! at-least-once delivery: an entry is acknowledged only after every sink
//! accepted it, so sinks must tolerate duplicates.
//!
//! [`LogEntry`]: condensat_lib::models::LogEntry

#![forbid(unsafe_code)]

pub mod error;
pub mod grabber;
pub mod producer;
pub mod queue;
pub mod sink;

pub use error::{LoggerError, Result};
pub use grabber::{Grabber, GrabberSettings, GrabberStats};
pub use producer::{QueueLayer, QueueLogger};
pub use queue::{LogQueue, MemoryLogQueue, RedisLogQueue};
pub use sink::{ConsoleFormat, ConsoleSink, DatabaseSink, LogSink};
