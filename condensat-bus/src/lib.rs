//! # Condensat Bus
//!
//! Messaging layer shared by every Condensat service: request/reply RPC on top
//! of a publish/subscribe transport, bounded worker pools for inbound
//! subjects, and a registry wiring subjects to handlers at startup.
//!
//! ## Features
//!
//! - **Transport contract**: [`Transport`] trait with an embedded in-process broker
//! - **RPC correlation**: per-request correlation ids and inbox reply subjects
//! - **Worker pools**: N concurrent handlers per subject with backpressure
//! - **Cancellation**: every blocking call takes a [`CancellationToken`]
//!
//! ## Basic Usage
//!
//! ```rust,no_run
//! use condensat_bus::{
//!     CancellationToken, EmbeddedBroker, HandlerError, MessageBus, subject, typed_handler,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bus = MessageBus::new(Arc::new(EmbeddedBroker::new()), Duration::from_secs(5)).await?;
//!     let cancel = CancellationToken::new();
//!
//!     let handler = typed_handler(|n: u64| async move { Ok::<_, HandlerError>(n + 1) });
//!     let pool = bus
//!         .subscribe_workers(subject::EXAMPLE_REQUEST, 4, handler, &cancel)
//!         .await?;
//!
//!     let reply: u64 = bus
//!         .request_typed(subject::EXAMPLE_REQUEST, &41u64, Duration::from_secs(1), &cancel)
//!         .await?;
//!     assert_eq!(reply, 42);
//!
//!     cancel.cancel();
//!     pool.wait_stopped().await?;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod bus;
pub mod error;
pub mod handler;
pub mod message;
pub mod registry;
pub mod rpc;
pub mod subject;
pub mod transport;
pub mod worker_pool;

pub use broker::{BrokerStatistics, EmbeddedBroker};
pub use bus::MessageBus;
pub use error::{BusError, ErrorCode, HandlerError, Result};
pub use handler::{HandlerResult, MessageHandler, handler_fn, typed_handler};
pub use message::{ErrorReply, Message, decode, encode};
pub use registry::{HandlerRegistry, RegistryHandle};
pub use rpc::{DEFAULT_RPC_TIMEOUT, RpcCorrelator, generate_correlation_id};
pub use transport::{Subscription, Transport};
pub use worker_pool::{PoolState, WorkerPool, WorkerPoolHandle, WorkerPoolStats};

pub use tokio_util::sync::CancellationToken;
