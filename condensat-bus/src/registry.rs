//! Handler registry: subject to handler wiring validated at startup

use crate::bus::MessageBus;
use crate::error::{BusError, Result};
use crate::handler::MessageHandler;
use crate::subject::validate_pattern;
use crate::worker_pool::{PoolState, WorkerPoolHandle, WorkerPoolStats};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

struct Registration {
    concurrency: usize,
    handler: Arc<dyn MessageHandler>,
}

/// Subjects and the handlers serving them
#[derive(Default)]
pub struct HandlerRegistry {
    entries: BTreeMap<String, Registration>,
}

impl HandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a subject with `concurrency` slots
    pub fn register(
        &mut self,
        subject: impl Into<String>,
        concurrency: usize,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<&mut Self> {
        let subject = subject.into();
        validate_pattern(&subject)?;

        if concurrency == 0 {
            return Err(BusError::registry(format!(
                "concurrency for {subject} must be at least 1"
            )));
        }
        if self.entries.contains_key(&subject) {
            return Err(BusError::registry(format!(
                "handler already registered for {subject}"
            )));
        }

        self.entries.insert(
            subject,
            Registration {
                concurrency,
                handler,
            },
        );
        Ok(self)
    }

    /// Registered subjects, sorted
    pub fn subjects(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// Number of registrations
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fail unless every `required` subject has a handler
    pub fn validate(&self, required: &[&str]) -> Result<()> {
        let missing: Vec<&str> = required
            .iter()
            .copied()
            .filter(|subject| !self.entries.contains_key(*subject))
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(BusError::registry(format!(
                "missing handlers for {}",
                missing.join(", ")
            )))
        }
    }

    /// Start one worker pool per registration
    pub async fn start(self, bus: &MessageBus, cancel: &CancellationToken) -> Result<RegistryHandle> {
        let cancel = cancel.child_token();
        let mut pools = Vec::with_capacity(self.entries.len());

        for (subject, registration) in self.entries {
            match bus
                .subscribe_workers(&subject, registration.concurrency, registration.handler, &cancel)
                .await
            {
                Ok(pool) => pools.push(pool),
                Err(e) => {
                    warn!(%subject, error = %e, "Failed to start worker pool, stopping the others");
                    cancel.cancel();
                    for pool in pools {
                        let _ = pool.wait_stopped().await;
                    }
                    return Err(e);
                }
            }
        }

        info!(pools = pools.len(), "Handler registry started");
        Ok(RegistryHandle { pools, cancel })
    }
}

/// Running worker pools started from a registry
pub struct RegistryHandle {
    pools: Vec<WorkerPoolHandle>,
    cancel: CancellationToken,
}

impl RegistryHandle {
    /// State of the pool serving `subject`
    pub fn state(&self, subject: &str) -> Option<PoolState> {
        self.pool(subject).map(WorkerPoolHandle::state)
    }

    /// Statistics of the pool serving `subject`
    pub fn stats(&self, subject: &str) -> Option<WorkerPoolStats> {
        self.pool(subject).map(WorkerPoolHandle::stats)
    }

    fn pool(&self, subject: &str) -> Option<&WorkerPoolHandle> {
        self.pools.iter().find(|pool| pool.subject() == subject)
    }

    /// Drain every pool
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait for every pool to stop
    pub async fn wait_stopped(self) -> Result<()> {
        let results = futures::future::join_all(
            self.pools.into_iter().map(WorkerPoolHandle::wait_stopped),
        )
        .await;
        results.into_iter().collect()
    }
}
