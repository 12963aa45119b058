//! Typed client for the monitor subjects

use crate::error::{MonitorError, Result};
use chrono::{DateTime, Utc};
use condensat_bus::subject::monitor;
use condensat_bus::{CancellationToken, MessageBus};
use condensat_lib::models::{
    ProcessInfo, StackListRequest, StackListService, StackServiceHistory,
    StackServiceHistoryRequest,
};
use std::sync::Arc;
use std::time::Duration;

/// Client for pushing telemetry and querying the monitor
#[derive(Clone)]
pub struct MonitorClient {
    bus: Arc<MessageBus>,
    timeout: Duration,
}

impl MonitorClient {
    /// Create a client using the bus default RPC timeout
    pub fn new(bus: Arc<MessageBus>) -> Self {
        let timeout = bus.rpc_timeout();
        Self { bus, timeout }
    }

    /// Override the request timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Publish a process-info sample
    pub async fn push_process_info(&self, info: &ProcessInfo) -> Result<()> {
        self.bus.publish_typed(monitor::INBOUND, info).await?;
        Ok(())
    }

    /// Latest status of every service seen within `since` (zero for the server default)
    ///
    /// `since` must be whole seconds.
    pub async fn stack_list(
        &self,
        since: Duration,
        cancel: &CancellationToken,
    ) -> Result<StackListService> {
        let request = StackListRequest {
            since_secs: whole_secs("since", since)?,
        };
        Ok(self
            .bus
            .request_typed(monitor::STACK_LIST, &request, self.timeout, cancel)
            .await?)
    }

    /// Bucketed history of one service
    ///
    /// `step` and `round` travel as whole seconds; zero selects the server
    /// default and a fractional second is rejected before anything is sent.
    pub async fn service_history(
        &self,
        app_name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        step: Duration,
        round: Duration,
        cancel: &CancellationToken,
    ) -> Result<StackServiceHistory> {
        let request = StackServiceHistoryRequest {
            app_name: app_name.to_owned(),
            from,
            to,
            step_secs: whole_secs("step", step)?,
            round_secs: whole_secs("round", round)?,
        };
        Ok(self
            .bus
            .request_typed(monitor::STACK_SERVICE_HISTORY, &request, self.timeout, cancel)
            .await?)
    }
}

fn whole_secs(name: &str, duration: Duration) -> Result<u64> {
    if duration.subsec_nanos() != 0 {
        return Err(MonitorError::InvalidRequest(format!(
            "{name} must be whole seconds, got {duration:?}"
        )));
    }
    Ok(duration.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whole_seconds_pass_through() {
        assert_eq!(whole_secs("step", Duration::from_secs(60)).unwrap(), 60);
        assert_eq!(whole_secs("step", Duration::ZERO).unwrap(), 0);
    }

    #[test]
    fn test_fractional_seconds_are_rejected() {
        for duration in [Duration::from_millis(500), Duration::from_millis(1500)] {
            assert!(matches!(
                whole_secs("round", duration),
                Err(MonitorError::InvalidRequest(_))
            ));
        }
    }
}
