//! Periodic process-info reporting for the current process

use crate::client::MonitorClient;
use chrono::Utc;
use condensat_bus::CancellationToken;
use condensat_lib::models::ProcessInfo;
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

/// Samples the current process and publishes it on a fixed cadence
pub struct ProcessInfoReporter {
    client: MonitorClient,
    app_name: String,
    hostname: String,
    interval: Duration,
    system: System,
    pid: Option<Pid>,
}

impl ProcessInfoReporter {
    /// Create a reporter for `app_name`
    pub fn new(client: MonitorClient, app_name: impl Into<String>, interval: Duration) -> Self {
        let pid = sysinfo::get_current_pid()
            .inspect_err(|e| warn!(error = %e, "Current pid unavailable, reporting without metrics"))
            .ok();

        Self {
            client,
            app_name: app_name.into(),
            hostname: local_hostname(),
            interval,
            system: System::new(),
            pid,
        }
    }

    /// Take one sample of the current process
    pub fn sample(&mut self) -> ProcessInfo {
        let mut info = ProcessInfo::new(&self.app_name, &self.hostname, Utc::now());
        let Some(pid) = self.pid else {
            return info;
        };

        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::everything(),
        );

        if let Some(process) = self.system.process(pid) {
            info.pid = pid.as_u32();
            let cpu = process.cpu_usage();
            info.cpu_usage = if cpu.is_finite() { f64::from(cpu) } else { 0.0 };
            info.memory_rss = process.memory();
            info.memory_virtual = process.virtual_memory();
            info.uptime_secs = process.run_time();
            info.thread_count = process
                .tasks()
                .map_or(1, |tasks| u32::try_from(tasks.len()).unwrap_or(u32::MAX));
        }

        info
    }

    /// Publish samples until `cancel` fires
    #[instrument(skip_all, fields(app_name = %self.app_name))]
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs(), "Process-info reporter started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let sample = self.sample();
                    match self.client.push_process_info(&sample).await {
                        Ok(()) => debug!(cpu_usage = sample.cpu_usage, memory_rss = sample.memory_rss, "Process info reported"),
                        Err(e) => warn!(error = %e, "Failed to report process info"),
                    }
                }
            }
        }

        info!("Process-info reporter stopped");
    }
}

/// Hostname reported for this machine
pub fn local_hostname() -> String {
    System::host_name().unwrap_or_else(|| "localhost".to_owned())
}
