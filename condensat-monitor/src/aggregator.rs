//! Latest-state and windowed history of process-info samples
//!
//! State is split per service: the service table sits behind an `RwLock` and
//! every service has its own `Mutex`, so ingesting samples for unrelated
//! services never contends on the same lock.

use crate::error::{MonitorError, Result};
use chrono::{DateTime, Utc};
use condensat_lib::config::MonitorConfig;
use condensat_lib::models::{ProcessInfo, StackListService, StackServiceHistory};
use condensat_lib::storage::{Storage, StorageExt, Tables};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Aggregation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatorSettings {
    /// Default bucket width
    pub step: Duration,
    /// Default timestamp rounding
    pub round: Duration,
    /// History kept behind the newest sample of a service
    pub retention: Duration,
    /// Default look-back window of stack list queries
    pub since: Duration,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self::from(&MonitorConfig::default())
    }
}

impl From<&MonitorConfig> for AggregatorSettings {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            step: config.step(),
            round: config.round(),
            retention: config.retention(),
            since: config.since(),
        }
    }
}

#[derive(Debug, Default)]
struct ServiceState {
    /// Newest sample per hostname
    latest: HashMap<String, ProcessInfo>,
    /// Samples ordered by timestamp, arrival order among equal timestamps
    history: Vec<ProcessInfo>,
}

impl ServiceState {
    /// Insert a sample; returns samples evicted by retention
    fn insert(&mut self, info: ProcessInfo, retention: Duration) -> Vec<ProcessInfo> {
        let newer = self
            .latest
            .get(&info.hostname)
            .is_none_or(|current| current.timestamp <= info.timestamp);
        if newer {
            self.latest.insert(info.hostname.clone(), info.clone());
        }

        let position = self
            .history
            .partition_point(|sample| sample.timestamp <= info.timestamp);
        self.history.insert(position, info);

        let Some(newest) = self.history.last().map(|sample| sample.timestamp) else {
            return Vec::new();
        };
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return Vec::new();
        };
        let Some(cutoff) = newest.checked_sub_signed(retention) else {
            return Vec::new();
        };
        let expired = self.history.partition_point(|sample| sample.timestamp < cutoff);
        self.history.drain(..expired).collect()
    }

    /// Most recent sample with `from <= ts <= to`
    fn latest_within(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Option<&ProcessInfo> {
        self.history
            .iter()
            .rev()
            .find(|sample| sample.timestamp <= to)
            .filter(|sample| sample.timestamp >= from)
    }
}

/// Telemetry aggregator
pub struct Aggregator {
    services: RwLock<HashMap<String, Arc<Mutex<ServiceState>>>>,
    settings: AggregatorSettings,
    storage: Option<Arc<dyn Storage>>,
}

impl Aggregator {
    /// Create an in-memory aggregator
    pub fn new(settings: AggregatorSettings) -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            settings,
            storage: None,
        }
    }

    /// Create an aggregator writing every sample through to storage
    pub fn with_storage(settings: AggregatorSettings, storage: Arc<dyn Storage>) -> Self {
        Self {
            storage: Some(storage),
            ..Self::new(settings)
        }
    }

    /// Aggregation parameters
    pub fn settings(&self) -> &AggregatorSettings {
        &self.settings
    }

    /// Reload persisted samples; returns how many were loaded
    pub async fn restore(&self) -> Result<usize> {
        let Some(storage) = &self.storage else {
            return Ok(0);
        };

        let samples: Vec<ProcessInfo> = storage.query_json(Tables::PROCESS_INFO.name, "")?;
        let count = samples.len();
        for sample in samples {
            if let Err(e) = self.ingest(sample, false).await {
                warn!(error = %e, "Skipping persisted sample");
            }
        }

        info!(count, "Restored process-info history");
        Ok(count)
    }

    /// Ingest one process-info sample
    pub async fn add_process_info(&self, info: ProcessInfo) -> Result<()> {
        self.ingest(info, true).await
    }

    async fn ingest(&self, info: ProcessInfo, persist: bool) -> Result<()> {
        if info.app_name.trim().is_empty() {
            return Err(MonitorError::AddProcessInfo("app_name is empty".to_owned()));
        }
        if info.hostname.trim().is_empty() {
            return Err(MonitorError::AddProcessInfo(format!(
                "hostname is empty for {}",
                info.app_name
            )));
        }

        let service = self.service(&info.app_name).await;
        let stored = persist.then(|| info.clone());
        let evicted = service.lock().await.insert(info, self.settings.retention);

        if !evicted.is_empty() {
            debug!(count = evicted.len(), "Evicted samples past retention");
        }

        if let Some(storage) = &self.storage {
            if let Some(sample) = &stored {
                storage.upsert_json(Tables::PROCESS_INFO.name, &sample.storage_key(), sample)?;
            }
            // Restored samples past retention are removed as well
            for sample in &evicted {
                storage.delete(Tables::PROCESS_INFO.name, &sample.storage_key())?;
            }
        }

        Ok(())
    }

    async fn service(&self, app_name: &str) -> Arc<Mutex<ServiceState>> {
        if let Some(service) = self.services.read().await.get(app_name) {
            return service.clone();
        }
        self.services
            .write()
            .await
            .entry(app_name.to_owned())
            .or_default()
            .clone()
    }

    async fn snapshot(&self) -> BTreeMap<String, Arc<Mutex<ServiceState>>> {
        self.services
            .read()
            .await
            .iter()
            .map(|(name, state)| (name.clone(), state.clone()))
            .collect()
    }

    /// Known service names, ascending
    pub async fn services(&self) -> Vec<String> {
        self.snapshot().await.into_keys().collect()
    }

    /// Newest sample of every instance of a service, ordered by hostname
    pub async fn instances(&self, app_name: &str) -> Vec<ProcessInfo> {
        let Some(service) = self.services.read().await.get(app_name).cloned() else {
            return Vec::new();
        };
        let state = service.lock().await;
        let mut instances: Vec<ProcessInfo> = state.latest.values().cloned().collect();
        instances.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        instances
    }

    /// Latest sample of every service seen in `[now - since, now]`
    pub async fn last_services_status(&self, now: DateTime<Utc>, since: Duration) -> StackListService {
        let from = chrono::Duration::from_std(since)
            .ok()
            .and_then(|since| now.checked_sub_signed(since))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut result = StackListService {
            since,
            ..StackListService::default()
        };

        for (app_name, service) in self.snapshot().await {
            let state = service.lock().await;
            if let Some(sample) = state.latest_within(from, now) {
                result.services.push(app_name);
                result.processes.push(sample.clone());
            }
        }

        result
    }

    /// Bucketed history of one service over `[from, to]`
    ///
    /// Timestamps are truncated to a multiple of `round` (epoch aligned) and
    /// assigned to bucket `floor((truncated - from) / step)`. Each bucket keeps
    /// its most recent sample. Samples truncated before `from` are dropped and
    /// buckets past the last one fold into it. A zero `step` or `round` falls
    /// back to the configured default.
    pub async fn service_history(
        &self,
        app_name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        step: Duration,
        round: Duration,
    ) -> Result<StackServiceHistory> {
        if from > to {
            return Err(MonitorError::InvalidRequest(format!(
                "from ({from}) is after to ({to})"
            )));
        }

        let step = if step.is_zero() { self.settings.step } else { step };
        let round = if round.is_zero() { self.settings.round } else { round };
        let step_us = duration_micros(step)?;
        let round_us = duration_micros(round)?;

        let mut history = StackServiceHistory {
            app_name: app_name.to_owned(),
            from,
            to,
            step,
            round,
            history: Vec::new(),
        };

        let span_us = (to - from).num_microseconds().ok_or_else(|| {
            MonitorError::InvalidRequest("requested window is too large".to_owned())
        })?;
        let bucket_count = span_us.div_euclid(step_us) + i64::from(span_us.rem_euclid(step_us) != 0);
        if bucket_count == 0 {
            return Ok(history);
        }

        let Some(service) = self.services.read().await.get(app_name).cloned() else {
            return Ok(history);
        };

        let from_us = from.timestamp_micros();
        let mut buckets: BTreeMap<i64, ProcessInfo> = BTreeMap::new();
        {
            let state = service.lock().await;
            for sample in state
                .history
                .iter()
                .filter(|sample| sample.timestamp >= from && sample.timestamp <= to)
            {
                let ts_us = sample.timestamp.timestamp_micros();
                let truncated = ts_us - ts_us.rem_euclid(round_us);
                let offset = truncated - from_us;
                if offset < 0 {
                    continue;
                }
                let bucket = (offset / step_us).min(bucket_count - 1);

                let replace = buckets
                    .get(&bucket)
                    .is_none_or(|kept| kept.timestamp <= sample.timestamp);
                if replace {
                    buckets.insert(bucket, sample.clone());
                }
            }
        }

        history.history = buckets.into_values().collect();
        Ok(history)
    }
}

fn duration_micros(duration: Duration) -> Result<i64> {
    i64::try_from(duration.as_micros())
        .ok()
        .filter(|us| *us > 0)
        .ok_or_else(|| MonitorError::InvalidRequest(format!("invalid duration {duration:?}")))
}
