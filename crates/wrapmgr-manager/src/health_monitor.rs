use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::instance::{Instance, InstanceStatus};
use crate::instance_pool::InstancePool;

/// Health of one instance as judged by its latest probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// The worker answered, but not with 200.
    Degraded,
    /// The probe timed out or could not run at all.
    Unhealthy,
    Recovering,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub instance_id: String,
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub error: Option<String>,
    pub response_time_ms: Option<f64>,
    pub consecutive_failures: u32,
}

/// A restart about to be attempted.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryAction {
    pub instance_id: String,
    pub action_type: &'static str,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    pub check_interval: Duration,
    pub probe_timeout: Duration,
    /// Consecutive failures before an unhealthy instance is restarted.
    pub failure_threshold: u32,
    pub recovery_enabled: bool,
    /// Restarts tried before the instance is given up on.
    pub max_recovery_attempts: u32,
    /// Minimum gap after a restart is `backoff_base * 2^attempts`.
    pub backoff_base: Duration,
    pub restart_pause: Duration,
    pub verify_delay: Duration,
    pub history_limit: usize,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            failure_threshold: 3,
            recovery_enabled: true,
            max_recovery_attempts: 5,
            backoff_base: Duration::from_secs(30),
            restart_pause: Duration::from_secs(1),
            verify_delay: Duration::from_secs(2),
            history_limit: 100,
        }
    }
}

/// Hooks into health transitions and restarts.
#[async_trait]
pub trait RecoveryObserver: Send + Sync {
    async fn on_health_change(
        &self,
        _instance_id: &str,
        _previous: Option<HealthStatus>,
        _current: HealthStatus,
    ) {
    }

    async fn on_recovery_start(&self, _action: &RecoveryAction) {}

    async fn on_recovery_complete(&self, _instance_id: &str, _success: bool, _message: &str) {}
}

/// Writes every health event to the log.
pub struct LoggingObserver;

#[async_trait]
impl RecoveryObserver for LoggingObserver {
    async fn on_health_change(
        &self,
        instance_id: &str,
        previous: Option<HealthStatus>,
        current: HealthStatus,
    ) {
        info!("Instance {} health: {:?} -> {:?}", instance_id, previous, current);
    }

    async fn on_recovery_start(&self, action: &RecoveryAction) {
        warn!("Restarting instance {}: {}", action.instance_id, action.reason);
    }

    async fn on_recovery_complete(&self, instance_id: &str, success: bool, message: &str) {
        if success {
            info!("Instance {} recovered: {}", instance_id, message);
        } else {
            error!("Instance {} recovery failed: {}", instance_id, message);
        }
    }
}

/// Aggregates derived from an instance's check history.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InstanceHealthMetrics {
    pub total_checks: usize,
    pub healthy_count: usize,
    pub unhealthy_count: usize,
    pub avg_response_time_ms: f64,
    pub consecutive_failures: u32,
    pub recovery_attempts: u32,
    pub last_check: Option<DateTime<Utc>>,
    pub last_status: Option<HealthStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub enabled: bool,
    pub check_interval_secs: u64,
    pub failure_threshold: u32,
    pub instances: HashMap<String, InstanceHealthMetrics>,
}

#[derive(Default)]
struct Tracker {
    /// Creation time of the instance this tracker belongs to. Ids are derived
    /// from the username, so a re-added account reuses its old id.
    born: Option<DateTime<Utc>>,
    history: VecDeque<HealthCheckResult>,
    recovery_attempts: u32,
    last_recovery: Option<Instant>,
    recovering: bool,
}

impl Tracker {
    fn consecutive_failures(&self) -> u32 {
        self.history
            .iter()
            .rev()
            .take_while(|result| result.status != HealthStatus::Healthy)
            .count() as u32
    }

    fn metrics(&self) -> InstanceHealthMetrics {
        let Some(last) = self.history.back() else {
            return InstanceHealthMetrics {
                recovery_attempts: self.recovery_attempts,
                ..Default::default()
            };
        };

        let times: Vec<f64> = self
            .history
            .iter()
            .filter_map(|result| result.response_time_ms)
            .collect();
        let avg = if times.is_empty() {
            0.0
        } else {
            times.iter().sum::<f64>() / times.len() as f64
        };

        InstanceHealthMetrics {
            total_checks: self.history.len(),
            healthy_count: self.count(HealthStatus::Healthy),
            unhealthy_count: self.count(HealthStatus::Unhealthy),
            avg_response_time_ms: (avg * 100.0).round() / 100.0,
            consecutive_failures: last.consecutive_failures,
            recovery_attempts: self.recovery_attempts,
            last_check: Some(last.timestamp),
            last_status: Some(last.status),
        }
    }

    fn count(&self, status: HealthStatus) -> usize {
        self.history.iter().filter(|r| r.status == status).count()
    }
}

/// Periodically probes every instance and restarts the ones that stay down.
///
/// Restarts are bounded: after `max_recovery_attempts` failed restarts the
/// instance is marked `Failed` with `no_restart` and left alone.
pub struct HealthMonitor {
    pool: Arc<InstancePool>,
    config: HealthMonitorConfig,
    observers: Vec<Arc<dyn RecoveryObserver>>,
    trackers: Mutex<HashMap<String, Tracker>>,
    task: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl HealthMonitor {
    pub fn new(pool: Arc<InstancePool>, config: HealthMonitorConfig) -> Self {
        info!(
            "Health monitor initialized (interval={:?}, threshold={})",
            config.check_interval, config.failure_threshold
        );
        Self {
            pool,
            config,
            observers: Vec::new(),
            trackers: Mutex::new(HashMap::new()),
            task: Mutex::new(None),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RecoveryObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn config(&self) -> &HealthMonitorConfig {
        &self.config
    }

    /// Starts the background loop. Calling it while running does nothing.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            warn!("Health monitor already running");
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor.config.check_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }
                // A tick that has begun runs to completion, restarts included.
                monitor.run_once().await;
            }
        });

        *task = Some((shutdown_tx, handle));
        info!("Health monitor started");
    }

    /// Stops scheduling new ticks. Calling it while stopped does nothing.
    pub fn stop(&self) {
        if let Some((shutdown_tx, _handle)) = self.task.lock().take() {
            let _ = shutdown_tx.send(true);
            info!("Health monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Probes every instance that is not `Stopped` once, then handles the
    /// results in order.
    pub async fn run_once(&self) {
        let pooled = self.pool.list();
        self.sync_trackers(&pooled);

        let instances: Vec<_> = pooled
            .into_iter()
            .filter(|instance| instance.status() != InstanceStatus::Stopped)
            .collect();

        if instances.is_empty() {
            return;
        }
        debug!("Performing health checks on {} instances", instances.len());

        let probes = instances.iter().map(|instance| self.check_instance(instance));
        let results = join_all(probes).await;

        for result in results {
            self.process_result(result).await;
        }
    }

    /// Drops trackers of instances that left the pool or were replaced by a
    /// new instance under the same id, and opens one for every newcomer.
    fn sync_trackers(&self, pooled: &[Arc<Instance>]) {
        let born: HashMap<&str, DateTime<Utc>> = pooled
            .iter()
            .map(|instance| (instance.instance_id(), instance.created_at()))
            .collect();

        let mut trackers = self.trackers.lock();
        let before = trackers.len();
        trackers.retain(|id, tracker| born.get(id.as_str()).copied() == tracker.born);
        if trackers.len() != before {
            debug!("Dropped {} stale health trackers", before - trackers.len());
        }

        let known: HashSet<String> = trackers.keys().cloned().collect();
        for (id, created_at) in born {
            if !known.contains(id) {
                trackers.insert(
                    id.to_string(),
                    Tracker {
                        born: Some(created_at),
                        ..Default::default()
                    },
                );
            }
        }
    }

    async fn check_instance(&self, instance: &Instance) -> HealthCheckResult {
        let instance_id = instance.instance_id().to_string();
        let failures_after = || self.consecutive_failures(&instance_id) + 1;

        let Some(proxy) = instance.proxy() else {
            return HealthCheckResult {
                instance_id: instance_id.clone(),
                status: HealthStatus::Unhealthy,
                timestamp: Utc::now(),
                error: Some("No proxy available".to_string()),
                response_time_ms: None,
                consecutive_failures: failures_after(),
            };
        };

        let start = Instant::now();
        let probe = tokio::time::timeout(self.config.probe_timeout, proxy.health_check()).await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        let (status, error, response_time_ms, consecutive_failures) = match probe {
            Ok(true) => (HealthStatus::Healthy, None, Some(elapsed_ms), 0),
            Ok(false) => (
                HealthStatus::Degraded,
                Some("Health check returned false".to_string()),
                Some(elapsed_ms),
                failures_after(),
            ),
            Err(_) => (
                HealthStatus::Unhealthy,
                Some("Health check timeout".to_string()),
                None,
                failures_after(),
            ),
        };

        HealthCheckResult {
            instance_id,
            status,
            timestamp: Utc::now(),
            error,
            response_time_ms,
            consecutive_failures,
        }
    }

    async fn process_result(&self, result: HealthCheckResult) {
        let previous = {
            let mut trackers = self.trackers.lock();
            let tracker = trackers.entry(result.instance_id.clone()).or_default();
            let previous = tracker.history.back().map(|r| r.status);
            tracker.history.push_back(result.clone());
            while tracker.history.len() > self.config.history_limit {
                tracker.history.pop_front();
            }
            previous
        };

        if previous != Some(result.status) {
            for observer in &self.observers {
                observer
                    .on_health_change(&result.instance_id, previous, result.status)
                    .await;
            }
        }

        if result.status != HealthStatus::Healthy {
            warn!(
                "Instance {} health: {:?} (failures: {}, error: {})",
                result.instance_id,
                result.status,
                result.consecutive_failures,
                result.error.as_deref().unwrap_or("none")
            );
        }

        if result.status == HealthStatus::Unhealthy
            && result.consecutive_failures >= self.config.failure_threshold
        {
            self.trigger_recovery(&result).await;
        }
    }

    async fn trigger_recovery(&self, result: &HealthCheckResult) {
        let instance_id = &result.instance_id;

        if !self.config.recovery_enabled {
            warn!("Recovery disabled, skipping instance {}", instance_id);
            return;
        }

        let Some(instance) = self.pool.get(instance_id) else {
            return;
        };
        if instance.no_restart() {
            debug!("Instance {} is marked no_restart, not recovering", instance_id);
            return;
        }

        let attempts = {
            let trackers = self.trackers.lock();
            let Some(tracker) = trackers.get(instance_id) else {
                return;
            };

            if tracker.recovery_attempts < self.config.max_recovery_attempts {
                if let Some(last) = tracker.last_recovery {
                    let backoff = self.config.backoff_base * 2u32.saturating_pow(tracker.recovery_attempts);
                    if last.elapsed() < backoff {
                        debug!("Skipping recovery for {}, too soon after last attempt", instance_id);
                        return;
                    }
                }
            }
            tracker.recovery_attempts
        };

        if attempts >= self.config.max_recovery_attempts {
            error!(
                "Instance {} exceeded max recovery attempts ({}), marking as failed",
                instance_id, self.config.max_recovery_attempts
            );
            instance.mark_failed_permanently("max recovery attempts reached");
            return;
        }

        let action = RecoveryAction {
            instance_id: instance_id.clone(),
            action_type: "restart",
            reason: format!(
                "Consecutive failures: {}, error: {}",
                result.consecutive_failures,
                result.error.as_deref().unwrap_or("none")
            ),
            timestamp: Utc::now(),
        };

        self.set_recovering(instance_id, true);
        for observer in &self.observers {
            observer.on_recovery_start(&action).await;
        }

        info!(
            "Starting recovery for instance {} (attempt {}/{})",
            instance_id,
            attempts + 1,
            self.config.max_recovery_attempts
        );
        let (success, message) = self.recover(&instance).await;

        {
            let mut trackers = self.trackers.lock();
            if let Some(tracker) = trackers.get_mut(instance_id) {
                tracker.recovering = false;
                tracker.last_recovery = Some(Instant::now());
                tracker.recovery_attempts = if success { 0 } else { attempts + 1 };
            }
        }

        for observer in &self.observers {
            observer
                .on_recovery_complete(instance_id, success, &message)
                .await;
        }
    }

    /// Stop, pause, start, wait, re-probe.
    async fn recover(&self, instance: &Instance) -> (bool, String) {
        let old_status = instance.status();
        instance.set_status(InstanceStatus::Initializing);

        let Some(proxy) = instance.proxy() else {
            instance.set_status(old_status);
            return (false, "No proxy to restart".to_string());
        };

        proxy.stop().await;
        tokio::time::sleep(self.config.restart_pause).await;

        if let Err(e) = proxy.start().await {
            let message = format!("Recovery error: {}", e);
            restore_after_failed_restart(instance, old_status, &message);
            return (false, message);
        }

        tokio::time::sleep(self.config.verify_delay).await;
        let healthy = tokio::time::timeout(self.config.probe_timeout, proxy.health_check())
            .await
            .unwrap_or(false);

        if healthy {
            instance.set_status(InstanceStatus::Active);
            instance.set_error(None);
            (true, "Instance restarted successfully".to_string())
        } else {
            let message = "Instance restart failed health check".to_string();
            restore_after_failed_restart(instance, old_status, &message);
            (false, message)
        }
    }

    fn set_recovering(&self, instance_id: &str, recovering: bool) {
        if let Some(tracker) = self.trackers.lock().get_mut(instance_id) {
            tracker.recovering = recovering;
        }
    }

    fn consecutive_failures(&self, instance_id: &str) -> u32 {
        self.trackers
            .lock()
            .get(instance_id)
            .map(Tracker::consecutive_failures)
            .unwrap_or(0)
    }

    /// Latest known health, `None` before the first probe.
    pub fn health_status(&self, instance_id: &str) -> Option<HealthStatus> {
        let trackers = self.trackers.lock();
        let tracker = trackers.get(instance_id)?;
        if tracker.recovering {
            return Some(HealthStatus::Recovering);
        }
        tracker.history.back().map(|result| result.status)
    }

    pub fn history(&self, instance_id: &str) -> Vec<HealthCheckResult> {
        self.trackers
            .lock()
            .get(instance_id)
            .map(|tracker| tracker.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn metrics(&self, instance_id: &str) -> InstanceHealthMetrics {
        self.trackers
            .lock()
            .get(instance_id)
            .map(Tracker::metrics)
            .unwrap_or_default()
    }

    pub fn all_metrics(&self) -> HashMap<String, InstanceHealthMetrics> {
        self.trackers
            .lock()
            .iter()
            .map(|(id, tracker)| (id.clone(), tracker.metrics()))
            .collect()
    }

    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            enabled: self.is_running(),
            check_interval_secs: self.config.check_interval.as_secs(),
            failure_threshold: self.config.failure_threshold,
            instances: self.all_metrics(),
        }
    }
}

/// Puts back the status an instance had before a restart was attempted.
fn restore_after_failed_restart(instance: &Instance, previous: InstanceStatus, error: &str) {
    instance.set_status(previous);
    instance.set_error(Some(error.to_string()));
}
