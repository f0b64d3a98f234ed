use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use wrapmgr_metrics::ServiceMetrics;

use crate::instance::Instance;
use crate::instance_pool::InstancePool;

pub const NO_AVAILABLE_INSTANCE: &str = "no available instance";
pub const NO_PROXY: &str = "instance proxy not initialized";

/// One sample to decrypt. Built whole by [`DecryptTask::new`].
#[derive(Debug, Clone)]
pub struct DecryptTask {
    pub adam_id: String,
    pub key: String,
    pub sample: Vec<u8>,
    pub sample_index: u32,
    pub created_at: DateTime<Utc>,
}

impl DecryptTask {
    pub fn new(
        adam_id: impl Into<String>,
        key: impl Into<String>,
        sample: Vec<u8>,
        sample_index: u32,
    ) -> Self {
        Self {
            adam_id: adam_id.into(),
            key: key.into(),
            sample,
            sample_index,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptResult {
    pub success: bool,
    pub data: Vec<u8>,
    pub error: Option<String>,
    /// The instance that served the task; `None` when none was selected.
    pub instance_id: Option<String>,
}

impl DecryptResult {
    fn failed(error: impl Into<String>, instance_id: Option<String>) -> Self {
        Self {
            success: false,
            data: Vec::new(),
            error: Some(error.into()),
            instance_id,
        }
    }
}

/// Outcome of [`Dispatcher::dispatch_batch`]; `data` follows input order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchDecryptResult {
    pub success: bool,
    pub data: Vec<Vec<u8>>,
    pub error: Option<String>,
    pub instance_id: Option<String>,
}

/// Instance counts as seen by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatcherStatistics {
    pub total_instances: usize,
    pub active_instances: usize,
    pub idle_instances: usize,
    pub busy_instances: usize,
}

/// Routes decrypt work to pool instances.
///
/// Selection keeps a worker on the song it is already serving, then prefers
/// idle workers, then falls back to any active worker. The pinned song is
/// written under the same lock that reads it.
pub struct Dispatcher {
    pool: Arc<InstancePool>,
    select_lock: Mutex<()>,
    /// Open Decrypt streams holding `(instance_id, adam_id)`.
    stream_pins: parking_lot::Mutex<HashMap<(String, String), usize>>,
    metrics: Option<ServiceMetrics>,
}

impl Dispatcher {
    pub fn new(pool: Arc<InstancePool>) -> Self {
        Self {
            pool,
            select_lock: Mutex::new(()),
            stream_pins: parking_lot::Mutex::new(HashMap::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ServiceMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn pool(&self) -> &Arc<InstancePool> {
        &self.pool
    }

    /// Picks the instance that should serve `adam_id` and pins it to that song.
    pub async fn select_instance(&self, adam_id: &str) -> Option<Arc<Instance>> {
        let _guard = self.select_lock.lock().await;

        let active = self.pool.active();
        if active.is_empty() {
            return None;
        }

        let sticky = active
            .iter()
            .find(|instance| instance.last_adam_id() == adam_id)
            .cloned();

        let selected = match sticky {
            Some(instance) => {
                debug!("Reusing instance {} for {} (sticky)", instance.instance_id(), adam_id);
                instance
            }
            None => {
                let idle: Vec<_> = active
                    .iter()
                    .filter(|instance| instance.last_adam_id().is_empty())
                    .cloned()
                    .collect();

                let mut rng = rand::thread_rng();
                let (candidates, kind) = if idle.is_empty() {
                    (&active, "random")
                } else {
                    (&idle, "idle")
                };
                let instance = Arc::clone(candidates.choose(&mut rng)?);
                debug!("Selected {} instance {} for {}", kind, instance.instance_id(), adam_id);
                instance
            }
        };

        if let Some(proxy) = selected.proxy() {
            proxy.set_last_adam_id(adam_id);
        }
        Some(selected)
    }

    /// Decrypts one sample on a selected instance.
    ///
    /// Never fails outright: every problem is reported in the result.
    pub async fn dispatch(&self, task: DecryptTask) -> DecryptResult {
        let Some(instance) = self.select_instance(&task.adam_id).await else {
            error!("No available wrapper instance for {}", task.adam_id);
            return DecryptResult::failed(NO_AVAILABLE_INSTANCE, None);
        };
        let instance_id = instance.instance_id().to_string();

        let Some(proxy) = instance.proxy() else {
            error!("Instance {} has no proxy", instance_id);
            return DecryptResult::failed(NO_PROXY, Some(instance_id));
        };

        instance.touch();

        let result = match proxy
            .decrypt(&task.adam_id, &task.key, &task.sample, task.sample_index)
            .await
        {
            Ok(data) => {
                debug!(
                    "Decrypt success: {}[{}] via {}",
                    task.adam_id, task.sample_index, instance_id
                );
                DecryptResult {
                    success: true,
                    data,
                    error: None,
                    instance_id: Some(instance_id),
                }
            }
            Err(e) => {
                warn!(
                    "Decrypt failed: {}[{}] via {}: {}",
                    task.adam_id, task.sample_index, instance_id, e
                );
                DecryptResult::failed(e.to_string(), Some(instance_id))
            }
        };

        self.record(&result.instance_id, result.success);
        result
    }

    /// Decrypts every sample of one song on a single instance.
    ///
    /// Uses the worker's one-connection batch path when the instance
    /// advertises it, otherwise one exchange per sample. `progress` receives
    /// `(done, total)` every 100 samples.
    pub async fn dispatch_batch(
        &self,
        adam_id: &str,
        key: &str,
        samples: &[Vec<u8>],
        progress: Option<&(dyn Fn(usize, usize) + Send + Sync)>,
    ) -> BatchDecryptResult {
        let failed = |error: &str, instance_id: Option<String>| BatchDecryptResult {
            success: false,
            data: Vec::new(),
            error: Some(error.to_string()),
            instance_id,
        };

        let Some(instance) = self.select_instance(adam_id).await else {
            error!("No available wrapper instance for batch {}", adam_id);
            return failed(NO_AVAILABLE_INSTANCE, None);
        };
        let instance_id = instance.instance_id().to_string();
        let Some(proxy) = instance.proxy() else {
            return failed(NO_PROXY, Some(instance_id));
        };

        instance.touch();

        let outcome = if proxy.capabilities().batch_decrypt {
            proxy.decrypt_batch(adam_id, key, samples, progress).await
        } else {
            let total = samples.len();
            let mut data = Vec::with_capacity(total);
            let mut outcome = Ok(());
            for (i, sample) in samples.iter().enumerate() {
                match proxy.decrypt(adam_id, key, sample, i as u32).await {
                    Ok(chunk) => data.push(chunk),
                    Err(e) => {
                        outcome = Err(e);
                        break;
                    }
                }
                if let Some(progress) = progress {
                    if (i + 1) % 100 == 0 {
                        progress(i + 1, total);
                    }
                }
            }
            outcome.map(|()| data)
        };

        let result = match outcome {
            Ok(data) => BatchDecryptResult {
                success: true,
                data,
                error: None,
                instance_id: Some(instance_id),
            },
            Err(e) => {
                warn!("Batch decrypt of {} via {} failed: {}", adam_id, instance_id, e);
                failed(&e.to_string(), Some(instance_id))
            }
        };

        self.record(&result.instance_id, result.success);
        result
    }

    /// Unpins `adam_id` from every instance serving it.
    ///
    /// # Returns
    /// Number of instances returned to the idle set.
    pub fn release(&self, adam_id: &str) -> usize {
        self.pool
            .list()
            .iter()
            .filter_map(|instance| instance.proxy())
            .filter(|proxy| proxy.release_adam_id(adam_id))
            .count()
    }

    /// Records that an open stream holds `adam_id` on `instance_id`.
    pub fn pin(&self, instance_id: &str, adam_id: &str) {
        *self
            .stream_pins
            .lock()
            .entry((instance_id.to_string(), adam_id.to_string()))
            .or_insert(0) += 1;
    }

    /// Drops one stream's hold on `adam_id` at `instance_id`. The instance
    /// is unpinned once no open stream holds the song there.
    ///
    /// # Returns
    /// `true` if the instance went back to the idle set.
    pub fn unpin(&self, instance_id: &str, adam_id: &str) -> bool {
        let key = (instance_id.to_string(), adam_id.to_string());
        {
            let mut pins = self.stream_pins.lock();
            match pins.get_mut(&key) {
                Some(holders) if *holders > 1 => {
                    *holders -= 1;
                    return false;
                }
                Some(_) => {
                    pins.remove(&key);
                }
                None => return false,
            }
        }

        self.pool
            .get(instance_id)
            .and_then(|instance| instance.proxy().map(|proxy| proxy.release_adam_id(adam_id)))
            .unwrap_or(false)
    }

    pub fn statistics(&self) -> DispatcherStatistics {
        let instances = self.pool.list();
        let active: Vec<_> = instances
            .iter()
            .filter(|instance| instance.is_active() && instance.proxy().is_some())
            .collect();
        let idle = active
            .iter()
            .filter(|instance| instance.last_adam_id().is_empty())
            .count();

        DispatcherStatistics {
            total_instances: instances.len(),
            active_instances: active.len(),
            idle_instances: idle,
            busy_instances: active.len() - idle,
        }
    }

    fn record(&self, instance_id: &Option<String>, success: bool) {
        if let (Some(metrics), Some(instance_id)) = (&self.metrics, instance_id) {
            metrics.record_dispatch(instance_id, success);
        }
    }
}
