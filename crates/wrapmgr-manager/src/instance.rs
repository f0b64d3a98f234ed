use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::worker_proxy::WorkerProxy;

/// Namespace for deterministic instance ids.
const INSTANCE_NAMESPACE: Uuid = Uuid::from_u128(0x7777_7777_7777_7777_7777_7777_7777_7777);

/// Stable instance id for an account: UUIDv5 of the username.
pub fn instance_id_for(username: &str) -> String {
    Uuid::new_v5(&INSTANCE_NAMESPACE, username.as_bytes()).to_string()
}

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Initializing,
    Active,
    Failed,
    Stopped,
}

#[derive(Debug)]
struct InstanceState {
    status: InstanceStatus,
    last_used: Instant,
    last_used_at: DateTime<Utc>,
    no_restart: bool,
    error: Option<String>,
}

/// One account-bound worker known to the pool.
///
/// Identity fields are immutable; status and usage live behind a lock so the
/// dispatcher and health monitor can update them through a shared `Arc`.
#[derive(Debug)]
pub struct Instance {
    instance_id: String,
    username: String,
    region: String,
    created_at: DateTime<Utc>,
    proxy: Option<Arc<WorkerProxy>>,
    state: RwLock<InstanceState>,
}

impl Instance {
    pub fn new(
        instance_id: impl Into<String>,
        username: impl Into<String>,
        region: impl Into<String>,
        proxy: Option<Arc<WorkerProxy>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            instance_id: instance_id.into(),
            username: username.into(),
            region: region.into(),
            created_at: now,
            proxy,
            state: RwLock::new(InstanceState {
                status: InstanceStatus::Initializing,
                last_used: Instant::now(),
                last_used_at: now,
                no_restart: false,
                error: None,
            }),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn proxy(&self) -> Option<&Arc<WorkerProxy>> {
        self.proxy.as_ref()
    }

    pub fn status(&self) -> InstanceStatus {
        self.state.read().status
    }

    pub fn set_status(&self, status: InstanceStatus) {
        self.state.write().status = status;
    }

    pub fn is_active(&self) -> bool {
        self.status() == InstanceStatus::Active
    }

    /// Records that the instance just served a request.
    pub fn touch(&self) {
        let mut state = self.state.write();
        state.last_used = Instant::now();
        state.last_used_at = Utc::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.state.read().last_used.elapsed()
    }

    pub fn no_restart(&self) -> bool {
        self.state.read().no_restart
    }

    /// Gives up on the instance: `Failed`, never restarted again.
    pub fn mark_failed_permanently(&self, reason: impl Into<String>) {
        let mut state = self.state.write();
        state.status = InstanceStatus::Failed;
        state.no_restart = true;
        state.error = Some(reason.into());
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.read().error.clone()
    }

    pub fn set_error(&self, error: Option<String>) {
        self.state.write().error = error;
    }

    /// The song this instance is pinned to, empty when idle or proxy-less.
    pub fn last_adam_id(&self) -> String {
        self.proxy
            .as_ref()
            .map(|proxy| proxy.last_adam_id())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        let state = self.state.read();
        InstanceSnapshot {
            instance_id: self.instance_id.clone(),
            username: self.username.clone(),
            region: self.region.clone(),
            status: state.status,
            created_at: self.created_at,
            last_used: state.last_used_at,
            no_restart: state.no_restart,
            error: state.error.clone(),
            last_adam_id: self.last_adam_id(),
        }
    }
}

/// Serializable view of an instance for status endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub instance_id: String,
    pub username: String,
    pub region: String,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub no_restart: bool,
    pub error: Option<String>,
    pub last_adam_id: String,
}
