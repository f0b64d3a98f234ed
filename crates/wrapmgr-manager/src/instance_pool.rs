use dashmap::DashMap;
use futures::future::join_all;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};
use wrapmgr_metrics::ServiceMetrics;

use crate::auth::{AccountAuthenticator, Credentials, WorkerManagedAuth};
use crate::error::{AuthError, PoolError};
use crate::instance::{instance_id_for, Instance, InstanceStatus};
use crate::worker_proxy::{WorkerProxy, WorkerProxyConfig};

/// Parameters for bringing one account online.
#[derive(Debug, Clone)]
pub struct AddInstance {
    pub credentials: Credentials,
    pub region: String,
    /// Overrides the pool's default worker endpoint for this account.
    pub proxy_config: Option<WorkerProxyConfig>,
}

impl AddInstance {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            credentials: Credentials::new(username, password),
            region: region.into(),
            proxy_config: None,
        }
    }

    pub fn with_two_factor_code(mut self, code: impl Into<String>) -> Self {
        self.credentials = self.credentials.with_two_factor_code(code);
        self
    }

    pub fn with_proxy_config(mut self, config: WorkerProxyConfig) -> Self {
        self.proxy_config = Some(config);
        self
    }
}

/// Registry of live worker instances.
///
/// Reads (`get`, `list`, `regions`, ...) never wait on the mutation lock.
/// `add`, `remove` and the bulk operations built on them are serialized so
/// two logins of the same account cannot both start a proxy.
pub struct InstancePool {
    instances: DashMap<String, Arc<Instance>>,
    by_username: DashMap<String, String>,
    mutations: Mutex<()>,
    proxy_config: WorkerProxyConfig,
    authenticator: Arc<dyn AccountAuthenticator>,
    metrics: Option<ServiceMetrics>,
}

impl InstancePool {
    /// Creates an empty pool whose instances talk to `proxy_config`.
    pub fn new(proxy_config: WorkerProxyConfig) -> Self {
        Self {
            instances: DashMap::new(),
            by_username: DashMap::new(),
            mutations: Mutex::new(()),
            proxy_config,
            authenticator: Arc::new(WorkerManagedAuth),
            metrics: None,
        }
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn AccountAuthenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// Drops per-instance dispatch metrics when instances leave the pool.
    pub fn with_metrics(mut self, metrics: ServiceMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn proxy_config(&self) -> &WorkerProxyConfig {
        &self.proxy_config
    }

    /// Adds an account using the pool's default worker endpoint.
    ///
    /// # Errors
    /// - [`PoolError::AlreadyExists`] if the account is already loaded; the
    ///   existing instance is left untouched
    /// - [`PoolError::TwoFactorRequired`] if the authenticator wants a code
    /// - [`PoolError::StartFailed`] if the worker proxy cannot start
    pub async fn add(
        &self,
        username: &str,
        password: &str,
        region: &str,
    ) -> Result<Arc<Instance>, PoolError> {
        self.add_instance(AddInstance::new(username, password, region))
            .await
    }

    /// Adds an account with explicit options.
    pub async fn add_instance(&self, request: AddInstance) -> Result<Arc<Instance>, PoolError> {
        let _guard = self.mutations.lock().await;

        let username = request.credentials.username.clone();
        let instance_id = instance_id_for(&username);

        if self.instances.contains_key(&instance_id) {
            return Err(PoolError::AlreadyExists {
                username,
                instance_id,
            });
        }

        self.authenticator
            .authenticate(&request.credentials)
            .await
            .map_err(|e| match e {
                AuthError::TwoFactorRequired => PoolError::TwoFactorRequired {
                    username: username.clone(),
                },
                other => PoolError::AuthenticationFailed {
                    username: username.clone(),
                    reason: other.to_string(),
                },
            })?;

        let config = request
            .proxy_config
            .unwrap_or_else(|| self.proxy_config.clone());
        let proxy = Arc::new(WorkerProxy::new(
            instance_id.clone(),
            username.clone(),
            request.region.clone(),
            config,
        ));
        proxy
            .start()
            .await
            .map_err(|e| PoolError::StartFailed(e.to_string()))?;

        let instance = Arc::new(Instance::new(
            instance_id.clone(),
            username.clone(),
            request.region,
            Some(proxy),
        ));
        instance.set_status(InstanceStatus::Active);

        self.instances.insert(instance_id.clone(), Arc::clone(&instance));
        self.by_username.insert(username.clone(), instance_id.clone());

        info!("Added account {} as instance {} ({})", username, instance_id, instance.region());
        Ok(instance)
    }

    /// Stops an instance's proxy and forgets it.
    pub async fn remove(&self, instance_id: &str) -> Result<Arc<Instance>, PoolError> {
        let _guard = self.mutations.lock().await;
        self.remove_locked(instance_id).await
    }

    async fn remove_locked(&self, instance_id: &str) -> Result<Arc<Instance>, PoolError> {
        let (_, instance) = self
            .instances
            .remove(instance_id)
            .ok_or_else(|| PoolError::NotFound(instance_id.to_string()))?;

        self.by_username
            .remove_if(instance.username(), |_, id| id == instance_id);

        if let Some(proxy) = instance.proxy() {
            proxy.stop().await;
        }
        instance.set_status(InstanceStatus::Stopped);

        if let Some(metrics) = &self.metrics {
            metrics.forget_instance(instance_id);
        }

        info!("Removed account {} (instance {})", instance.username(), instance_id);
        Ok(instance)
    }

    pub fn get(&self, instance_id: &str) -> Option<Arc<Instance>> {
        self.instances.get(instance_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn get_by_username(&self, username: &str) -> Option<Arc<Instance>> {
        let instance_id = self.by_username.get(username)?.value().clone();
        self.get(&instance_id)
    }

    /// All instances, oldest first.
    pub fn list(&self) -> Vec<Arc<Instance>> {
        let mut instances: Vec<_> = self
            .instances
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        instances.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.instance_id().cmp(b.instance_id()))
        });
        instances
    }

    /// Instances that are `Active` and have a proxy, oldest first.
    pub fn active(&self) -> Vec<Arc<Instance>> {
        self.list()
            .into_iter()
            .filter(|instance| instance.is_active() && instance.proxy().is_some())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Distinct regions served by active instances, sorted.
    pub fn regions(&self) -> Vec<String> {
        self.active()
            .iter()
            .map(|instance| instance.region().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Number of active instances.
    pub fn client_count(&self) -> usize {
        self.active().len()
    }

    /// Probes every instance's worker concurrently.
    pub async fn health_check_all(&self) -> HashMap<String, bool> {
        let probes = self.list().into_iter().filter_map(|instance| {
            let proxy = instance.proxy().cloned()?;
            Some(async move { (instance.instance_id().to_string(), proxy.health_check().await) })
        });

        join_all(probes).await.into_iter().collect()
    }

    /// Removes instances idle longer than `max_idle`.
    ///
    /// Instances marked `no_restart` are left for an operator to inspect.
    ///
    /// # Returns
    /// Ids of the removed instances.
    pub async fn cleanup_idle(&self, max_idle: Duration) -> Vec<String> {
        let _guard = self.mutations.lock().await;

        let stale: Vec<String> = self
            .instances
            .iter()
            .filter(|entry| entry.idle_for() > max_idle && !entry.no_restart())
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = Vec::with_capacity(stale.len());
        for instance_id in stale {
            info!("Cleaning up idle instance {}", instance_id);
            match self.remove_locked(&instance_id).await {
                Ok(_) => removed.push(instance_id),
                Err(e) => warn!("Idle cleanup of {} failed: {}", instance_id, e),
            }
        }
        removed
    }

    /// Stops and removes every instance.
    pub async fn shutdown_all(&self) {
        let _guard = self.mutations.lock().await;
        info!("Shutting down all instances...");

        let ids: Vec<String> = self.instances.iter().map(|e| e.key().clone()).collect();
        for instance_id in ids {
            if let Err(e) = self.remove_locked(&instance_id).await {
                warn!("Shutdown of {} failed: {}", instance_id, e);
            }
        }

        info!("All instances shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct RequireCode;

    #[async_trait]
    impl AccountAuthenticator for RequireCode {
        async fn authenticate(&self, credentials: &Credentials) -> Result<(), AuthError> {
            match credentials.two_factor_code.as_deref() {
                None => Err(AuthError::TwoFactorRequired),
                Some("000000") => Ok(()),
                Some(_) => Err(AuthError::TwoFactorRejected),
            }
        }
    }

    #[tokio::test]
    async fn test_add_is_idempotent_per_username() {
        let pool = InstancePool::new(WorkerProxyConfig::default());

        let first = pool.add("alice", "pw", "us").await.unwrap();
        let err = pool.add("alice", "pw", "us").await.unwrap_err();

        match &err {
            PoolError::AlreadyExists { instance_id, .. } => {
                assert_eq!(instance_id, first.instance_id());
            }
            other => panic!("expected AlreadyExists, got {:?}", other),
        }
        assert!(err.to_string().contains("already exists"));
        assert_eq!(pool.len(), 1);
        assert_eq!(first.instance_id(), instance_id_for("alice"));
    }

    #[tokio::test]
    async fn test_lookup_by_id_and_username() {
        let pool = InstancePool::new(WorkerProxyConfig::default());
        let added = pool.add("alice", "pw", "us").await.unwrap();

        assert!(Arc::ptr_eq(&pool.get(added.instance_id()).unwrap(), &added));
        assert!(Arc::ptr_eq(&pool.get_by_username("alice").unwrap(), &added));
        assert!(pool.get_by_username("bob").is_none());
        assert!(pool.get("missing").is_none());
    }

    #[tokio::test]
    async fn test_remove_stops_proxy() {
        let pool = InstancePool::new(WorkerProxyConfig::default());
        let added = pool.add("alice", "pw", "us").await.unwrap();
        let proxy = Arc::clone(added.proxy().unwrap());
        assert!(proxy.is_active());

        let removed = pool.remove(added.instance_id()).await.unwrap();
        assert_eq!(removed.status(), InstanceStatus::Stopped);
        assert!(!proxy.is_active());
        assert!(pool.is_empty());
        assert!(pool.get_by_username("alice").is_none());

        assert!(matches!(
            pool.remove(added.instance_id()).await,
            Err(PoolError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_regions_and_client_count_only_count_active() {
        let pool = InstancePool::new(WorkerProxyConfig::default());
        pool.add("a", "pw", "us").await.unwrap();
        pool.add("b", "pw", "jp").await.unwrap();
        let c = pool.add("c", "pw", "us").await.unwrap();

        assert_eq!(pool.regions(), vec!["jp".to_string(), "us".to_string()]);
        assert_eq!(pool.client_count(), 3);

        c.mark_failed_permanently("test");
        assert_eq!(pool.client_count(), 2);
        assert_eq!(pool.len(), 3);
    }

    #[tokio::test]
    async fn test_two_factor_is_structured() {
        let pool = InstancePool::new(WorkerProxyConfig::default())
            .with_authenticator(Arc::new(RequireCode));

        let err = pool.add("alice", "pw", "us").await.unwrap_err();
        assert_eq!(
            err,
            PoolError::TwoFactorRequired {
                username: "alice".to_string()
            }
        );

        let wrong = pool
            .add_instance(AddInstance::new("alice", "pw", "us").with_two_factor_code("999999"))
            .await
            .unwrap_err();
        assert!(matches!(wrong, PoolError::AuthenticationFailed { .. }));

        let ok = pool
            .add_instance(AddInstance::new("alice", "pw", "us").with_two_factor_code("000000"))
            .await;
        assert!(ok.is_ok());
        assert_eq!(pool.client_count(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_idle_skips_no_restart() {
        let pool = InstancePool::new(WorkerProxyConfig::default());
        let keep = pool.add("keep", "pw", "us").await.unwrap();
        pool.add("drop", "pw", "us").await.unwrap();
        keep.mark_failed_permanently("inspect me");

        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(pool.cleanup_idle(Duration::from_secs(3600)).await.is_empty());

        let removed = pool.cleanup_idle(Duration::from_millis(5)).await;
        assert_eq!(removed, vec![instance_id_for("drop")]);
        assert_eq!(pool.len(), 1);
        assert!(pool.get(keep.instance_id()).is_some());
    }

    #[tokio::test]
    async fn test_shutdown_all_empties_pool() {
        let pool = InstancePool::new(WorkerProxyConfig::default());
        let a = pool.add("a", "pw", "us").await.unwrap();
        pool.add("b", "pw", "us").await.unwrap();

        pool.shutdown_all().await;
        assert!(pool.is_empty());
        assert_eq!(a.status(), InstanceStatus::Stopped);
        assert!(!a.proxy().unwrap().is_active());
    }

    #[tokio::test]
    async fn test_concurrent_adds_of_same_account() {
        let pool = Arc::new(InstancePool::new(WorkerProxyConfig::default()));
        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move { pool.add("alice", "pw", "us").await.is_ok() })
            })
            .collect();

        let mut successes = 0;
        for attempt in attempts {
            if attempt.await.unwrap() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(pool.len(), 1);
    }
}
