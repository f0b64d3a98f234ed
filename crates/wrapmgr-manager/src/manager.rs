use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use wrapmgr_common::transport::RpcServer;
use wrapmgr_common::WrapmgrError;
use wrapmgr_metrics::ServiceMetrics;

use crate::auth::{AccountAuthenticator, WorkerManagedAuth};
use crate::catalog::{CatalogClient, CatalogConfig};
use crate::dispatcher::Dispatcher;
use crate::error::ManagerError;
use crate::health_monitor::{HealthMonitor, HealthMonitorConfig, LoggingObserver};
use crate::http_server::AdminServer;
use crate::instance_pool::InstancePool;
use crate::login::{LoginConfig, LoginSessionManager};
use crate::service::ServiceFront;
use crate::worker_proxy::WorkerProxyConfig;

/// Housekeeping that runs beside the service.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Time between passes.
    ///
    /// Default: 60s
    pub interval: Duration,
    /// Login sessions older than this are dropped whatever their state.
    ///
    /// Default: 600s
    pub session_max_age: Duration,
    /// Instances idle longer than this are removed. `None` keeps them.
    ///
    /// Default: `None`
    pub instance_idle_limit: Option<Duration>,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            session_max_age: Duration::from_secs(600),
            instance_idle_limit: None,
        }
    }
}

/// Everything needed to run a manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Address of the RPC front.
    ///
    /// Default: `127.0.0.1:18923`
    pub rpc_bind: String,
    /// Address of the admin HTTP server. `None` disables it.
    pub admin_bind: Option<String>,
    /// Default worker endpoint for new instances.
    pub proxy: WorkerProxyConfig,
    /// `false` runs without health probing or automatic restarts.
    pub health_enabled: bool,
    pub health: HealthMonitorConfig,
    pub login: LoginConfig,
    pub maintenance: MaintenanceConfig,
    pub catalog: CatalogConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            rpc_bind: "127.0.0.1:18923".to_string(),
            admin_bind: None,
            proxy: WorkerProxyConfig::default(),
            health_enabled: true,
            health: HealthMonitorConfig::default(),
            login: LoginConfig::default(),
            maintenance: MaintenanceConfig::default(),
            catalog: CatalogConfig::default(),
        }
    }
}

/// The wrapper manager: pool, dispatcher, health monitor, login sessions
/// and the service built on them, constructed once and shared by reference.
pub struct WrapperManager {
    config: ManagerConfig,
    pool: Arc<InstancePool>,
    login: Arc<LoginSessionManager>,
    front: Arc<ServiceFront>,
    health: Option<Arc<HealthMonitor>>,
}

impl WrapperManager {
    pub fn new(config: ManagerConfig) -> Result<Self, ManagerError> {
        Self::with_authenticator(config, Arc::new(WorkerManagedAuth))
    }

    /// Creates a manager whose pool checks credentials with `authenticator`.
    pub fn with_authenticator(
        config: ManagerConfig,
        authenticator: Arc<dyn AccountAuthenticator>,
    ) -> Result<Self, ManagerError> {
        let metrics = ServiceMetrics::new();

        let pool = Arc::new(
            InstancePool::new(config.proxy.clone())
                .with_authenticator(authenticator)
                .with_metrics(metrics.clone()),
        );
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&pool)).with_metrics(metrics.clone()));
        let login = Arc::new(LoginSessionManager::new(
            Arc::clone(&pool),
            config.login.clone(),
        ));
        let catalog = CatalogClient::new(config.catalog.clone())?;

        let health = config.health_enabled.then(|| {
            Arc::new(
                HealthMonitor::new(Arc::clone(&pool), config.health.clone())
                    .with_observer(Arc::new(LoggingObserver)),
            )
        });

        let front = Arc::new(ServiceFront::new(
            Arc::clone(&pool),
            dispatcher,
            Arc::clone(&login),
            catalog,
            metrics,
        ));

        Ok(Self {
            config,
            pool,
            login,
            front,
            health,
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<InstancePool> {
        &self.pool
    }

    pub fn service(&self) -> &Arc<ServiceFront> {
        &self.front
    }

    pub fn health_monitor(&self) -> Option<&Arc<HealthMonitor>> {
        self.health.as_ref()
    }

    /// One housekeeping pass.
    pub async fn run_maintenance(&self) {
        let expired = self
            .login
            .cleanup_expired(self.config.maintenance.session_max_age);
        if expired > 0 {
            info!("Removed {} expired login session(s)", expired);
        }

        if let Some(limit) = self.config.maintenance.instance_idle_limit {
            let removed = self.pool.cleanup_idle(limit).await;
            if !removed.is_empty() {
                info!("Removed {} idle instance(s)", removed.len());
            }
        }
    }

    /// Binds the RPC front (and admin server if configured) and starts the
    /// background loops.
    ///
    /// # Returns
    /// A handle with the bound addresses; dropping it does not stop anything,
    /// call [`ManagerHandle::shutdown`].
    pub async fn start(self: &Arc<Self>) -> Result<ManagerHandle, ManagerError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let rpc = RpcServer::new(&self.config.rpc_bind).await?;
        let rpc_addr = rpc.local_addr()?;
        let front = Arc::clone(&self.front);
        let signal = shutdown_signal(shutdown_rx.clone());
        tasks.push(tokio::spawn(async move {
            if let Err(e) = rpc.run_until(front, signal).await {
                error!("RPC server stopped: {}", e);
            }
        }));
        info!("Wrapper manager RPC listening on {}", rpc_addr);

        let admin_addr = match &self.config.admin_bind {
            Some(bind) => {
                let listener = TcpListener::bind(bind).await.map_err(|e| {
                    WrapmgrError::Transport(format!("Failed to bind to {}: {}", bind, e))
                })?;
                let addr = listener.local_addr().map_err(WrapmgrError::from)?;
                let server = AdminServer::new(Arc::clone(&self.front), self.health.clone());
                let signal = shutdown_signal(shutdown_rx.clone());
                tasks.push(tokio::spawn(async move {
                    if let Err(e) = server.serve(listener, signal).await {
                        error!("Admin server stopped: {}", e);
                    }
                }));
                Some(addr)
            }
            None => None,
        };

        if let Some(health) = &self.health {
            health.start();
        }

        let manager = Arc::clone(self);
        let mut maintenance_rx = shutdown_rx;
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.config.maintenance.interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => manager.run_maintenance().await,
                    _ = maintenance_rx.changed() => break,
                }
            }
        }));

        self.front.set_ready(true);
        info!("Wrapper manager started");

        Ok(ManagerHandle {
            manager: Arc::clone(self),
            rpc_addr,
            admin_addr,
            shutdown_tx,
            tasks,
        })
    }

    /// Marks the service not ready, stops health probing and removes every
    /// instance.
    pub async fn shutdown(&self) {
        info!("Stopping wrapper manager...");
        self.front.set_ready(false);
        if let Some(health) = &self.health {
            health.stop();
        }
        self.pool.shutdown_all().await;
        info!("Wrapper manager stopped");
    }
}

async fn shutdown_signal(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// A running manager.
pub struct ManagerHandle {
    manager: Arc<WrapperManager>,
    rpc_addr: SocketAddr,
    admin_addr: Option<SocketAddr>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ManagerHandle {
    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc_addr
    }

    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin_addr
    }

    pub fn manager(&self) -> &Arc<WrapperManager> {
        &self.manager
    }

    /// Stops accepting connections, waits for the server loops to exit and
    /// shuts the manager down.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Manager task ended abnormally: {}", e);
            }
        }
        self.manager.shutdown().await;
    }
}
