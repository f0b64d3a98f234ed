pub mod auth;
pub mod catalog;
pub mod dispatcher;
pub mod error;
pub mod health_monitor;
pub mod http_server;
pub mod instance;
pub mod instance_pool;
pub mod login;
pub mod manager;
pub mod rpc;
pub mod service;
pub mod wire;
pub mod worker_proxy;

pub use auth::{AccountAuthenticator, Credentials, WorkerManagedAuth};
pub use catalog::{CatalogClient, CatalogConfig};
pub use dispatcher::{DecryptResult, DecryptTask, Dispatcher, DispatcherStatistics};
pub use error::{AuthError, CatalogError, LoginError, ManagerError, PoolError, ProxyError};
pub use health_monitor::{HealthMonitor, HealthMonitorConfig, HealthStatus, RecoveryObserver};
pub use http_server::AdminServer;
pub use instance::{Instance, InstanceSnapshot, InstanceStatus};
pub use instance_pool::{AddInstance, InstancePool};
pub use login::{LoginConfig, LoginSessionManager, LoginState, LoginTicket};
pub use manager::{MaintenanceConfig, ManagerConfig, ManagerHandle, WrapperManager};
pub use service::ServiceFront;
pub use worker_proxy::{
    AccountInfo, AccountTokens, WorkerCapabilities, WorkerProxy, WorkerProxyConfig,
};
