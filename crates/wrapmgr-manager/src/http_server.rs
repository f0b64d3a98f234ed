//! Admin HTTP server
//!
//! Read-only JSON views of the manager for operators and dashboards:
//!
//! | route | body |
//! |-------|------|
//! | `GET /__health` | `OK` |
//! | `GET /status` | pool aggregates, same as the Status call |
//! | `GET /instances` | every instance with its latest health |
//! | `GET /metrics` | call and dispatch metrics |
//! | `GET /dispatcher` | idle/busy instance counts |
//! | `GET /health` | health monitor summary |

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;
use wrapmgr_common::protocol::error::WrapmgrError;

use crate::health_monitor::{HealthMonitor, HealthStatus};
use crate::instance::InstanceSnapshot;
use crate::service::ServiceFront;

#[derive(Clone)]
struct AdminState {
    front: Arc<ServiceFront>,
    health: Option<Arc<HealthMonitor>>,
}

/// One row of `GET /instances`.
#[derive(Debug, Serialize)]
pub struct InstanceView {
    #[serde(flatten)]
    pub instance: InstanceSnapshot,
    pub health: Option<HealthStatus>,
}

/// HTTP server for the admin endpoints.
pub struct AdminServer {
    state: AdminState,
}

impl AdminServer {
    /// Creates a new admin server.
    ///
    /// # Arguments
    /// * `front` - The service whose state is exposed
    /// * `health` - Health monitor, if one is running
    pub fn new(front: Arc<ServiceFront>, health: Option<Arc<HealthMonitor>>) -> Self {
        Self {
            state: AdminState { front, health },
        }
    }

    /// Builds the axum router with CORS enabled.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/__health", get(health_check))
            .route("/status", get(status))
            .route("/instances", get(instances))
            .route("/metrics", get(metrics))
            .route("/dispatcher", get(dispatcher))
            .route("/health", get(health_summary))
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Binds `addr` and serves until the process exits.
    pub async fn run(self, addr: SocketAddr) -> Result<(), WrapmgrError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| WrapmgrError::Transport(format!("Failed to bind to {}: {}", addr, e)))?;
        self.serve(listener, std::future::pending()).await
    }

    /// Serves on an already bound listener until `shutdown` resolves.
    pub async fn serve<S>(self, listener: TcpListener, shutdown: S) -> Result<(), WrapmgrError>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        info!(
            "Admin HTTP server listening on {}",
            listener
                .local_addr()
                .map_err(|e| WrapmgrError::Transport(format!("Failed to get local addr: {}", e)))?
        );

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| WrapmgrError::Transport(format!("Server error: {}", e)))
    }
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn status(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.front.status().data)
}

async fn instances(State(state): State<AdminState>) -> Json<Vec<InstanceView>> {
    let views = state
        .front
        .pool()
        .list()
        .iter()
        .map(|instance| InstanceView {
            instance: instance.snapshot(),
            health: state
                .health
                .as_ref()
                .and_then(|monitor| monitor.health_status(instance.instance_id())),
        })
        .collect();
    Json(views)
}

async fn metrics(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.front.metrics().snapshot())
}

async fn dispatcher(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.front.dispatcher().statistics())
}

async fn health_summary(State(state): State<AdminState>) -> axum::response::Response {
    match &state.health {
        Some(monitor) => Json(monitor.summary()).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Health monitor not enabled"})),
        )
            .into_response(),
    }
}
