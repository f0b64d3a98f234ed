use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode, Uri},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// What the mock catalog saw on its most recent lyrics request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogRequest {
    pub path: String,
    pub authorization: Option<String>,
    pub media_user_token: Option<String>,
    pub language: Option<String>,
}

#[derive(Default)]
struct CatalogState {
    lyrics: Mutex<HashMap<String, String>>,
    error_body: Mutex<Option<String>>,
    status: Mutex<Option<u16>>,
    last_request: Mutex<Option<CatalogRequest>>,
}

/// A fake catalog API serving `syllable-lyrics`.
pub struct MockCatalog {
    state: Arc<CatalogState>,
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl MockCatalog {
    /// # Panics
    /// If the port cannot be bound.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock catalog");
        let addr = listener.local_addr().expect("mock catalog has no address");
        let state = Arc::new(CatalogState::default());

        let app = Router::new()
            .route(
                "/v1/catalog/{region}/songs/{adam_id}/syllable-lyrics",
                get(syllable_lyrics),
            )
            .with_state(Arc::clone(&state));
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { state, addr, task }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn set_lyrics(&self, adam_id: impl Into<String>, ttml: impl Into<String>) {
        self.state.lyrics.lock().insert(adam_id.into(), ttml.into());
    }

    /// Replaces every successful answer with `body`, sent as JSON with 200.
    pub fn set_error_body(&self, body: impl Into<String>) {
        *self.state.error_body.lock() = Some(body.into());
    }

    /// Answers every request with `status` and an empty body.
    pub fn set_status(&self, status: u16) {
        *self.state.status.lock() = Some(status);
    }

    pub fn last_request(&self) -> Option<CatalogRequest> {
        self.state.last_request.lock().clone()
    }
}

impl Drop for MockCatalog {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

async fn syllable_lyrics(
    State(state): State<Arc<CatalogState>>,
    Path((_region, adam_id)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    uri: Uri,
) -> axum::response::Response {
    *state.last_request.lock() = Some(CatalogRequest {
        path: uri.path().to_string(),
        authorization: header_value(&headers, header::AUTHORIZATION.as_str()),
        media_user_token: header_value(&headers, "media-user-token"),
        language: query.get("l[lyrics]").cloned(),
    });

    if let Some(code) = *state.status.lock() {
        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return status.into_response();
    }

    if let Some(body) = state.error_body.lock().clone() {
        return ([(header::CONTENT_TYPE, "application/json")], body).into_response();
    }

    let ttml = state.lyrics.lock().get(&adam_id).cloned();
    let data = match ttml {
        Some(ttml) => json!([{
            "id": adam_id,
            "type": "syllable-lyrics",
            "attributes": { "ttmlLocalizations": ttml },
        }]),
        None => json!([]),
    };
    Json(json!({ "data": data })).into_response()
}
