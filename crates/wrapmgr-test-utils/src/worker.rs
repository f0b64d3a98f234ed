use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use parking_lot::Mutex;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::debug;

/// Byte every sample is XORed with by the mock decrypt port.
pub const MOCK_KEY_BYTE: u8 = 0x5A;

/// What the mock worker returns for `sample`.
pub fn mock_decrypt(sample: &[u8]) -> Vec<u8> {
    sample.iter().map(|b| b ^ MOCK_KEY_BYTE).collect()
}

/// Knobs and counters shared by the mock worker's listeners.
#[derive(Debug)]
pub struct WorkerState {
    healthy: AtomicBool,
    account_delay: Mutex<Duration>,
    m3u8_reply: Mutex<Option<String>>,
    tokens: Mutex<(String, String)>,
    decrypt_connections: AtomicUsize,
    samples_decrypted: AtomicUsize,
    m3u8_requests: AtomicUsize,
    account_requests: AtomicUsize,
}

impl Default for WorkerState {
    fn default() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            account_delay: Mutex::new(Duration::ZERO),
            m3u8_reply: Mutex::new(None),
            tokens: Mutex::new(("mock-dev-token".to_string(), "mock-media-token".to_string())),
            decrypt_connections: AtomicUsize::new(0),
            samples_decrypted: AtomicUsize::new(0),
            m3u8_requests: AtomicUsize::new(0),
            account_requests: AtomicUsize::new(0),
        }
    }
}

impl WorkerState {
    /// `false` makes `/account` answer 503.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Delay applied before `/account` answers.
    pub fn set_account_delay(&self, delay: Duration) {
        *self.account_delay.lock() = delay;
    }

    /// Fixed line returned by the M3U8 port. Without one the port answers
    /// `https://mock.invalid/<adam_id>/playlist.m3u8`.
    pub fn set_m3u8_reply(&self, line: impl Into<String>) {
        *self.m3u8_reply.lock() = Some(line.into());
    }

    pub fn set_tokens(&self, dev_token: impl Into<String>, media_token: impl Into<String>) {
        *self.tokens.lock() = (dev_token.into(), media_token.into());
    }

    pub fn decrypt_connections(&self) -> usize {
        self.decrypt_connections.load(Ordering::SeqCst)
    }

    pub fn samples_decrypted(&self) -> usize {
        self.samples_decrypted.load(Ordering::SeqCst)
    }

    pub fn m3u8_requests(&self) -> usize {
        self.m3u8_requests.load(Ordering::SeqCst)
    }

    pub fn account_requests(&self) -> usize {
        self.account_requests.load(Ordering::SeqCst)
    }
}

/// A fake worker listening on three ephemeral ports.
pub struct MockWorker {
    state: Arc<WorkerState>,
    decrypt_addr: SocketAddr,
    m3u8_addr: SocketAddr,
    account_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl MockWorker {
    /// Binds all three listeners and starts serving.
    ///
    /// # Panics
    /// If a port cannot be bound.
    pub async fn start() -> Self {
        let state = Arc::new(WorkerState::default());

        let decrypt = bind().await;
        let m3u8 = bind().await;
        let account = bind().await;
        let decrypt_addr = local_addr(&decrypt);
        let m3u8_addr = local_addr(&m3u8);
        let account_addr = local_addr(&account);

        let tasks = vec![
            tokio::spawn(accept_loop(decrypt, Arc::clone(&state), serve_decrypt)),
            tokio::spawn(accept_loop(m3u8, Arc::clone(&state), serve_m3u8)),
            tokio::spawn(serve_account(account, Arc::clone(&state))),
        ];

        Self {
            state,
            decrypt_addr,
            m3u8_addr,
            account_addr,
            tasks,
        }
    }

    pub fn host(&self) -> String {
        self.decrypt_addr.ip().to_string()
    }

    pub fn decrypt_port(&self) -> u16 {
        self.decrypt_addr.port()
    }

    pub fn m3u8_port(&self) -> u16 {
        self.m3u8_addr.port()
    }

    pub fn account_port(&self) -> u16 {
        self.account_addr.port()
    }

    /// Shared handle to the worker's knobs, usable after the worker moves.
    pub fn state(&self) -> Arc<WorkerState> {
        Arc::clone(&self.state)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.state.set_healthy(healthy);
    }

    pub fn set_account_delay(&self, delay: Duration) {
        self.state.set_account_delay(delay);
    }

    pub fn set_m3u8_reply(&self, line: impl Into<String>) {
        self.state.set_m3u8_reply(line);
    }

    pub fn set_tokens(&self, dev_token: impl Into<String>, media_token: impl Into<String>) {
        self.state.set_tokens(dev_token, media_token);
    }
}

impl Drop for MockWorker {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn bind() -> TcpListener {
    TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind mock listener")
}

fn local_addr(listener: &TcpListener) -> SocketAddr {
    listener.local_addr().expect("mock listener has no address")
}

async fn accept_loop<F, Fut>(listener: TcpListener, state: Arc<WorkerState>, serve: F)
where
    F: Fn(TcpStream, Arc<WorkerState>) -> Fut + Send + Copy + 'static,
    Fut: std::future::Future<Output = std::io::Result<()>> + Send + 'static,
{
    while let Ok((stream, _)) = listener.accept().await {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = serve(stream, state).await {
                debug!("mock worker connection ended: {}", e);
            }
        });
    }
}

async fn read_short_field(stream: &mut TcpStream) -> std::io::Result<String> {
    let len = stream.read_u8().await? as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

async fn serve_decrypt(mut stream: TcpStream, state: Arc<WorkerState>) -> std::io::Result<()> {
    state.decrypt_connections.fetch_add(1, Ordering::SeqCst);
    let _adam_id = read_short_field(&mut stream).await?;
    let _key = read_short_field(&mut stream).await?;

    loop {
        let len = match stream.read_u32_le().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        let mut sample = vec![0u8; len];
        stream.read_exact(&mut sample).await?;
        stream.write_all(&mock_decrypt(&sample)).await?;
        state.samples_decrypted.fetch_add(1, Ordering::SeqCst);
    }
}

async fn serve_m3u8(mut stream: TcpStream, state: Arc<WorkerState>) -> std::io::Result<()> {
    state.m3u8_requests.fetch_add(1, Ordering::SeqCst);
    let adam_id = read_short_field(&mut stream).await?;
    let line = state
        .m3u8_reply
        .lock()
        .clone()
        .unwrap_or_else(|| format!("https://mock.invalid/{}/playlist.m3u8", adam_id));
    stream.write_all(format!("{}\n", line).as_bytes()).await?;
    stream.shutdown().await
}

async fn serve_account(listener: TcpListener, state: Arc<WorkerState>) {
    let app = Router::new()
        .route("/account", get(account))
        .with_state(state);
    let _ = axum::serve(listener, app).await;
}

async fn account(State(state): State<Arc<WorkerState>>) -> axum::response::Response {
    state.account_requests.fetch_add(1, Ordering::SeqCst);
    let delay = *state.account_delay.lock();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    if !state.healthy.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let (dev_token, media_token) = state.tokens.lock().clone();
    Json(json!({
        "dev_token": dev_token,
        "music_token": media_token,
    }))
    .into_response()
}
