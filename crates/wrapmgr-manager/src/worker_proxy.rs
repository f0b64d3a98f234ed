//! Network client for one decryption worker.
//!
//! A worker listens on three ports: raw-socket decrypt, raw-socket M3U8
//! lookup, and an HTTP side-channel whose `/account` endpoint returns the
//! account's tokens and doubles as a health probe.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::error::ProxyError;
use crate::wire;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// Optional worker features, fixed when the proxy is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerCapabilities {
    /// The worker accepts many samples on one decrypt connection.
    pub batch_decrypt: bool,
}

impl Default for WorkerCapabilities {
    fn default() -> Self {
        Self {
            batch_decrypt: true,
        }
    }
}

/// Where a worker listens and how patiently to talk to it.
#[derive(Debug, Clone)]
pub struct WorkerProxyConfig {
    pub host: String,
    pub decrypt_port: u16,
    pub m3u8_port: u16,
    pub account_port: u16,
    /// Budget for one decrypt or M3U8 exchange.
    pub io_timeout: Duration,
    pub connect_timeout: Duration,
    pub account_timeout: Duration,
    pub health_timeout: Duration,
    /// Attempts for an M3U8 lookup that fails on transport errors.
    pub m3u8_attempts: u32,
    /// Delay before the second M3U8 attempt; doubles after each retry.
    pub m3u8_backoff: Duration,
    pub capabilities: WorkerCapabilities,
}

impl Default for WorkerProxyConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            decrypt_port: 10020,
            m3u8_port: 20020,
            account_port: 30020,
            io_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            account_timeout: Duration::from_secs(10),
            health_timeout: Duration::from_secs(5),
            m3u8_attempts: 3,
            m3u8_backoff: Duration::from_millis(500),
            capabilities: WorkerCapabilities::default(),
        }
    }
}

impl WorkerProxyConfig {
    pub fn decrypt_addr(&self) -> String {
        format!("{}:{}", self.host, self.decrypt_port)
    }

    pub fn m3u8_addr(&self) -> String {
        format!("{}:{}", self.host, self.m3u8_port)
    }

    pub fn account_base(&self) -> String {
        format!("http://{}:{}", self.host, self.account_port)
    }
}

/// Body of the worker's `/account` endpoint. A field the worker leaves out
/// or sends as `null` is `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    #[serde(default)]
    pub dev_token: Option<String>,
    #[serde(default, alias = "music_token")]
    pub media_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storefront: Option<String>,
}

/// Credentials for catalog calls on behalf of an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountTokens {
    pub dev_token: String,
    pub media_token: String,
}

impl AccountInfo {
    /// Both tokens, provided the worker sent each one non-empty.
    pub fn tokens(&self) -> Result<AccountTokens, ProxyError> {
        fn required(field: &'static str, value: &Option<String>) -> Result<String, ProxyError> {
            match value.as_deref() {
                None => Err(ProxyError::MissingToken { field, state: "missing" }),
                Some("") => Err(ProxyError::MissingToken { field, state: "empty" }),
                Some(token) => Ok(token.to_string()),
            }
        }

        Ok(AccountTokens {
            dev_token: required("dev_token", &self.dev_token)?,
            media_token: required("media_token", &self.media_token)?,
        })
    }
}

/// Client for one worker instance.
///
/// Each decrypt or M3U8 call opens its own TCP connection, so calls on the
/// same proxy may run concurrently. The HTTP client exists only between
/// [`start`](Self::start) and [`stop`](Self::stop).
#[derive(Debug)]
pub struct WorkerProxy {
    instance_id: String,
    username: String,
    region: String,
    config: WorkerProxyConfig,
    http: RwLock<Option<reqwest::Client>>,
    last_adam_id: Mutex<String>,
}

impl WorkerProxy {
    pub fn new(
        instance_id: impl Into<String>,
        username: impl Into<String>,
        region: impl Into<String>,
        config: WorkerProxyConfig,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            username: username.into(),
            region: region.into(),
            config,
            http: RwLock::new(None),
            last_adam_id: Mutex::new(String::new()),
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

    pub fn config(&self) -> &WorkerProxyConfig {
        &self.config
    }

    pub fn capabilities(&self) -> WorkerCapabilities {
        self.config.capabilities
    }

    /// Builds the HTTP client and marks the proxy active.
    pub async fn start(&self) -> Result<(), ProxyError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(self.config.connect_timeout)
            .build()?;
        *self.http.write() = Some(client);
        info!(
            "Worker proxy {} started ({}, decrypt {})",
            self.instance_id,
            self.username,
            self.config.decrypt_addr()
        );
        Ok(())
    }

    /// Drops the HTTP client and marks the proxy inactive.
    pub async fn stop(&self) {
        if self.http.write().take().is_some() {
            info!("Worker proxy {} stopped", self.instance_id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.http.read().is_some()
    }

    /// The song this worker served most recently, empty when idle.
    pub fn last_adam_id(&self) -> String {
        self.last_adam_id.lock().clone()
    }

    pub fn set_last_adam_id(&self, adam_id: &str) {
        let mut last = self.last_adam_id.lock();
        last.clear();
        last.push_str(adam_id);
    }

    /// Clears the marker if it still names `adam_id`.
    pub fn release_adam_id(&self, adam_id: &str) -> bool {
        let mut last = self.last_adam_id.lock();
        if *last == adam_id {
            last.clear();
            true
        } else {
            false
        }
    }

    fn http_client(&self) -> Result<reqwest::Client, ProxyError> {
        self.http.read().clone().ok_or(ProxyError::Inactive)
    }

    async fn connect(&self, addr: &str) -> Result<TcpStream, ProxyError> {
        let connect = TcpStream::connect(addr);
        match tokio::time::timeout(self.config.connect_timeout, connect).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                Err(ProxyError::Refused(addr.to_string()))
            }
            Ok(Err(e)) => Err(ProxyError::Io(e)),
            Err(_) => Err(ProxyError::Timeout(self.config.connect_timeout.as_millis() as u64)),
        }
    }

    async fn with_io_timeout<T, F>(&self, fut: F) -> Result<T, ProxyError>
    where
        F: std::future::Future<Output = Result<T, ProxyError>>,
    {
        tokio::time::timeout(self.config.io_timeout, fut)
            .await
            .map_err(|_| ProxyError::Timeout(self.config.io_timeout.as_millis() as u64))?
    }

    /// Decrypts one sample on a fresh connection.
    ///
    /// # Returns
    /// Plaintext of exactly `sample.len()` bytes.
    pub async fn decrypt(
        &self,
        adam_id: &str,
        key: &str,
        sample: &[u8],
        sample_index: u32,
    ) -> Result<Vec<u8>, ProxyError> {
        if !self.is_active() {
            return Err(ProxyError::Inactive);
        }
        let context = wire::encode_decrypt_context(adam_id, key)?;
        let addr = self.config.decrypt_addr();

        debug!(
            "Decrypting {}[{}] ({} bytes) on {}",
            adam_id,
            sample_index,
            sample.len(),
            addr
        );

        let result = self
            .with_io_timeout(async {
                let mut stream = self.connect(&addr).await?;
                stream.write_all(&context).await?;
                wire::write_sample(&mut stream, sample).await?;
                wire::read_plaintext(&mut stream, sample.len()).await
            })
            .await;

        if let Err(e) = &result {
            warn!("Decrypt {}[{}] failed on {}: {}", adam_id, sample_index, addr, e);
        }
        result
    }

    /// Decrypts many samples of one song over a single connection.
    ///
    /// Output order matches input order. `progress` is called with
    /// `(done, total)` after every 100 samples. The I/O timeout applies to
    /// each sample, not to the whole batch.
    pub async fn decrypt_batch(
        &self,
        adam_id: &str,
        key: &str,
        samples: &[Vec<u8>],
        progress: Option<&(dyn Fn(usize, usize) + Send + Sync)>,
    ) -> Result<Vec<Vec<u8>>, ProxyError> {
        if !self.is_active() {
            return Err(ProxyError::Inactive);
        }
        let context = wire::encode_decrypt_context(adam_id, key)?;
        let addr = self.config.decrypt_addr();
        let total = samples.len();

        let mut stream = self.connect(&addr).await?;
        self.with_io_timeout(async {
            stream.write_all(&context).await?;
            Ok::<(), ProxyError>(())
        })
        .await?;

        let mut plaintext = Vec::with_capacity(total);
        for (i, sample) in samples.iter().enumerate() {
            let chunk = self
                .with_io_timeout(async {
                    wire::write_sample(&mut stream, sample).await?;
                    wire::read_plaintext(&mut stream, sample.len()).await
                })
                .await
                .map_err(|e| {
                    warn!("Batch decrypt of {} failed at sample {}/{}: {}", adam_id, i, total, e);
                    e
                })?;
            plaintext.push(chunk);

            if let Some(progress) = progress {
                if (i + 1) % 100 == 0 {
                    progress(i + 1, total);
                }
            }
        }

        info!("Decrypted {} samples of {} on {}", total, adam_id, addr);
        Ok(plaintext)
    }

    /// Resolves the playlist URL for a song.
    ///
    /// Refused connections and timeouts are retried with exponential backoff;
    /// a malformed reply is returned immediately.
    pub async fn get_m3u8(&self, adam_id: &str) -> Result<String, ProxyError> {
        let attempts = self.config.m3u8_attempts.max(1);
        let mut delay = self.config.m3u8_backoff;
        let mut attempt = 1;

        loop {
            match self.fetch_m3u8_once(adam_id).await {
                Ok(url) => return Ok(url),
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(
                        "M3U8 lookup for {} failed (attempt {}/{}): {}, retrying in {:?}",
                        adam_id, attempt, attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => {
                    warn!("M3U8 lookup for {} failed: {}", adam_id, e);
                    return Err(e);
                }
            }
        }
    }

    async fn fetch_m3u8_once(&self, adam_id: &str) -> Result<String, ProxyError> {
        if !self.is_active() {
            return Err(ProxyError::Inactive);
        }
        let request = wire::encode_m3u8_request(adam_id)?;
        let addr = self.config.m3u8_addr();

        let line = self
            .with_io_timeout(async {
                let stream = self.connect(&addr).await?;
                let mut stream = BufReader::new(stream);
                stream.get_mut().write_all(&request).await?;
                wire::read_reply_line(&mut stream).await
            })
            .await?;

        wire::parse_m3u8_line(&line)
    }

    /// Fetches the account tokens from the HTTP side-channel.
    pub async fn get_account_info(&self) -> Result<AccountInfo, ProxyError> {
        let client = self.http_client()?;
        let response = client
            .get(format!("{}/account", self.config.account_base()))
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(self.config.account_timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProxyError::Status(status.as_u16()));
        }
        Ok(response.json::<AccountInfo>().await?)
    }

    /// `true` when `/account` answers 200 within the health timeout.
    pub async fn health_check(&self) -> bool {
        let Ok(client) = self.http_client() else {
            return false;
        };
        let request = client
            .get(format!("{}/account", self.config.account_base()))
            .timeout(self.config.health_timeout);

        match request.send().await {
            Ok(response) => response.status() == reqwest::StatusCode::OK,
            Err(e) => {
                debug!("Health probe for {} failed: {}", self.instance_id, e);
                false
            }
        }
    }
}
