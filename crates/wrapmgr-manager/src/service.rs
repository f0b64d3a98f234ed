//! Typed implementations of the service methods.
//!
//! Every method answers with a [`Reply`]; nothing here returns an error to
//! the transport. Framing and streaming live in [`crate::rpc`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use wrapmgr_common::protocol::{
    DecryptData, LicenseData, LicenseRequest, LoginData, LogoutData, LyricsData, LyricsRequest,
    M3u8Data, M3u8Request, Reply, ReplyHeader, StatusData, WebPlaybackData, WebPlaybackRequest,
};
use wrapmgr_metrics::ServiceMetrics;

use crate::catalog::CatalogClient;
use crate::dispatcher::{DecryptTask, Dispatcher, NO_AVAILABLE_INSTANCE};
use crate::error::LoginError;
use crate::instance::Instance;
use crate::instance_pool::InstancePool;
use crate::login::{LoginSessionManager, LoginState, LoginTicket};

/// The manager's public face: pool aggregates, sign-in, decrypt routing and
/// the per-account lookups.
pub struct ServiceFront {
    pool: Arc<InstancePool>,
    dispatcher: Arc<Dispatcher>,
    login: Arc<LoginSessionManager>,
    catalog: CatalogClient,
    metrics: ServiceMetrics,
    ready: AtomicBool,
}

impl ServiceFront {
    pub fn new(
        pool: Arc<InstancePool>,
        dispatcher: Arc<Dispatcher>,
        login: Arc<LoginSessionManager>,
        catalog: CatalogClient,
        metrics: ServiceMetrics,
    ) -> Self {
        Self {
            pool,
            dispatcher,
            login,
            catalog,
            metrics,
            ready: AtomicBool::new(false),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn pool(&self) -> &Arc<InstancePool> {
        &self.pool
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn login_sessions(&self) -> &Arc<LoginSessionManager> {
        &self.login
    }

    pub fn metrics(&self) -> &ServiceMetrics {
        &self.metrics
    }

    pub fn status(&self) -> Reply<StatusData> {
        let client_count = self.pool.client_count();
        Reply::ok(StatusData {
            status: client_count > 0,
            regions: self.pool.regions(),
            client_count,
            ready: self.is_ready(),
        })
    }

    /// Handles one frame of the Login stream.
    ///
    /// A frame with a code answers a pending two-factor prompt; any other
    /// frame starts a login. The reply waits for the attempt to settle.
    pub async fn login(&self, data: LoginData) -> Reply<LoginData> {
        let echo = LoginData {
            username: data.username.clone(),
            ..Default::default()
        };

        let started = if data.two_step_code.is_empty() {
            self.login.start_login(&data.username, &data.password)
        } else {
            self.login.provide_2fa(&data.username, &data.two_step_code)
        };

        match started {
            Ok(ticket) => self.await_login(ticket, echo).await,
            Err(LoginError::AwaitingTwoFactor { .. }) => Reply::with_header(
                ReplyHeader::two_factor_required("two-factor code required"),
                Some(echo),
            ),
            Err(e) => Reply::failure_with(e.to_string(), echo),
        }
    }

    async fn await_login(&self, mut ticket: LoginTicket, echo: LoginData) -> Reply<LoginData> {
        let timeout = self.login.config().outcome_timeout;
        match ticket.outcome(timeout).await {
            Some(LoginState::Completed) => Reply::ok_with_msg("login completed", echo),
            Some(LoginState::Pending2fa) => Reply::with_header(
                ReplyHeader::two_factor_required("two-factor code required"),
                Some(echo),
            ),
            Some(LoginState::Failed) => {
                let reason = self
                    .login
                    .session(ticket.session_id())
                    .and_then(|session| session.error)
                    .unwrap_or_else(|| "login failed".to_string());
                Reply::failure_with(reason, echo)
            }
            Some(LoginState::PendingPassword) | None => {
                warn!("Login for {} did not settle within {:?}", echo.username, timeout);
                Reply::failure_with("login still in progress", echo)
            }
        }
    }

    pub async fn logout(&self, data: LogoutData) -> Reply<LogoutData> {
        let Some(instance) = self.pool.get_by_username(&data.username) else {
            return Reply::failure_with("account not found", data);
        };

        match self.pool.remove(instance.instance_id()).await {
            Ok(_) => {
                info!("Logged out {}", data.username);
                Reply::ok_with_msg("logged out", data)
            }
            Err(e) => Reply::failure_with(e.to_string(), data),
        }
    }

    /// Decrypts one Decrypt stream frame.
    ///
    /// Keep-alive frames come back as sent. The task runs on its own tokio
    /// task, so even a panic in it only fails this frame.
    pub async fn decrypt(&self, data: DecryptData) -> Reply<DecryptData> {
        self.decrypt_routed(data).await.0
    }

    /// Like [`decrypt`](Self::decrypt), also naming the instance the frame
    /// was routed to.
    pub async fn decrypt_routed(&self, data: DecryptData) -> (Reply<DecryptData>, Option<String>) {
        if data.is_keepalive() {
            return (Reply::ok(data), None);
        }

        let echo = DecryptData {
            adam_id: data.adam_id.clone(),
            key: data.key.clone(),
            sample_index: data.sample_index,
            sample: Vec::new(),
        };
        debug!("[Decrypt] Dispatching task for {}[{}]", data.adam_id, data.sample_index);

        let task = DecryptTask::new(data.adam_id, data.key, data.sample, data.sample_index);
        let dispatcher = Arc::clone(&self.dispatcher);
        match tokio::spawn(async move { dispatcher.dispatch(task).await }).await {
            Ok(result) if result.success => (
                Reply::ok(DecryptData {
                    sample: result.data,
                    ..echo
                }),
                result.instance_id,
            ),
            Ok(result) => (
                Reply::failure_with(
                    result.error.unwrap_or_else(|| "decrypt failed".to_string()),
                    echo,
                ),
                result.instance_id,
            ),
            Err(e) => {
                error!("Decrypt task error for {}: {}", echo.adam_id, e);
                (
                    Reply::failure_with(format!("decrypt task failed: {}", e), echo),
                    None,
                )
            }
        }
    }

    /// Resolves a playlist on the oldest active instance.
    pub async fn m3u8(&self, request: M3u8Request) -> Reply<M3u8Data> {
        let Some(instance) = self.pool.active().into_iter().next() else {
            return Reply::failure(NO_AVAILABLE_INSTANCE);
        };
        let Some(proxy) = instance.proxy() else {
            return Reply::failure("instance has no proxy");
        };
        instance.touch();

        match proxy.get_m3u8(&request.adam_id).await {
            Ok(m3u8) => Reply::ok(M3u8Data {
                adam_id: request.adam_id,
                m3u8,
            }),
            Err(e) => Reply::failure_with(
                e.to_string(),
                M3u8Data {
                    adam_id: request.adam_id,
                    m3u8: String::new(),
                },
            ),
        }
    }

    /// Fetches lyrics with the tokens of an account, preferring one in the
    /// requested region.
    pub async fn lyrics(&self, request: LyricsRequest) -> Reply<LyricsData> {
        let Some(instance) = self.lyrics_instance(&request.region) else {
            return Reply::failure(NO_AVAILABLE_INSTANCE);
        };
        let Some(proxy) = instance.proxy() else {
            return Reply::failure("instance has no proxy");
        };
        instance.touch();

        let tokens = match proxy.get_account_info().await.and_then(|info| info.tokens()) {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!("Account info from {} failed: {}", instance.instance_id(), e);
                return Reply::failure(format!("failed to fetch account info: {}", e));
            }
        };

        let language = if request.language.is_empty() {
            "en-US"
        } else {
            request.language.as_str()
        };

        match self
            .catalog
            .lyrics(instance.region(), &request.adam_id, language, &tokens)
            .await
        {
            Ok(lyrics) => Reply::ok(LyricsData {
                adam_id: request.adam_id,
                lyrics,
            }),
            Err(e) => {
                warn!("Lyrics for {} failed: {}", request.adam_id, e);
                Reply::failure(e.to_string())
            }
        }
    }

    fn lyrics_instance(&self, region: &str) -> Option<Arc<Instance>> {
        let active = self.pool.active();
        active
            .iter()
            .find(|instance| instance.region().eq_ignore_ascii_case(region))
            .or_else(|| active.first())
            .cloned()
    }

    pub fn license(&self, _request: LicenseRequest) -> Reply<LicenseData> {
        Reply::failure("License not implemented")
    }

    pub fn web_playback(&self, _request: WebPlaybackRequest) -> Reply<WebPlaybackData> {
        Reply::failure("WebPlayback not implemented")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogConfig;
    use crate::login::LoginConfig;
    use crate::test_support::config_for;
    use crate::worker_proxy::WorkerProxyConfig;
    use wrapmgr_test_utils::{mock_decrypt, MockCatalog, MockWorker};

    fn front_with(pool: Arc<InstancePool>, catalog_base: &str) -> ServiceFront {
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&pool)));
        let login = Arc::new(LoginSessionManager::new(
            Arc::clone(&pool),
            LoginConfig::default(),
        ));
        let catalog = CatalogClient::new(CatalogConfig {
            base_url: catalog_base.to_string(),
            ..Default::default()
        })
        .unwrap();
        ServiceFront::new(pool, dispatcher, login, catalog, ServiceMetrics::new())
    }

    fn empty_front() -> ServiceFront {
        front_with(
            Arc::new(InstancePool::new(WorkerProxyConfig::default())),
            "http://127.0.0.1:9",
        )
    }

    #[tokio::test]
    async fn test_status_reflects_pool() {
        let front = empty_front();
        let status = front.status().data.unwrap();
        assert!(!status.status);
        assert_eq!(status.client_count, 0);
        assert!(!status.ready);

        front.pool().add("a", "pw", "jp").await.unwrap();
        front.set_ready(true);
        let status = front.status().data.unwrap();
        assert!(status.status);
        assert_eq!(status.regions, vec!["jp".to_string()]);
        assert_eq!(status.client_count, 1);
        assert!(status.ready);
    }

    #[tokio::test]
    async fn test_keepalive_is_echoed() {
        let front = empty_front();
        let frame = DecryptData {
            key: "k".to_string(),
            sample_index: 9,
            ..DecryptData::keepalive()
        };
        let reply = front.decrypt(frame.clone()).await;
        assert!(reply.is_success());
        assert_eq!(reply.data.unwrap(), frame);
    }

    #[tokio::test]
    async fn test_decrypt_without_instances_fails_softly() {
        let front = empty_front();
        let reply = front
            .decrypt(DecryptData {
                adam_id: "1".to_string(),
                key: "k".to_string(),
                sample_index: 4,
                sample: vec![1, 2, 3],
            })
            .await;

        assert_eq!(reply.header.code, ReplyHeader::FAILURE);
        assert!(reply.header.msg.contains("no available instance"));
        let data = reply.data.unwrap();
        assert_eq!(data.sample_index, 4);
        assert!(data.sample.is_empty());
    }

    #[tokio::test]
    async fn test_decrypt_round_trip() {
        let worker = MockWorker::start().await;
        let pool = Arc::new(InstancePool::new(config_for(&worker)));
        pool.add("a", "pw", "us").await.unwrap();
        let front = front_with(pool, "http://127.0.0.1:9");

        let sample = vec![0x10, 0x20, 0x30, 0x40];
        let reply = front
            .decrypt(DecryptData {
                adam_id: "1440818664".to_string(),
                key: "skd://key".to_string(),
                sample_index: 0,
                sample: sample.clone(),
            })
            .await;

        assert!(reply.is_success());
        assert_eq!(reply.data.unwrap().sample, mock_decrypt(&sample));
    }

    #[tokio::test]
    async fn test_logout() {
        let front = empty_front();
        front.pool().add("alice", "pw", "us").await.unwrap();

        let reply = front
            .logout(LogoutData {
                username: "alice".to_string(),
            })
            .await;
        assert!(reply.is_success());
        assert!(front.pool().is_empty());

        let reply = front
            .logout(LogoutData {
                username: "alice".to_string(),
            })
            .await;
        assert_eq!(reply.header.code, ReplyHeader::FAILURE);
        assert_eq!(reply.data.unwrap().username, "alice");
    }

    #[tokio::test]
    async fn test_login_completes() {
        let front = empty_front();
        let reply = front
            .login(LoginData {
                username: "alice".to_string(),
                password: "pw".to_string(),
                two_step_code: String::new(),
            })
            .await;
        assert!(reply.is_success(), "{:?}", reply.header);
        assert_eq!(front.pool().client_count(), 1);

        let again = front
            .login(LoginData {
                username: "alice".to_string(),
                password: "pw".to_string(),
                two_step_code: String::new(),
            })
            .await;
        assert_eq!(again.header.code, ReplyHeader::FAILURE);
        assert!(again.header.msg.contains("already logged in"));
    }

    #[tokio::test]
    async fn test_m3u8_uses_oldest_active_instance() {
        let worker = MockWorker::start().await;
        worker.set_m3u8_reply("https://example.com/playlist.m3u8");
        let pool = Arc::new(InstancePool::new(config_for(&worker)));
        pool.add("a", "pw", "us").await.unwrap();
        let front = front_with(pool, "http://127.0.0.1:9");

        let reply = front
            .m3u8(M3u8Request {
                adam_id: "1".to_string(),
            })
            .await;
        assert!(reply.is_success());
        assert_eq!(reply.data.unwrap().m3u8, "https://example.com/playlist.m3u8");
    }

    #[tokio::test]
    async fn test_m3u8_without_instances() {
        let reply = empty_front()
            .m3u8(M3u8Request {
                adam_id: "1".to_string(),
            })
            .await;
        assert_eq!(reply.header.code, ReplyHeader::FAILURE);
        assert!(reply.data.is_none());
    }

    #[tokio::test]
    async fn test_lyrics_prefers_matching_region() {
        let worker_us = MockWorker::start().await;
        let worker_jp = MockWorker::start().await;
        worker_jp.set_tokens("dev-jp", "media-jp");
        let catalog = MockCatalog::start().await;
        catalog.set_lyrics("42", "<tt/>");

        let pool = Arc::new(InstancePool::new(config_for(&worker_us)));
        pool.add("us-account", "pw", "us").await.unwrap();
        pool.add_instance(
            crate::instance_pool::AddInstance::new("jp-account", "pw", "jp")
                .with_proxy_config(config_for(&worker_jp)),
        )
        .await
        .unwrap();
        let front = front_with(pool, &catalog.base_url());

        let reply = front
            .lyrics(LyricsRequest {
                adam_id: "42".to_string(),
                language: "ja".to_string(),
                region: "JP".to_string(),
            })
            .await;
        assert!(reply.is_success(), "{:?}", reply.header);
        assert_eq!(reply.data.unwrap().lyrics, "<tt/>");

        let seen = catalog.last_request().unwrap();
        assert_eq!(seen.path, "/v1/catalog/jp/songs/42/syllable-lyrics");
        assert_eq!(seen.authorization.as_deref(), Some("Bearer dev-jp"));
    }

    #[tokio::test]
    async fn test_lyrics_rejects_empty_account_token() {
        let worker = MockWorker::start().await;
        worker.set_tokens("", "media");
        let catalog = MockCatalog::start().await;
        catalog.set_lyrics("42", "<tt/>");

        let pool = Arc::new(InstancePool::new(config_for(&worker)));
        pool.add("alice", "pw", "us").await.unwrap();
        let front = front_with(pool, &catalog.base_url());

        let reply = front
            .lyrics(LyricsRequest {
                adam_id: "42".to_string(),
                language: String::new(),
                region: String::new(),
            })
            .await;
        assert_eq!(reply.header.code, ReplyHeader::FAILURE);
        assert!(reply.header.msg.contains("dev_token is empty"), "{}", reply.header.msg);
        assert!(catalog.last_request().is_none());
    }

    #[tokio::test]
    async fn test_unimplemented_methods() {
        let front = empty_front();
        let license = front.license(LicenseRequest::default());
        assert_eq!(license.header.code, ReplyHeader::FAILURE);
        assert!(license.header.msg.contains("not implemented"));

        let playback = front.web_playback(WebPlaybackRequest::default());
        assert_eq!(playback.header.code, ReplyHeader::FAILURE);
        assert!(playback.header.msg.contains("not implemented"));
    }
}
