//! Account sign-in sessions with an optional two-factor step.
//!
//! ```text
//! PendingPassword ──ok──────────────────────────▶ Completed
//!        │ two-factor required
//!        ▼
//!   Pending2fa ──code accepted──▶ Completed
//!        └──────code rejected──▶ Failed
//! ```
//!
//! Instance creation runs on a detached task; callers hold a [`LoginTicket`]
//! to wait for the session to move on.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info};
use uuid::Uuid;

use crate::auth::Credentials;
use crate::error::{LoginError, PoolError};
use crate::instance_pool::{AddInstance, InstancePool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoginState {
    #[serde(rename = "pending_password")]
    PendingPassword,
    #[serde(rename = "pending_2fa")]
    Pending2fa,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
}

impl LoginState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoginState::PendingPassword => "pending_password",
            LoginState::Pending2fa => "pending_2fa",
            LoginState::Completed => "completed",
            LoginState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LoginState::Completed | LoginState::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct LoginConfig {
    /// How long finished sessions stay queryable.
    pub completed_grace: Duration,
    /// Region assigned to accounts added through a login.
    pub default_region: String,
    /// How long the Login stream waits for an attempt to settle.
    pub outcome_timeout: Duration,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            completed_grace: Duration::from_secs(60),
            default_region: "us".to_string(),
            outcome_timeout: Duration::from_secs(30),
        }
    }
}

struct LoginSession {
    session_id: String,
    credentials: Credentials,
    state: watch::Sender<LoginState>,
    created_at: Instant,
    created_at_utc: DateTime<Utc>,
    error: Option<String>,
    attempt_in_flight: bool,
}

impl LoginSession {
    fn new(credentials: Credentials) -> Self {
        let (state, _) = watch::channel(LoginState::PendingPassword);
        Self {
            session_id: Uuid::new_v4().to_string(),
            credentials,
            state,
            created_at: Instant::now(),
            created_at_utc: Utc::now(),
            error: None,
            attempt_in_flight: false,
        }
    }

    fn state(&self) -> LoginState {
        *self.state.borrow()
    }

    fn ticket(&self) -> LoginTicket {
        LoginTicket {
            session_id: self.session_id.clone(),
            from: self.state(),
            updates: self.state.subscribe(),
        }
    }

    fn info(&self) -> LoginSessionInfo {
        LoginSessionInfo {
            session_id: self.session_id.clone(),
            username: self.credentials.username.clone(),
            state: self.state(),
            created_at: self.created_at_utc,
            error: self.error.clone(),
        }
    }
}

/// Read-only view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoginSessionInfo {
    pub session_id: String,
    pub username: String,
    pub state: LoginState,
    pub created_at: DateTime<Utc>,
    pub error: Option<String>,
}

/// Handle on a login attempt that was handed to a background task.
#[derive(Debug)]
pub struct LoginTicket {
    session_id: String,
    from: LoginState,
    updates: watch::Receiver<LoginState>,
}

impl LoginTicket {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> LoginState {
        *self.updates.borrow()
    }

    /// Waits until the session leaves the state it was in when the ticket was
    /// issued.
    ///
    /// # Returns
    /// The new state, or `None` if nothing changed within `timeout`.
    pub async fn outcome(&mut self, timeout: Duration) -> Option<LoginState> {
        let from = self.from;
        let waited = tokio::time::timeout(timeout, self.updates.wait_for(|state| *state != from))
            .await
            .map(|changed| changed.map(|state| *state));
        match waited {
            Ok(Ok(state)) => Some(state),
            Ok(Err(_)) => {
                let state = *self.updates.borrow();
                (state != from).then_some(state)
            }
            Err(_) => None,
        }
    }
}

#[derive(Default)]
struct Sessions {
    by_id: HashMap<String, LoginSession>,
    by_username: HashMap<String, String>,
}

impl Sessions {
    fn for_username(&mut self, username: &str) -> Option<&mut LoginSession> {
        let session_id = self.by_username.get(username)?;
        self.by_id.get_mut(session_id)
    }

    fn purge(&mut self, session_id: &str) -> Option<LoginSession> {
        let session = self.by_id.remove(session_id)?;
        let username = &session.credentials.username;
        if self.by_username.get(username).map(String::as_str) == Some(session_id) {
            self.by_username.remove(username);
        }
        Some(session)
    }
}

/// Drives sign-ins into the instance pool.
pub struct LoginSessionManager {
    pool: Arc<InstancePool>,
    config: LoginConfig,
    sessions: Mutex<Sessions>,
}

impl LoginSessionManager {
    pub fn new(pool: Arc<InstancePool>, config: LoginConfig) -> Self {
        Self {
            pool,
            config,
            sessions: Mutex::new(Sessions::default()),
        }
    }

    pub fn config(&self) -> &LoginConfig {
        &self.config
    }

    /// Begins signing in `username`.
    ///
    /// Returns immediately; the instance is created on a background task.
    /// An attempt already running for the account is joined rather than
    /// duplicated.
    ///
    /// # Errors
    /// - [`LoginError::AlreadyLoggedIn`] if the account has an active instance
    /// - [`LoginError::AwaitingTwoFactor`] if a session is waiting for a code
    pub fn start_login(
        self: &Arc<Self>,
        username: &str,
        password: &str,
    ) -> Result<LoginTicket, LoginError> {
        if let Some(instance) = self.pool.get_by_username(username) {
            if instance.is_active() {
                return Err(LoginError::AlreadyLoggedIn(username.to_string()));
            }
        }

        let (ticket, credentials, session_id) = {
            let mut sessions = self.sessions.lock();

            if let Some(existing) = sessions.for_username(username) {
                match existing.state() {
                    LoginState::Pending2fa => {
                        return Err(LoginError::AwaitingTwoFactor {
                            username: username.to_string(),
                            session_id: existing.session_id.clone(),
                        });
                    }
                    LoginState::PendingPassword => return Ok(existing.ticket()),
                    LoginState::Completed | LoginState::Failed => {}
                }
            }

            let mut session = LoginSession::new(Credentials::new(username, password));
            session.attempt_in_flight = true;
            let ticket = session.ticket();
            let credentials = session.credentials.clone();
            let session_id = session.session_id.clone();

            sessions
                .by_username
                .insert(username.to_string(), session_id.clone());
            sessions.by_id.insert(session_id.clone(), session);
            (ticket, credentials, session_id)
        };

        info!("Started login session {} for {}", session_id, username);
        self.spawn_attempt(session_id, credentials);
        Ok(ticket)
    }

    /// Supplies the two-factor code for a session parked in `Pending2fa`.
    pub fn provide_2fa(
        self: &Arc<Self>,
        username: &str,
        code: &str,
    ) -> Result<LoginTicket, LoginError> {
        let (ticket, credentials, session_id) = {
            let mut sessions = self.sessions.lock();
            let session = sessions
                .for_username(username)
                .ok_or_else(|| LoginError::NoSession(username.to_string()))?;

            let state = session.state();
            if state != LoginState::Pending2fa {
                return Err(LoginError::NotAwaitingCode {
                    username: username.to_string(),
                    state: state.as_str(),
                });
            }
            if session.attempt_in_flight {
                return Err(LoginError::NotAwaitingCode {
                    username: username.to_string(),
                    state: "verifying",
                });
            }

            session.credentials.two_factor_code = Some(code.to_string());
            session.attempt_in_flight = true;
            (
                session.ticket(),
                session.credentials.clone(),
                session.session_id.clone(),
            )
        };

        info!("Received 2FA code for {}", username);
        self.spawn_attempt(session_id, credentials);
        Ok(ticket)
    }

    fn spawn_attempt(self: &Arc<Self>, session_id: String, credentials: Credentials) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run_attempt(session_id, credentials).await;
        });
    }

    async fn run_attempt(&self, session_id: String, credentials: Credentials) {
        let username = credentials.username.clone();
        let with_code = credentials.two_factor_code.is_some();
        let request = AddInstance {
            credentials,
            region: self.config.default_region.clone(),
            proxy_config: None,
        };

        let (next, error) = match self.pool.add_instance(request).await {
            Ok(instance) => {
                info!("Login completed for {} ({})", username, instance.instance_id());
                (LoginState::Completed, None)
            }
            Err(PoolError::TwoFactorRequired { .. }) if !with_code => {
                info!("2FA required for {}", username);
                (LoginState::Pending2fa, None)
            }
            Err(PoolError::TwoFactorRequired { .. }) => {
                error!("2FA verification failed for {}: code not accepted", username);
                (
                    LoginState::Failed,
                    Some("two-factor code not accepted".to_string()),
                )
            }
            Err(e) => {
                error!("Login failed for {}: {}", username, e);
                (LoginState::Failed, Some(e.to_string()))
            }
        };

        {
            let mut sessions = self.sessions.lock();
            let Some(session) = sessions.by_id.get_mut(&session_id) else {
                return;
            };
            session.attempt_in_flight = false;
            session.error = error;
            session.state.send_replace(next);
        }

        if next.is_terminal() {
            tokio::time::sleep(self.config.completed_grace).await;
            if self.sessions.lock().purge(&session_id).is_some() {
                info!("Removed finished login session for {}", username);
            }
        }
    }

    pub fn session(&self, session_id: &str) -> Option<LoginSessionInfo> {
        self.sessions.lock().by_id.get(session_id).map(LoginSession::info)
    }

    pub fn session_for(&self, username: &str) -> Option<LoginSessionInfo> {
        self.sessions
            .lock()
            .for_username(username)
            .map(|session| session.info())
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every session older than `max_age`, whatever its state.
    ///
    /// # Returns
    /// Number of sessions removed.
    pub fn cleanup_expired(&self, max_age: Duration) -> usize {
        let mut sessions = self.sessions.lock();
        let expired: Vec<String> = sessions
            .by_id
            .values()
            .filter(|session| session.created_at.elapsed() > max_age)
            .map(|session| session.session_id.clone())
            .collect();

        for session_id in &expired {
            if let Some(session) = sessions.purge(session_id) {
                info!("Cleaning up expired session: {}", session.credentials.username);
            }
        }
        expired.len()
    }
}
