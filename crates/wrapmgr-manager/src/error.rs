use thiserror::Error;

/// Failure talking to a worker.
///
/// Every [`WorkerProxy`](crate::worker_proxy::WorkerProxy) operation returns
/// this as a value; transport problems never escape as panics.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Proxy not active")]
    Inactive,

    #[error("Connection refused by {0}")]
    Refused(String),

    #[error("Socket timeout after {0}ms")]
    Timeout(u64),

    #[error("Incomplete read: expected {expected} bytes, got {received}")]
    ShortRead { expected: usize, received: usize },

    #[error("{field} is {len} bytes, the worker protocol allows at most 255")]
    FieldTooLong { field: &'static str, len: usize },

    #[error("Sample of {0} bytes does not fit a u32 length prefix")]
    SampleTooLarge(usize),

    #[error("Invalid reply: {0}")]
    InvalidReply(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {0} from worker account endpoint")]
    Status(u16),

    #[error("Account token {field} is {state}")]
    MissingToken {
        field: &'static str,
        state: &'static str,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Whether retrying on a fresh connection may help.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProxyError::Refused(_) | ProxyError::Timeout(_) | ProxyError::Io(_))
    }
}

/// Why an account could not be signed in.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("two-factor code required")]
    TwoFactorRequired,

    #[error("two-factor code rejected")]
    TwoFactorRejected,

    #[error("authentication failed: {0}")]
    Rejected(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("account {username} already exists")]
    AlreadyExists { username: String, instance_id: String },

    #[error("instance {0} not found")]
    NotFound(String),

    #[error("account {username} requires a two-factor code")]
    TwoFactorRequired { username: String },

    #[error("authentication failed for {username}: {reason}")]
    AuthenticationFailed { username: String, reason: String },

    #[error("failed to start worker proxy: {0}")]
    StartFailed(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoginError {
    #[error("account {0} is already logged in")]
    AlreadyLoggedIn(String),

    /// A session for this account is parked on a two-factor prompt.
    #[error("waiting for two-factor code for {username}")]
    AwaitingTwoFactor { username: String, session_id: String },

    #[error("no login session for {0}")]
    NoSession(String),

    #[error("login session for {username} is {state}, not awaiting a code")]
    NotAwaitingCode { username: String, state: &'static str },
}

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("lyrics request failed: HTTP {0}")]
    Status(u16),

    #[error("catalog API error: {0}")]
    Api(String),

    #[error("no lyrics data in catalog response")]
    NoLyrics,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Failure bringing the manager up.
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("catalog client: {0}")]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Transport(#[from] wrapmgr_common::WrapmgrError),
}
