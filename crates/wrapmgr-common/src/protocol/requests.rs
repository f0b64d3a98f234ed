use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

pub type RequestId = u64;
pub type RpcArgs = serde_json::Value;

static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Methods exposed by the wrapper manager service.
///
/// `Login` and `Decrypt` are bidirectional streams; everything else is a
/// single request/reply exchange.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Method {
    Status,
    Login,
    Logout,
    Decrypt,
    #[serde(rename = "M3U8")]
    M3u8,
    Lyrics,
    License,
    WebPlayback,
}

impl Method {
    pub const ALL: [Method; 8] = [
        Method::Status,
        Method::Login,
        Method::Logout,
        Method::Decrypt,
        Method::M3u8,
        Method::Lyrics,
        Method::License,
        Method::WebPlayback,
    ];

    /// Whether the first frame of this method turns the connection into a stream.
    pub fn is_streaming(self) -> bool {
        matches!(self, Method::Login | Method::Decrypt)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Status => "Status",
            Method::Login => "Login",
            Method::Logout => "Logout",
            Method::Decrypt => "Decrypt",
            Method::M3u8 => "M3U8",
            Method::Lyrics => "Lyrics",
            Method::License => "License",
            Method::WebPlayback => "WebPlayback",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One client frame: a unary call or one item of a stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: Method,
    pub args: RpcArgs,
}

impl Request {
    pub fn new(method: Method, args: RpcArgs) -> Self {
        Request {
            id: generate_request_id(),
            method,
            args,
        }
    }

    /// Builds a request from any serializable payload.
    pub fn with_payload<T: Serialize>(method: Method, payload: &T) -> crate::Result<Self> {
        Ok(Self::new(method, serde_json::to_value(payload)?))
    }

    /// Decodes the arguments into a typed payload.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> crate::Result<T> {
        serde_json::from_value(self.args.clone()).map_err(|e| {
            crate::WrapmgrError::InvalidRequest(format!("bad {} arguments: {}", self.method, e))
        })
    }
}

fn generate_request_id() -> RequestId {
    let timestamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);

    // Upper half from the clock, lower half from a process-wide counter.
    let counter = REQUEST_ID_COUNTER.fetch_add(1, Ordering::SeqCst);
    (timestamp & 0xFFFF_FFFF_0000_0000) | (counter & 0xFFFF_FFFF)
}
