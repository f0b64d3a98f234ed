use thiserror::Error;

#[derive(Error, Debug)]
pub enum WrapmgrError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Message too large: {size} bytes (max {max} bytes)")]
    MessageTooLarge { size: usize, max: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// The server answered with a non-success reply header.
    #[error("Call rejected (code {code}): {message}")]
    Rejected { code: i32, message: String },
}

impl From<std::net::AddrParseError> for WrapmgrError {
    fn from(err: std::net::AddrParseError) -> Self {
        WrapmgrError::InvalidRequest(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WrapmgrError>;
