//! wrapmgr Response Types
//!
//! Every reply carries a `{code, msg}` header and an optional payload.
//! Codes follow the wrapper manager convention:
//!
//! | code | meaning |
//! |------|---------|
//! | `0`  | success |
//! | `-1` | failure, `msg` says why |
//! | `1`, `2` | Login only: a two-factor code is required |

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::error::{Result, WrapmgrError};
use super::RequestId;

/// Status header attached to every reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplyHeader {
    pub code: i32,
    pub msg: String,
}

impl ReplyHeader {
    pub const SUCCESS: i32 = 0;
    pub const FAILURE: i32 = -1;
    pub const TWO_FACTOR_REQUIRED: i32 = 1;
    /// Alternate 2FA code some servers send; accepted by clients, never emitted here.
    pub const TWO_FACTOR_REQUIRED_ALT: i32 = 2;

    pub fn success(msg: impl Into<String>) -> Self {
        Self {
            code: Self::SUCCESS,
            msg: msg.into(),
        }
    }

    pub fn failure(msg: impl Into<String>) -> Self {
        Self {
            code: Self::FAILURE,
            msg: msg.into(),
        }
    }

    pub fn two_factor_required(msg: impl Into<String>) -> Self {
        Self {
            code: Self::TWO_FACTOR_REQUIRED,
            msg: msg.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Self::SUCCESS
    }

    pub fn is_two_factor_required(&self) -> bool {
        self.code == Self::TWO_FACTOR_REQUIRED || self.code == Self::TWO_FACTOR_REQUIRED_ALT
    }
}

/// A typed reply: header plus optional payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reply<T> {
    pub header: ReplyHeader,
    #[serde(default)]
    pub data: Option<T>,
}

impl<T> Reply<T> {
    /// Success reply with the conventional `SUCCESS` message.
    pub fn ok(data: T) -> Self {
        Self {
            header: ReplyHeader::success("SUCCESS"),
            data: Some(data),
        }
    }

    pub fn ok_with_msg(msg: impl Into<String>, data: T) -> Self {
        Self {
            header: ReplyHeader::success(msg),
            data: Some(data),
        }
    }

    pub fn failure(msg: impl Into<String>) -> Self {
        Self {
            header: ReplyHeader::failure(msg),
            data: None,
        }
    }

    /// Failure that still echoes a payload, e.g. the sample index of a failed decrypt.
    pub fn failure_with(msg: impl Into<String>, data: T) -> Self {
        Self {
            header: ReplyHeader::failure(msg),
            data: Some(data),
        }
    }

    pub fn with_header(header: ReplyHeader, data: Option<T>) -> Self {
        Self { header, data }
    }

    pub fn is_success(&self) -> bool {
        self.header.is_success()
    }

    /// Turns a non-success reply into [`WrapmgrError::Rejected`].
    pub fn into_result(self) -> Result<Option<T>> {
        if self.header.is_success() {
            Ok(self.data)
        } else {
            Err(WrapmgrError::Rejected {
                code: self.header.code,
                message: self.header.msg,
            })
        }
    }
}

/// One server frame on the wire.
///
/// `id` echoes the [`Request`](super::Request) that produced the reply, so
/// stream replies can be matched with the frame they answer.
///
/// # Example
///
/// ```
/// use wrapmgr_common::protocol::{Reply, Response};
///
/// let reply = Reply::ok(serde_json::json!({"adam_id": "1440818664"}));
/// let response = Response::from_reply(7, &reply).unwrap();
/// assert!(response.header.is_success());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub header: ReplyHeader,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Response {
    /// Encodes a typed reply for request `id`.
    pub fn from_reply<T: Serialize>(id: RequestId, reply: &Reply<T>) -> Result<Self> {
        let data = match &reply.data {
            Some(data) => serde_json::to_value(data)?,
            None => serde_json::Value::Null,
        };
        Ok(Response {
            id,
            header: reply.header.clone(),
            data,
        })
    }

    /// Failure frame without payload.
    pub fn failure(id: RequestId, msg: impl Into<String>) -> Self {
        Response {
            id,
            header: ReplyHeader::failure(msg),
            data: serde_json::Value::Null,
        }
    }

    /// Decodes the payload back into a typed reply.
    pub fn into_reply<T: DeserializeOwned>(self) -> Result<Reply<T>> {
        let data = if self.data.is_null() {
            None
        } else {
            Some(serde_json::from_value(self.data).map_err(|e| {
                WrapmgrError::InvalidResponse(format!("unexpected reply payload: {}", e))
            })?)
        };
        Ok(Reply {
            header: self.header,
            data,
        })
    }
}
