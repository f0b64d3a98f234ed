//! wrapmgr Common Types and Transport
//!
//! Protocol definitions and the TCP transport shared by the wrapper manager
//! server, its client library and the CLI.
//!
//! # Overview
//!
//! The wrapper manager fronts a pool of account-bound decryption workers and
//! exposes them as one service with eight methods: `Status`, `Login`,
//! `Logout`, `Decrypt`, `M3U8`, `Lyrics`, `License` and `WebPlayback`.
//!
//! - **Protocol Layer**: [`Request`], [`Response`], the `{code, msg}` [`ReplyHeader`]
//!   and one typed payload per method
//! - **Transport Layer**: framed JSON over TCP with a pluggable [`CallHandler`]
//!
//! # Wire protocol
//!
//! - **Message Format**: `[4-byte length prefix as u32 big-endian] + [JSON data]`
//! - **Max Message Size**: 100 MB
//! - **Streams**: `Login` and `Decrypt` bind a connection for their lifetime;
//!   every inbound frame gets exactly one reply, in order
//!
//! # Example
//!
//! ```
//! use wrapmgr_common::{Method, Reply, Request, Response, M3u8Request, M3u8Data};
//!
//! let request = Request::with_payload(
//!     Method::M3u8,
//!     &M3u8Request { adam_id: "1440818664".to_string() },
//! ).unwrap();
//!
//! let reply = Reply::ok(M3u8Data {
//!     adam_id: "1440818664".to_string(),
//!     m3u8: "https://example.com/master.m3u8".to_string(),
//! });
//! let response = Response::from_reply(request.id, &reply).unwrap();
//! assert!(response.header.is_success());
//! ```

pub mod protocol;
pub mod transport;

pub use protocol::*;
