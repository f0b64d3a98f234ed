//! wrapmgr Transport Layer
//!
//! Length-prefixed JSON frames over TCP.
//!
//! - **Wire Format**: `[4-byte length prefix as u32 big-endian] + [JSON data]`
//! - **Client side**: [`FrameTransport`] plus the [`send_message`] / [`receive_message`] helpers
//! - **Server side**: [`RpcServer`] driving a [`CallHandler`]
//!
//! All readers enforce a maximum frame size of 100 MB.

pub mod codec;
pub mod tcp;
pub mod tcp_server;

pub use codec::JsonCodec;
pub use tcp::{receive_message, send_message, FrameTransport};
pub use tcp_server::{CallHandler, RpcServer};

/// Maximum frame size (100 MB)
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;
