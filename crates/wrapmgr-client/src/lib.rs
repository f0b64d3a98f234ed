//! Async client for the wrapper manager.
//!
//! ```no_run
//! use wrapmgr_client::ManagerClient;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ManagerClient::new("127.0.0.1:18923");
//! let status = client.status().await?;
//! println!("{} account(s) online", status.client_count);
//! # Ok(())
//! # }
//! ```

pub mod client;

pub use client::{DecryptStream, ManagerClient};
