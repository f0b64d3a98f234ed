//! In-process stand-ins for the services the manager talks to.
//!
//! [`MockWorker`] speaks the worker's decrypt and M3U8 socket protocols and
//! serves its `/account` side-channel. [`MockCatalog`] answers lyrics
//! lookups the way the catalog API does. Both bind ephemeral ports on
//! 127.0.0.1 and stop when dropped.

mod catalog;
mod worker;

pub use catalog::{CatalogRequest, MockCatalog};
pub use worker::{mock_decrypt, MockWorker, WorkerState, MOCK_KEY_BYTE};
