//! wrapmgr Metrics Collection
//!
//! Thread-safe call and dispatch metrics for the wrapper manager.
//!
//! # Architecture
//!
//! - [`MetricsRegistry`]: lock-free counters plus a log-linear latency histogram per operation
//! - [`ServiceMetrics`]: cloneable handle used by the RPC service and dispatcher
//! - [`MetricsSnapshot`]: serializable view served by the admin HTTP endpoint
//!
//! # Usage Example
//!
//! ```rust
//! use wrapmgr_metrics::ServiceMetrics;
//! use std::time::Instant;
//!
//! let metrics = ServiceMetrics::new();
//!
//! let start = Instant::now();
//! // ... decrypt a sample ...
//! metrics.record_call("decrypt", start, true);
//! metrics.record_dispatch("instance-id", true);
//!
//! let snapshot = metrics.snapshot();
//! println!("decrypt p99: {}us", snapshot.operations["decrypt"].p99_latency_us);
//! ```

mod collector;
mod registry;
mod snapshot;

pub use collector::{ServiceMetrics, StreamGuard};
pub use registry::MetricsRegistry;
pub use snapshot::{InstanceDispatchMetrics, MetricsSnapshot, OperationMetrics};
