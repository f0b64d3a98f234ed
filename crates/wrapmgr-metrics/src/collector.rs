// Copyright 2025 wrapmgr Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::registry::MetricsRegistry;
use crate::snapshot::MetricsSnapshot;
use std::sync::Arc;
use std::time::Instant;

/// Front-door metrics for the wrapper manager.
///
/// `ServiceMetrics` is what the RPC service and dispatcher hold. It is a thin,
/// cloneable handle over a shared [`MetricsRegistry`].
///
/// # Example
///
/// ```rust
/// use wrapmgr_metrics::ServiceMetrics;
/// use std::time::Instant;
///
/// let metrics = ServiceMetrics::new();
///
/// let start = Instant::now();
/// // ... serve an M3U8 request ...
/// metrics.record_call("m3u8", start, true);
///
/// assert_eq!(metrics.snapshot().total_calls, 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ServiceMetrics {
    registry: Arc<MetricsRegistry>,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing registry, e.g. one shared with another component.
    pub fn with_registry(registry: Arc<MetricsRegistry>) -> Self {
        Self { registry }
    }

    /// Records a finished call, measuring latency from `start_time`.
    ///
    /// # Arguments
    /// * `operation` - The operation name
    /// * `start_time` - When the call began
    /// * `success` - `true` if the reply carried a success code
    pub fn record_call(&self, operation: &str, start_time: Instant, success: bool) {
        let latency_us = start_time.elapsed().as_micros() as u64;
        self.registry.record_operation(operation, latency_us, success);
    }

    /// Records which instance served a dispatched task.
    pub fn record_dispatch(&self, instance_id: &str, success: bool) {
        self.registry.record_dispatch(instance_id, success);
    }

    pub fn forget_instance(&self, instance_id: &str) {
        self.registry.forget_instance(instance_id);
    }

    /// Marks a long-lived stream as open until the returned guard drops.
    pub fn track_stream(&self) -> StreamGuard {
        self.registry.increment_active_streams();
        StreamGuard {
            registry: Arc::clone(&self.registry),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.registry.snapshot()
    }
}

/// Decrements the active stream gauge on drop.
#[derive(Debug)]
pub struct StreamGuard {
    registry: Arc<MetricsRegistry>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.registry.decrement_active_streams();
    }
}
