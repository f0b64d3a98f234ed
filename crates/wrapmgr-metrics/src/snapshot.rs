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

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Metrics for one service operation (`Decrypt`, `M3U8`, `Lyrics`, ...)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationMetrics {
    pub call_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub avg_latency_us: u64,
    pub p50_latency_us: u64,
    pub p95_latency_us: u64,
    pub p99_latency_us: u64,
}

impl OperationMetrics {
    /// Fraction of calls that succeeded, `1.0` when nothing was recorded.
    pub fn success_rate(&self) -> f64 {
        if self.call_count == 0 {
            return 1.0;
        }
        self.success_count as f64 / self.call_count as f64
    }
}

/// How many tasks the dispatcher routed to a given instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceDispatchMetrics {
    pub instance_id: String,
    pub dispatch_count: u64,
    pub failure_count: u64,
    /// Unix time of the last dispatch in milliseconds
    pub last_dispatch_ms: u64,
}

/// Complete metrics snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub version: String,
    pub uptime_ms: u64,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub active_streams: u64,
    pub operations: HashMap<String, OperationMetrics>,
    pub instances: HashMap<String, InstanceDispatchMetrics>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_rate() {
        let empty = OperationMetrics::default();
        assert_eq!(empty.success_rate(), 1.0);

        let metrics = OperationMetrics {
            call_count: 4,
            success_count: 3,
            failure_count: 1,
            ..Default::default()
        };
        assert!((metrics.success_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_snapshot_serializes_with_stable_keys() {
        let snapshot = MetricsSnapshot {
            version: "0.1.0".to_string(),
            uptime_ms: 10,
            total_calls: 1,
            successful_calls: 1,
            failed_calls: 0,
            active_streams: 0,
            operations: HashMap::from([("status".to_string(), OperationMetrics::default())]),
            instances: HashMap::new(),
        };

        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["total_calls"], 1);
        assert!(value["operations"]["status"].is_object());
        assert!(value["instances"].as_object().unwrap().is_empty());
    }
}
