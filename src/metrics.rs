//! Resource sampling for managed service processes. The health monitor calls
//! this once per probe tick to fill in the CPU/RSS fields of each
//! `ServiceStatus`; the log store persists the samples it's handed for
//! historical charting.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// A single point-in-time resource reading for one managed process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ResourceSample {
    pub cpu_percent: f32,
    pub rss_bytes: u64,
}

impl ResourceSample {
    fn missing() -> Self {
        ResourceSample {
            cpu_percent: 0.0,
            rss_bytes: 0,
        }
    }
}

/// One row of the historical metric series the log store persists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub service: String,
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f32,
    pub rss_bytes: u64,
}

/// Wraps a single `sysinfo::System` so every probe tick pays for one process-
/// table refresh covering every managed service, not one per service.
pub struct ResourceSampler {
    system: System,
}

impl Default for ResourceSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler {
    pub fn new() -> Self {
        ResourceSampler { system: System::new() }
    }

    /// Samples CPU% and RSS for every `(service name, pid)` pair given,
    /// returning a reading for each. A service whose pid is no longer live
    /// gets a zeroed sample rather than being omitted, so callers can always
    /// attach a resource reading to a `ServiceStatus`.
    pub fn sample_all(&mut self, pids: &HashMap<String, u32>) -> HashMap<String, ResourceSample> {
        let sysinfo_pids: Vec<Pid> = pids.values().map(|&p| Pid::from_u32(p)).collect();
        self.system
            .refresh_processes_specifics(ProcessesToUpdate::Some(&sysinfo_pids), true, ProcessRefreshKind::everything());

        pids.iter()
            .map(|(name, &pid)| {
                let sample = self
                    .system
                    .process(Pid::from_u32(pid))
                    .map(|process| ResourceSample {
                        cpu_percent: process.cpu_usage(),
                        rss_bytes: process.memory() * 1024,
                    })
                    .unwrap_or_else(ResourceSample::missing);
                (name.clone(), sample)
            })
            .collect()
    }
}
