//! C6: the health monitor — runs the process/port/HTTP probe triad for every
//! registered service on each tick, combined with a resource-usage sample.
use crate::{
    constants::{HEALTH_PROBE_TIMEOUT, PORT_PROBE_TIMEOUT},
    error::HealthError,
    logstore::{LogEntryInput, LogLevel, LogStore},
    metrics::{ResourceSample, ResourceSampler},
    registry::{Registry, ServiceEntry},
    supervisor::{ServiceState, Supervisor},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::TcpStream;
use tracing::warn;

/// The outcome of the port+HTTP probe pair, computed only while a service is
/// `running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unreachable,
}

/// The full probe result for one service on one tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub name: String,
    pub state: ServiceState,
    /// `None` whenever `state != Running`: health is only meaningful for a
    /// service whose process probe passed.
    pub health: Option<HealthState>,
    pub cpu_percent: f32,
    pub rss_bytes: u64,
}

/// Probes every service in the registry. Per-service probes (process, port,
/// HTTP) run sequentially for a given service; different services' probes
/// run concurrently via one thread per service. The resource sample is
/// gathered afterwards in a single batched refresh, since `sysinfo`'s
/// process-table scan is cheaper done once than once per service.
///
/// A service found `running` in the supervisor's tracked state but dead on
/// the process probe has its crash persisted and an `ERROR` log entry
/// written to `log_store` with its last exit code, once, on the tick that
/// first observes the transition.
pub fn probe_tick(registry: &Registry, supervisor: &Supervisor, sampler: &mut ResourceSampler, log_store: &LogStore) -> Vec<ServiceHealth> {
    let entries: Vec<ServiceEntry> = registry.all().cloned().collect();

    let probed: Vec<(String, ServiceState, Option<u32>, Option<HealthState>, Option<Option<i32>>)> = std::thread::scope(|scope| {
        let handles: Vec<_> = entries
            .iter()
            .map(|entry| scope.spawn(move || probe_one(supervisor, entry)))
            .collect();
        handles.into_iter().map(|h| h.join().expect("probe thread panicked")).collect()
    });

    for (name, _, _, _, crash) in &probed {
        let Some(exit_code) = *crash else { continue };
        warn!(service = %name, ?exit_code, "service process died unexpectedly");
        let entry = LogEntryInput {
            timestamp: chrono::Utc::now(),
            service_name: name.clone(),
            level: LogLevel::Error,
            message: format!("service '{name}' crashed (exit code {})", exit_code.map_or("unknown".to_string(), |c| c.to_string())),
            context: serde_json::json!({ "last_exit_code": exit_code }),
            trace_id: None,
            user_id: None,
            hostname: crate::runtime::local_hostname(),
            process_id: None,
        };
        if let Err(err) = log_store.ingest(&[entry]) {
            warn!(service = %name, error = %err, "failed to record crash log entry");
        }
    }

    let mut pids: HashMap<String, u32> = HashMap::new();
    for (name, state, pid, _, _) in &probed {
        if *state == ServiceState::Running {
            if let Some(p) = pid {
                pids.insert(name.clone(), *p);
            }
        }
    }
    let resources = sampler.sample_all(&pids);

    probed
        .into_iter()
        .map(|(name, state, _pid, health, _crash)| {
            let resource = resources.get(&name).copied().unwrap_or(ResourceSample {
                cpu_percent: 0.0,
                rss_bytes: 0,
            });
            ServiceHealth {
                name,
                state,
                health,
                cpu_percent: resource.cpu_percent,
                rss_bytes: resource.rss_bytes,
            }
        })
        .collect()
}

/// Probes a single named service on demand (e.g. for a targeted status
/// request), without touching resource sampling.
pub fn probe_service(registry: &Registry, supervisor: &Supervisor, name: &str) -> Result<ServiceHealth, HealthError> {
    let entry = registry.get(name).map_err(|_| HealthError::UnknownService(name.to_string()))?;
    let (_, state, _, health, _crash) = probe_one(supervisor, entry);
    Ok(ServiceHealth {
        name: entry.name.clone(),
        state,
        health,
        cpu_percent: 0.0,
        rss_bytes: 0,
    })
}

/// Probes one service's process/port/HTTP triad. Also reconciles the
/// supervisor's tracked liveness first, so a service that died since the
/// last tick is observed as `Failed` rather than a stale `Running`; the
/// returned `Option<Option<i32>>` is `Some` exactly on the tick a crash is
/// first detected, carrying its exit code when known.
fn probe_one(
    supervisor: &Supervisor,
    entry: &ServiceEntry,
) -> (String, ServiceState, Option<u32>, Option<HealthState>, Option<Option<i32>>) {
    let crash = supervisor.reconcile_liveness(&entry.name).unwrap_or(None);

    let (state, pid) = match supervisor.status(&entry.name) {
        Ok(status) => (status.state, status.pid),
        Err(_) => (ServiceState::Stopped, None),
    };

    if state != ServiceState::Running {
        return (entry.name.clone(), state, pid, None, crash);
    }

    let health = if !port_open(entry.port) {
        HealthState::Unreachable
    } else {
        http_health(entry)
    };

    (entry.name.clone(), state, pid, Some(health), crash)
}

fn port_open(port: u16) -> bool {
    let Ok(addr) = format!("127.0.0.1:{port}").parse() else {
        return false;
    };
    TcpStream::connect_timeout(&addr, PORT_PROBE_TIMEOUT).is_ok()
}

fn http_health(entry: &ServiceEntry) -> HealthState {
    let Some(path) = &entry.health_path else {
        // No HTTP endpoint declared: process and port probes already passed.
        return HealthState::Healthy;
    };

    let url = format!("{}{}", entry.local_url(), path);
    let response = reqwest::blocking::Client::new().get(url).timeout(HEALTH_PROBE_TIMEOUT).send();

    let Ok(response) = response else {
        return HealthState::Unreachable;
    };
    if !response.status().is_success() {
        return HealthState::Unreachable;
    }

    match response.json::<serde_json::Value>() {
        Ok(body) => match body.get("status").and_then(|v| v.as_str()) {
            Some("healthy") => HealthState::Healthy,
            Some("degraded") => HealthState::Degraded,
            _ => HealthState::Unreachable,
        },
        Err(_) => HealthState::Unreachable,
    }
}
