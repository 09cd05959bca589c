//! C5: the process supervisor — owns the lifecycle of every managed service
//! process: spawning, liveness tracking, graceful shutdown, and adoption of
//! processes left running by a previous supervisor instance.
use crate::{
    constants::{PORT_PROBE_TIMEOUT, START_POLL_INTERVAL, START_READY_TIMEOUT, STOP_GRACE_TIMEOUT, STOP_POLL_INTERVAL},
    error::SupervisorError,
    ipc::StartMode,
    registry::{ExecutionKind, Registry, ServiceEntry},
    runtime,
};
use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    io::{BufRead, BufReader},
    net::TcpStream,
    process::{Child, Command, Stdio},
    sync::{Arc, Mutex},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use tracing::{info, warn};

/// Lifecycle state of a single managed service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

/// Everything the supervisor tracks about a running (or previously running)
/// service. Persisted to a pidfile so a restarted supervisor can adopt it.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProcessRecord {
    pid: u32,
    started_at_unix: u64,
    exe_path: String,
}

/// A point-in-time view of a service, returned over the control channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceStatus {
    pub name: String,
    pub state: ServiceState,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub uptime_seconds: Option<u64>,
    pub last_exit_code: Option<i32>,
}

struct ManagedProcess {
    child: Option<Child>,
    record: Option<ProcessRecord>,
    state: ServiceState,
    last_exit_code: Option<i32>,
}

impl ManagedProcess {
    fn stopped() -> Self {
        Self {
            child: None,
            record: None,
            state: ServiceState::Stopped,
            last_exit_code: None,
        }
    }
}

/// Owns the table of managed processes and the service registry they are
/// drawn from.
pub struct Supervisor {
    registry: Registry,
    processes: Arc<Mutex<HashMap<String, ManagedProcess>>>,
}

impl Supervisor {
    /// Builds a supervisor over the given registry, adopting any services
    /// that are already running from a previous instance.
    pub fn new(registry: Registry) -> Result<Self, SupervisorError> {
        runtime::ensure_directories().map_err(|source| SupervisorError::PidFile {
            service: "*".to_string(),
            source,
        })?;

        let mut processes = HashMap::new();
        for entry in registry.all() {
            let adopted = adopt_if_alive(entry)?;
            processes.insert(entry.name.clone(), adopted.unwrap_or_else(ManagedProcess::stopped));
        }

        Ok(Self {
            registry,
            processes: Arc::new(Mutex::new(processes)),
        })
    }

    /// Starts a single service in the given process-invocation mode. Does
    /// not start its dependencies: dependency ordering is the concern of the
    /// band-based boot sequence, not of an individual `start` call.
    pub fn start(&self, name: &str, mode: StartMode) -> Result<(), SupervisorError> {
        let entry = self
            .registry
            .get(name)
            .map_err(|_| SupervisorError::UnknownService(name.to_string()))?
            .clone();

        {
            let processes = self.processes.lock()?;
            if let Some(proc) = processes.get(name)
                && proc.state == ServiceState::Running
            {
                return Ok(());
            }
        }

        if port_in_use(entry.port) {
            return Err(SupervisorError::PortInUse {
                service: name.to_string(),
                port: entry.port,
            });
        }

        let child = spawn_child(&entry, mode)?;
        let pid = child.id();
        let record = ProcessRecord {
            pid,
            started_at_unix: now_unix(),
            exe_path: exe_path_for(&entry),
        };
        write_pidfile(name, &record).map_err(|source| SupervisorError::PidFile {
            service: name.to_string(),
            source,
        })?;

        {
            let mut processes = self.processes.lock()?;
            processes.insert(
                name.to_string(),
                ManagedProcess {
                    child: Some(child),
                    record: Some(record),
                    state: ServiceState::Starting,
                    last_exit_code: None,
                },
            );
        }

        self.wait_until_ready(name, &entry)?;
        Ok(())
    }

    fn wait_until_ready(&self, name: &str, entry: &ServiceEntry) -> Result<(), SupervisorError> {
        let deadline = Instant::now() + START_READY_TIMEOUT;
        while Instant::now() < deadline {
            if !self.is_alive(name)? {
                let mut processes = self.processes.lock()?;
                if let Some(proc) = processes.get_mut(name) {
                    proc.state = ServiceState::Failed;
                }
                return Err(SupervisorError::SpawnFailed {
                    service: name.to_string(),
                    source: std::io::Error::other("process exited before becoming ready"),
                });
            }

            if entry.health_path.is_none() || probe_ready(entry) {
                let mut processes = self.processes.lock()?;
                if let Some(proc) = processes.get_mut(name) {
                    proc.state = ServiceState::Running;
                }
                return Ok(());
            }
            std::thread::sleep(START_POLL_INTERVAL);
        }
        Err(SupervisorError::StartTimeout(name.to_string()))
    }

    /// Stops a single service, sending SIGTERM and escalating to SIGKILL if
    /// it has not exited within the grace period.
    pub fn stop(&self, name: &str) -> Result<(), SupervisorError> {
        let pid = {
            let mut processes = self.processes.lock()?;
            let Some(proc) = processes.get_mut(name) else {
                return Ok(());
            };
            if proc.state == ServiceState::Stopped {
                return Ok(());
            }
            proc.state = ServiceState::Stopping;
            proc.record.as_ref().map(|r| r.pid)
        };

        let Some(pid) = pid else {
            return Ok(());
        };

        let nix_pid = Pid::from_raw(pid as i32);
        signal::kill(nix_pid, Signal::SIGTERM).map_err(|source| SupervisorError::SignalFailed {
            service: name.to_string(),
            source,
        })?;

        let deadline = Instant::now() + STOP_GRACE_TIMEOUT;
        while Instant::now() < deadline {
            if !process_alive(pid) {
                break;
            }
            std::thread::sleep(STOP_POLL_INTERVAL);
        }
        if process_alive(pid) {
            let _ = signal::kill(nix_pid, Signal::SIGKILL);
        }

        let mut processes = self.processes.lock()?;
        if let Some(proc) = processes.get_mut(name) {
            if let Some(child) = proc.child.as_mut() {
                proc.last_exit_code = child.wait().ok().and_then(|s| s.code());
            }
            proc.child = None;
            proc.record = None;
            proc.state = ServiceState::Stopped;
        }
        let _ = fs::remove_file(runtime::pidfile_path(name));
        Ok(())
    }

    /// Stops then starts a single service in the given mode.
    pub fn restart(&self, name: &str, mode: StartMode) -> Result<(), SupervisorError> {
        self.stop(name)?;
        self.start(name, mode)
    }

    /// Starts every registered service, ascending by `install_order`, with
    /// every service sharing an `install_order` started concurrently. The
    /// next band begins only once every service in the current one has
    /// become ready (or failed).
    pub fn start_all(&self, mode: StartMode) -> Result<(), SupervisorError> {
        for band in bands_by_install_order(&self.registry) {
            let results: Vec<Result<(), SupervisorError>> = std::thread::scope(|scope| {
                let handles: Vec<_> = band
                    .iter()
                    .map(|name| scope.spawn(move || self.start(name, mode)))
                    .collect();
                handles.into_iter().map(|h| h.join().expect("start thread panicked")).collect()
            });

            for (name, result) in band.iter().zip(results) {
                if let Err(err) = result {
                    warn!(service = %name, error = %err, "failed to start service during boot");
                }
            }
        }
        Ok(())
    }

    /// Stops every running service, descending by `install_order`, with
    /// every service sharing an `install_order` stopped concurrently. The
    /// next (lower-order) band begins only once every service in the
    /// current one has reached a terminal state.
    pub fn shutdown_all(&self) -> Result<(), SupervisorError> {
        for band in bands_by_install_order(&self.registry).into_iter().rev() {
            std::thread::scope(|scope| {
                for name in &band {
                    scope.spawn(move || {
                        if let Err(err) = self.stop(name) {
                            warn!(service = %name, error = %err, "failed to stop service during shutdown");
                        }
                    });
                }
            });
        }
        Ok(())
    }

    fn is_alive(&self, name: &str) -> Result<bool, SupervisorError> {
        let processes = self.processes.lock()?;
        Ok(processes
            .get(name)
            .and_then(|p| p.record.as_ref())
            .is_some_and(|r| process_alive(r.pid)))
    }

    /// Detects a service whose tracked state is `Running` but whose process
    /// has died, persists the `Failed` transition, and captures the exit
    /// code when a `Child` handle is available to reap it. Returns `Some`
    /// exactly once per crash, on the tick that first observes it, so a
    /// caller can log the transition without repeating it every tick.
    pub fn reconcile_liveness(&self, name: &str) -> Result<Option<Option<i32>>, SupervisorError> {
        let mut processes = self.processes.lock()?;
        let Some(proc) = processes.get_mut(name) else {
            return Ok(None);
        };
        if proc.state != ServiceState::Running {
            return Ok(None);
        }
        let alive = proc.record.as_ref().is_some_and(|r| process_alive(r.pid));
        if alive {
            return Ok(None);
        }

        proc.state = ServiceState::Failed;
        if let Some(child) = proc.child.as_mut() {
            if let Ok(Some(status)) = child.try_wait() {
                proc.last_exit_code = status.code();
            }
        }
        Ok(Some(proc.last_exit_code))
    }

    /// Returns the current status of a single service.
    pub fn status(&self, name: &str) -> Result<ServiceStatus, SupervisorError> {
        let entry = self
            .registry
            .get(name)
            .map_err(|_| SupervisorError::UnknownService(name.to_string()))?;

        let processes = self.processes.lock()?;
        let proc = processes.get(name);

        let alive = proc
            .and_then(|p| p.record.as_ref())
            .is_some_and(|r| process_alive(r.pid));

        let state = match proc.map(|p| p.state) {
            Some(ServiceState::Running) if alive => ServiceState::Running,
            Some(ServiceState::Running) => ServiceState::Failed,
            Some(other) => other,
            None => ServiceState::Stopped,
        };

        let pid = proc.and_then(|p| p.record.as_ref()).map(|r| r.pid);
        let uptime_seconds = proc
            .and_then(|p| p.record.as_ref())
            .map(|r| now_unix().saturating_sub(r.started_at_unix));

        Ok(ServiceStatus {
            name: name.to_string(),
            state,
            pid,
            port: Some(entry.port),
            uptime_seconds,
            last_exit_code: proc.and_then(|p| p.last_exit_code),
        })
    }

    /// Returns the current status of every registered service.
    pub fn status_all(&self) -> Result<Vec<ServiceStatus>, SupervisorError> {
        self.registry.all().map(|e| self.status(&e.name)).collect()
    }

    /// Names of every registered service, in catalog order.
    pub fn list(&self) -> Vec<String> {
        self.registry.all().map(|e| e.name.clone()).collect()
    }
}

/// Groups every registered service by its `install_order` field, ascending,
/// with ties (equal `install_order`) collected into the same band and
/// ordered by name within a band for determinism.
fn bands_by_install_order(registry: &Registry) -> Vec<Vec<String>> {
    let mut by_order: std::collections::BTreeMap<i32, Vec<String>> = std::collections::BTreeMap::new();
    for entry in registry.all() {
        by_order.entry(entry.install_order).or_default().push(entry.name.clone());
    }
    for band in by_order.values_mut() {
        band.sort();
    }
    by_order.into_values().collect()
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn exe_path_for(entry: &ServiceEntry) -> String {
    match &entry.execution {
        ExecutionKind::ManagedPython { directory, entrypoint, .. } => format!("{directory}/{entrypoint}"),
        ExecutionKind::ExternalJava { directory, jar } => format!("{directory}/{jar}"),
    }
}

/// The directory a service is installed in, as recorded on its execution kind.
fn service_directory(entry: &ServiceEntry) -> &str {
    match &entry.execution {
        ExecutionKind::ManagedPython { directory, .. } => directory,
        ExecutionKind::ExternalJava { directory, .. } => directory,
    }
}

fn spawn_child(entry: &ServiceEntry, mode: StartMode) -> Result<Child, SupervisorError> {
    let open_append = |path: std::path::PathBuf| {
        fs::OpenOptions::new().create(true).append(true).open(path)
    };
    let stdout_log = open_append(runtime::stdout_log_path(&entry.name)).map_err(|source| SupervisorError::SpawnFailed {
        service: entry.name.clone(),
        source,
    })?;
    let stderr_log = open_append(runtime::stderr_log_path(&entry.name)).map_err(|source| SupervisorError::SpawnFailed {
        service: entry.name.clone(),
        source,
    })?;

    let env_vars = load_env_file(&std::path::Path::new(service_directory(entry)).join(".env"));

    let mut command = match &entry.execution {
        ExecutionKind::ManagedPython {
            directory,
            entrypoint,
            wsgi_runner,
        } => match (mode, wsgi_runner) {
            (StartMode::Production, Some(runner)) => {
                let mut parts = runner.split_whitespace();
                let program = parts.next().unwrap_or("python3");
                let mut cmd = Command::new(program);
                cmd.args(parts).current_dir(directory);
                cmd
            }
            _ => {
                let mut cmd = Command::new("python3");
                cmd.arg(entrypoint).current_dir(directory);
                cmd
            }
        },
        ExecutionKind::ExternalJava { directory, jar } => {
            let mut cmd = Command::new("java");
            cmd.arg("-jar").arg(jar).current_dir(directory);
            cmd
        }
    };

    command
        .envs(env_vars)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout_log))
        .stderr(Stdio::from(stderr_log));

    command.spawn().map_err(|source| SupervisorError::SpawnFailed {
        service: entry.name.clone(),
        source,
    })
}

fn load_env_file(path: &std::path::Path) -> Vec<(String, String)> {
    let Ok(file) = fs::File::open(path) else {
        return Vec::new();
    };
    BufReader::new(file)
        .lines()
        .map_while(Result::ok)
        .filter_map(|line| {
            let line = line.trim().to_string();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            line.split_once('=').map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect()
}

fn probe_ready(entry: &ServiceEntry) -> bool {
    let Some(path) = &entry.health_path else {
        return true;
    };
    let url = format!("{}{}", entry.local_url(), path);
    reqwest::blocking::Client::new()
        .get(url)
        .timeout(Duration::from_millis(500))
        .send()
        .is_ok_and(|r| r.status().is_success())
}

fn process_alive(pid: u32) -> bool {
    signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Whether some other process already has `port` bound on the loopback
/// interface, checked before spawning so an unmanaged occupant is reported
/// as a conflict rather than masked by a spawn failure further down.
fn port_in_use(port: u16) -> bool {
    let Ok(addr) = format!("127.0.0.1:{port}").parse() else {
        return false;
    };
    TcpStream::connect_timeout(&addr, PORT_PROBE_TIMEOUT).is_ok()
}

fn write_pidfile(name: &str, record: &ProcessRecord) -> std::io::Result<()> {
    let path = runtime::pidfile_path(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("pid.tmp");
    fs::write(&tmp, serde_json::to_vec(record)?)?;
    fs::rename(tmp, path)
}

/// Checks the pidfile for a service and, if the recorded process is still
/// alive and its executable path still matches the registry entry, adopts
/// it instead of spawning a duplicate.
fn adopt_if_alive(entry: &ServiceEntry) -> Result<Option<ManagedProcess>, SupervisorError> {
    let path = runtime::pidfile_path(&entry.name);
    let Ok(raw) = fs::read_to_string(&path) else {
        return Ok(None);
    };
    let Ok(record) = serde_json::from_str::<ProcessRecord>(&raw) else {
        let _ = fs::remove_file(&path);
        return Ok(None);
    };

    if !process_alive(record.pid) {
        let _ = fs::remove_file(&path);
        return Ok(None);
    }

    let current_exe = fs::read_link(format!("/proc/{}/exe", record.pid)).ok();
    let expected = exe_path_for(entry);
    let matches_interpreter = current_exe
        .map(|p| p.display().to_string())
        .is_some_and(|p| p.contains("python3") || p.contains("java"));

    if !matches_interpreter && record.exe_path != expected {
        let _ = fs::remove_file(&path);
        return Ok(None);
    }

    info!(service = %entry.name, pid = record.pid, "adopted running process from previous instance");
    Ok(Some(ManagedProcess {
        child: None,
        record: Some(record),
        state: ServiceState::Running,
        last_exit_code: None,
    }))
}
