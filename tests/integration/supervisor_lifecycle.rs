//! Process-level supervisor invariants against a real spawned `python3`
//! process: start/stop round trip, pidfile-based adoption across supervisor
//! instances, crash detection, and restart producing a fresh pid.
#[path = "common/mod.rs"]
mod common;

use common::{env_lock, Fixture};
use helmd::ipc::StartMode;
use helmd::registry::{ExecutionKind, Registry, ServiceEntry, ServiceOrigin};
use helmd::runtime;
use helmd::supervisor::{ServiceState, Supervisor};
use std::collections::BTreeMap;
use std::time::Duration;

const SERVICE_NAME: &str = "hivematrix-sleeper";

fn sleeper_entry(directory: &std::path::Path, port: u16) -> ServiceEntry {
    std::fs::write(directory.join("run.py"), "import time\nwhile True:\n    time.sleep(1)\n").unwrap();
    ServiceEntry {
        name: SERVICE_NAME.to_string(),
        origin: ServiceOrigin::CoreRequired,
        execution: ExecutionKind::ManagedPython {
            directory: directory.display().to_string(),
            entrypoint: "run.py".to_string(),
            wsgi_runner: None,
        },
        port,
        depends_on: Vec::new(),
        install_order: 0,
        health_path: None,
    }
}

fn single_service_registry(fixture: &Fixture, port: u16) -> Registry {
    let dir = fixture.service_dir(SERVICE_NAME);
    let mut entries = BTreeMap::new();
    entries.insert(SERVICE_NAME.to_string(), sleeper_entry(&dir, port));
    Registry::from_entries_for_test(entries)
}

fn pid_alive(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}

#[test]
fn start_stop_round_trip_leaves_no_orphan_pid() {
    let _guard = env_lock();
    let fixture = Fixture::new();
    runtime::init(fixture.root());
    let registry = single_service_registry(&fixture, 18001);
    let supervisor = Supervisor::new(registry).unwrap();

    supervisor.start(SERVICE_NAME, StartMode::Production).unwrap();
    let status = supervisor.status(SERVICE_NAME).unwrap();
    assert_eq!(status.state, ServiceState::Running);
    let pid = status.pid.expect("running service has a pid");
    assert!(pid_alive(pid));
    assert!(runtime::pidfile_path(SERVICE_NAME).is_file());

    supervisor.stop(SERVICE_NAME).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert!(!pid_alive(pid));
    assert!(!runtime::pidfile_path(SERVICE_NAME).is_file());

    let status = supervisor.status(SERVICE_NAME).unwrap();
    assert_eq!(status.state, ServiceState::Stopped);
    assert_eq!(status.pid, None);
}

#[test]
fn restart_produces_a_fresh_pid() {
    let _guard = env_lock();
    let fixture = Fixture::new();
    runtime::init(fixture.root());
    let registry = single_service_registry(&fixture, 18002);
    let supervisor = Supervisor::new(registry).unwrap();

    supervisor.start(SERVICE_NAME, StartMode::Production).unwrap();
    let first_pid = supervisor.status(SERVICE_NAME).unwrap().pid.unwrap();

    supervisor.restart(SERVICE_NAME, StartMode::Production).unwrap();
    let second_pid = supervisor.status(SERVICE_NAME).unwrap().pid.unwrap();

    assert_ne!(first_pid, second_pid);
    assert!(!pid_alive(first_pid));
    assert!(pid_alive(second_pid));

    supervisor.stop(SERVICE_NAME).unwrap();
}

#[test]
fn a_fresh_supervisor_adopts_a_process_left_by_a_previous_one() {
    let _guard = env_lock();
    let fixture = Fixture::new();
    runtime::init(fixture.root());
    let registry = single_service_registry(&fixture, 18003);

    let first_supervisor = Supervisor::new(registry.clone()).unwrap();
    first_supervisor.start(SERVICE_NAME, StartMode::Production).unwrap();
    let pid = first_supervisor.status(SERVICE_NAME).unwrap().pid.unwrap();
    drop(first_supervisor);

    assert!(pid_alive(pid), "process must survive the supervisor handle being dropped");

    let second_supervisor = Supervisor::new(registry).unwrap();
    let status = second_supervisor.status(SERVICE_NAME).unwrap();
    assert_eq!(status.state, ServiceState::Running);
    assert_eq!(status.pid, Some(pid));

    second_supervisor.stop(SERVICE_NAME).unwrap();
    assert!(!pid_alive(pid));
}

#[test]
fn status_reports_failed_after_process_is_killed_externally() {
    let _guard = env_lock();
    let fixture = Fixture::new();
    runtime::init(fixture.root());
    let registry = single_service_registry(&fixture, 18004);
    let supervisor = Supervisor::new(registry).unwrap();

    supervisor.start(SERVICE_NAME, StartMode::Production).unwrap();
    let pid = supervisor.status(SERVICE_NAME).unwrap().pid.unwrap();

    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), nix::sys::signal::Signal::SIGKILL)
        .expect("kill -9 the adopted process");

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    let mut state = ServiceState::Running;
    while std::time::Instant::now() < deadline {
        state = supervisor.status(SERVICE_NAME).unwrap().state;
        if state == ServiceState::Failed {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(state, ServiceState::Failed);

    // A subsequent start must succeed even though the previous process
    // object is gone.
    supervisor.start(SERVICE_NAME, StartMode::Production).unwrap();
    let status = supervisor.status(SERVICE_NAME).unwrap();
    assert_eq!(status.state, ServiceState::Running);
    supervisor.stop(SERVICE_NAME).unwrap();
}

#[test]
fn health_tick_logs_a_crash_with_its_exit_code() {
    let _guard = env_lock();
    let fixture = Fixture::new();
    runtime::init(fixture.root());
    let registry = single_service_registry(&fixture, 18005);
    let supervisor = Supervisor::new(registry.clone()).unwrap();
    let log_store = helmd::logstore::LogStore::open_in_memory().unwrap();
    let mut sampler = helmd::metrics::ResourceSampler::new();

    supervisor.start(SERVICE_NAME, StartMode::Production).unwrap();
    let pid = supervisor.status(SERVICE_NAME).unwrap().pid.unwrap();
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), nix::sys::signal::Signal::SIGKILL)
        .expect("kill -9 the running process");

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        helmd::health::probe_tick(&registry, &supervisor, &mut sampler, &log_store);
        let logged = log_store.query(&helmd::logstore::LogQuery::new()).unwrap();
        if !logged.is_empty() {
            assert_eq!(logged[0].service_name, SERVICE_NAME);
            assert_eq!(logged[0].level, helmd::logstore::LogLevel::Error);
            break;
        }
        if std::time::Instant::now() >= deadline {
            panic!("expected a crash log entry within the deadline");
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    // The crash is only logged once, on the tick that first observes it.
    helmd::health::probe_tick(&registry, &supervisor, &mut sampler, &log_store);
    let logged = log_store.query(&helmd::logstore::LogQuery::new()).unwrap();
    assert_eq!(logged.len(), 1);
}
