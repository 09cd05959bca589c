//! Band-based start/stop ordering (spec.md §8 scenario 5): services sharing
//! an `install_order` run concurrently; a lower startup band (or higher
//! shutdown band) only proceeds once every service in the current band has
//! reached a terminal state.
#[path = "common/mod.rs"]
mod common;

use common::{env_lock, Fixture};
use helmd::ipc::StartMode;
use helmd::registry::{ExecutionKind, Registry, ServiceEntry, ServiceOrigin};
use helmd::runtime;
use helmd::supervisor::Supervisor;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Writes a `run.py` that records its own start time immediately, then on
/// SIGTERM waits `term_delay_ms` before recording its exit time and quitting.
/// The delay lets the test distinguish "SIGTERM sent" from "band complete":
/// `Supervisor::stop` only returns once the process has actually exited.
fn write_marker_service(directory: &Path, term_delay_ms: u64) {
    let script = format!(
        "import signal, sys, time\n\
         def handle_term(signum, frame):\n\
         \ttime.sleep({delay})\n\
         \twith open('exit.marker', 'w') as f:\n\
         \t\tf.write(str(time.time()))\n\
         \tsys.exit(0)\n\
         signal.signal(signal.SIGTERM, handle_term)\n\
         with open('start.marker', 'w') as f:\n\
         \tf.write(str(time.time()))\n\
         while True:\n\
         \ttime.sleep(1)\n",
        delay = term_delay_ms as f64 / 1000.0,
    );
    std::fs::write(directory.join("run.py"), script).unwrap();
}

fn marker_time(directory: &Path, name: &str) -> f64 {
    let path = directory.join(name);
    let raw = std::fs::read_to_string(&path).unwrap_or_else(|_| panic!("missing marker {path:?}"));
    raw.trim().parse().unwrap()
}

fn wait_for_marker(directory: &Path, name: &str, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if directory.join(name).is_file() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

fn entry(name: &str, directory: &Path, port: u16, install_order: i32) -> ServiceEntry {
    ServiceEntry {
        name: name.to_string(),
        origin: ServiceOrigin::CoreRequired,
        execution: ExecutionKind::ManagedPython {
            directory: directory.display().to_string(),
            entrypoint: "run.py".to_string(),
            wsgi_runner: None,
        },
        port,
        depends_on: Vec::new(),
        install_order,
        health_path: None,
    }
}

#[test]
fn startup_and_shutdown_respect_install_order_bands() {
    let _guard = env_lock();
    let fixture = Fixture::new();
    runtime::init(fixture.root());

    // x and y share install_order 3; z has the lower install_order 2 and so
    // must start first and stop last, per the spec's own worked example.
    let x_dir = fixture.service_dir("x");
    let y_dir = fixture.service_dir("y");
    let z_dir = fixture.service_dir("z");
    write_marker_service(&x_dir, 300);
    write_marker_service(&y_dir, 300);
    write_marker_service(&z_dir, 0);

    let mut entries = BTreeMap::new();
    entries.insert("x".to_string(), entry("x", &x_dir, 19001, 3));
    entries.insert("y".to_string(), entry("y", &y_dir, 19002, 3));
    entries.insert("z".to_string(), entry("z", &z_dir, 19003, 2));
    let registry = Registry::from_entries_for_test(entries);
    let supervisor = Supervisor::new(registry).unwrap();

    supervisor.start_all(StartMode::Production).unwrap();
    assert!(wait_for_marker(&x_dir, "start.marker", Duration::from_secs(5)));
    assert!(wait_for_marker(&y_dir, "start.marker", Duration::from_secs(5)));
    assert!(wait_for_marker(&z_dir, "start.marker", Duration::from_secs(5)));

    let z_start = marker_time(&z_dir, "start.marker");
    let x_start = marker_time(&x_dir, "start.marker");
    let y_start = marker_time(&y_dir, "start.marker");

    // z's whole band (install_order 2) must complete before the order-3
    // band begins spawning.
    assert!(z_start < x_start, "z (order 2) must start before x (order 3)");
    assert!(z_start < y_start, "z (order 2) must start before y (order 3)");
    // x and y, sharing a band, start within a small window of each other
    // rather than one waiting on the other.
    assert!((x_start - y_start).abs() < 2.0, "x and y should start concurrently");

    supervisor.shutdown_all().unwrap();
    assert!(wait_for_marker(&x_dir, "exit.marker", Duration::from_secs(5)));
    assert!(wait_for_marker(&y_dir, "exit.marker", Duration::from_secs(5)));
    assert!(wait_for_marker(&z_dir, "exit.marker", Duration::from_secs(5)));

    let x_exit = marker_time(&x_dir, "exit.marker");
    let y_exit = marker_time(&y_dir, "exit.marker");
    let z_exit = marker_time(&z_dir, "exit.marker");

    // The order-3 band (x, y) must fully exit before z's band is even
    // signalled; z has no artificial delay, so if shutdown_all raced the
    // bands, z would exit first.
    assert!(z_exit > x_exit, "z must stop after x's band has fully exited");
    assert!(z_exit > y_exit, "z must stop after y's band has fully exited");
}
