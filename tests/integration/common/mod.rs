//! Shared helpers for the integration test binaries: an install-root
//! fixture builder and small poll-with-deadline utilities, mirroring the
//! conventions used for the crate's own on-disk layout.
#![allow(dead_code)]
use serde_json::json;
use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
use tempfile::TempDir;

/// Every test that calls `runtime::init` mutates the same process-global
/// context, so tests in one binary must not run concurrently. Hold this
/// for the lifetime of any test that touches `helmd::runtime`.
pub fn env_lock() -> std::sync::MutexGuard<'static, ()> {
    helmd::test_utils::env_lock()
}

/// A scratch install root with `services.json` and a directory per
/// `core_required` entry, so `Registry::build()` (and anything built on
/// top of it) can run against a realistic, self-contained layout.
pub struct Fixture {
    pub dir: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        Fixture {
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    /// Creates `<root>/<name>/run.py` so a `ManagedPython` entry pointed at
    /// this directory passes the core-required presence check.
    pub fn service_dir(&self, name: &str) -> PathBuf {
        let dir = self.root().join(name);
        fs::create_dir_all(&dir).expect("create service dir");
        dir
    }

    pub fn write_manifest(&self, manifest: &serde_json::Value) {
        let path = self.root().join("services.json");
        fs::write(path, serde_json::to_string_pretty(manifest).unwrap()).expect("write manifest");
    }
}

pub fn managed_python_entry(
    name: &str,
    directory: &Path,
    port: Option<u16>,
    install_order: i32,
    depends_on: &[&str],
) -> serde_json::Value {
    let mut entry = json!({
        "name": name,
        "execution": {
            "kind": "managed_python",
            "directory": directory.display().to_string(),
            "entrypoint": "run.py",
        },
        "install_order": install_order,
        "depends_on": depends_on,
    });
    if let Some(port) = port {
        entry["port"] = json!(port);
    }
    entry
}

/// Polls `check` every `interval` until it returns `true` or `deadline` elapses.
pub fn wait_until<F: FnMut() -> bool>(deadline: Duration, interval: Duration, mut check: F) -> bool {
    let start = Instant::now();
    loop {
        if check() {
            return true;
        }
        if start.elapsed() >= deadline {
            return false;
        }
        std::thread::sleep(interval);
    }
}
