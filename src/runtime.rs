//! Resolution of the on-disk layout rooted at the orchestrator's install directory.
use std::{
    env,
    path::PathBuf,
    sync::{OnceLock, RwLock},
};

#[cfg(test)]
use std::path::Path;

use crate::constants::{MASTER_CONFIG_FILE, SERVICE_MANIFEST_FILE, THICK_REGISTRY_FILE, THIN_REGISTRY_FILE};

#[derive(Debug, Clone)]
struct RuntimeContext {
    install_root: PathBuf,
}

static CONTEXT: OnceLock<RwLock<RuntimeContext>> = OnceLock::new();

fn context_lock() -> &'static RwLock<RuntimeContext> {
    CONTEXT.get_or_init(|| RwLock::new(RuntimeContext::from_root(default_install_root())))
}

fn default_install_root() -> PathBuf {
    env::var_os("HELM_INSTALL_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/opt/hivematrix"))
}

impl RuntimeContext {
    fn from_root(install_root: PathBuf) -> Self {
        Self { install_root }
    }
}

/// Repoints the orchestrator at a different install root. Used by the CLI
/// entry point (via `HELM_INSTALL_ROOT`) and by tests.
pub fn init(install_root: PathBuf) {
    let mut guard = context_lock().write().expect("runtime context poisoned");
    *guard = RuntimeContext::from_root(install_root);
}

#[cfg(test)]
pub fn init_with_test_root(root: &Path) {
    init(root.to_path_buf());
}

/// Root directory under which every other path in this module is nested.
pub fn install_root() -> PathBuf {
    context_lock()
        .read()
        .expect("runtime context poisoned")
        .install_root
        .clone()
}

/// Directory holding one pidfile per managed service.
pub fn pids_dir() -> PathBuf {
    install_root().join("pids")
}

/// Directory holding captured stdout/stderr for each managed service.
pub fn logs_dir() -> PathBuf {
    install_root().join("logs")
}

/// Directory holding the mutable instance state: master config, registries,
/// synthesized per-service configuration, and the centralized log database.
pub fn instance_dir() -> PathBuf {
    install_root().join("instance")
}

/// Directory holding synthesized `.env`/`.conf` files, one per service.
pub fn instance_configs_dir() -> PathBuf {
    instance_dir().join("configs")
}

/// Path to the master configuration document.
pub fn master_config_path() -> PathBuf {
    instance_dir().join("configs").join(MASTER_CONFIG_FILE)
}

/// Path to the thin registry projection.
pub fn thin_registry_path() -> PathBuf {
    instance_dir().join(THIN_REGISTRY_FILE)
}

/// Path to the thick registry projection.
pub fn thick_registry_path() -> PathBuf {
    instance_dir().join(THICK_REGISTRY_FILE)
}

/// Path to the static service manifest shipped alongside the orchestrator.
pub fn service_manifest_path() -> PathBuf {
    install_root().join(SERVICE_MANIFEST_FILE)
}

/// Path to the centralized log/metric store's sqlite database file.
pub fn logstore_db_path() -> PathBuf {
    instance_dir().join("logstore.db")
}

/// Path to the control-channel Unix domain socket.
pub fn control_socket_path() -> PathBuf {
    install_root().join("helm.sock")
}

/// Directory holding the identity service's JWT signing keypair.
pub fn jwt_keys_dir() -> PathBuf {
    instance_dir().join("keys")
}

/// Path to the identity service's JWT signing private key, generated on
/// first boot if absent.
pub fn jwt_private_key_path() -> PathBuf {
    jwt_keys_dir().join("jwt_signing.pem")
}

/// Path to the identity service's JWT verification public key.
pub fn jwt_public_key_path() -> PathBuf {
    jwt_keys_dir().join("jwt_signing.pub.pem")
}

/// Path to the pidfile for a single named service.
pub fn pidfile_path(service_name: &str) -> PathBuf {
    pids_dir().join(format!("{service_name}.pid"))
}

/// Path to the captured stdout log for a single named service. stdout and
/// stderr are always separate files (spec.md §4.5, §6); the core never
/// truncates or rotates them.
pub fn stdout_log_path(service_name: &str) -> PathBuf {
    logs_dir().join(format!("{service_name}.stdout.log"))
}

/// Path to the captured stderr log for a single named service.
pub fn stderr_log_path(service_name: &str) -> PathBuf {
    logs_dir().join(format!("{service_name}.stderr.log"))
}

/// The machine's own hostname, used to stamp log entries the orchestrator
/// writes on a service's behalf (crash reports, its own structured logs).
/// Falls back to `"localhost"` if the kernel call fails.
pub fn local_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|s| s.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Ensures every directory this module resolves exists, creating it if needed.
pub fn ensure_directories() -> std::io::Result<()> {
    for dir in [pids_dir(), logs_dir(), instance_dir(), instance_configs_dir()] {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}
