//! Bundles the long-lived subsystems (master config, registry, supervisor,
//! log store) behind one handle so the control API and the CLI boot path
//! share the same state instead of reaching for separate globals.
use crate::{
    constants::DEFAULT_LOG_RETENTION_DAYS,
    error::ApiError,
    health::{self, ServiceHealth},
    idp,
    ipc::StartMode,
    logstore::LogStore,
    master_config::MasterConfig,
    metrics::ResourceSampler,
    registry::Registry,
    runtime,
    supervisor::{ServiceStatus, Supervisor},
    synth,
};
use std::sync::{Arc, Mutex, RwLock};

/// The orchestrator's full in-process state, cheaply cloneable (every field
/// is an `Arc`) so it can be handed to `axum` as shared `State`.
#[derive(Clone)]
pub struct Orchestrator {
    pub master: Arc<RwLock<MasterConfig>>,
    pub registry: Arc<Registry>,
    pub supervisor: Arc<Supervisor>,
    pub log_store: Arc<LogStore>,
    sampler: Arc<Mutex<ResourceSampler>>,
}

impl Orchestrator {
    /// Performs the full boot sequence: load or create the master config,
    /// build and persist the registry, synthesize every service's config,
    /// adopt any already-running processes, and open the log store.
    pub fn bootstrap() -> Result<Self, ApiError> {
        let master = MasterConfig::load_or_default()?;
        let registry = Registry::build()?;
        registry.persist()?;

        let peers = registry.thin_projection();
        for entry in registry.all() {
            synth::synthesize(entry, &master, &peers)?;
        }

        let supervisor = Supervisor::new(registry.clone())?;
        let log_store = LogStore::open(&runtime::logstore_db_path())?;

        Ok(Orchestrator {
            master: Arc::new(RwLock::new(master)),
            registry: Arc::new(registry),
            supervisor: Arc::new(supervisor),
            log_store: Arc::new(log_store),
            sampler: Arc::new(Mutex::new(ResourceSampler::new())),
        })
    }

    pub fn start_service(&self, name: &str, mode: StartMode) -> Result<ServiceStatus, ApiError> {
        self.supervisor.start(name, mode)?;
        Ok(self.supervisor.status(name)?)
    }

    pub fn stop_service(&self, name: &str) -> Result<ServiceStatus, ApiError> {
        self.supervisor.stop(name)?;
        Ok(self.supervisor.status(name)?)
    }

    pub fn restart_service(&self, name: &str, mode: StartMode) -> Result<ServiceStatus, ApiError> {
        self.supervisor.restart(name, mode)?;
        Ok(self.supervisor.status(name)?)
    }

    pub fn status_all(&self) -> Result<Vec<ServiceStatus>, ApiError> {
        Ok(self.supervisor.status_all()?)
    }

    /// Runs one health-monitor tick across every registered service.
    pub fn health_tick(&self) -> Vec<ServiceHealth> {
        let mut sampler = self.sampler.lock().expect("resource sampler mutex poisoned");
        health::probe_tick(&self.registry, &self.supervisor, &mut sampler, &self.log_store)
    }

    pub fn health_one(&self, name: &str) -> Result<ServiceHealth, ApiError> {
        Ok(health::probe_service(&self.registry, &self.supervisor, name)?)
    }

    /// Deletes log entries past the configured retention horizon.
    pub fn enforce_log_retention(&self) -> Result<usize, ApiError> {
        Ok(self.log_store.enforce_retention(DEFAULT_LOG_RETENTION_DAYS)?)
    }

    /// Applies a hostname change: reconciles the identity provider's realm
    /// against the new host, persists the new hostname, and re-synthesizes
    /// every service's configuration so `HELM_HOSTNAME`/`OIDC_ISSUER` reflect
    /// it on next start.
    pub fn change_hostname(&self, new_hostname: &str) -> Result<(), ApiError> {
        let mut master = self.master.write().expect("master config lock poisoned");
        idp::rebootstrap_for_hostname_change(&mut master, new_hostname)?;
        master.set_hostname(new_hostname);
        master.save()?;

        let peers = self.registry.thin_projection();
        for entry in self.registry.all() {
            synth::synthesize(entry, &master, &peers)?;
        }
        Ok(())
    }

    /// A read-only snapshot of the master configuration.
    pub fn master_snapshot(&self) -> MasterConfig {
        self.master.read().expect("master config lock poisoned").clone()
    }
}
