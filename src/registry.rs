//! C2: the service registry — the catalog of every service this installation
//! knows how to run, whether declared in the static manifest or discovered on
//! disk, along with the ports and startup order derived from it.
use crate::{
    constants::{
        DISCOVERED_INSTALL_ORDER, DISCOVERED_PORT_BASE, DISCOVERED_PORT_SPAN, PLATFORM_PREFIX,
        PORT_RANGE,
    },
    error::RegistryError,
    runtime,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    fs,
    path::Path,
};

/// How a service process is launched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionKind {
    /// A Python service managed directly by the supervisor (venv + entrypoint).
    /// `wsgi_runner`, when set, is the production-mode command (e.g. a
    /// gunicorn invocation) used instead of `entrypoint` unless the
    /// supervisor is asked to start the service in development mode.
    ManagedPython {
        directory: String,
        entrypoint: String,
        #[serde(default)]
        wsgi_runner: Option<String>,
    },
    /// An externally-built Java process (the identity provider).
    ExternalJava { directory: String, jar: String },
}

/// Where a `ServiceEntry` originated from, used to order and label entries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ServiceOrigin {
    /// Must be present for the platform to function (e.g. the identity provider).
    CoreRequired,
    /// Installed by default but may be disabled.
    DefaultOptional,
    /// A dependency of another service rather than a platform service itself.
    SystemDependency,
    /// Found on disk via the `<prefix>-*` filesystem scan, not in the manifest.
    Discovered,
}

/// A single entry in the service catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceEntry {
    pub name: String,
    pub origin: ServiceOrigin,
    pub execution: ExecutionKind,
    pub port: u16,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub install_order: i32,
    /// Relative path, under the service directory, of an HTTP health endpoint.
    /// `None` means only process liveness is checked.
    #[serde(default)]
    pub health_path: Option<String>,
}

impl ServiceEntry {
    /// The service's local base URL, assuming it binds on loopback.
    pub fn local_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

/// On-disk static manifest: services grouped by how mandatory they are.
#[derive(Debug, Clone, Deserialize)]
struct ManifestFile {
    #[serde(default)]
    core_required: Vec<ManifestEntry>,
    #[serde(default)]
    default_optional: Vec<ManifestEntry>,
    #[serde(default)]
    system_dependencies: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct ManifestEntry {
    name: String,
    execution: ExecutionKind,
    port: Option<u16>,
    #[serde(default)]
    depends_on: Vec<String>,
    install_order: i32,
    #[serde(default)]
    health_path: Option<String>,
}

/// The full set of services known to this installation, in no particular order.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    entries: BTreeMap<String, ServiceEntry>,
}

impl Registry {
    /// Builds a registry directly from a pre-assembled entry map, bypassing
    /// manifest loading and filesystem discovery. Used by other modules'
    /// tests that need a `Registry` without a manifest file on disk.
    #[cfg(test)]
    pub fn from_entries_for_test(entries: BTreeMap<String, ServiceEntry>) -> Self {
        Registry { entries }
    }

    /// Builds a registry from the static manifest plus a filesystem scan for
    /// undeclared `<prefix>-*` peer directories, assigning deterministic
    /// ports to any entry that doesn't carry one explicitly.
    pub fn build() -> Result<Self, RegistryError> {
        let manifest_path = runtime::service_manifest_path();
        let manifest = load_manifest(&manifest_path)?;

        let mut entries = BTreeMap::new();
        for (origin, list) in [
            (ServiceOrigin::CoreRequired, manifest.core_required),
            (ServiceOrigin::DefaultOptional, manifest.default_optional),
            (ServiceOrigin::SystemDependency, manifest.system_dependencies),
        ] {
            for item in list {
                if entries.contains_key(&item.name) {
                    return Err(RegistryError::DuplicateService(item.name));
                }
                let port = match item.port {
                    Some(p) => p,
                    None => derive_port(&item.name),
                };
                entries.insert(
                    item.name.clone(),
                    ServiceEntry {
                        name: item.name,
                        origin,
                        execution: item.execution,
                        port,
                        depends_on: item.depends_on,
                        install_order: item.install_order,
                        health_path: item.health_path,
                    },
                );
            }
        }

        for discovered in scan_discovered_peers(&runtime::install_root(), &entries)? {
            entries.insert(discovered.name.clone(), discovered);
        }

        let registry = Registry { entries };
        registry.validate_ports()?;
        registry.validate_dependencies()?;
        registry.validate_core_required_present()?;
        Ok(registry)
    }

    /// Looks up a single entry by name.
    pub fn get(&self, name: &str) -> Result<&ServiceEntry, RegistryError> {
        self.entries
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// All entries, ordered by name for determinism.
    pub fn all(&self) -> impl Iterator<Item = &ServiceEntry> {
        self.entries.values()
    }

    fn validate_ports(&self) -> Result<(), RegistryError> {
        let mut seen: BTreeMap<u16, &str> = BTreeMap::new();
        for entry in self.entries.values() {
            if !PORT_RANGE.contains(&entry.port) {
                return Err(RegistryError::NoPortAvailable(entry.name.clone()));
            }
            if let Some(&existing) = seen.get(&entry.port) {
                return Err(RegistryError::PortCollision {
                    port: entry.port,
                    first: existing.to_string(),
                    second: entry.name.clone(),
                });
            }
            seen.insert(entry.port, &entry.name);
        }
        Ok(())
    }

    /// A `core_required` entry must resolve to an installed directory on
    /// disk; a missing one means the installer never finished and is a
    /// fatal installation error (spec.md §4.2).
    fn validate_core_required_present(&self) -> Result<(), RegistryError> {
        for entry in self.entries.values() {
            if entry.origin != ServiceOrigin::CoreRequired {
                continue;
            }
            let directory = match &entry.execution {
                ExecutionKind::ManagedPython { directory, .. } => directory,
                ExecutionKind::ExternalJava { directory, .. } => directory,
            };
            if !Path::new(directory).is_dir() {
                return Err(RegistryError::MissingCoreService {
                    service: entry.name.clone(),
                    directory: directory.clone(),
                });
            }
        }
        Ok(())
    }

    fn validate_dependencies(&self) -> Result<(), RegistryError> {
        for entry in self.entries.values() {
            for dep in &entry.depends_on {
                if !self.entries.contains_key(dep) {
                    return Err(RegistryError::UnknownDependency {
                        service: entry.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Returns services ordered so that every dependency precedes its
    /// dependents (Kahn's algorithm, ties broken by name for determinism).
    pub fn service_start_order(&self) -> Result<Vec<String>, RegistryError> {
        let mut indegree: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();

        for entry in self.entries.values() {
            indegree.entry(entry.name.as_str()).or_insert(0);
            for dep in &entry.depends_on {
                *indegree.entry(entry.name.as_str()).or_insert(0) += 1;
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .insert(entry.name.as_str());
            }
        }

        let mut ready: BTreeSet<&str> = indegree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&name, _)| name)
            .collect();

        let mut order = Vec::with_capacity(self.entries.len());
        let mut queue: VecDeque<&str> = ready.iter().copied().collect();
        ready.clear();

        while let Some(name) = queue.pop_front() {
            order.push(name.to_string());
            if let Some(children) = dependents.get(name) {
                let mut newly_ready: Vec<&str> = Vec::new();
                for &child in children {
                    let deg = indegree.get_mut(child).expect("known node");
                    *deg -= 1;
                    if *deg == 0 {
                        newly_ready.push(child);
                    }
                }
                newly_ready.sort_unstable();
                for child in newly_ready {
                    queue.push_back(child);
                }
            }
        }

        if order.len() != self.entries.len() {
            let remaining: Vec<&str> = indegree
                .iter()
                .filter(|(name, &deg)| deg > 0 && !order.contains(&name.to_string()))
                .map(|(&name, _)| name)
                .collect();
            return Err(RegistryError::DependencyCycle {
                cycle: remaining.join(", "),
            });
        }

        Ok(order)
    }

    /// Writes the thin projection (`name -> {url, port}`) and the thick
    /// projection (adds execution details and dependency order) to disk.
    pub fn persist(&self) -> Result<(), RegistryError> {
        write_thin(&self.entries)?;
        write_thick(&self.entries)?;
        Ok(())
    }

    /// The thin projection in memory: `name -> {url, port}`, used for peer
    /// service URL discovery during config synthesis without a round trip
    /// through disk.
    pub fn thin_projection(&self) -> BTreeMap<String, ThinEntry> {
        self.entries
            .values()
            .map(|e| {
                (
                    e.name.clone(),
                    ThinEntry {
                        url: e.local_url(),
                        port: e.port,
                    },
                )
            })
            .collect()
    }
}

fn load_manifest(path: &Path) -> Result<ManifestFile, RegistryError> {
    let raw = fs::read_to_string(path).map_err(|source| RegistryError::ManifestRead {
        path: path.display().to_string(),
        source,
    })?;
    Ok(serde_json::from_str(&raw)?)
}

/// Deterministically derives a port in `[DISCOVERED_PORT_BASE,
/// DISCOVERED_PORT_BASE + DISCOVERED_PORT_SPAN)` from a service name by
/// hashing the name and reducing modulo the span width. Ties (two names
/// hashing to the same port) are broken by the caller's insertion order,
/// which walks entries alphabetically, so the lexicographically earlier
/// name always wins the slot and the later one advances to the next free
/// port in the band.
fn derive_port(name: &str) -> u16 {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();
    let raw = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    DISCOVERED_PORT_BASE + (raw % DISCOVERED_PORT_SPAN as u32) as u16
}

fn scan_discovered_peers(
    install_root: &Path,
    existing: &BTreeMap<String, ServiceEntry>,
) -> Result<Vec<ServiceEntry>, RegistryError> {
    let mut discovered = Vec::new();
    let mut taken_ports: BTreeSet<u16> = existing.values().map(|e| e.port).collect();

    let read_dir = match fs::read_dir(install_root) {
        Ok(rd) => rd,
        Err(_) => return Ok(discovered),
    };

    let mut candidates: Vec<String> = Vec::new();
    for entry in read_dir.flatten() {
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if !file_name.starts_with(&format!("{PLATFORM_PREFIX}-")) {
            continue;
        }
        if existing.contains_key(&file_name) {
            continue;
        }
        if !entry.path().is_dir() {
            continue;
        }
        candidates.push(file_name);
    }
    candidates.sort();

    for name in candidates {
        let mut port = derive_port(&name);
        while taken_ports.contains(&port) {
            port = if port + 1 < DISCOVERED_PORT_BASE + DISCOVERED_PORT_SPAN {
                port + 1
            } else {
                DISCOVERED_PORT_BASE
            };
        }
        taken_ports.insert(port);

        discovered.push(ServiceEntry {
            execution: ExecutionKind::ManagedPython {
                directory: install_root.join(&name).display().to_string(),
                entrypoint: "run.py".to_string(),
                wsgi_runner: None,
            },
            name,
            origin: ServiceOrigin::Discovered,
            port,
            depends_on: Vec::new(),
            install_order: DISCOVERED_INSTALL_ORDER,
            health_path: Some("/health".to_string()),
        });
    }

    Ok(discovered)
}

/// One entry of the thin registry projection: just enough for a peer service
/// to address another without knowing how it is launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinEntry {
    pub url: String,
    pub port: u16,
}

fn write_thin(entries: &BTreeMap<String, ServiceEntry>) -> Result<(), RegistryError> {
    let thin: BTreeMap<&str, ThinEntry> = entries
        .values()
        .map(|e| {
            (
                e.name.as_str(),
                ThinEntry {
                    url: e.local_url(),
                    port: e.port,
                },
            )
        })
        .collect();
    let path = runtime::thin_registry_path();
    write_json(&path, &thin)
}

fn write_thick(entries: &BTreeMap<String, ServiceEntry>) -> Result<(), RegistryError> {
    let path = runtime::thick_registry_path();
    write_json(&path, entries)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), RegistryError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| RegistryError::WriteFailed {
            path: path.display().to_string(),
            source,
        })?;
    }
    let serialized = serde_json::to_string_pretty(value)?;
    fs::write(path, serialized).map_err(|source| RegistryError::WriteFailed {
        path: path.display().to_string(),
        source,
    })
}
