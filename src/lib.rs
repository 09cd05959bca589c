//! Orchestrator core for the Helm platform: service discovery, process
//! supervision, configuration synthesis, identity-provider bootstrap,
//! health monitoring, and the control API that fronts them.

#![warn(unused_crate_dependencies)]
// These dependencies are only used in the binary (src/bin/main.rs).
// Test dependencies are only used in test code.
#[cfg(test)]
use assert_cmd as _;
use ctrlc as _;
// OpenSSL is only needed for static linking on Linux.
#[cfg(target_os = "linux")]
use openssl_sys as _;
#[cfg(test)]
use predicates as _;
use tracing_subscriber as _;

/// C8: the control API — HTTP surface, JWT verification, principal resolution.
pub mod api;

/// Command-line interface.
pub mod cli;

/// Layout constants and tunables shared across every module.
pub mod constants;

/// Per-subsystem error types.
pub mod error;

/// C6: the health and resource monitor.
pub mod health;

/// C4: identity-provider bootstrap and reconciliation.
pub mod idp;

/// CLI-to-daemon control channel.
pub mod ipc;

/// C7: the centralized append-only log and metric store.
pub mod logstore;

/// C1: the master configuration document.
pub mod master_config;

/// Resource sampling (CPU/RSS) shared by the health monitor and log store.
pub mod metrics;

/// Bundles every subsystem behind one handle shared by the CLI and the API.
pub mod orchestrator;

/// C2: the service registry and filesystem discovery.
pub mod registry;

/// Resolution of the on-disk layout rooted at the install directory.
pub mod runtime;

/// C5: the process supervisor.
pub mod supervisor;

/// C3: per-service configuration synthesis.
pub mod synth;

/// Shared test-only helpers.
#[doc(hidden)]
pub mod test_utils;
