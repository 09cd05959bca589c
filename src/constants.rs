//! Constants and layout values for the Helm orchestrator core.
//!
//! This module centralizes magic numbers, file names, and defaults used
//! throughout the crate so they are defined once and documented in place.

use std::time::Duration;

/// Prefix used when scanning for peer services on disk (`<PREFIX>-*`
/// directories are candidates for discovery).
pub const PLATFORM_PREFIX: &str = "hivematrix";

/// Name of the master configuration document under `instance/configs`.
pub const MASTER_CONFIG_FILE: &str = "master_config.json";

/// Name of the thin registry projection (`name -> {url, port}`).
pub const THIN_REGISTRY_FILE: &str = "thin-registry.json";

/// Name of the thick registry projection (adds directory/entrypoint/flags).
pub const THICK_REGISTRY_FILE: &str = "thick-registry.json";

/// Name of the static service manifest consulted by the registry.
pub const SERVICE_MANIFEST_FILE: &str = "services.json";

/// Default interval between health-monitor probe ticks.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(5);

/// Timeout applied to a single HTTP health probe call.
pub const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout applied to the TCP port-reachability probe preceding an HTTP
/// health check.
pub const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Maximum time allowed for a service to reach `running` after spawn.
pub const START_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval at which the post-spawn readiness window is polled.
pub const START_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Total time budget for graceful shutdown (TERM) before escalating to KILL.
pub const STOP_GRACE_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval at which liveness is polled while waiting for a stop to complete.
pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default log retention horizon, in days, for the centralized log store.
pub const DEFAULT_LOG_RETENTION_DAYS: i64 = 90;

/// Maximum number of log entries returned by a single query page.
pub const LOG_QUERY_MAX_LIMIT: i64 = 1000;

/// Maximum number of log entries accepted in a single ingest batch.
pub const LOG_INGEST_MAX_BATCH: usize = 500;

/// Lifetime ceiling for a service token, per spec: short-lived.
pub const SERVICE_TOKEN_MAX_LIFETIME: Duration = Duration::from_secs(5 * 60);

/// Port range considered valid for a `ServiceEntry`.
pub const PORT_RANGE: std::ops::RangeInclusive<u16> = 1..=65535;

/// Base of the deterministic port band assigned to discovered services.
pub const DISCOVERED_PORT_BASE: u16 = 5000;

/// Width of the deterministic port band assigned to discovered services.
pub const DISCOVERED_PORT_SPAN: u16 = 900;

/// Install order assigned to services synthesized from a filesystem scan.
pub const DISCOVERED_INSTALL_ORDER: i32 = 99;

/// Retries performed for a single IDP bootstrap step before surfacing failure.
pub const IDP_BOOTSTRAP_RETRIES: u32 = 3;

/// Linear backoff applied between IDP bootstrap retries.
pub const IDP_BOOTSTRAP_BACKOFF: Duration = Duration::from_secs(1);

/// The four permission groups the identity provider must carry.
pub const IDP_PERMISSION_GROUPS: [&str; 4] = ["admins", "technicians", "billing", "client"];

/// Name of the service that fronts JWKS/session-validation for the rest of
/// the platform. This is the only service that receives a JWT signing
/// keypair and the direct (non-proxied) identity-provider backend URL.
pub const IDENTITY_SERVICE_NAME: &str = "hivematrix-core";
