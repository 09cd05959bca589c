//! Per-subsystem error types.
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Errors raised while loading, validating, or persisting the master configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read master config: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse master config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("master config schema version {found} is newer than the supported {supported}")]
    UnsupportedSchema { found: u32, supported: u32 },

    #[error("identity provider is not configured")]
    IdentityProviderMissing,

    #[error("master config path has no parent directory: {0}")]
    InvalidPath(String),
}

/// Errors raised by the service registry: static manifest loading, filesystem
/// discovery, port assignment, and registry persistence.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read service manifest at {path}: {source}")]
    ManifestRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse service manifest: {0}")]
    ManifestParse(#[from] serde_json::Error),

    #[error("duplicate service name '{0}' across manifest buckets")]
    DuplicateService(String),

    #[error("port {port} is claimed by both '{first}' and '{second}'")]
    PortCollision { port: u16, first: String, second: String },

    #[error("service '{0}' has no port assigned and none could be derived")]
    NoPortAvailable(String),

    #[error("dependency cycle detected among services: {cycle}")]
    DependencyCycle { cycle: String },

    #[error("service '{service}' declares unknown dependency '{dependency}'")]
    UnknownDependency { service: String, dependency: String },

    #[error("failed to write registry file {path}: {source}")]
    WriteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("service '{0}' is not registered")]
    NotFound(String),

    #[error("core_required service '{service}' has no installed directory at '{directory}'")]
    MissingCoreService { service: String, directory: String },
}

/// Errors raised while synthesizing per-service configuration artifacts.
#[derive(Debug, Error)]
pub enum SynthError {
    #[error("failed to write synthesized config for '{service}': {source}")]
    WriteFailed {
        service: String,
        #[source]
        source: std::io::Error,
    },

    #[error("service '{0}' is missing a required template value")]
    MissingValue(String),
}

/// Errors raised while bootstrapping or reconciling the identity provider.
#[derive(Debug, Error)]
pub enum IdpError {
    #[error("identity provider admin request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("identity provider returned status {status} for {step}: {body}")]
    UnexpectedStatus {
        step: String,
        status: u16,
        body: String,
    },

    #[error("identity provider response for {step} was malformed: {source}")]
    MalformedResponse {
        step: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("bootstrap step '{step}' failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        step: String,
        attempts: u32,
        #[source]
        source: Box<IdpError>,
    },
}

/// Errors raised by the process supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("service '{0}' is not registered")]
    UnknownService(String),

    #[error("failed to spawn service '{service}': {source}")]
    SpawnFailed {
        service: String,
        #[source]
        source: std::io::Error,
    },

    #[error("port {port} for service '{service}' is already in use by an unmanaged process")]
    PortInUse { service: String, port: u16 },

    #[error("service '{0}' did not become ready within the startup timeout")]
    StartTimeout(String),

    #[error("service '{0}' did not stop within the shutdown timeout")]
    StopTimeout(String),

    #[error("failed to signal service '{service}': {source}")]
    SignalFailed {
        service: String,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("pidfile error for service '{service}': {source}")]
    PidFile {
        service: String,
        #[source]
        source: std::io::Error,
    },

    #[error("mutex poisoned: {0}")]
    MutexPoisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for SupervisorError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        SupervisorError::MutexPoisoned(err.to_string())
    }
}

/// Errors raised by the health and metrics monitor.
#[derive(Debug, Error)]
pub enum HealthError {
    #[error("probe request failed for '{service}': {source}")]
    ProbeFailed {
        service: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("service '{0}' is not registered")]
    UnknownService(String),
}

/// Errors raised by the centralized log and metric store.
#[derive(Debug, Error)]
pub enum LogStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to prepare log store directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("log batch rejected: entry {index} is malformed: {reason}")]
    MalformedEntry { index: usize, reason: String },

    #[error("requested limit {0} exceeds the maximum page size")]
    LimitTooLarge(i64),
}

/// Errors surfaced by the control API, mapped to HTTP responses.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Health(#[from] HealthError),

    #[error(transparent)]
    LogStore(#[from] LogStoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Idp(#[from] IdpError),

    #[error(transparent)]
    Synth(#[from] SynthError),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("service '{0}' is already running")]
    AlreadyRunning(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Registry(RegistryError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Registry(_) => StatusCode::BAD_REQUEST,
            ApiError::Supervisor(SupervisorError::UnknownService(_)) => StatusCode::NOT_FOUND,
            ApiError::Supervisor(
                SupervisorError::StartTimeout(_) | SupervisorError::StopTimeout(_),
            ) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Supervisor(SupervisorError::PortInUse { .. }) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Supervisor(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Health(HealthError::UnknownService(_)) => StatusCode::NOT_FOUND,
            ApiError::Health(_) => StatusCode::BAD_GATEWAY,
            ApiError::LogStore(LogStoreError::LimitTooLarge(_))
            | ApiError::LogStore(LogStoreError::MalformedEntry { .. }) => StatusCode::BAD_REQUEST,
            ApiError::LogStore(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Config(ConfigError::IdentityProviderMissing) => StatusCode::CONFLICT,
            ApiError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Idp(_) => StatusCode::BAD_GATEWAY,
            ApiError::Synth(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::AlreadyRunning(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
