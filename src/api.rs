//! C8: the control API — an `axum` HTTP surface over the orchestrator's
//! synchronous core. The router owns its own `tokio` runtime; every handler
//! that touches the supervisor, registry, or log store runs the blocking
//! call on `tokio::task::spawn_blocking` rather than making the core async.
use crate::{
    constants::{IDENTITY_SERVICE_NAME, SERVICE_TOKEN_MAX_LIFETIME},
    error::{ApiError, IdpError},
    health::ServiceHealth,
    ipc::StartMode,
    logstore::{LogEntry, LogEntryInput, LogLevel, LogQuery, MetricPoint},
    orchestrator::Orchestrator,
    registry::ServiceEntry,
    supervisor::ServiceStatus,
};
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

/// Verifies bearer tokens against the identity service's published JWKS,
/// caching the key set until a `kid` miss forces a refresh.
pub struct JwtVerifier {
    identity_base_url: String,
    keys: Mutex<Option<HashMap<String, DecodingKey>>>,
}

impl JwtVerifier {
    pub fn new(identity_base_url: impl Into<String>) -> Self {
        JwtVerifier {
            identity_base_url: identity_base_url.into(),
            keys: Mutex::new(None),
        }
    }

    fn keys(&self, force_refresh: bool) -> Result<HashMap<String, DecodingKey>, ApiError> {
        let mut cache = self.keys.lock().expect("jwks cache mutex poisoned");
        if cache.is_none() || force_refresh {
            *cache = Some(fetch_jwks(&self.identity_base_url)?);
        }
        Ok(cache.clone().expect("cache populated above"))
    }

    fn verify(&self, token: &str) -> Result<RawClaims, ApiError> {
        let header = decode_header(token).map_err(|_| ApiError::Unauthorized("malformed token header".to_string()))?;
        let kid = header.kid.ok_or_else(|| ApiError::Unauthorized("token is missing a key id".to_string()))?;

        let mut keys = self.keys(false)?;
        if !keys.contains_key(&kid) {
            keys = self.keys(true)?;
        }
        let key = keys
            .get(&kid)
            .ok_or_else(|| ApiError::Unauthorized("token signed by an unrecognized key".to_string()))?;

        let validation = Validation::new(header.alg);
        let data = decode::<RawClaims>(token, key, &validation).map_err(|_| ApiError::Unauthorized("token signature or claims invalid".to_string()))?;
        Ok(data.claims)
    }
}

#[derive(Debug, Deserialize)]
struct Jwks {
    keys: Vec<JwkKey>,
}

#[derive(Debug, Deserialize)]
struct JwkKey {
    kid: String,
    n: String,
    e: String,
}

fn fetch_jwks(identity_base_url: &str) -> Result<HashMap<String, DecodingKey>, ApiError> {
    let url = format!("{identity_base_url}/.well-known/jwks.json");
    let response = reqwest::blocking::get(&url).map_err(IdpError::from)?;
    let jwks: Jwks = response.json().map_err(IdpError::from)?;
    jwks.keys
        .into_iter()
        .map(|k| {
            let key = DecodingKey::from_rsa_components(&k.n, &k.e).map_err(|e| ApiError::Internal(e.to_string()))?;
            Ok((k.kid, key))
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct RawClaims {
    sub: String,
    exp: i64,
    #[serde(default)]
    iat: i64,
    #[serde(default)]
    permission_level: Option<String>,
    #[serde(default)]
    groups: Vec<String>,
    #[serde(default)]
    jti: Option<String>,
    #[serde(default, rename = "type")]
    token_type: Option<String>,
    #[serde(default)]
    calling_service: Option<String>,
    #[serde(default)]
    target_service: Option<String>,
}

/// The authenticated caller of a request: either a human operator's session
/// or a short-lived inter-service credential.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Principal {
    User {
        sub: String,
        permission_level: String,
        groups: Vec<String>,
        jti: Option<String>,
    },
    Service {
        calling_service: String,
        target_service: String,
    },
}

impl Principal {
    fn is_admin(&self) -> bool {
        matches!(self, Principal::User { permission_level, .. } if permission_level == "admin")
    }
}

fn require_admin(principal: &Principal) -> Result<(), ApiError> {
    match principal {
        Principal::Service { .. } => Ok(()),
        Principal::User { .. } if principal.is_admin() => Ok(()),
        Principal::User { .. } => Err(ApiError::Forbidden("admin permission required".to_string())),
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<String, ApiError> {
    let raw = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("missing Authorization header".to_string()))?;
    raw.strip_prefix("Bearer ")
        .map(str::to_string)
        .ok_or_else(|| ApiError::Unauthorized("Authorization header must be a bearer token".to_string()))
}

fn validate_session(identity_base_url: &str, token: &str) -> Result<(), ApiError> {
    let url = format!("{identity_base_url}/api/sessions/validate");
    let response = reqwest::blocking::Client::new()
        .post(&url)
        .bearer_auth(token)
        .send()
        .map_err(IdpError::from)?;
    if response.status().is_success() {
        Ok(())
    } else {
        Err(ApiError::Unauthorized("session has been revoked".to_string()))
    }
}

/// Verifies the caller's bearer token and returns the authenticated
/// principal. User tokens are additionally checked against the identity
/// service's session-validation endpoint so a revoked session is rejected
/// even before its `exp`; service tokens are accepted on signature + a
/// short-lived `exp` alone.
fn authenticate(headers: &HeaderMap, ctx: &ApiContext) -> Result<Principal, ApiError> {
    let token = bearer_token(headers)?;
    let claims = ctx.verifier.verify(&token)?;

    if claims.token_type.as_deref() == Some("service") {
        let calling_service = claims
            .calling_service
            .ok_or_else(|| ApiError::Unauthorized("service token missing calling_service".to_string()))?;
        let target_service = claims
            .target_service
            .ok_or_else(|| ApiError::Unauthorized("service token missing target_service".to_string()))?;
        let lifetime = Duration::from_secs((claims.exp - claims.iat).max(0) as u64);
        if lifetime > SERVICE_TOKEN_MAX_LIFETIME {
            return Err(ApiError::Unauthorized("service token exceeds the maximum lifetime".to_string()));
        }
        return Ok(Principal::Service { calling_service, target_service });
    }

    validate_session(&ctx.identity_base_url, &token)?;
    Ok(Principal::User {
        sub: claims.sub,
        permission_level: claims.permission_level.unwrap_or_default(),
        groups: claims.groups,
        jti: claims.jti,
    })
}

/// Shared state handed to every route: the orchestrator plus the JWT
/// verifier and the identity service's base URL used for session checks.
#[derive(Clone)]
pub struct ApiContext {
    pub orchestrator: Orchestrator,
    pub verifier: std::sync::Arc<JwtVerifier>,
    pub identity_base_url: String,
}

impl ApiContext {
    pub fn new(orchestrator: Orchestrator) -> Self {
        let identity_base_url = std::env::var("CORE_SERVICE_URL").unwrap_or_else(|_| {
            orchestrator
                .registry
                .get(IDENTITY_SERVICE_NAME)
                .map(|e| e.local_url())
                .unwrap_or_else(|_| "http://127.0.0.1:5000".to_string())
        });
        let verifier = std::sync::Arc::new(JwtVerifier::new(identity_base_url.clone()));
        ApiContext {
            orchestrator,
            verifier,
            identity_base_url,
        }
    }
}

/// Runs a blocking closure on the tokio blocking pool, folding a join
/// failure into the same `ApiError` surface as the closure's own errors.
async fn blocking<F, T>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| ApiError::Internal(e.to_string()))?
}

pub fn build_router(ctx: ApiContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(orchestrator_health))
        .route("/services", get(list_services))
        .route("/services/status", get(status_all))
        .route("/services/{name}/status", get(status_one))
        .route("/services/{name}/start", post(start_service))
        .route("/services/{name}/stop", post(stop_service))
        .route("/services/{name}/restart", post(restart_service))
        .route("/logs/ingest", post(ingest_logs))
        .route("/logs", get(query_logs))
        .route("/metrics/{name}", get(query_metrics))
        .route("/dashboard/status", get(dashboard_status))
        .layer(cors)
        .with_state(ctx)
}

async fn orchestrator_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}

async fn list_services(State(ctx): State<ApiContext>, headers: HeaderMap) -> Result<Json<Vec<ServiceEntry>>, ApiError> {
    blocking(move || {
        authenticate(&headers, &ctx)?;
        Ok(Json(ctx.orchestrator.registry.all().cloned().collect()))
    })
    .await
}

async fn status_all(State(ctx): State<ApiContext>, headers: HeaderMap) -> Result<Json<BTreeMap<String, ServiceStatus>>, ApiError> {
    blocking(move || {
        authenticate(&headers, &ctx)?;
        let statuses = ctx.orchestrator.status_all()?;
        Ok(Json(statuses.into_iter().map(|s| (s.name.clone(), s)).collect()))
    })
    .await
}

async fn status_one(State(ctx): State<ApiContext>, headers: HeaderMap, Path(name): Path<String>) -> Result<Json<ServiceStatus>, ApiError> {
    blocking(move || {
        authenticate(&headers, &ctx)?;
        Ok(Json(ctx.orchestrator.supervisor.status(&name)?))
    })
    .await
}

#[derive(Debug, Deserialize)]
struct StartBody {
    #[serde(default)]
    mode: Option<StartMode>,
}

async fn start_service(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
    Path(name): Path<String>,
    body: Option<Json<StartBody>>,
) -> Result<Json<ServiceStatus>, ApiError> {
    blocking(move || {
        let principal = authenticate(&headers, &ctx)?;
        require_admin(&principal)?;

        let current = ctx.orchestrator.supervisor.status(&name)?;
        if current.state == crate::supervisor::ServiceState::Running {
            return Err(ApiError::AlreadyRunning(name));
        }

        let mode = body.and_then(|b| b.0.mode).unwrap_or_default();
        Ok(Json(ctx.orchestrator.start_service(&name, mode)?))
    })
    .await
}

async fn stop_service(State(ctx): State<ApiContext>, headers: HeaderMap, Path(name): Path<String>) -> Result<Json<ServiceStatus>, ApiError> {
    blocking(move || {
        let principal = authenticate(&headers, &ctx)?;
        require_admin(&principal)?;
        Ok(Json(ctx.orchestrator.stop_service(&name)?))
    })
    .await
}

async fn restart_service(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
    Path(name): Path<String>,
    body: Option<Json<StartBody>>,
) -> Result<Json<ServiceStatus>, ApiError> {
    blocking(move || {
        let principal = authenticate(&headers, &ctx)?;
        require_admin(&principal)?;
        let mode = body.and_then(|b| b.0.mode).unwrap_or_default();
        Ok(Json(ctx.orchestrator.restart_service(&name, mode)?))
    })
    .await
}

/// One log line as submitted by a calling service: a batch-level
/// `service_name` carries the slug once rather than repeating it per line.
#[derive(Debug, Deserialize)]
struct IngestLine {
    level: LogLevel,
    message: String,
    #[serde(default)]
    timestamp: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    context: serde_json::Value,
    #[serde(default)]
    trace_id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IngestBody {
    service_name: String,
    logs: Vec<IngestLine>,
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    accepted: usize,
}

/// A service name slug: lowercase ASCII, starting with a letter, and made up
/// only of letters, digits, `-`, and `_` afterward.
fn is_valid_slug(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

async fn ingest_logs(State(ctx): State<ApiContext>, headers: HeaderMap, Json(body): Json<IngestBody>) -> Result<Json<IngestResponse>, ApiError> {
    blocking(move || {
        authenticate(&headers, &ctx)?;

        if !is_valid_slug(&body.service_name) {
            return Err(ApiError::BadRequest(format!("service_name '{}' is not a valid slug", body.service_name)));
        }

        let hostname = crate::runtime::local_hostname();
        let entries: Vec<LogEntryInput> = body
            .logs
            .into_iter()
            .map(|line| LogEntryInput {
                timestamp: line.timestamp.unwrap_or_else(chrono::Utc::now),
                service_name: body.service_name.clone(),
                level: line.level,
                message: line.message,
                context: line.context,
                trace_id: line.trace_id,
                user_id: line.user_id,
                hostname: hostname.clone(),
                process_id: None,
            })
            .collect();

        let accepted = ctx.orchestrator.log_store.ingest(&entries)?;
        Ok(Json(IngestResponse { accepted }))
    })
    .await
}

#[derive(Debug, Deserialize)]
struct LogFilters {
    service_name: Option<String>,
    min_level: Option<String>,
    since: Option<chrono::DateTime<chrono::Utc>>,
    until: Option<chrono::DateTime<chrono::Utc>>,
    trace_id: Option<String>,
    user_id: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn query_logs(State(ctx): State<ApiContext>, headers: HeaderMap, Query(filters): Query<LogFilters>) -> Result<Json<Vec<LogEntry>>, ApiError> {
    blocking(move || {
        authenticate(&headers, &ctx)?;
        let mut query = LogQuery::new();
        query.service_name = filters.service_name;
        query.min_level = filters
            .min_level
            .map(|raw| raw.parse::<LogLevel>().map_err(|_| ApiError::BadRequest(format!("unknown log level '{raw}'"))))
            .transpose()?;
        query.since = filters.since;
        query.until = filters.until;
        query.trace_id = filters.trace_id;
        query.user_id = filters.user_id;
        if let Some(limit) = filters.limit {
            query.limit = limit;
        }
        if let Some(offset) = filters.offset {
            query.offset = offset;
        }
        Ok(Json(ctx.orchestrator.log_store.query(&query)?))
    })
    .await
}

#[derive(Debug, Deserialize)]
struct MetricFilters {
    since: Option<chrono::DateTime<chrono::Utc>>,
    until: Option<chrono::DateTime<chrono::Utc>>,
}

async fn query_metrics(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Query(filters): Query<MetricFilters>,
) -> Result<Json<Vec<MetricPoint>>, ApiError> {
    blocking(move || {
        authenticate(&headers, &ctx)?;
        ctx.orchestrator.registry.get(&name)?;
        Ok(Json(ctx.orchestrator.log_store.query_metrics(&name, filters.since, filters.until)?))
    })
    .await
}

async fn dashboard_status(State(ctx): State<ApiContext>, headers: HeaderMap) -> Result<Json<Vec<ServiceHealth>>, ApiError> {
    blocking(move || {
        authenticate(&headers, &ctx)?;
        Ok(Json(ctx.orchestrator.health_tick()))
    })
    .await
}
