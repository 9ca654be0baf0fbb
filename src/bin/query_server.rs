//! query_server: the split-trust REST façade over Query Orchestration
//! (§4.5, §6). Never constructs or holds a [`securequery::paillier::PrivateKey`];
//! decryption is always delegated to the `decryption_oracle` process over
//! HTTP, grounded on the teacher's split between `tinyzkp_api` (the façade)
//! and the prover/verifier core it calls into.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::key_extractor::SmartIpKeyExtractor;
use tower_governor::GovernorLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use securequery::dataset;
use securequery::error::CoreError;
use securequery::kvs::{ExpiringStore, InMemoryStore, UpstashStore};
use securequery::oracle::{OracleClient, RemoteOracleClient};
use securequery::paillier::PublicKey;
use securequery::query::{NewRow, QueryOrchestrator};
use securequery::tokens::TokenAuthority;

/// HTTP-boundary error envelope (§6: `{"error": message}` + status code).
/// Translates [`CoreError`] the way the teacher's handlers translate
/// `anyhow::Error` into `(StatusCode, String)`, but as a typed wrapper so
/// `?` works directly in handlers.
struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            CoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::StoreUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::CryptoFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::PersistenceFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorBody { error: self.0.to_string() })).into_response()
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Clone)]
struct AppState {
    tokens: Arc<TokenAuthority>,
    orchestrator: Arc<QueryOrchestrator>,
}

fn bearer_token(headers: &HeaderMap, name: &str) -> Result<String, ApiError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start_matches("Bearer ").to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError(CoreError::Unauthorized(format!("missing {name} header"))))
}

async fn require_access(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    let token = bearer_token(headers, "authorization")?;
    if !state.tokens.validate_access(&token).await? {
        return Err(ApiError(CoreError::Unauthorized("invalid or expired access token".into())));
    }
    Ok(token)
}

/// Canonicalize `value` through `serde_json::Value` before hashing so the
/// payload binding check agrees regardless of struct field order: `Value`'s
/// object map is a `BTreeMap` (no `preserve_order` feature is enabled), so it
/// always serializes keys alphabetically. `generate_query_token` hashes the
/// client's raw `serde_json::Value` query body, which goes through the same
/// `BTreeMap` reordering; routing every typed request struct through this
/// helper before hashing makes both sides agree on the same canonical form.
fn canonical_payload<T: Serialize>(value: &T) -> Result<String, ApiError> {
    let as_value = serde_json::to_value(value)
        .map_err(|e| ApiError(CoreError::InvalidInput(format!("invalid query payload: {e}"))))?;
    serde_json::to_string(&as_value)
        .map_err(|e| ApiError(CoreError::InvalidInput(format!("invalid query payload: {e}"))))
}

async fn require_query(state: &AppState, headers: &HeaderMap, access_token: &str, payload: &str) -> Result<(), ApiError> {
    let query_token = bearer_token(headers, "query-token")?;
    if !state
        .tokens
        .validate_query_bound(access_token, &query_token, payload)
        .await?
    {
        return Err(ApiError(CoreError::Unauthorized("invalid, expired, or mismatched query token".into())));
    }
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct GenerateTokenReq {
    user_id: String,
}

#[derive(Serialize)]
struct GenerateTokenRes {
    token: String,
}

async fn generate_token(
    State(state): State<AppState>,
    Json(req): Json<GenerateTokenReq>,
) -> Result<impl IntoResponse, ApiError> {
    let token = state.tokens.mint_access(&req.user_id).await?;
    Ok(Json(GenerateTokenRes { token }))
}

#[derive(Deserialize)]
struct GenerateQueryTokenReq {
    query: serde_json::Value,
}

#[derive(Serialize)]
struct GenerateQueryTokenRes {
    query_token: String,
}

async fn generate_query_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<GenerateQueryTokenReq>,
) -> Result<impl IntoResponse, ApiError> {
    let access = require_access(&state, &headers).await?;
    let payload = canonical_payload(&req.query)?;
    let query_token = state.tokens.mint_query(&access, &payload).await?;
    Ok(Json(GenerateQueryTokenRes { query_token }))
}

#[derive(Deserialize, Serialize)]
struct ExactMatchReq {
    field: String,
    value: String,
}

async fn exact_match(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ExactMatchReq>,
) -> Result<impl IntoResponse, ApiError> {
    let access = require_access(&state, &headers).await?;
    let payload = canonical_payload(&req)?;
    require_query(&state, &headers, &access, &payload).await?;
    let results = state.orchestrator.exact_match(&req.field, &req.value)?;
    Ok(Json(serde_json::json!({ "results": results })))
}

#[derive(Deserialize, Serialize)]
struct RangeQueryReq {
    field: String,
    min_value: f64,
    max_value: f64,
}

async fn range_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RangeQueryReq>,
) -> Result<impl IntoResponse, ApiError> {
    let access = require_access(&state, &headers).await?;
    let payload = canonical_payload(&req)?;
    require_query(&state, &headers, &access, &payload).await?;
    let results = state
        .orchestrator
        .range_query(&req.field, req.min_value, req.max_value)
        .await?;
    Ok(Json(serde_json::json!({ "results": results })))
}

#[derive(Deserialize, Serialize)]
struct KnnQueryReq {
    latitude: f64,
    longitude: f64,
    k: usize,
}

async fn knn_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<KnnQueryReq>,
) -> Result<impl IntoResponse, ApiError> {
    let access = require_access(&state, &headers).await?;
    let payload = canonical_payload(&req)?;
    require_query(&state, &headers, &access, &payload).await?;
    let results = state.orchestrator.knn_query(req.latitude, req.longitude, req.k)?;
    Ok(Json(serde_json::json!({ "results": results })))
}

async fn homomorphic_sum(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let access = require_access(&state, &headers).await?;
    // No request body; clients mint this token against the JSON string
    // `"homomorphic_sum"` (i.e. `{"query": "homomorphic_sum"}`), so the
    // hashed payload here must be that same quoted JSON string value rather
    // than the bare Rust literal.
    let payload = canonical_payload(&"homomorphic_sum")?;
    require_query(&state, &headers, &access, &payload).await?;
    let total = state.orchestrator.homomorphic_sum().await?;
    Ok(Json(serde_json::json!({ "decrypted_sum": total })))
}

async fn add_data(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<NewRow>,
) -> Result<impl IntoResponse, ApiError> {
    require_access(&state, &headers).await?;
    state.orchestrator.add_data(req)?;
    Ok(StatusCode::CREATED)
}

/// Parse `"d1,d2,d3"` (§12 `SECUREQUERY_BLOOM_DIMS`); any malformed or
/// missing value falls back to the compiled-in default at the call site.
fn parse_bloom_dims(raw: &str) -> Option<(usize, usize, usize)> {
    let mut parts = raw.split(',').map(|s| s.trim().parse::<usize>());
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(Ok(d1)), Some(Ok(d2)), Some(Ok(d3)), None) => Some((d1, d2, d3)),
        _ => None,
    }
}

fn load_public_key(path: &PathBuf) -> anyhow::Result<PublicKey> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

async fn build_store() -> anyhow::Result<Arc<dyn ExpiringStore>> {
    match UpstashStore::from_env() {
        Ok(store) => {
            info!("using Upstash-backed token store");
            Ok(Arc::new(store))
        }
        Err(_) => {
            warn!("UPSTASH_REDIS_REST_URL/TOKEN not set, falling back to an in-memory token store");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "query_server=info,tower_http=info".into()))
        .with_target(false)
        .compact()
        .init();

    info!("starting query_server");

    let addr: SocketAddr = std::env::var("QUERY_SERVER_ADDR")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8080)));

    let dataset_path = std::env::var("SECUREQUERY_DATASET_PATH")
        .unwrap_or_else(|_| "dataset.csv".into());
    let bloom_path = std::env::var("SECUREQUERY_BLOOM_PATH")
        .unwrap_or_else(|_| "bloom.json".into());
    let public_key_path = std::env::var("SECUREQUERY_PUBLIC_KEY_PATH")
        .unwrap_or_else(|_| "public_key.json".into());
    let scaling_factor: u64 = std::env::var("SECUREQUERY_SCALING_FACTOR")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1000);
    let bloom_dims = parse_bloom_dims(&std::env::var("SECUREQUERY_BLOOM_DIMS").unwrap_or_default())
        .unwrap_or(securequery::bloom::DEFAULT_DIMENSIONS);
    let bloom_hashes: usize = std::env::var("SECUREQUERY_BLOOM_HASHES")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(securequery::bloom::DEFAULT_NUM_HASHES);
    let bloom_levels: usize = std::env::var("SECUREQUERY_BLOOM_LEVELS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(securequery::bloom::DEFAULT_LEVELS);

    let public_key = load_public_key(&PathBuf::from(&public_key_path))?;
    let rows = dataset::load_csv(&dataset_path)?;
    info!(rows = rows.len(), "loaded dataset");

    let oracle: Arc<dyn OracleClient> = Arc::new(RemoteOracleClient::from_env()?);
    let orchestrator = QueryOrchestrator::bootstrap(
        rows,
        Some(PathBuf::from(bloom_path)),
        (bloom_levels, bloom_dims, bloom_hashes),
        Some(PathBuf::from(&dataset_path)),
        oracle,
        public_key,
        scaling_factor,
    )?;

    let tokens = Arc::new(TokenAuthority::new(build_store().await?));
    let state = AppState {
        tokens,
        orchestrator: Arc::new(orchestrator),
    };

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderName::from_static("query-token"),
        ])
        .allow_origin(tower_http::cors::Any);

    let governor_conf = Box::leak(Box::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(30)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .expect("static governor config is valid"),
    ));

    let app = Router::new()
        .route("/v1/health", get(health))
        .route("/generate_token", post(generate_token))
        .route("/generate_query_token", post(generate_query_token))
        .route("/exact_match", post(exact_match))
        .route("/range_query", post(range_query))
        .route("/knn_query", post(knn_query))
        .route("/homomorphic_sum", post(homomorphic_sum))
        .route("/add_data", post(add_data))
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(GovernorLayer { config: governor_conf })
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    info!(%addr, "query_server listening");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
