//! decryption_oracle: the only process permitted to load a Paillier private
//! key (§4.6, §9). Exposes `decrypt`, `decrypt_sum`, and
//! `homomorphic_operations`; every handler threads a
//! [`RequestState`](securequery::oracle::RequestState) through its
//! lifecycle for structured logging and returns before reaching
//! `Responded` on any error path, so no intermediate plaintext is ever
//! attached to a log line or an error body.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use securequery::error::CoreError;
use securequery::oracle::{ComposeOperation, LocalOracle, OracleClient, RequestState};
use securequery::paillier::{EncryptedNumber, PrivateKey, PublicKey};

struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            CoreError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
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
    oracle: Arc<LocalOracle>,
    public_key: Arc<PublicKey>,
    scaling_factor: u64,
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct DecryptReq {
    ciphertexts: Vec<EncryptedNumber>,
    #[serde(default)]
    scaling_factor: Option<u64>,
}

#[derive(Serialize)]
struct DecryptRes {
    decrypted: Vec<i128>,
}

async fn decrypt(
    State(state): State<AppState>,
    Json(req): Json<DecryptReq>,
) -> Result<impl IntoResponse, ApiError> {
    let mut log_state = RequestState::Received;
    debug!(state = log_state.as_str(), "decrypt request");

    log_state = RequestState::Validated;
    let scaling_factor = req.scaling_factor.unwrap_or(state.scaling_factor);
    debug!(state = log_state.as_str(), count = req.ciphertexts.len());

    let decrypted = state
        .oracle
        .decrypt_many(&req.ciphertexts, scaling_factor)
        .await
        .map_err(|e| {
            error!(state = "decrypted", "decrypt_many failed: {e}");
            e
        })?;
    log_state = RequestState::Decrypted;
    debug!(state = log_state.as_str());

    log_state = RequestState::Responded;
    debug!(state = log_state.as_str());
    Ok(Json(DecryptRes { decrypted }))
}

#[derive(Deserialize)]
struct DecryptSumReq {
    encrypted_sum: EncryptedNumber,
    #[serde(default)]
    scaling_factor: Option<u64>,
}

#[derive(Serialize)]
struct DecryptSumRes {
    decrypted_sum: i128,
}

async fn decrypt_sum(
    State(state): State<AppState>,
    Json(req): Json<DecryptSumReq>,
) -> Result<impl IntoResponse, ApiError> {
    let scaling_factor = req.scaling_factor.unwrap_or(state.scaling_factor);
    let decrypted_sum = state
        .oracle
        .decrypt_sum(&req.encrypted_sum, scaling_factor)
        .await
        .map_err(|e| {
            error!("decrypt_sum failed: {e}");
            e
        })?;
    Ok(Json(DecryptSumRes { decrypted_sum }))
}

#[derive(Deserialize)]
struct HomomorphicOpsReq {
    #[serde(flatten)]
    operation: ComposeOperation,
    #[serde(default)]
    scaling_factor: Option<u64>,
}

#[derive(Serialize)]
struct HomomorphicOpsRes {
    decrypted_result: i128,
}

async fn homomorphic_operations(
    State(state): State<AppState>,
    Json(req): Json<HomomorphicOpsReq>,
) -> Result<impl IntoResponse, ApiError> {
    let scaling_factor = req.scaling_factor.unwrap_or(state.scaling_factor);
    let decrypted_result = state
        .oracle
        .compose_then_decrypt(state.public_key.as_ref(), req.operation, scaling_factor)
        .await
        .map_err(|e| {
            error!("compose_then_decrypt failed: {e}");
            e
        })?;
    Ok(Json(HomomorphicOpsRes { decrypted_result }))
}

fn load_private_key(path: &PathBuf) -> anyhow::Result<PrivateKey> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn load_public_key(path: &PathBuf) -> anyhow::Result<PublicKey> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "decryption_oracle=info,tower_http=info".into()))
        .with_target(false)
        .compact()
        .init();

    info!("starting decryption_oracle");

    let addr: SocketAddr = std::env::var("ORACLE_ADDR")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8081)));

    let private_key_path = std::env::var("SECUREQUERY_PRIVATE_KEY_PATH")
        .unwrap_or_else(|_| "private_key.json".into());
    let public_key_path = std::env::var("SECUREQUERY_PUBLIC_KEY_PATH")
        .unwrap_or_else(|_| "public_key.json".into());
    let scaling_factor: u64 = std::env::var("SECUREQUERY_SCALING_FACTOR")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1000);

    let private_key = load_private_key(&PathBuf::from(&private_key_path))?;
    let public_key = load_public_key(&PathBuf::from(&public_key_path))?;

    let state = AppState {
        oracle: Arc::new(LocalOracle::new(private_key)),
        public_key: Arc::new(public_key),
        scaling_factor,
    };

    let cors = CorsLayer::new().allow_methods([Method::GET, Method::POST]);

    let app = Router::new()
        .route("/v1/health", get(health))
        .route("/decrypt", post(decrypt))
        .route("/decrypt_sum", post(decrypt_sum))
        .route("/homomorphic_operations", post(homomorphic_operations))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    info!(%addr, "decryption_oracle listening — this process holds the private key and must never be reachable from outside the trust boundary");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
