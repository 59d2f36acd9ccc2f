use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use secret_santa_api::{
    load_pairing_config, ApiError, Caller, ErrorCode, GifteeView, MigrateResult, PairingPreview,
    PairingStatus, ParticipantSummary, RegisterParticipantRequest, SecretSantaApi,
    TriggerPairingResult, WishlistUpdate, API_CONTRACT_VERSION,
};
use secret_santa_store_sqlite::SchemaStatus;
use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
/// Set by the fronting auth gateway after it has verified the user.
const CALLER_EMAIL_HEADER: &str = "x-caller-email";

#[derive(Debug, Clone)]
struct ServiceState {
    api: SecretSantaApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: ApiError,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct WishlistRequest {
    wishlist: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PreviewRequest {
    #[serde(default)]
    seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct ParticipantList {
    participants: Vec<ParticipantSummary>,
}

#[derive(Debug, Clone, Serialize)]
struct GifteeResponse {
    giftee: Option<GifteeView>,
}

#[derive(Debug, Parser)]
#[command(name = "secret-santa-service")]
#[command(about = "Local HTTP service for Secret Santa pairing")]
struct Args {
    #[arg(long, env = "SANTA_DB", default_value = "./secret_santa.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "SANTA_BIND", default_value = "127.0.0.1:4010")]
    bind: SocketAddr,
    #[arg(long, env = "SANTA_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long, env = "SANTA_MAX_PLACEMENTS")]
    max_placements: Option<u64>,
    #[arg(long, env = "SANTA_LOG", default_value = "info")]
    log_level: String,
    #[arg(long, env = "SANTA_JSON_LOGS", default_value_t = false)]
    json_logs: bool,
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthenticated => StatusCode::UNAUTHORIZED,
        ErrorCode::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorCode::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::FailedPrecondition => StatusCode::CONFLICT,
        ErrorCode::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = status_for(self.error.code);
        if status.is_server_error() {
            tracing::error!(code = %self.error.code, message = %self.error.message, "request failed");
        }
        (status, Json(self)).into_response()
    }
}

impl From<ApiError> for ServiceError {
    fn from(error: ApiError) -> Self {
        Self { service_contract_version: SERVICE_CONTRACT_VERSION, error }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn caller_from(headers: &HeaderMap) -> Caller {
    headers
        .get(CALLER_EMAIL_HEADER)
        .and_then(|value| value.to_str().ok())
        .map_or_else(Caller::anonymous, Caller::with_email)
}

/// Pairing searches are CPU-bound and uncapped by default, so they run on the
/// blocking pool instead of an async worker.
async fn run_pairing<T, F>(task: F) -> Result<T, ServiceError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    let joined = tokio::task::spawn_blocking(task).await.map_err(|err| {
        ApiError::new(ErrorCode::Internal, format!("Pairing failed: search task aborted: {err}"))
    })?;
    joined.map_err(ServiceError::from)
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/participants", get(participants_list).post(participants_register))
        .route("/v1/participants/wishlist", post(participants_wishlist))
        .route("/v1/pairing/trigger", post(pairing_trigger))
        .route("/v1/pairing/preview", post(pairing_preview))
        .route("/v1/pairing/status", get(pairing_status))
        .route("/v1/pairing/giftee", get(pairing_giftee))
        .with_state(state)
}

fn init_tracing(args: &Args) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let registry = tracing_subscriber::registry().with(env_filter);

    if args.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    let config = load_pairing_config(args.config.as_deref(), args.max_placements)?;
    let state = ServiceState { api: SecretSantaApi::new(args.db.clone(), config) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, db = %args.db.display(), "secret santa service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    Ok(Json(envelope(state.api.schema_status()?)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    Ok(Json(envelope(state.api.migrate(request.dry_run)?)))
}

async fn participants_list(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<ParticipantList>>, ServiceError> {
    let participants = state.api.list_participants()?;
    Ok(Json(envelope(ParticipantList { participants })))
}

async fn participants_register(
    State(state): State<ServiceState>,
    Json(request): Json<RegisterParticipantRequest>,
) -> Result<Json<ServiceEnvelope<ParticipantSummary>>, ServiceError> {
    Ok(Json(envelope(state.api.register_participant(request)?)))
}

async fn participants_wishlist(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<WishlistRequest>,
) -> Result<Json<ServiceEnvelope<WishlistUpdate>>, ServiceError> {
    let update = state.api.update_wishlist(&caller_from(&headers), &request.wishlist)?;
    Ok(Json(envelope(update)))
}

async fn pairing_trigger(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<TriggerPairingResult>>, ServiceError> {
    let caller = caller_from(&headers);
    let result = run_pairing(move || state.api.trigger_pairing(&caller)).await?;
    Ok(Json(envelope(result)))
}

async fn pairing_preview(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<PreviewRequest>,
) -> Result<Json<ServiceEnvelope<PairingPreview>>, ServiceError> {
    let caller = caller_from(&headers);
    let preview = run_pairing(move || state.api.preview_pairing(&caller, request.seed)).await?;
    Ok(Json(envelope(preview)))
}

async fn pairing_status(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<PairingStatus>>, ServiceError> {
    Ok(Json(envelope(state.api.pairing_status()?)))
}

async fn pairing_giftee(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<GifteeResponse>>, ServiceError> {
    let giftee = state.api.my_giftee(&caller_from(&headers))?;
    Ok(Json(envelope(GifteeResponse { giftee })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use secret_santa_api::PairingConfig;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("secret-santa-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn test_router(db_path: PathBuf) -> Router {
        test_router_with_config(db_path, PairingConfig::default())
    }

    fn test_router_with_config(db_path: PathBuf, config: PairingConfig) -> Router {
        app(ServiceState { api: SecretSantaApi::new(db_path, config) })
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    async fn send(
        router: &Router,
        method: &str,
        uri: &str,
        caller: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().uri(uri).method(method);
        if let Some(email) = caller {
            builder = builder.header(CALLER_EMAIL_HEADER, email);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(axum::body::Body::from(body.to_string())),
            None => builder.body(axum::body::Body::empty()),
        }
        .unwrap_or_else(|err| panic!("failed to build {method} {uri} request: {err}"));

        let response = match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("{method} {uri} request failed: {err}"),
        };
        let status = response.status();
        (status, response_json(response).await)
    }

    async fn register(router: &Router, id: &str, is_admin: bool, conflicts: serde_json::Value) {
        let payload = serde_json::json!({
            "id": id,
            "name": format!("Name {id}"),
            "is_admin": is_admin,
            "conflicts": conflicts,
            "wishlist": format!("{id} wishlist")
        });
        let (status, value) = send(router, "POST", "/v1/participants", None, Some(payload)).await;
        assert_eq!(status, StatusCode::OK, "register {id}: {value}");
    }

    fn error_code(value: &serde_json::Value) -> Option<&str> {
        value.get("error").and_then(|error| error.get("code")).and_then(serde_json::Value::as_str)
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let router = test_router(unique_temp_db_path());

        let (status, value) = send(&router, "GET", "/v1/health", None, None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(
            value.get("api_contract_version").and_then(serde_json::Value::as_str),
            Some(API_CONTRACT_VERSION)
        );
    }

    #[tokio::test]
    async fn trigger_maps_identity_failures_to_http_statuses() {
        let db_path = unique_temp_db_path();
        let router = test_router(db_path.clone());
        register(&router, "admin", true, serde_json::json!([])).await;
        for id in ["john", "mary", "paul"] {
            register(&router, id, false, serde_json::json!([])).await;
        }

        let (status, value) = send(&router, "POST", "/v1/pairing/trigger", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(error_code(&value), Some("UNAUTHENTICATED"));

        let (status, value) =
            send(&router, "POST", "/v1/pairing/trigger", Some("not-an-email"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_code(&value), Some("INVALID_ARGUMENT"));

        let (status, value) =
            send(&router, "POST", "/v1/pairing/trigger", Some("john@example.test"), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(error_code(&value), Some("PERMISSION_DENIED"));

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn pairing_flow_locks_once_and_reveals_giftees() {
        let db_path = unique_temp_db_path();
        let router = test_router(db_path.clone());
        register(&router, "admin", true, serde_json::json!([])).await;
        register(&router, "john", false, serde_json::json!(["mary"])).await;
        for id in ["mary", "paul", "ringo"] {
            register(&router, id, false, serde_json::json!([])).await;
        }

        let (status, preview) = send(
            &router,
            "POST",
            "/v1/pairing/preview",
            Some("admin@example.test"),
            Some(serde_json::json!({ "seed": 3 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "preview: {preview}");

        let (status, triggered) =
            send(&router, "POST", "/v1/pairing/trigger", Some("admin@example.test"), None).await;
        assert_eq!(status, StatusCode::OK, "trigger: {triggered}");
        let data = triggered.get("data").cloned().unwrap_or_default();
        assert_eq!(data.get("pairings_count").and_then(serde_json::Value::as_u64), Some(4));
        assert_eq!(data.get("warnings").and_then(serde_json::Value::as_array).map(Vec::len), Some(1));

        let (status, again) =
            send(&router, "POST", "/v1/pairing/trigger", Some("admin@example.test"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(error_code(&again), Some("FAILED_PRECONDITION"));

        let (status, pairing) = send(&router, "GET", "/v1/pairing/status", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            pairing.get("data").and_then(|d| d.get("locked")).and_then(serde_json::Value::as_bool),
            Some(true)
        );

        let (status, giftee) =
            send(&router, "GET", "/v1/pairing/giftee", Some("mary@example.test"), None).await;
        assert_eq!(status, StatusCode::OK);
        let giftee_id = giftee
            .get("data")
            .and_then(|d| d.get("giftee"))
            .and_then(|g| g.get("id"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or_else(|| panic!("mary should have a giftee: {giftee}"));
        assert_ne!(giftee_id, "mary");
        assert_ne!(giftee_id, "john");

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn capped_pairing_search_maps_to_too_many_requests() {
        let db_path = unique_temp_db_path();
        let config = PairingConfig::default().with_max_placements(Some(1));
        let router = test_router_with_config(db_path.clone(), config);
        register(&router, "admin", true, serde_json::json!([])).await;
        for id in ["a", "b", "c", "d", "e"] {
            register(&router, id, false, serde_json::json!([])).await;
        }

        let (status, preview) = send(
            &router,
            "POST",
            "/v1/pairing/preview",
            Some("admin@example.test"),
            Some(serde_json::json!({ "seed": 4 })),
        )
        .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS, "preview: {preview}");
        assert_eq!(error_code(&preview), Some("RESOURCE_EXHAUSTED"));

        let (status, triggered) =
            send(&router, "POST", "/v1/pairing/trigger", Some("admin@example.test"), None).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS, "trigger: {triggered}");

        let (_, pairing) = send(&router, "GET", "/v1/pairing/status", None, None).await;
        assert_eq!(
            pairing.get("data").and_then(|d| d.get("locked")).and_then(serde_json::Value::as_bool),
            Some(false)
        );

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn wishlist_updates_require_a_registered_caller() {
        let db_path = unique_temp_db_path();
        let router = test_router(db_path.clone());
        register(&router, "mary", false, serde_json::json!([])).await;
        let payload = serde_json::json!({ "wishlist": "Tea, candles" });

        let (status, updated) = send(
            &router,
            "POST",
            "/v1/participants/wishlist",
            Some("mary@example.test"),
            Some(payload.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            updated.get("data").and_then(|d| d.get("participant_id")).and_then(serde_json::Value::as_str),
            Some("mary")
        );

        let (status, missing) =
            send(&router, "POST", "/v1/participants/wishlist", Some("ghost@example.test"), Some(payload))
                .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(error_code(&missing), Some("NOT_FOUND"));

        let (status, listed) = send(&router, "GET", "/v1/participants", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            listed
                .get("data")
                .and_then(|d| d.get("participants"))
                .and_then(serde_json::Value::as_array)
                .map(Vec::len),
            Some(1)
        );

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn migrate_endpoint_reports_applied_versions() {
        let db_path = unique_temp_db_path();
        let router = test_router(db_path.clone());

        let (status, value) = send(
            &router,
            "POST",
            "/v1/db/migrate",
            None,
            Some(serde_json::json!({ "dry_run": false })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            value.get("data").and_then(|d| d.get("up_to_date")).and_then(serde_json::Value::as_bool),
            Some(true)
        );

        let _ = std::fs::remove_file(&db_path);
    }
}
