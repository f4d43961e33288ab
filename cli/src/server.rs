use std::sync::{Arc, Mutex};

use axum::{
    Json, Router,
    extract::{Path, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::limit::RequestBodyLimitLayer;

use buzz_core::cloud::{CloudError, CloudStore, LedgerCloud};
use buzz_core::db::Database;
use buzz_core::models::{Intake, Settings};
use buzz_core::normalize::{normalize_intake, normalize_intakes, normalize_settings};

const BODY_LIMIT: usize = 2 * 1024 * 1024; // 2 MB

/// Names the user whose ledger a request reads and writes.
pub const USER_HEADER: &str = "x-buzz-user";
/// Ledger used by key-authenticated requests that name no user.
pub const DEFAULT_USER: &str = "default";
const MAX_USER_LEN: usize = 64;

#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Database>>,
    api_key: Option<String>,
}

// --- Request / Response types ---

#[derive(Serialize, Deserialize)]
struct IntakesBody<T> {
    intakes: T,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AddResponse {
    cloud_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RemovedResponse {
    client_ids: Option<Vec<String>>,
}

#[derive(Serialize)]
struct RemoveResponse {
    removed: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// --- Error handling ---

enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            Self::Internal(err) => {
                tracing::error!(error = %format!("{err:#}"), "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<CloudError> for ApiError {
    fn from(err: CloudError) -> Self {
        match err {
            CloudError::NotAuthenticated => Self::Unauthorized(err.to_string()),
            CloudError::NotAuthorized => Self::Forbidden(err.to_string()),
            CloudError::Transport(_) | CloudError::Rejected(_) => Self::Internal(err.into()),
        }
    }
}

// --- Middleware ---

async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(ref expected_key) = state.api_key {
        let authorized = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| token == expected_key);

        if !authorized {
            return ApiError::Unauthorized("Invalid or missing API key".to_string())
                .into_response();
        }
    }
    next.run(request).await
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

// --- Identity ---

fn valid_user(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_USER_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
}

/// Without `--no-auth` the key holder may name any user and defaults to
/// [`DEFAULT_USER`]; in open mode only a named user has an identity.
fn identity(state: &AppState, headers: &HeaderMap) -> Result<Option<String>, ApiError> {
    let named = headers
        .get(USER_HEADER)
        .map(|v| v.to_str().map(str::trim).unwrap_or_default());

    match named {
        Some(name) if valid_user(name) => Ok(Some(name.to_string())),
        Some(_) => Err(ApiError::Forbidden(format!(
            "Invalid user name in {USER_HEADER}"
        ))),
        None if state.api_key.is_some() => Ok(Some(DEFAULT_USER.to_string())),
        None => Ok(None),
    }
}

fn ledger(state: &AppState, headers: &HeaderMap) -> Result<LedgerCloud, ApiError> {
    Ok(LedgerCloud::new(state.db.clone(), identity(state, headers)?))
}

// --- Handlers ---

async fn list_intakes(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<IntakesBody<Option<Vec<Intake>>>>, ApiError> {
    let intakes = ledger(&state, &headers)?.list_all()?;
    Ok(Json(IntakesBody { intakes }))
}

async fn add_intake(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(raw): Json<Value>,
) -> Result<(StatusCode, Json<AddResponse>), ApiError> {
    let intake = normalize_intake(&raw)
        .ok_or_else(|| ApiError::BadRequest("Invalid intake record".to_string()))?;
    let cloud_id = ledger(&state, &headers)?.add(&intake)?;
    let status = if cloud_id.is_some() {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(AddResponse { cloud_id })))
}

async fn upsert_intake(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(client_id): Path<String>,
    Json(raw): Json<Value>,
) -> Result<StatusCode, ApiError> {
    let intake = normalize_intake(&raw)
        .ok_or_else(|| ApiError::BadRequest("Invalid intake record".to_string()))?;
    if intake.client_id != client_id {
        return Err(ApiError::BadRequest(format!(
            "clientId '{}' does not match path '{client_id}'",
            intake.client_id
        )));
    }
    ledger(&state, &headers)?.upsert_intake(&intake)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_intake(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(client_id): Path<String>,
) -> Result<Json<RemoveResponse>, ApiError> {
    let removed = ledger(&state, &headers)?.remove(&client_id)?;
    Ok(Json(RemoveResponse { removed }))
}

async fn list_removed(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<RemovedResponse>, ApiError> {
    let client_ids = ledger(&state, &headers)?.list_removed()?;
    Ok(Json(RemovedResponse { client_ids }))
}

async fn merge_intakes(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<IntakesBody<Value>>,
) -> Result<Json<IntakesBody<Option<Vec<Intake>>>>, ApiError> {
    if !body.intakes.is_array() {
        return Err(ApiError::BadRequest("intakes must be an array".to_string()));
    }
    let local = normalize_intakes(&body.intakes);
    let intakes = ledger(&state, &headers)?.merge_from_local(&local)?;
    Ok(Json(IntakesBody { intakes }))
}

async fn get_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Option<Settings>>, ApiError> {
    Ok(Json(ledger(&state, &headers)?.get_settings()?))
}

async fn put_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(raw): Json<Value>,
) -> Result<StatusCode, ApiError> {
    if !raw.is_object() {
        return Err(ApiError::BadRequest(
            "settings must be a JSON object".to_string(),
        ));
    }
    ledger(&state, &headers)?.save_settings(&normalize_settings(&raw))?;
    Ok(StatusCode::NO_CONTENT)
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/intakes", get(list_intakes).post(add_intake))
        .route("/api/intakes/merge", post(merge_intakes))
        .route("/api/intakes/removed", get(list_removed))
        .route(
            "/api/intakes/{client_id}",
            put(upsert_intake).delete(remove_intake),
        )
        .route("/api/settings", get(get_settings).put(put_settings))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

/// Router over `db`, for serving and for in-process tests.
pub(crate) fn router(db: Database, api_key: Option<String>) -> Router {
    build_router(AppState {
        db: Arc::new(Mutex::new(db)),
        api_key,
    })
}

pub async fn start_server(
    db: Database,
    port: u16,
    bind: &str,
    api_key: Option<String>,
) -> anyhow::Result<()> {
    if let Some(ref key) = api_key {
        let shown: String = key.chars().take(4).collect();
        eprintln!("API key: {shown}... (see api_key file in data directory)");
    } else {
        eprintln!(
            "Warning: Authentication disabled (--no-auth). Requests must name a user with the {USER_HEADER} header."
        );
    }

    if bind != "127.0.0.1" && bind != "localhost" && api_key.is_none() {
        eprintln!(
            "Warning: Listening on {bind} with no authentication. Any device on your network can read and write every ledger."
        );
    }

    let app = router(db, api_key);
    let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}")).await?;
    eprintln!("Listening on http://{bind}:{port}");
    tracing::info!(bind, port, "sync server started");
    axum::serve(listener, app).await?;

    Ok(())
}
