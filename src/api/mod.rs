use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use futures_util::{Stream, StreamExt};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::download::error::SessionError;
use crate::download::session::{AggregateProgress, SessionManager, SessionParams, SessionSnapshot};
use crate::download::throughput::ThroughputSnapshot;
use crate::download::util::DirStats;
use crate::remote::{list_all, DropboxClient, Entry, RemoteError, SharedFolder};

/// Where remote calls made on behalf of API clients go.
#[derive(Clone, Debug)]
pub struct RemoteEndpoints {
    pub api_base: Option<String>,
    pub content_base: Option<String>,
}

impl RemoteEndpoints {
    pub fn production() -> Self {
        Self { api_base: None, content_base: None }
    }

    fn client(&self, token: &str) -> Result<DropboxClient, RemoteError> {
        let client = DropboxClient::new(token)?;
        Ok(match (&self.api_base, &self.content_base) {
            (Some(api), Some(content)) => client.with_endpoints(api.clone(), content.clone()),
            (Some(api), None) => client.with_endpoints(api.clone(), api.clone()),
            _ => client,
        })
    }
}

/// Response data struct
#[derive(Serialize)]
struct HttpUserResponse {
    code: u16,
    message: String,
}

impl HttpUserResponse {
    fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self { code: 200, message: message.into() })
    }
}

enum ApiError {
    Session(SessionError),
    Remote(RemoteError),
    BadRequest(&'static str),
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        ApiError::Session(err)
    }
}

impl From<RemoteError> for ApiError {
    fn from(err: RemoteError) -> Self {
        ApiError::Remote(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Session(err) => {
                let status = match err {
                    SessionError::MissingParams(_) | SessionError::InvalidRange { .. } => StatusCode::BAD_REQUEST,
                    SessionError::AlreadyRunning | SessionError::NoActiveSession => StatusCode::CONFLICT,
                };
                (status, err.to_string())
            }
            ApiError::Remote(err) => {
                warn!("Remote call failed: {}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message.to_string()),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Parameters of a new session
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartBody {
    #[serde(default, alias = "dropboxToken")]
    token: String,
    #[serde(default)]
    shared_link: String,
    #[serde(default)]
    destination_path: String,
}

#[derive(Deserialize)]
struct ConcurrencyBody {
    count: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteBody {
    #[serde(default, alias = "dropboxToken")]
    token: String,
    #[serde(default)]
    shared_link: String,
}

pub fn router(manager: Arc<SessionManager>, endpoints: RemoteEndpoints) -> Router {
    Router::new()
        .route("/api/session", get(current_session))
        .route("/api/session/start", post(start_session))
        .route("/api/session/stop", post(stop_session))
        .route("/api/session/pause", post(pause_session))
        .route("/api/session/concurrency", post(set_concurrency))
        .route("/api/session/:id/progress", get(session_progress))
        .route("/api/throughput", get(throughput))
        .route("/api/destination", get(destination_stats))
        .route("/api/output", get(output_events))
        .route("/api/check-connection", post(check_connection))
        .route("/api/list-files", post(list_files))
        .layer(Extension(manager))
        .layer(Extension(Arc::new(endpoints)))
}

pub async fn setup_server(manager: Arc<SessionManager>, bind_addr: &str) -> Result<()> {
    let app = router(manager, RemoteEndpoints::production());

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!("API server listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn current_session(Extension(manager): Extension<Arc<SessionManager>>) -> Json<Option<SessionSnapshot>> {
    Json(manager.current())
}

async fn start_session(
    Extension(manager): Extension<Arc<SessionManager>>,
    Json(body): Json<StartBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let params = SessionParams::new(body.token, body.shared_link, body.destination_path)?;
    let id = manager.start(params)?;
    Ok(Json(json!({ "sessionId": id })))
}

async fn stop_session(Extension(manager): Extension<Arc<SessionManager>>) -> Json<HttpUserResponse> {
    manager.stop();
    HttpUserResponse::ok("Session stopped")
}

async fn pause_session(Extension(manager): Extension<Arc<SessionManager>>) -> Result<Json<HttpUserResponse>, ApiError> {
    manager.pause()?;
    Ok(HttpUserResponse::ok("Session paused"))
}

async fn set_concurrency(
    Extension(manager): Extension<Arc<SessionManager>>,
    Json(body): Json<ConcurrencyBody>,
) -> Result<Json<HttpUserResponse>, ApiError> {
    manager.set_target_concurrency(body.count)?;
    Ok(HttpUserResponse::ok(format!("Concurrency set to {}", body.count)))
}

async fn session_progress(
    Extension(manager): Extension<Arc<SessionManager>>,
    Path(id): Path<Uuid>,
) -> Json<AggregateProgress> {
    Json(manager.aggregate_progress(id).await)
}

async fn throughput(Extension(manager): Extension<Arc<SessionManager>>) -> Json<ThroughputSnapshot> {
    Json(manager.throughput())
}

async fn destination_stats(Extension(manager): Extension<Arc<SessionManager>>) -> Json<DirStats> {
    Json(manager.destination_stats().await)
}

async fn output_events(
    Extension(manager): Extension<Arc<SessionManager>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = manager.output_stream().filter_map(|line| async move {
        match Event::default().json_data(&line) {
            Ok(event) => Some(Ok(event)),
            Err(err) => {
                warn!("Dropping unencodable output line: {}", err);
                None
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn check_connection(
    Extension(endpoints): Extension<Arc<RemoteEndpoints>>,
    Json(body): Json<RemoteBody>,
) -> Response {
    if body.token.trim().is_empty() {
        return ApiError::BadRequest("access token is required").into_response();
    }

    let account = match endpoints.client(body.token.trim()) {
        Ok(client) => client.current_account().await,
        Err(err) => Err(err),
    };
    match account {
        Ok(account) => Json(json!({ "connected": true, "account": account })).into_response(),
        Err(err) => {
            warn!("Connection check failed: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "connected": false, "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

async fn list_files(
    Extension(endpoints): Extension<Arc<RemoteEndpoints>>,
    Json(body): Json<RemoteBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.token.trim().is_empty() || body.shared_link.trim().is_empty() {
        return Err(ApiError::BadRequest("access token and shared link are required"));
    }

    let folder = SharedFolder::new(endpoints.client(body.token.trim())?, body.shared_link.trim());
    let entries: Vec<Entry> = list_all(&folder, "").await?;
    Ok(Json(json!({ "entries": entries })))
}
