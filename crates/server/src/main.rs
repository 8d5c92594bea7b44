use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use server_api::{ApiContext, AuthConfig};
use shared::{
    domain::{Category, CategoryId, SessionState, VoteOption},
    error::{ApiError, ErrorCode},
    protocol::{
        AdvanceRequest, ClearRequest, ClearResponse, HostSnapshot, Identity, LockRequest,
        RankedOption, RegisterRequest, RegisterResponse, ResultsSnapshot, ScreenSnapshot,
        ServerEvent, SignInRequest, SignInResponse, SubmitVoteRequest, SubmitVoteResponse,
        SubscriptionFilter, TransitionResponse, VoteProgress, VoteSnapshot,
    },
};
use storage::Storage;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;
mod extract;

use app_state::AppState;
use config::{load_settings, prepare_database_url};
use extract::{ApiJson, ApiPath};

const MAX_BODY_BYTES: usize = 16 * 1024;

type HttpError = (StatusCode, Json<ApiError>);
type HttpResult<T> = Result<Json<T>, HttpError>;

#[derive(Debug, Deserialize)]
struct WsQuery {
    tables: Option<String>,
    kinds: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings()?;
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let api = ApiContext::new(
        storage,
        AuthConfig {
            jwt_secret: settings.jwt_secret,
            token_ttl_seconds: settings.token_ttl_seconds,
        },
        settings.advance_policy,
        settings.event_buffer,
    );

    let app = build_router(Arc::new(AppState { api }));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, advance_policy = settings.advance_policy.as_str(), "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/auth/register", post(http_register))
        .route("/auth/signin", post(http_sign_in))
        .route("/auth/me", get(http_me))
        .route("/session", get(http_session))
        .route("/categories", get(http_categories))
        .route("/categories/:category_id/options", get(http_options))
        .route("/categories/:category_id/progress", get(http_progress))
        .route("/categories/:category_id/top3", get(http_top3))
        .route("/views/host", get(http_host_view))
        .route("/views/vote", get(http_vote_view))
        .route("/views/screen", get(http_screen_view))
        .route("/views/results", get(http_results_view))
        .route("/votes", post(http_submit_vote))
        .route("/host/open", post(http_open))
        .route("/host/results", post(http_show_results))
        .route("/host/reset", post(http_reset))
        .route("/host/advance", post(http_advance))
        .route("/host/lock", post(http_lock))
        .route("/host/clear", post(http_clear))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn http_error(err: ApiError) -> HttpError {
    if err.code == ErrorCode::Internal {
        error!(message = %err.message, "request failed");
    }
    (status_for(err.code), Json(err))
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Identity, HttpError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| http_error(ApiError::unauthorized("missing bearer token")))?;
    server_api::resolve_identity(&state.api, token)
        .await
        .map_err(http_error)
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, HttpError> {
    state.api.storage.health_check().await.map_err(|e| {
        http_error(ApiError::new(ErrorCode::Internal, e.to_string()))
    })?;
    Ok("ok")
}

async fn http_register(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<RegisterRequest>,
) -> HttpResult<RegisterResponse> {
    server_api::register(&state.api, &req)
        .await
        .map(Json)
        .map_err(http_error)
}

async fn http_sign_in(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<SignInRequest>,
) -> HttpResult<SignInResponse> {
    server_api::sign_in(&state.api, &req)
        .await
        .map(Json)
        .map_err(http_error)
}

async fn http_me(State(state): State<Arc<AppState>>, headers: HeaderMap) -> HttpResult<Identity> {
    authenticate(&state, &headers).await.map(Json)
}

async fn http_session(State(state): State<Arc<AppState>>) -> HttpResult<SessionState> {
    server_api::current_state(&state.api)
        .await
        .map(Json)
        .map_err(http_error)
}

async fn http_categories(State(state): State<Arc<AppState>>) -> HttpResult<Vec<Category>> {
    server_api::list_categories(&state.api)
        .await
        .map(Json)
        .map_err(http_error)
}

async fn http_options(
    State(state): State<Arc<AppState>>,
    ApiPath(category_id): ApiPath<i64>,
) -> HttpResult<Vec<VoteOption>> {
    server_api::list_options(&state.api, CategoryId(category_id))
        .await
        .map(Json)
        .map_err(http_error)
}

async fn http_progress(
    State(state): State<Arc<AppState>>,
    ApiPath(category_id): ApiPath<i64>,
    headers: HeaderMap,
) -> HttpResult<VoteProgress> {
    let identity = authenticate(&state, &headers).await?;
    server_api::vote_progress(&state.api, &identity, CategoryId(category_id))
        .await
        .map(Json)
        .map_err(http_error)
}

async fn http_top3(
    State(state): State<Arc<AppState>>,
    ApiPath(category_id): ApiPath<i64>,
) -> HttpResult<Vec<RankedOption>> {
    server_api::top3(&state.api, CategoryId(category_id))
        .await
        .map(Json)
        .map_err(http_error)
}

async fn http_host_view(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> HttpResult<HostSnapshot> {
    let identity = authenticate(&state, &headers).await?;
    server_api::host_snapshot(&state.api, &identity)
        .await
        .map(Json)
        .map_err(http_error)
}

async fn http_vote_view(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> HttpResult<VoteSnapshot> {
    let identity = authenticate(&state, &headers).await?;
    server_api::vote_snapshot(&state.api, &identity)
        .await
        .map(Json)
        .map_err(http_error)
}

async fn http_screen_view(State(state): State<Arc<AppState>>) -> HttpResult<ScreenSnapshot> {
    server_api::screen_snapshot(&state.api)
        .await
        .map(Json)
        .map_err(http_error)
}

async fn http_results_view(State(state): State<Arc<AppState>>) -> HttpResult<ResultsSnapshot> {
    server_api::results_snapshot(&state.api)
        .await
        .map(Json)
        .map_err(http_error)
}

async fn http_submit_vote(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<SubmitVoteRequest>,
) -> HttpResult<SubmitVoteResponse> {
    let identity = authenticate(&state, &headers).await?;
    server_api::submit_vote(&state.api, &identity, req.category_id, req.option_id)
        .await
        .map(Json)
        .map_err(http_error)
}

async fn http_open(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> HttpResult<TransitionResponse> {
    let identity = authenticate(&state, &headers).await?;
    server_api::open_voting(&state.api, &identity)
        .await
        .map(Json)
        .map_err(http_error)
}

async fn http_show_results(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> HttpResult<TransitionResponse> {
    let identity = authenticate(&state, &headers).await?;
    server_api::show_results(&state.api, &identity)
        .await
        .map(Json)
        .map_err(http_error)
}

async fn http_reset(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> HttpResult<TransitionResponse> {
    let identity = authenticate(&state, &headers).await?;
    server_api::reset_to_lobby(&state.api, &identity)
        .await
        .map(Json)
        .map_err(http_error)
}

async fn http_advance(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<AdvanceRequest>,
) -> HttpResult<TransitionResponse> {
    let identity = authenticate(&state, &headers).await?;
    server_api::advance(&state.api, &identity, req.force)
        .await
        .map(Json)
        .map_err(http_error)
}

async fn http_lock(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<LockRequest>,
) -> HttpResult<TransitionResponse> {
    let identity = authenticate(&state, &headers).await?;
    server_api::set_locked(&state.api, &identity, req.locked)
        .await
        .map(Json)
        .map_err(http_error)
}

async fn http_clear(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<ClearRequest>,
) -> HttpResult<ClearResponse> {
    let identity = authenticate(&state, &headers).await?;
    server_api::clear(&state.api, &identity, req.scope)
        .await
        .map(Json)
        .map_err(http_error)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> Result<impl IntoResponse, HttpError> {
    let filter = SubscriptionFilter::parse(q.tables.as_deref(), q.kinds.as_deref())
        .map_err(|e| http_error(ApiError::validation(e.to_string())))?;
    // Subscribe before the handshake completes so nothing published in
    // between is lost.
    let events = BroadcastStream::new(state.api.subscribe());
    Ok(ws.on_upgrade(move |socket| ws_connection(socket, events, filter)))
}

async fn ws_connection(
    socket: WebSocket,
    mut events: BroadcastStream<ServerEvent>,
    filter: SubscriptionFilter,
) {
    let (mut sender, mut receiver) = socket.split();
    info!(tables = ?filter.tables, kinds = ?filter.kinds, "change subscriber connected");

    let send_task = tokio::spawn(async move {
        while let Some(item) = events.next().await {
            let event = match item {
                Ok(event) if filter.matches(&event) => event,
                Ok(_) => continue,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "change subscriber lagged, asking it to resync");
                    ServerEvent::Resync
                }
            };
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
    info!("change subscriber disconnected");
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
