use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use uuid::Uuid;

use application::Credentials;
use domain::{CallId, CallSession, CallStatus, FileId, Message, Room, UserId};

use crate::{
    auth::bearer_token, error::ApiError, state::AppState, ws_connection::WebSocketConnection,
};

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<u32>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    before: Option<OffsetDateTime>,
}

#[derive(Debug, Default, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StartCallPayload {
    receiver_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct CallStatusPayload {
    status: CallStatus,
}

#[derive(Debug, Serialize)]
struct RoomView {
    #[serde(flatten)]
    room: Room,
    members: Vec<UserId>,
    online_sessions: usize,
}

#[derive(Debug, Serialize)]
struct ReadReceipt {
    updated: u64,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_routes())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/ws", get(websocket_upgrade))
        .route("/ws/chat/{room}", get(websocket_room_upgrade))
        .route("/rooms/{slug}", get(get_room).delete(delete_room))
        .route("/rooms/{slug}/messages", get(room_messages))
        .route("/conversations/{peer_id}/messages", get(conversation_messages))
        .route("/conversations/{peer_id}/read", post(mark_conversation_read))
        .route("/files/{file_id}", get(download_file))
        .route("/calls", post(start_call))
        .route("/calls/{call_id}", get(get_call))
        .route("/calls/{call_id}/status", post(update_call_status))
}

async fn health() -> &'static str {
    "ok"
}

fn current_user(state: &AppState, headers: &HeaderMap) -> Result<UserId, ApiError> {
    state.jwt_service.extract_user_from_headers(headers)
}

/// 查询参数里的令牌优先，浏览器无法给 WebSocket 握手附加请求头。
fn ws_credentials(query: WsQuery, headers: &HeaderMap) -> Credentials {
    match query.token.or_else(|| bearer_token(headers).map(str::to_string)) {
        Some(token) => Credentials::bearer(token),
        None => Credentials::anonymous(),
    }
}

async fn websocket_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let credentials = ws_credentials(query, &headers);
    ws.on_upgrade(move |socket| WebSocketConnection::new(socket, state, credentials, None).run())
}

async fn websocket_room_upgrade(
    State(state): State<AppState>,
    Path(room): Path<String>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let credentials = ws_credentials(query, &headers);
    ws.on_upgrade(move |socket| {
        WebSocketConnection::new(socket, state, credentials, Some(room)).run()
    })
}

async fn get_room(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    headers: HeaderMap,
) -> Result<Json<RoomView>, ApiError> {
    current_user(&state, &headers)?;
    let gateway = state.engine.gateway();
    let room = gateway.get_room_by_slug(&slug).await?;
    let members = gateway.list_members(room.id).await?;
    let online_sessions = state.engine.registry().session_count(room.id);
    Ok(Json(RoomView {
        room,
        members,
        online_sessions,
    }))
}

async fn delete_room(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let user_id = current_user(&state, &headers)?;
    let room = state.engine.gateway().get_room_by_slug(&slug).await?;
    state.engine.delete_room(room.id, user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn room_messages(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Query(query): Query<HistoryQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<Message>>, ApiError> {
    current_user(&state, &headers)?;
    let gateway = state.engine.gateway();
    let room = gateway.get_room_by_slug(&slug).await?;
    let messages = gateway
        .room_history(room.id, query.limit, query.before)
        .await?;
    Ok(Json(messages))
}

async fn conversation_messages(
    State(state): State<AppState>,
    Path(peer_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<Message>>, ApiError> {
    let user_id = current_user(&state, &headers)?;
    let messages = state
        .engine
        .gateway()
        .conversation_history(user_id, UserId::from(peer_id), query.limit, query.before)
        .await?;
    Ok(Json(messages))
}

async fn mark_conversation_read(
    State(state): State<AppState>,
    Path(peer_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<ReadReceipt>, ApiError> {
    let user_id = current_user(&state, &headers)?;
    let updated = state
        .engine
        .gateway()
        .mark_conversation_read(user_id, UserId::from(peer_id))
        .await?;
    Ok(Json(ReadReceipt { updated }))
}

/// 文件按 id 直接下载，`<img>` 等引用无法携带 Bearer 头。
///
/// 只有白名单内的图片按声明类型内联返回，其余内容一律作为附件下载。
async fn download_file(
    State(state): State<AppState>,
    Path(file_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let file = state.engine.gateway().get_file(FileId::from(file_id)).await?;
    let octet_stream = HeaderValue::from_static("application/octet-stream");
    let (content_type, disposition) = if file.is_inline_safe() {
        let content_type = HeaderValue::from_str(&file.content_type).unwrap_or(octet_stream);
        (content_type, HeaderValue::from_static("inline"))
    } else {
        (octet_stream, attachment(&file.file_name))
    };
    let headers = [
        (header::CONTENT_TYPE, content_type),
        (header::CONTENT_DISPOSITION, disposition),
        (header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff")),
    ];
    Ok((headers, file.data).into_response())
}

fn attachment(file_name: &str) -> HeaderValue {
    let safe: String = file_name
        .chars()
        .filter(|c| c.is_ascii_graphic() && !matches!(c, '"' | '\\' | ';'))
        .collect();
    HeaderValue::from_str(&format!("attachment; filename=\"{safe}\""))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

async fn start_call(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<StartCallPayload>,
) -> Result<(StatusCode, Json<CallSession>), ApiError> {
    let caller = current_user(&state, &headers)?;
    let call = state
        .engine
        .calls()
        .start_call(caller, UserId::from(payload.receiver_id))
        .await?;
    Ok((StatusCode::CREATED, Json(call)))
}

async fn get_call(
    State(state): State<AppState>,
    Path(call_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<CallSession>, ApiError> {
    let viewer = current_user(&state, &headers)?;
    let call = state
        .engine
        .calls()
        .get_call(CallId::from(call_id), viewer)
        .await?;
    Ok(Json(call))
}

async fn update_call_status(
    State(state): State<AppState>,
    Path(call_id): Path<Uuid>,
    headers: HeaderMap,
    Json(payload): Json<CallStatusPayload>,
) -> Result<Json<CallSession>, ApiError> {
    let actor = current_user(&state, &headers)?;
    let call = state
        .engine
        .calls()
        .update_status(CallId::from(call_id), actor, payload.status)
        .await?;
    Ok(Json(call))
}
