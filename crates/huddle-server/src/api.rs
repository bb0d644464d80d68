use std::net::IpAddr;
use std::sync::Arc;

use axum::{
    async_trait,
    body::Bytes,
    extract::{DefaultBodyLimit, FromRequestParts, Path, State},
    http::{header::AUTHORIZATION, request::Parts, Method, StatusCode},
    middleware,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use huddle_shared::{ChatError, ConnectionId, IdentityId, RoomSummary};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::hub::Hub;
use crate::media::MediaStore;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::session::ws_upgrade;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub media: Arc<MediaStore>,
    pub rate_limiter: RateLimiter<IpAddr>,
    pub message_limiter: RateLimiter<ConnectionId>,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/api/rooms", get(list_rooms).post(create_room))
        .route("/api/rooms/kick", post(kick_member))
        .route("/api/rooms/:name", delete(delete_room))
        .route("/api/rooms/:name/join", post(join_room))
        .route("/api/rooms/:name/invite", post(invite_to_room))
        .route("/api/users/online", get(online_users))
        .route("/api/media", post(media_upload))
        .route("/api/media/:id", get(media_download))
        .route("/ws", get(ws_upgrade))
        .layer(DefaultBodyLimit::max(body_limit(state.config.max_media_size)))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Media uploads plus headroom for the JSON endpoints.
fn body_limit(max_media_size: usize) -> usize {
    max_media_size.saturating_add(1024)
}

/// The identity behind a `Authorization: Bearer <token>` header.
pub struct AuthIdentity(pub IdentityId);

#[async_trait]
impl FromRequestParts<AppState> for AuthIdentity {
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(ChatError::InvalidToken)?;

        let identity = state.hub.verify_token(token.trim()).await?;
        Ok(Self(identity))
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    connections: usize,
}

#[derive(Deserialize)]
struct CredentialsRequest {
    username: String,
    password: String,
}

#[derive(Serialize)]
struct RegisterResponse {
    message: &'static str,
    username: IdentityId,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    token: String,
    username: IdentityId,
    expires_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct RoomsResponse {
    rooms: Vec<RoomSummary>,
}

#[derive(Serialize)]
struct RoomResponse {
    room: RoomSummary,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRoomRequest {
    name: String,
    #[serde(default)]
    is_private: bool,
    password: Option<String>,
}

#[derive(Deserialize, Default)]
struct JoinRoomRequest {
    password: Option<String>,
}

#[derive(Deserialize)]
struct InviteRequest {
    username: IdentityId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct KickRequest {
    room_name: String,
    username: IdentityId,
}

#[derive(Serialize)]
struct OnlineUsersResponse {
    users: Vec<IdentityId>,
}

#[derive(Serialize)]
struct MediaUploadResponse {
    id: Uuid,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        connections: state.hub.connection_count(),
    })
}

async fn register(
    State(state): State<AppState>,
    Json(req): Json<CredentialsRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), ServerError> {
    let username = state.hub.register(&req.username, &req.password).await?;
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            message: "User registered successfully",
            username,
        }),
    ))
}

async fn login(
    State(state): State<AppState>,
    Json(req): Json<CredentialsRequest>,
) -> Result<Json<LoginResponse>, ServerError> {
    let (token, claims) = state.hub.login(&req.username, &req.password).await?;
    Ok(Json(LoginResponse {
        token,
        username: claims.identity,
        expires_at: claims.expires_at,
    }))
}

async fn list_rooms(
    State(state): State<AppState>,
    AuthIdentity(_identity): AuthIdentity,
) -> Json<RoomsResponse> {
    Json(RoomsResponse {
        rooms: state.hub.list_rooms().await,
    })
}

async fn create_room(
    State(state): State<AppState>,
    AuthIdentity(identity): AuthIdentity,
    Json(req): Json<CreateRoomRequest>,
) -> Result<(StatusCode, Json<RoomResponse>), ServerError> {
    let room = state
        .hub
        .create_room(&identity, &req.name, req.is_private, req.password.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(RoomResponse { room })))
}

async fn join_room(
    State(state): State<AppState>,
    AuthIdentity(identity): AuthIdentity,
    Path(name): Path<String>,
    body: Option<Json<JoinRoomRequest>>,
) -> Result<Json<RoomResponse>, ServerError> {
    let Json(req) = body.unwrap_or_default();
    let room = state
        .hub
        .join_room(&identity, &name, req.password.as_deref())
        .await?;
    Ok(Json(RoomResponse { room }))
}

async fn invite_to_room(
    State(state): State<AppState>,
    AuthIdentity(identity): AuthIdentity,
    Path(name): Path<String>,
    Json(req): Json<InviteRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state.hub.invite_to_room(&identity, &name, &req.username).await?;
    Ok(Json(serde_json::json!({ "invited": true })))
}

async fn delete_room(
    State(state): State<AppState>,
    AuthIdentity(identity): AuthIdentity,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state.hub.delete_room(&identity, &name).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

async fn kick_member(
    State(state): State<AppState>,
    AuthIdentity(identity): AuthIdentity,
    Json(req): Json<KickRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state
        .hub
        .kick_member(&identity, &req.room_name, &req.username)
        .await?;
    Ok(Json(serde_json::json!({ "kicked": true })))
}

async fn online_users(
    State(state): State<AppState>,
    AuthIdentity(_identity): AuthIdentity,
) -> Json<OnlineUsersResponse> {
    Json(OnlineUsersResponse {
        users: state.hub.list_online(),
    })
}

async fn media_upload(
    State(state): State<AppState>,
    AuthIdentity(identity): AuthIdentity,
    body: Bytes,
) -> Result<(StatusCode, Json<MediaUploadResponse>), ServerError> {
    let id = state.media.store(&body).await?;
    info!(id = %id, size = body.len(), identity = %identity, "Media uploaded");
    Ok((StatusCode::CREATED, Json(MediaUploadResponse { id })))
}

async fn media_download(
    State(state): State<AppState>,
    AuthIdentity(_identity): AuthIdentity,
    Path(id): Path<Uuid>,
) -> Result<Vec<u8>, ServerError> {
    Ok(state.media.get(id).await?)
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
