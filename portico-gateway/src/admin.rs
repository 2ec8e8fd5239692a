//! Admin HTTP surface: tunnel CRUD, health/stats queries, and the agent
//! websocket connect endpoint.

use std::sync::Arc;

use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::PortError;
use crate::state::GatewayContext;
use crate::tunnel::record::{generate_subdomain, TunnelEntry, TunnelStatus};
use crate::tunnel::registry::RegistryError;
use crate::tunnel::session::{self, TeardownReason};

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error(transparent)]
    InvalidPort(#[from] PortError),
    #[error("user_id is required")]
    MissingUserId,
    #[error("maximum number of tunnels exceeded for user (limit {0})")]
    TunnelLimit(usize),
    #[error("tunnel not found")]
    NotFound,
    #[error("tunnel is already {0}")]
    AlreadyFinished(TunnelStatus),
    #[error("tunnel cannot be attached: {0}")]
    AttachRejected(&'static str),
    #[error("failed to allocate a unique subdomain")]
    SubdomainExhausted,
}

impl AdminError {
    fn status(&self) -> StatusCode {
        match self {
            AdminError::InvalidPort(_) | AdminError::MissingUserId => StatusCode::BAD_REQUEST,
            AdminError::TunnelLimit(_)
            | AdminError::AlreadyFinished(_)
            | AdminError::AttachRejected(_) => StatusCode::CONFLICT,
            AdminError::NotFound => StatusCode::NOT_FOUND,
            AdminError::SubdomainExhausted => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self, "admin request failed");
        }
        (
            status,
            Json(json!({ "success": false, "error": self.to_string() })),
        )
            .into_response()
    }
}

pub fn router(ctx: GatewayContext) -> Router {
    Router::new()
        .route("/tunnel/create", post(create_tunnel))
        .route("/tunnel/active", get(active_tunnels))
        .route("/tunnel/user/{user_id}", get(user_tunnels))
        .route("/tunnel/health/{subdomain}", get(tunnel_health))
        .route("/tunnel/stats/{subdomain}", get(tunnel_stats))
        .route("/tunnel/ws/connect", get(agent_connect))
        .route(
            "/tunnel/{tunnel_id}",
            get(get_tunnel).delete(terminate_tunnel),
        )
        .with_state(ctx)
}

#[derive(Debug, Deserialize)]
struct CreateTunnelRequest {
    #[serde(default)]
    user_id: String,
    local_port: u32,
}

async fn create_tunnel(
    State(ctx): State<GatewayContext>,
    Json(req): Json<CreateTunnelRequest>,
) -> Result<(StatusCode, Json<Value>), AdminError> {
    if req.user_id.trim().is_empty() {
        return Err(AdminError::MissingUserId);
    }
    let port = ctx.config.validate_port(req.local_port)?;
    if ctx.registry.by_user(&req.user_id).len() >= ctx.config.max_tunnels_per_user {
        return Err(AdminError::TunnelLimit(ctx.config.max_tunnels_per_user));
    }

    let entry = register_new(&ctx, &req.user_id, port)?;
    info!(
        tunnel_id = %entry.tunnel_id,
        user_id = %entry.user_id,
        subdomain = %entry.subdomain,
        local_port = port,
        "tunnel created"
    );
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "data": entry.snapshot(),
            "message": "Tunnel created successfully",
        })),
    ))
}

/// Register a fresh record under a new random subdomain. Collisions are
/// vanishingly rare; a handful of retries covers them.
fn register_new(
    ctx: &GatewayContext,
    user_id: &str,
    local_port: u16,
) -> Result<Arc<TunnelEntry>, AdminError> {
    for _ in 0..4 {
        let entry = Arc::new(TunnelEntry::new(
            user_id,
            generate_subdomain(user_id),
            local_port,
            &ctx.config.base_domain,
            ctx.config.tunnel_expiration(),
        ));
        match ctx.registry.register(Arc::clone(&entry)) {
            Ok(()) => return Ok(entry),
            Err(RegistryError::DuplicateSubdomain(_) | RegistryError::DuplicateId(_)) => continue,
        }
    }
    Err(AdminError::SubdomainExhausted)
}

async fn get_tunnel(
    State(ctx): State<GatewayContext>,
    Path(tunnel_id): Path<String>,
) -> Result<Json<Value>, AdminError> {
    let id = Uuid::parse_str(&tunnel_id).map_err(|_| AdminError::NotFound)?;
    let entry = ctx.registry.by_id(&id).ok_or(AdminError::NotFound)?;
    Ok(Json(json!({ "success": true, "data": entry.snapshot() })))
}

async fn user_tunnels(
    State(ctx): State<GatewayContext>,
    Path(user_id): Path<String>,
) -> Json<Value> {
    let tunnels: Vec<_> = ctx
        .registry
        .by_user(&user_id)
        .iter()
        .map(|entry| entry.snapshot())
        .collect();
    Json(json!({ "success": true, "count": tunnels.len(), "data": tunnels }))
}

async fn terminate_tunnel(
    State(ctx): State<GatewayContext>,
    Path(tunnel_id): Path<String>,
) -> Result<Json<Value>, AdminError> {
    let id = Uuid::parse_str(&tunnel_id).map_err(|_| AdminError::NotFound)?;
    let entry = ctx.registry.by_id(&id).ok_or(AdminError::NotFound)?;
    if entry.status().is_terminal() {
        return Err(AdminError::AlreadyFinished(entry.status()));
    }

    match entry.session() {
        Some(session) => session.teardown(TeardownReason::Terminated),
        None => {
            ctx.registry.remove(&id);
            entry.finish(TunnelStatus::Terminated);
        }
    }
    info!(tunnel_id = %id, "tunnel terminated");
    Ok(Json(json!({
        "success": true,
        "message": "Tunnel terminated successfully",
    })))
}

async fn active_tunnels(State(ctx): State<GatewayContext>) -> Json<Value> {
    let tunnels = ctx.registry.list_active();
    Json(json!({ "success": true, "count": tunnels.len(), "data": tunnels }))
}

async fn tunnel_health(
    State(ctx): State<GatewayContext>,
    Path(subdomain): Path<String>,
) -> Response {
    let healthy = ctx
        .registry
        .by_subdomain(&subdomain)
        .and_then(|entry| entry.session())
        .map(|session| session.is_healthy(ctx.config.stale_threshold()))
        .unwrap_or(false);

    if healthy {
        Json(json!({ "healthy": true, "subdomain": subdomain })).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({
                "healthy": false,
                "subdomain": subdomain,
                "error": "tunnel not found or unhealthy",
            })),
        )
            .into_response()
    }
}

async fn tunnel_stats(
    State(ctx): State<GatewayContext>,
    Path(subdomain): Path<String>,
) -> Result<Json<Value>, AdminError> {
    let entry = ctx
        .registry
        .by_subdomain(&subdomain)
        .ok_or(AdminError::NotFound)?;
    let snapshot = entry.snapshot();
    let uptime_seconds = (Utc::now() - snapshot.created_at).num_seconds().max(0);
    let healthy = entry
        .session()
        .map(|session| session.is_healthy(ctx.config.stale_threshold()))
        .unwrap_or(false);

    Ok(Json(json!({
        "success": true,
        "data": {
            "tunnel_id": snapshot.tunnel_id,
            "user_id": snapshot.user_id,
            "subdomain": snapshot.subdomain,
            "local_port": snapshot.local_port,
            "status": snapshot.status,
            "created_at": snapshot.created_at,
            "last_activity": snapshot.last_activity,
            "uptime_seconds": uptime_seconds,
            "healthy": healthy,
            "analytics": snapshot.analytics,
        },
    })))
}

#[derive(Debug, Deserialize)]
struct ConnectQuery {
    #[serde(default)]
    user_id: String,
    #[serde(default = "default_local_port")]
    local_port: u32,
    /// Attach to a pre-created `connecting` record instead of minting a
    /// fresh one.
    tunnel_id: Option<Uuid>,
}

fn default_local_port() -> u32 {
    3000
}

async fn agent_connect(
    State(ctx): State<GatewayContext>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, AdminError> {
    if query.user_id.trim().is_empty() {
        return Err(AdminError::MissingUserId);
    }
    let local_port = ctx.config.validate_port(query.local_port)?;

    let entry = match query.tunnel_id {
        Some(id) => {
            let entry = ctx.registry.by_id(&id).ok_or(AdminError::NotFound)?;
            if entry.user_id != query.user_id {
                return Err(AdminError::AttachRejected("user mismatch"));
            }
            if entry.status() != TunnelStatus::Connecting || entry.session().is_some() {
                return Err(AdminError::AttachRejected("tunnel is not awaiting an agent"));
            }
            entry
        }
        None => {
            if ctx.registry.by_user(&query.user_id).len() >= ctx.config.max_tunnels_per_user {
                return Err(AdminError::TunnelLimit(ctx.config.max_tunnels_per_user));
            }
            register_new(&ctx, &query.user_id, local_port)?
        }
    };

    info!(
        tunnel_id = %entry.tunnel_id,
        user_id = %entry.user_id,
        subdomain = %entry.subdomain,
        "agent websocket connecting"
    );

    let max_frame = ctx.config.max_frame_bytes;
    Ok(ws
        .max_message_size(max_frame)
        .max_frame_size(max_frame)
        .on_upgrade(move |socket| session::run(ctx, entry, socket)))
}
