#![forbid(unsafe_code)]

// Signaling module - HTTP control plane and WebSocket signaling server

pub mod connection;
pub mod protocol;

use crate::signaling::connection::Connection;

use crate::media::MediaConfig;
use crate::metrics::ServerMetrics;
use crate::room::api;
use crate::room::participant::Participant;
use crate::room::roles::Role;
use crate::room::RoomManager;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use connection::WsConnection;
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Signaling server state shared by every handler.
#[derive(Clone)]
pub struct SignalingServer {
    room_manager: Arc<RoomManager>,
    media_config: Arc<MediaConfig>,
    metrics: ServerMetrics,
}

impl SignalingServer {
    pub fn new(
        room_manager: Arc<RoomManager>,
        media_config: Arc<MediaConfig>,
        metrics: ServerMetrics,
    ) -> Self {
        Self {
            room_manager,
            media_config,
            metrics,
        }
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.room_manager
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    /// Creates the Axum router for the control plane and signaling.
    pub fn router(self) -> Router {
        Router::new()
            .route("/rooms", post(api::create_room))
            .route("/rooms/:room_id/join", post(api::join_room))
            .route("/rooms/:room_id/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Binds and serves. A bind failure is surfaced to the caller and
    /// is process-fatal.
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        info!(addr = %addr, "starting signaling server");
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    let rooms = server.room_manager.room_count();
    let participants = server.room_manager.total_participant_count().await;
    Json(serde_json::json!({
        "status": "ok",
        "rooms": rooms,
        "participants": participants,
    }))
}

async fn metrics_handler(State(server): State<SignalingServer>) -> Response {
    let rooms = server.room_manager.room_count();
    let participants = server.room_manager.total_participant_count().await;
    let body = server.metrics.render_prometheus(rooms, participants);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

#[derive(Deserialize)]
struct WsParams {
    #[serde(rename = "userId", default)]
    user_id: String,
    #[serde(default)]
    role: String,
}

/// WebSocket upgrade: validates the query parameters and the room
/// before upgrading, then hands the socket to the participant loops.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(room_id): Path<String>,
    Query(params): Query<WsParams>,
    State(server): State<SignalingServer>,
) -> Response {
    if room_id.is_empty() || params.user_id.is_empty() || params.role.is_empty() {
        warn!(room_id = %room_id, user_id = %params.user_id, role = %params.role, "WebSocket connection attempt with missing parameters");
        return (StatusCode::BAD_REQUEST, "Missing roomID or userID").into_response();
    }
    let Some(role) = Role::parse(&params.role) else {
        warn!(room_id = %room_id, user_id = %params.user_id, role = %params.role, "invalid role on WebSocket connect");
        return (StatusCode::BAD_REQUEST, "Invalid role").into_response();
    };
    let Some(room) = server.room_manager.get_room(&room_id) else {
        warn!(room_id = %room_id, user_id = %params.user_id, "attempted to join non-existent room");
        return (StatusCode::BAD_REQUEST, "Room does not exist").into_response();
    };

    let user_id = params.user_id;
    server.metrics.inc_connections_total();
    ws.on_failed_upgrade(|error| {
        warn!(error = %error, "WebSocket upgrade failed");
    })
    .on_upgrade(move |socket| async move {
        let _conn_guard = server.metrics.connection_active_guard();

        // A second session under the same id evicts the first.
        if room.contains_participant(&user_id).await {
            warn!(room_id = %room.id, user_id = %user_id, "user already joined the room, evicting prior session");
            room.remove_participant(&user_id).await;
        }

        let conn = Arc::new(WsConnection::new(socket));
        let participant = Participant::new(user_id.clone(), role, room.id.clone(), conn.clone());

        if let Err(e) = room.add_participant(Arc::clone(&participant)).await {
            warn!(room_id = %room.id, user_id = %user_id, error = %e, "failed to add participant to room");
            conn.close().await;
            return;
        }
        server.metrics.inc_joins();
        info!(room_id = %room.id, user_id = %user_id, role = %role, "participant connected");

        tokio::spawn(Arc::clone(&participant).write_loop(server.metrics.clone()));
        participant
            .read_loop(
                Arc::clone(&room),
                Arc::clone(&server.media_config),
                server.metrics.clone(),
            )
            .await;

        server.metrics.inc_leaves();
        info!(room_id = %room.id, user_id = %user_id, "connection handler finished");
    })
}
