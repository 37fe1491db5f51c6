#![forbid(unsafe_code)]

// HTTP control plane - room creation and join preflight.

use crate::signaling::SignalingServer;
use axum::extract::{Host, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::roles::Role;

const ROOM_ID_LEN: usize = 8;

#[derive(Deserialize)]
pub struct CreateRoomRequest {
    #[serde(rename = "userId", default)]
    pub user_id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Serialize)]
pub struct CreateRoomResponse {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub name: String,
    pub role: String,
    #[serde(rename = "roomId")]
    pub room_id: String,
    #[serde(rename = "hostURL")]
    pub host_url: String,
    #[serde(rename = "guestURL")]
    pub guest_url: String,
    #[serde(rename = "audienceURL")]
    pub audience_url: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(rename = "createdBy")]
    pub created_by: String,
}

#[derive(Deserialize)]
pub struct JoinRoomRequest {
    #[serde(rename = "userId", default)]
    pub user_id: String,
    #[serde(rename = "roomId", default)]
    pub room_id: String,
    #[serde(default)]
    pub role: String,
}

#[derive(Serialize)]
pub struct JoinRoomResponse {
    pub status: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    pub role: String,
    #[serde(rename = "roomId")]
    pub room_id: String,
    #[serde(rename = "wsURL")]
    pub ws_url: String,
}

/// Scheme of the inbound request. Axum terminates no TLS itself, so a
/// terminating proxy is detected through X-Forwarded-Proto.
fn http_scheme(headers: &HeaderMap) -> &'static str {
    if forwarded_https(headers) {
        "https"
    } else {
        "http"
    }
}

fn ws_scheme(headers: &HeaderMap) -> &'static str {
    if forwarded_https(headers) {
        "wss"
    } else {
        "ws"
    }
}

fn forwarded_https(headers: &HeaderMap) -> bool {
    headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map(|proto| proto.eq_ignore_ascii_case("https"))
        .unwrap_or(false)
}

fn join_url(scheme: &str, host: &str, room_id: &str, role: Role) -> String {
    format!("{scheme}://{host}/join/{room_id}?role={role}")
}

/// POST /rooms
pub async fn create_room(
    State(server): State<SignalingServer>,
    Host(host): Host,
    headers: HeaderMap,
    Json(req): Json<CreateRoomRequest>,
) -> Response {
    if req.user_id.is_empty() || req.name.is_empty() {
        warn!(user_id = %req.user_id, name = %req.name, "create room request missing required fields");
        return (
            StatusCode::BAD_REQUEST,
            "Missing required fields: userId and name",
        )
            .into_response();
    }

    let manager = server.room_manager();
    let room = loop {
        let id = manager.generate_room_id(ROOM_ID_LEN);
        let (room, already_existed) = manager.create_room(&id, &req.name, &req.user_id);
        if !already_existed {
            break room;
        }
    };

    info!(
        room_id = %room.id,
        creator_user_id = %req.user_id,
        creator_name = %req.name,
        "room creation request succeeded"
    );

    let scheme = http_scheme(&headers);
    Json(CreateRoomResponse {
        user_id: req.user_id,
        name: req.name,
        role: "host".to_string(),
        room_id: room.id.clone(),
        host_url: join_url(scheme, &host, &room.id, Role::Host),
        guest_url: join_url(scheme, &host, &room.id, Role::Guest),
        audience_url: join_url(scheme, &host, &room.id, Role::Audience),
        created_at: room.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        created_by: room.created_by.clone(),
    })
    .into_response()
}

/// POST /rooms/{roomId}/join
pub async fn join_room(
    State(server): State<SignalingServer>,
    Host(host): Host,
    headers: HeaderMap,
    Json(req): Json<JoinRoomRequest>,
) -> Response {
    if req.user_id.is_empty() || req.room_id.is_empty() || req.role.is_empty() {
        warn!("missing required fields in join room request");
        return (StatusCode::BAD_REQUEST, "Missing required fields").into_response();
    }
    let Some(role) = Role::parse(&req.role) else {
        warn!(user_id = %req.user_id, room_id = %req.room_id, role = %req.role, "invalid role in join room request");
        return (StatusCode::BAD_REQUEST, "Invalid role").into_response();
    };
    let Some(room) = server.room_manager().get_room(&req.room_id) else {
        warn!(user_id = %req.user_id, room_id = %req.room_id, "attempt to join non-existent room");
        return (StatusCode::BAD_REQUEST, "Room does not exist").into_response();
    };

    let participant_count = room.participant_count().await;
    if let Err(rejection) = role.check_join(participant_count) {
        warn!(
            room_id = %req.room_id,
            user_id = %req.user_id,
            role = %role,
            participant_count,
            "join request rejected"
        );
        return (StatusCode::FORBIDDEN, rejection.message()).into_response();
    }

    let ws_url = format!(
        "{}://{}/rooms/{}/ws?userId={}&role={}",
        ws_scheme(&headers),
        host,
        req.room_id,
        req.user_id,
        req.role
    );

    info!(room_id = %req.room_id, user_id = %req.user_id, role = %role, "room join request succeeded");

    Json(JoinRoomResponse {
        status: "joined".to_string(),
        user_id: req.user_id,
        role: req.role,
        room_id: req.room_id,
        ws_url,
    })
    .into_response()
}
