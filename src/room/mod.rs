#![forbid(unsafe_code)]

// Room module - room state, participant tracking, and the room directory

pub mod api;
pub mod participant;
pub mod roles;
pub mod sfu;

pub use participant::{Participant, EnqueueError};
pub use roles::Role;

use crate::metrics::ServerMetrics;
use crate::signaling::protocol::{Message, ParticipantSummary};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::RwLock as TokioRwLock;
use tracing::{debug, info, warn};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("participant {0} already exists in room {1}")]
    DuplicateParticipant(String, String),
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("participant {0} not found")]
    NotFound(String),
    #[error("outbound queue full for participant {0}")]
    QueueFull(String),
    #[error("outbound queue closed for participant {0}")]
    Closed(String),
}

/// Publisher-facing view of one forwarding track, keyed by the
/// client-chosen track id.
pub struct TrackMeta {
    pub local: Arc<TrackLocalStaticRTP>,
    pub publisher_id: String,
    pub kind: String,
}

/// All concurrently mutated room state lives behind one lock:
/// the participant table, the forwarding tracks actually attached to
/// subscriber peers, and the publisher-facing track metadata.
pub(crate) struct RoomInner {
    pub participants: HashMap<String, Arc<Participant>>,
    pub track_locals: HashMap<String, Arc<TrackLocalStaticRTP>>,
    pub track_meta: HashMap<String, TrackMeta>,
}

pub struct Room {
    pub id: String,
    pub name: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub(crate) inner: TokioRwLock<RoomInner>,
    pub(crate) metrics: ServerMetrics,
    closed: AtomicBool,
}

impl Room {
    pub fn new(id: &str, name: &str, created_by: &str, metrics: ServerMetrics) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            name: name.to_string(),
            created_by: created_by.to_string(),
            created_at: Utc::now(),
            inner: TokioRwLock::new(RoomInner {
                participants: HashMap::new(),
                track_locals: HashMap::new(),
                track_meta: HashMap::new(),
            }),
            metrics,
            closed: AtomicBool::new(false),
        })
    }

    /// Set on deletion so detached renegotiation retries exit without
    /// touching the room.
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn add_participant(&self, participant: Arc<Participant>) -> Result<(), RoomError> {
        let mut inner = self.inner.write().await;
        if inner.participants.contains_key(&participant.id) {
            warn!(room_id = %self.id, participant_id = %participant.id, "participant already exists in room");
            return Err(RoomError::DuplicateParticipant(
                participant.id.clone(),
                self.id.clone(),
            ));
        }
        let count = inner.participants.len() + 1;
        inner
            .participants
            .insert(participant.id.clone(), participant.clone());
        info!(
            room_id = %self.id,
            participant_id = %participant.id,
            role = %participant.role,
            participant_count = count,
            "participant added to room"
        );
        Ok(())
    }

    /// Removes a participant, closing its connection, peer and queue
    /// exactly once, and notifies the remaining participants. Safe to
    /// call multiple times.
    pub async fn remove_participant(&self, participant_id: &str) {
        let (participant, remaining) = {
            let mut inner = self.inner.write().await;
            let Some(participant) = inner.participants.remove(participant_id) else {
                return;
            };
            (participant, inner.participants.len())
        };

        participant.close().await;

        if remaining > 0 {
            let content = serde_json::json!({
                "participant_count": remaining,
                "participant_id": participant.id,
                "participant_name": participant.name(),
            })
            .to_string();
            let msg = Message {
                kind: "participant_left".to_string(),
                from: participant.id.clone(),
                action: "leave".to_string(),
                content,
                ..Default::default()
            };
            self.broadcast(&participant.id, msg).await;
        }

        info!(
            room_id = %self.id,
            participant_id = %participant_id,
            participant_count = remaining,
            room_empty = remaining == 0,
            "participant removed from room"
        );
    }

    /// Non-blocking fan-out to every participant except the sender.
    pub async fn broadcast(&self, sender_id: &str, msg: Message) {
        let inner = self.inner.read().await;
        for (id, participant) in &inner.participants {
            if id == sender_id {
                continue;
            }
            match participant.enqueue(msg.clone()) {
                Ok(()) => {}
                Err(EnqueueError::Full) => {
                    self.metrics.inc_messages_dropped();
                    warn!(room_id = %self.id, sender_id = %sender_id, receiver_id = %id, "dropping message, outbound queue full");
                }
                Err(EnqueueError::Closed) => {
                    debug!(room_id = %self.id, receiver_id = %id, "outbound queue closed, participant disconnecting");
                }
            }
        }
    }

    /// Non-blocking delivery to one participant.
    pub async fn send_to(
        &self,
        sender_id: &str,
        receiver_id: &str,
        msg: Message,
    ) -> Result<(), SendError> {
        let inner = self.inner.read().await;
        let Some(participant) = inner.participants.get(receiver_id) else {
            warn!(room_id = %self.id, sender_id = %sender_id, receiver_id = %receiver_id, "receiver not found in room");
            return Err(SendError::NotFound(receiver_id.to_string()));
        };
        participant.enqueue(msg).map_err(|e| match e {
            EnqueueError::Full => {
                self.metrics.inc_messages_dropped();
                warn!(room_id = %self.id, receiver_id = %receiver_id, "failed to send message, queue full");
                SendError::QueueFull(receiver_id.to_string())
            }
            EnqueueError::Closed => SendError::Closed(receiver_id.to_string()),
        })
    }

    /// Delivery onto the sender's own queue (answers, acks, errors).
    pub async fn send_back(&self, sender_id: &str, msg: Message) -> Result<(), SendError> {
        self.send_to(sender_id, sender_id, msg).await
    }

    pub async fn participant_count(&self) -> usize {
        self.inner.read().await.participants.len()
    }

    pub async fn contains_participant(&self, participant_id: &str) -> bool {
        self.inner
            .read()
            .await
            .participants
            .contains_key(participant_id)
    }

    pub async fn participant_ids(&self) -> Vec<String> {
        self.inner.read().await.participants.keys().cloned().collect()
    }

    pub async fn participant_snapshot(&self) -> Vec<ParticipantSummary> {
        let inner = self.inner.read().await;
        inner.participants.values().map(|p| p.summary()).collect()
    }

    /// JSON payload of the `participant_list` reply.
    pub async fn participant_list_content(&self) -> String {
        let participants = self.participant_snapshot().await;
        serde_json::json!({
            "participant_count": participants.len(),
            "participants": participants,
        })
        .to_string()
    }
}

/// Room directory. The outer lock is held only for brief lookups and
/// inserts, never across await points; per-room state has its own lock.
pub struct RoomManager {
    rooms: StdRwLock<HashMap<String, Arc<Room>>>,
    metrics: ServerMetrics,
}

impl RoomManager {
    pub fn new(metrics: ServerMetrics) -> Self {
        Self {
            rooms: StdRwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Idempotent on id: an existing room is returned with
    /// `already_existed = true`.
    pub fn create_room(&self, id: &str, name: &str, created_by: &str) -> (Arc<Room>, bool) {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        if let Some(room) = rooms.get(id) {
            debug!(room_id = %id, "room already exists");
            return (room.clone(), true);
        }
        let room = Room::new(id, name, created_by, self.metrics.clone());
        rooms.insert(id.to_string(), room.clone());
        self.metrics.inc_rooms_created();
        info!(room_id = %id, created_by = %created_by, "room created");
        (room, false)
    }

    pub fn get_room(&self, id: &str) -> Option<Arc<Room>> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.get(id).cloned()
    }

    /// Drops the room from the directory first, then runs participant
    /// cleanup without holding the manager lock.
    pub async fn delete_room(&self, id: &str) {
        let room = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms.remove(id)
        };
        let Some(room) = room else {
            warn!(room_id = %id, "attempted to delete non-existing room");
            return;
        };
        room.mark_closed();
        for participant_id in room.participant_ids().await {
            room.remove_participant(&participant_id).await;
        }
        info!(room_id = %id, "room deleted");
    }

    pub async fn close_all_rooms(&self) {
        let rooms: Vec<Arc<Room>> = {
            let mut guard = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            guard.drain().map(|(_, room)| room).collect()
        };
        for room in rooms {
            room.mark_closed();
            for participant_id in room.participant_ids().await {
                room.remove_participant(&participant_id).await;
            }
        }
        info!("all rooms closed");
    }

    /// `n` characters drawn uniformly from `[a-zA-Z0-9]`, seeded from
    /// the current nanosecond time. Callers retry on collision.
    pub fn generate_room_id(&self, n: usize) -> String {
        const ALPHABET: &[u8] =
            b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        let mut rng = StdRng::seed_from_u64(seed);
        let id: String = (0..n)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        debug!(room_id = %id, "generated room id");
        id
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub async fn total_participant_count(&self) -> usize {
        let rooms: Vec<Arc<Room>> = {
            let guard = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            guard.values().cloned().collect()
        };
        let mut total = 0;
        for room in rooms {
            total += room.participant_count().await;
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{spawn_participant, recv_message, assert_no_message};

    fn manager() -> RoomManager {
        RoomManager::new(ServerMetrics::new())
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let room = Room::new("r1", "Standup", "u1", ServerMetrics::new());
        let (_a, mut remote_a) = spawn_participant(&room, "u1", Role::Host).await;
        let (_b, mut remote_b) = spawn_participant(&room, "u2", Role::Guest).await;
        let (_c, mut remote_c) = spawn_participant(&room, "u3", Role::Audience).await;

        let msg = Message {
            kind: "chat".to_string(),
            from: "u1".to_string(),
            content: "hello".to_string(),
            ..Default::default()
        };
        room.broadcast("u1", msg).await;

        let to_b = recv_message(&mut remote_b).await;
        let to_c = recv_message(&mut remote_c).await;
        assert_eq!(to_b.kind, "chat");
        assert_eq!(to_b.content, "hello");
        assert_eq!(to_c.kind, "chat");
        assert_no_message(&mut remote_a).await;
    }

    #[tokio::test]
    async fn test_send_to_unknown_participant() {
        let room = Room::new("r1", "Standup", "u1", ServerMetrics::new());
        let (_a, _remote) = spawn_participant(&room, "u1", Role::Host).await;
        let result = room.send_to("u1", "ghost", Message::error("x")).await;
        assert!(matches!(result, Err(SendError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_queue_full_drops_message() {
        let room = Room::new("r1", "Standup", "u1", ServerMetrics::new());
        // No write loop: the queue only fills.
        let (participant, _remote) =
            crate::test_support::make_participant(&room, "u2", Role::Guest).await;

        for _ in 0..participant::OUTBOUND_QUEUE_CAPACITY {
            participant.enqueue(Message::error("fill")).unwrap();
        }
        assert!(matches!(
            participant.enqueue(Message::error("overflow")),
            Err(EnqueueError::Full)
        ));
        assert!(matches!(
            room.send_to("u1", "u2", Message::error("overflow")).await,
            Err(SendError::QueueFull(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_participant_is_idempotent() {
        let room = Room::new("r1", "Standup", "u1", ServerMetrics::new());
        let (_a, mut remote_a) = spawn_participant(&room, "u1", Role::Host).await;
        let (b, remote_b) = spawn_participant(&room, "u2", Role::Guest).await;

        room.remove_participant("u2").await;
        room.remove_participant("u2").await;

        let left = recv_message(&mut remote_a).await;
        assert_eq!(left.kind, "participant_left");
        assert_eq!(left.from, "u2");
        assert_eq!(left.action, "leave");
        let content: serde_json::Value = serde_json::from_str(&left.content).unwrap();
        assert_eq!(content["participant_count"], 1);
        assert_eq!(content["participant_id"], "u2");
        // exactly one notification, one close
        assert_no_message(&mut remote_a).await;
        assert_eq!(remote_b.close_count(), 1);
        assert!(matches!(
            b.enqueue(Message::error("late")),
            Err(EnqueueError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_participant_rejected() {
        let room = Room::new("r1", "Standup", "u1", ServerMetrics::new());
        let (_a, _remote_a) = spawn_participant(&room, "u1", Role::Host).await;

        let (conn, _remote_dup) = crate::test_support::MockConnection::pair();
        let dup = Participant::new("u1", Role::Host, room.id.clone(), conn);
        assert!(room.add_participant(dup).await.is_err());
        assert_eq!(room.participant_count().await, 1);
    }

    #[tokio::test]
    async fn test_participant_list_content() {
        let room = Room::new("r1", "Standup", "u1", ServerMetrics::new());
        let (_a, _ra) = spawn_participant(&room, "u1", Role::Host).await;
        let (_b, _rb) = spawn_participant(&room, "u2", Role::Audience).await;

        let content = room.participant_list_content().await;
        let value: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value["participant_count"], 2);
        let roles: Vec<&str> = value["participants"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["role"].as_str().unwrap())
            .collect();
        assert!(roles.contains(&"host"));
        assert!(roles.contains(&"audience"));
    }

    #[tokio::test]
    async fn test_create_room_is_idempotent() {
        let manager = manager();
        let (first, existed) = manager.create_room("abc", "Standup", "u1");
        assert!(!existed);
        let (second, existed) = manager.create_room("abc", "Other", "u2");
        assert!(existed);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.room_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_room_is_not_auto_deleted() {
        let manager = manager();
        let (room, _) = manager.create_room("abc", "Standup", "u1");
        let (_p, _remote) = spawn_participant(&room, "u1", Role::Host).await;
        room.remove_participant("u1").await;
        assert_eq!(room.participant_count().await, 0);
        assert!(manager.get_room("abc").is_some());
    }

    #[tokio::test]
    async fn test_delete_room_removes_participants() {
        let manager = manager();
        let (room, _) = manager.create_room("abc", "Standup", "u1");
        let (_p, remote) = spawn_participant(&room, "u1", Role::Host).await;

        manager.delete_room("abc").await;
        assert!(manager.get_room("abc").is_none());
        assert!(room.is_closed());
        assert_eq!(remote.close_count(), 1);
    }

    #[tokio::test]
    async fn test_close_all_rooms_empties_directory() {
        let manager = manager();
        let (room_a, _) = manager.create_room("aaa", "A", "u1");
        let (_room_b, _) = manager.create_room("bbb", "B", "u2");
        let (_p, remote) = spawn_participant(&room_a, "u1", Role::Host).await;

        manager.close_all_rooms().await;
        assert_eq!(manager.room_count(), 0);
        assert_eq!(remote.close_count(), 1);
        assert_eq!(manager.total_participant_count().await, 0);
    }

    #[test]
    fn test_generate_room_id_charset_and_length() {
        let manager = manager();
        let id = manager.generate_room_id(8);
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
