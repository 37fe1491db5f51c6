#![forbid(unsafe_code)]

// Participant - one signaling connection plus at most one peer
// connection, with a read loop dispatching control verbs to the room.

use crate::media::forward;
use crate::media::{MediaConfig, RtcEventHandler, RtcPeer};
use crate::metrics::ServerMetrics;
use crate::room::roles::Role;
use crate::room::Room;
use crate::signaling::connection::Connection;
use crate::signaling::protocol::{self, IceCandidate, IncomingTrackMeta, Message, ParticipantSummary};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::track::track_remote::TrackRemote;

/// Bounded outbound queue per participant. Enqueues never block; a
/// full queue drops the message so one stalled subscriber cannot wedge
/// the room.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Pause between tearing down a publisher's previous peer and building
/// the replacement, letting the stack quiesce across client re-offers.
const SOFT_RESET_PAUSE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    Full,
    Closed,
}

pub struct Participant {
    pub id: String,
    pub role: Role,
    pub status: &'static str,
    pub joined_at: SystemTime,
    pub room_id: String,
    name: StdRwLock<String>,
    conn: Arc<dyn Connection>,
    outbound: StdMutex<Option<mpsc::Sender<Message>>>,
    outbound_rx: StdMutex<Option<mpsc::Receiver<Message>>>,
    peer: StdMutex<Option<Arc<RtcPeer>>>,
    closed: AtomicBool,
}

impl Participant {
    pub fn new(
        id: impl Into<String>,
        role: Role,
        room_id: impl Into<String>,
        conn: Arc<dyn Connection>,
    ) -> Arc<Self> {
        let id = id.into();
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        Arc::new(Self {
            name: StdRwLock::new(id.clone()),
            id,
            role,
            status: "active",
            joined_at: SystemTime::now(),
            room_id: room_id.into(),
            conn,
            outbound: StdMutex::new(Some(tx)),
            outbound_rx: StdMutex::new(Some(rx)),
            peer: StdMutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> String {
        self.name.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_name(&self, name: &str) {
        if !name.is_empty() {
            *self.name.write().unwrap_or_else(|e| e.into_inner()) = name.to_string();
        }
    }

    /// Non-blocking enqueue onto the outbound queue.
    pub fn enqueue(&self, msg: Message) -> Result<(), EnqueueError> {
        let guard = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = guard.as_ref() else {
            return Err(EnqueueError::Closed);
        };
        tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    pub fn peer(&self) -> Option<Arc<RtcPeer>> {
        self.peer.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_peer(&self, peer: Arc<RtcPeer>) {
        *self.peer.lock().unwrap_or_else(|e| e.into_inner()) = Some(peer);
    }

    fn take_peer(&self) -> Option<Arc<RtcPeer>> {
        self.peer.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Closes the connection, the peer (if any) and the outbound queue.
    /// Runs its effects exactly once regardless of how many callers
    /// race into it.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.conn.close().await;
        if let Some(peer) = self.take_peer() {
            peer.close().await;
        }
        // Dropping the sender closes the queue; the write loop drains
        // whatever is left and exits.
        self.outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    pub fn summary(&self) -> ParticipantSummary {
        ParticipantSummary {
            id: self.id.clone(),
            name: self.name(),
            role: self.role.as_str().to_string(),
            status: self.status.to_string(),
            joined_at: self
                .joined_at
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }

    /// Consumes the outbound queue until it closes, writing one JSON
    /// text frame per message.
    pub async fn write_loop(self: Arc<Self>, metrics: ServerMetrics) {
        let rx = self
            .outbound_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(mut rx) = rx else {
            return;
        };
        while let Some(msg) = rx.recv().await {
            let data = match serde_json::to_vec(&msg) {
                Ok(data) => data,
                Err(e) => {
                    error!(room_id = %self.room_id, participant_id = %self.id, error = %e, "failed to marshal outgoing message");
                    continue;
                }
            };
            if let Err(e) = self.conn.send(&data).await {
                warn!(room_id = %self.room_id, participant_id = %self.id, error = %e, "failed to send message");
                return;
            }
            metrics.inc_messages_sent();
        }
        debug!(room_id = %self.room_id, participant_id = %self.id, "write loop finished");
    }

    /// Blocking read loop. Any read error ends the loop, and the
    /// deferred cleanup removes the participant from the room.
    pub async fn read_loop(
        self: Arc<Self>,
        room: Arc<Room>,
        media: Arc<MediaConfig>,
        metrics: ServerMetrics,
    ) {
        loop {
            let frame = match self.conn.read().await {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(room_id = %room.id, participant_id = %self.id, error = %e, "connection read error");
                    break;
                }
            };
            metrics.inc_messages_received();

            let msg = match protocol::decode(&frame) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(room_id = %room.id, participant_id = %self.id, error = %e, "undecodable message");
                    metrics.inc_errors();
                    let _ = self.enqueue(Message::error(e.reply()));
                    continue;
                }
            };

            let start = Instant::now();
            Arc::clone(&self).dispatch(&room, &media, msg).await;
            metrics.observe_message_handling(start.elapsed());
        }

        room.remove_participant(&self.id).await;
        info!(room_id = %room.id, participant_id = %self.id, "connection closed, participant removed");
    }

    async fn dispatch(self: Arc<Self>, room: &Arc<Room>, media: &Arc<MediaConfig>, msg: Message) {
        let kind = msg.kind.clone();
        match kind.as_str() {
            "chat" => {
                room.broadcast(&self.id, msg).await;
                debug!(room_id = %room.id, participant_id = %self.id, "chat message broadcast");
            }
            "get_participants" => {
                let content = room.participant_list_content().await;
                let reply = Message {
                    kind: "participant_list".to_string(),
                    content,
                    ..Default::default()
                };
                if self.enqueue(reply).is_err() {
                    warn!(room_id = %room.id, participant_id = %self.id, "failed to send participant list");
                }
            }
            "join" => {
                self.set_name(&msg.name);
                let ack = Message {
                    kind: "join_ack".to_string(),
                    content: serde_json::json!({
                        "room_id": room.id,
                        "participant_id": self.id,
                        "participant_name": self.name(),
                        "participant_role": self.role.as_str(),
                    })
                    .to_string(),
                    state: room.participant_snapshot().await,
                    ..Default::default()
                };
                if self.enqueue(ack).is_err() {
                    warn!(room_id = %room.id, participant_id = %self.id, "failed to send join ack");
                }
                room.broadcast(&self.id, msg).await;
            }
            "sdp" => self.handle_sdp(room, media, msg).await,
            "ice" => self.handle_ice(room, msg).await,
            other => {
                warn!(room_id = %room.id, participant_id = %self.id, message_type = %other, "unknown message type");
                let _ = self.enqueue(Message::error("Unknown message type"));
            }
        }
    }

    async fn handle_sdp(self: Arc<Self>, room: &Arc<Room>, media: &Arc<MediaConfig>, msg: Message) {
        if !self.role.can_publish() {
            warn!(room_id = %room.id, participant_id = %self.id, "audience participant sent SDP, ignoring");
            return;
        }
        let Some(desc) = msg.sdp else {
            let _ = self.enqueue(Message::error("Missing session description"));
            return;
        };
        match desc.sdp_type {
            RTCSdpType::Offer => {
                self.handle_offer(room, media, desc, msg.incoming_tracks).await;
            }
            RTCSdpType::Answer => {
                let Some(peer) = self.peer() else {
                    let _ = self.enqueue(Message::error(
                        "Failed to handle SDP answer: no peer connection",
                    ));
                    return;
                };
                if let Err(e) = peer.handle_answer(desc).await {
                    warn!(room_id = %room.id, participant_id = %self.id, error = %e, "failed to apply SDP answer");
                    let _ = self
                        .enqueue(Message::error(format!("Failed to handle SDP answer: {e}")));
                }
            }
            other => {
                warn!(room_id = %room.id, participant_id = %self.id, sdp_type = %other, "unsupported SDP type, ignoring");
            }
        }
    }

    async fn handle_offer(
        self: Arc<Self>,
        room: &Arc<Room>,
        media: &Arc<MediaConfig>,
        desc: webrtc::peer_connection::sdp::session_description::RTCSessionDescription,
        incoming: Vec<IncomingTrackMeta>,
    ) {
        let mut tracks = Vec::with_capacity(incoming.len());
        for meta in incoming {
            if room.contains_participant(&meta.participant_id).await {
                tracks.push(meta);
            } else {
                warn!(
                    room_id = %room.id,
                    participant_id = %meta.participant_id,
                    client_track_id = %meta.id,
                    "offer references unknown participant, skipping track"
                );
            }
        }

        if let Some(previous) = self.take_peer() {
            info!(room_id = %room.id, participant_id = %self.id, "re-offer received, replacing peer connection");
            previous.close().await;
            tokio::time::sleep(SOFT_RESET_PAUSE).await;
        }

        let handler: Arc<dyn RtcEventHandler> = Arc::new(ParticipantRtcHandler {
            participant: Arc::clone(&self),
            room: Arc::clone(room),
        });
        let peer = match RtcPeer::new(media, handler, tracks).await {
            Ok(peer) => peer,
            Err(e) => {
                error!(room_id = %room.id, participant_id = %self.id, error = %e, "failed to create peer connection");
                let _ = self.enqueue(Message {
                    kind: "error".to_string(),
                    to: self.id.clone(),
                    content: format!("Failed to handle SDP offer: {e}"),
                    ..Default::default()
                });
                return;
            }
        };
        self.set_peer(Arc::clone(&peer));

        match peer.handle_offer(desc).await {
            Ok(answer) => {
                let reply = Message {
                    kind: "sdp".to_string(),
                    sdp: Some(answer),
                    outgoing_tracks: room.tracks_snapshot().await,
                    ..Default::default()
                };
                if self.enqueue(reply).is_err() {
                    warn!(room_id = %room.id, participant_id = %self.id, "failed to send SDP answer");
                }
                Arc::clone(room).signal_peer_connections().await;
            }
            Err(e) => {
                warn!(room_id = %room.id, participant_id = %self.id, error = %e, "failed to handle SDP offer");
                let _ = self.enqueue(Message {
                    kind: "error".to_string(),
                    to: self.id.clone(),
                    content: format!("Failed to handle SDP offer: {e}"),
                    ..Default::default()
                });
            }
        }
    }

    async fn handle_ice(&self, room: &Arc<Room>, msg: Message) {
        if !self.role.can_publish() {
            return;
        }
        let Some(candidate) = msg.ice else {
            warn!(room_id = %room.id, participant_id = %self.id, "ICE message without candidate");
            return;
        };
        match self.peer() {
            None => {
                // Pre-offer candidates are not queued.
                debug!(room_id = %room.id, participant_id = %self.id, "dropping ICE candidate received before any offer");
            }
            Some(peer) => {
                if let Err(e) = peer.handle_ice(candidate).await {
                    warn!(room_id = %room.id, participant_id = %self.id, error = %e, "failed to add ICE candidate");
                }
            }
        }
    }
}

/// Bridges peer-connection upcalls back onto the owning participant.
struct ParticipantRtcHandler {
    participant: Arc<Participant>,
    room: Arc<Room>,
}

#[async_trait]
impl RtcEventHandler for ParticipantRtcHandler {
    async fn on_local_ice(&self, candidate: IceCandidate) {
        // Self-addressed echo: the client consumes its own id.
        let msg = Message {
            kind: "ice".to_string(),
            from: self.participant.id.clone(),
            to: self.participant.id.clone(),
            ice: Some(candidate),
            ..Default::default()
        };
        if self.participant.enqueue(msg).is_err() {
            warn!(
                room_id = %self.room.id,
                participant_id = %self.participant.id,
                "failed to enqueue local ICE candidate"
            );
        }
    }

    async fn on_remote_track(&self, track: Arc<TrackRemote>, meta: IncomingTrackMeta) {
        forward::forward_remote_track(Arc::clone(&self.room), meta, track).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        assert_no_message, recv_message, send_frame, spawn_full_participant, spawn_participant,
    };

    #[tokio::test]
    async fn test_join_acks_sender_then_notifies_others() {
        let room = Room::new("r1", "Standup", "u1", ServerMetrics::new());
        let (_host, mut host_remote) = spawn_full_participant(&room, "u1", Role::Host).await;
        let (_guest, mut guest_remote) = spawn_full_participant(&room, "u2", Role::Guest).await;

        send_frame(
            &host_remote,
            br#"{"type":"join","name":"Alice","role":"host"}"#,
        );

        let ack = recv_message(&mut host_remote).await;
        assert_eq!(ack.kind, "join_ack");
        let content: serde_json::Value = serde_json::from_str(&ack.content).unwrap();
        assert_eq!(content["room_id"], "r1");
        assert_eq!(content["participant_id"], "u1");
        assert_eq!(content["participant_name"], "Alice");
        assert_eq!(content["participant_role"], "host");
        assert_eq!(ack.state.len(), 2);

        let join = recv_message(&mut guest_remote).await;
        assert_eq!(join.kind, "join");
        assert_eq!(join.name, "Alice");
    }

    #[tokio::test]
    async fn test_chat_delivered_once_to_others_never_to_sender() {
        let room = Room::new("r1", "Standup", "u1", ServerMetrics::new());
        let (_a, mut remote_a) = spawn_full_participant(&room, "u1", Role::Host).await;
        let (_b, mut remote_b) = spawn_full_participant(&room, "u2", Role::Guest).await;
        let (_c, mut remote_c) = spawn_full_participant(&room, "u3", Role::Audience).await;

        send_frame(&remote_a, br#"{"type":"chat","from":"u1","content":"hi"}"#);

        let to_b = recv_message(&mut remote_b).await;
        assert_eq!(to_b.kind, "chat");
        assert_eq!(to_b.content, "hi");
        let to_c = recv_message(&mut remote_c).await;
        assert_eq!(to_c.content, "hi");

        assert_no_message(&mut remote_a).await;
        assert_no_message(&mut remote_b).await;
    }

    #[tokio::test]
    async fn test_get_participants_returns_list() {
        let room = Room::new("r1", "Standup", "u1", ServerMetrics::new());
        let (_a, mut remote_a) = spawn_full_participant(&room, "u1", Role::Host).await;
        let (_b, _remote_b) = spawn_full_participant(&room, "u2", Role::Audience).await;

        send_frame(&remote_a, br#"{"type":"get_participants"}"#);

        let reply = recv_message(&mut remote_a).await;
        assert_eq!(reply.kind, "participant_list");
        let content: serde_json::Value = serde_json::from_str(&reply.content).unwrap();
        assert_eq!(content["participant_count"], 2);
        assert_eq!(content["participants"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_type_and_bad_frames_reply_with_errors() {
        let room = Room::new("r1", "Standup", "u1", ServerMetrics::new());
        let (_a, mut remote_a) = spawn_full_participant(&room, "u1", Role::Host).await;

        send_frame(&remote_a, br#"{"type":"teleport"}"#);
        assert_eq!(recv_message(&mut remote_a).await.content, "Unknown message type");

        send_frame(&remote_a, b"{broken");
        assert_eq!(recv_message(&mut remote_a).await.content, "invalid JSON");

        send_frame(&remote_a, br#"{"content":"no type"}"#);
        assert_eq!(
            recv_message(&mut remote_a).await.content,
            "Missing message type"
        );
    }

    #[tokio::test]
    async fn test_audience_sdp_is_ignored() {
        let room = Room::new("r1", "Standup", "u1", ServerMetrics::new());
        let (viewer, mut remote) = spawn_full_participant(&room, "u1", Role::Audience).await;

        send_frame(
            &remote,
            br#"{"type":"sdp","sdp":{"type":"offer","sdp":"v=0\r\n"}}"#,
        );

        assert_no_message(&mut remote).await;
        assert!(viewer.peer().is_none());
    }

    #[tokio::test]
    async fn test_pre_offer_ice_is_dropped_silently() {
        let room = Room::new("r1", "Standup", "u1", ServerMetrics::new());
        let (host, mut remote) = spawn_full_participant(&room, "u1", Role::Host).await;

        send_frame(
            &remote,
            br#"{"type":"ice","ice":{"candidate":"candidate:1 1 udp 1 198.51.100.5 4444 typ host","sdpMid":"0","sdpMLineIndex":0,"usernameFragment":null}}"#,
        );

        assert_no_message(&mut remote).await;
        assert!(host.peer().is_none());
    }

    #[tokio::test]
    async fn test_malformed_offer_yields_error_envelope() {
        let room = Room::new("r1", "Standup", "u1", ServerMetrics::new());
        let (_host, mut remote) = spawn_full_participant(&room, "u1", Role::Host).await;

        send_frame(
            &remote,
            br#"{"type":"sdp","sdp":{"type":"offer","sdp":"this is not sdp"}}"#,
        );

        let reply = crate::test_support::recv_message_within(&mut remote, 10_000).await;
        assert_eq!(reply.kind, "error");
        assert!(reply.content.starts_with("Failed to handle SDP offer:"));
        assert_eq!(reply.to, "u1");
    }

    #[tokio::test]
    async fn test_read_error_removes_participant_and_notifies() {
        let room = Room::new("r1", "Standup", "u1", ServerMetrics::new());
        let (_a, mut remote_a) = spawn_full_participant(&room, "u1", Role::Host).await;
        let (_b, remote_b) = spawn_full_participant(&room, "u2", Role::Guest).await;

        // Simulate the guest's socket dying.
        remote_b.disconnect();

        let left = recv_message(&mut remote_a).await;
        assert_eq!(left.kind, "participant_left");
        assert_eq!(left.from, "u2");
        assert_eq!(room.participant_count().await, 1);
    }

    #[tokio::test]
    async fn test_queue_overflow_is_not_fatal() {
        let room = Room::new("r1", "Standup", "u1", ServerMetrics::new());
        // Participant without a write loop: its queue can only fill.
        let (stalled, _stalled_remote) =
            crate::test_support::make_participant(&room, "u2", Role::Guest).await;
        let (_a, _remote_a) = spawn_participant(&room, "u1", Role::Host).await;

        for _ in 0..OUTBOUND_QUEUE_CAPACITY + 10 {
            room.broadcast(
                "u1",
                Message {
                    kind: "chat".to_string(),
                    content: "spam".to_string(),
                    ..Default::default()
                },
            )
            .await;
        }
        // Stalled participant is still a member; the room stayed live.
        assert!(room.contains_participant("u2").await);
        assert!(matches!(
            stalled.enqueue(Message::error("x")),
            Err(EnqueueError::Full)
        ));
    }
}
