#![forbid(unsafe_code)]

// Renegotiation core - keeps every subscriber's sender list in sync
// with the room's forwarding-track table.

use crate::room::{Room, RoomInner, TrackMeta};
use crate::signaling::protocol::{IncomingTrackMeta, Message, OutgoingTrackMeta};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

/// Synchronous attempts before the loop gives up on a flapping peer.
const MAX_SYNC_ATTEMPTS: usize = 25;

/// Deferred retry delay once the synchronous attempts are exhausted.
const RESYNC_DELAY: Duration = Duration::from_secs(3);

impl Room {
    /// Registers a forwarding track in both track tables.
    pub async fn register_track(&self, meta: &IncomingTrackMeta, local: Arc<TrackLocalStaticRTP>) {
        let mut inner = self.inner.write().await;
        inner
            .track_locals
            .insert(local.id().to_string(), Arc::clone(&local));
        inner.track_meta.insert(
            meta.id.clone(),
            TrackMeta {
                local,
                publisher_id: meta.participant_id.clone(),
                kind: meta.kind.clone(),
            },
        );
        self.metrics.inc_tracks_published();
    }

    /// Removes a forwarding track from both track tables. Called
    /// exactly once per track, when its pump exits.
    pub async fn unregister_track(&self, client_track_id: &str, local_id: &str) {
        let mut inner = self.inner.write().await;
        inner.track_meta.remove(client_track_id);
        inner.track_locals.remove(local_id);
    }

    /// Wire-format view of the published tracks, skipping entries
    /// whose publisher has already left.
    pub async fn tracks_snapshot(&self) -> Vec<OutgoingTrackMeta> {
        let inner = self.inner.read().await;
        Self::tracks_snapshot_locked(&inner)
    }

    fn tracks_snapshot_locked(inner: &RoomInner) -> Vec<OutgoingTrackMeta> {
        inner
            .track_meta
            .iter()
            .filter_map(|(client_track_id, meta)| {
                let Some(publisher) = inner.participants.get(&meta.publisher_id) else {
                    warn!(
                        client_track_id = %client_track_id,
                        publisher_id = %meta.publisher_id,
                        "publisher not found for track metadata entry"
                    );
                    return None;
                };
                Some(OutgoingTrackMeta {
                    client_track_id: client_track_id.clone(),
                    track_id: meta.local.id().to_string(),
                    participant_id: meta.publisher_id.clone(),
                    participant_name: publisher.name(),
                    kind: meta.kind.clone(),
                })
            })
            .collect()
    }

    /// Reconciles every publishing peer with the current track table
    /// and sends fresh offers where needed. Bounded retry storm, then
    /// a detached 3 s retry; always ends with a keyframe dispatch so
    /// late subscribers decode immediately.
    pub async fn signal_peer_connections(self: Arc<Self>) {
        self.metrics.inc_renegotiations();
        for _ in 0..MAX_SYNC_ATTEMPTS {
            if !self.attempt_sync().await {
                self.dispatch_key_frame().await;
                return;
            }
        }
        debug!(room_id = %self.id, "renegotiation did not converge, deferring retry");
        Arc::clone(&self).schedule_resync(RESYNC_DELAY);
        self.dispatch_key_frame().await;
    }

    fn schedule_resync(self: Arc<Self>, delay: Duration) {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if self.is_closed() {
                return;
            }
            self.signal_peer_connections().await;
        });
    }

    /// One reconciliation pass under the room lock. Returns true when
    /// the caller should retry (a peer is closed mid-iteration or a
    /// sender mutation failed).
    async fn attempt_sync(&self) -> bool {
        let inner = self.inner.write().await;
        let outgoing = Self::tracks_snapshot_locked(&inner);

        for participant in inner.participants.values() {
            if !participant.role.can_publish() {
                continue;
            }
            let Some(peer) = participant.peer() else {
                continue;
            };

            match peer.connection_state() {
                RTCPeerConnectionState::Closed | RTCPeerConnectionState::Failed => return true,
                _ => {}
            }

            let mut attached: HashSet<String> = HashSet::new();
            for sender in peer.senders().await {
                let Some(track) = sender.track().await else {
                    continue;
                };
                let track_id = track.id().to_string();
                if inner.track_locals.contains_key(&track_id) {
                    attached.insert(track_id);
                } else {
                    debug!(
                        room_id = %self.id,
                        participant_id = %participant.id,
                        track_id = %track_id,
                        "removing stale sender"
                    );
                    if peer.remove_track(&sender).await.is_err() {
                        return true;
                    }
                }
            }

            // Tracks this participant publishes arrive on receivers and
            // must not be offered back to it.
            for receiver in peer.receivers().await {
                if let Some(track) = receiver.tracks().await.into_iter().next() {
                    attached.insert(track.id());
                }
            }

            for (track_id, local) in &inner.track_locals {
                if attached.contains(track_id) {
                    continue;
                }
                let track: Arc<dyn TrackLocal + Send + Sync> = Arc::clone(local) as Arc<dyn TrackLocal + Send + Sync>;
                if peer.add_track(track).await.is_err() {
                    return true;
                }
            }

            if peer.signaling_state() != RTCSignalingState::Stable {
                debug!(
                    room_id = %self.id,
                    participant_id = %participant.id,
                    "peer mid-negotiation, skipping offer this round"
                );
                continue;
            }

            let offer = match peer.create_offer().await {
                Ok(offer) => offer,
                Err(e) => {
                    warn!(room_id = %self.id, participant_id = %participant.id, error = %e, "failed to create offer");
                    continue;
                }
            };
            if let Err(e) = peer.set_local_description(offer.clone()).await {
                warn!(room_id = %self.id, participant_id = %participant.id, error = %e, "failed to set local description");
                continue;
            }

            let msg = Message {
                kind: "sdp".to_string(),
                sdp: Some(offer),
                outgoing_tracks: outgoing.clone(),
                ..Default::default()
            };
            if participant.enqueue(msg).is_err() {
                self.metrics.inc_messages_dropped();
                warn!(room_id = %self.id, participant_id = %participant.id, "dropped renegotiation offer, queue unavailable");
            }
        }

        false
    }

    /// Asks every publisher for a fresh keyframe by sending a PLI for
    /// each receiver's SSRC. Best effort.
    pub async fn dispatch_key_frame(&self) {
        let inner = self.inner.read().await;
        for participant in inner.participants.values() {
            if !participant.role.can_publish() {
                continue;
            }
            let Some(peer) = participant.peer() else {
                continue;
            };
            for receiver in peer.receivers().await {
                let Some(track) = receiver.tracks().await.into_iter().next() else {
                    continue;
                };
                let pli = PictureLossIndication {
                    sender_ssrc: 0,
                    media_ssrc: track.ssrc(),
                };
                if let Err(e) = peer.write_rtcp(&[Box::new(pli)]).await {
                    debug!(room_id = %self.id, participant_id = %participant.id, error = %e, "keyframe request failed");
                }
            }
        }
    }
}
