#![forbid(unsafe_code)]

// Forwarding pump - relays RTP from one remote track into its local
// forwarding track until the publisher stops sending.

use crate::room::Room;
use crate::signaling::protocol::IncomingTrackMeta;
use std::sync::Arc;
use tracing::{debug, info};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

/// Maximum RTP packet size read from the remote track.
const RTP_READ_BUFFER: usize = 1500;

/// Pumps `remote` into a fresh forwarding track registered with the
/// room, then tears the registration down when the publisher's RTP
/// stream ends. Both registration changes schedule a renegotiation.
pub async fn forward_remote_track(
    room: Arc<Room>,
    meta: IncomingTrackMeta,
    remote: Arc<TrackRemote>,
) {
    let local = Arc::new(TrackLocalStaticRTP::new(
        remote.codec().capability.clone(),
        remote.id(),
        remote.stream_id(),
    ));
    let local_id = local.id().to_string();

    room.register_track(&meta, Arc::clone(&local)).await;
    info!(
        room_id = %room.id,
        participant_id = %meta.participant_id,
        client_track_id = %meta.id,
        track_id = %local_id,
        track_kind = %meta.kind,
        "forwarding track registered"
    );
    Arc::clone(&room).signal_peer_connections().await;

    let mut buf = vec![0u8; RTP_READ_BUFFER];
    loop {
        let mut packet = match remote.read(&mut buf).await {
            Ok((packet, _attrs)) => packet,
            Err(e) => {
                debug!(track_id = %local_id, error = %e, "remote track read ended");
                break;
            }
        };

        // Publisher-side header extensions have no shared meaning
        // across subscribers; strip them before forwarding.
        packet.header.extension = false;
        packet.header.extension_profile = 0;
        packet.header.extensions.clear();

        if let Err(e) = local.write_rtp(&packet).await {
            debug!(track_id = %local_id, error = %e, "forwarding track write failed");
            break;
        }
    }

    room.unregister_track(&meta.id, &local_id).await;
    info!(
        room_id = %room.id,
        track_id = %local_id,
        "forwarding track removed"
    );
    room.signal_peer_connections().await;
}

