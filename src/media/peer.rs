#![forbid(unsafe_code)]

// RtcPeer - capability wrapping one server-side RTCPeerConnection.
//
// The room's renegotiation loop drives the peer through the narrow
// surface below instead of reaching into webrtc-rs directly.

use crate::media::config::MediaConfig;
use crate::signaling::protocol::{IceCandidate, IncomingTrackMeta};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Ceiling on the ICE gathering wait inside `handle_offer`. Whatever
/// local description exists at the deadline is returned.
const ICE_GATHER_CEILING: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("remote description rejected: {0}")]
    SdpRejected(#[source] webrtc::Error),
    #[error("not in have-local-offer state")]
    UnexpectedAnswer,
    #[error("failed to create answer: {0}")]
    AnswerFailed(#[source] webrtc::Error),
    #[error("local description unavailable")]
    NoLocalDescription,
    #[error("failed to add ICE candidate: {0}")]
    IceFailed(#[source] webrtc::Error),
}

/// Upcalls from the peer connection into its owning participant.
#[async_trait]
pub trait RtcEventHandler: Send + Sync {
    /// A non-null local ICE candidate was gathered.
    async fn on_local_ice(&self, candidate: IceCandidate);

    /// A remote RTP track arrived and was correlated to one entry of
    /// the offer's track metadata. Runs on its own task; implementors
    /// may pump the track until it ends.
    async fn on_remote_track(&self, track: Arc<TrackRemote>, meta: IncomingTrackMeta);
}

pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    closed: AtomicBool,
}

impl RtcPeer {
    /// Creates a peer connection with default codecs and interceptors.
    /// `incoming_tracks` is the metadata list advertised in the offer;
    /// remote tracks are correlated against it by kind, first
    /// unconsumed entry in offer order.
    pub async fn new(
        config: &MediaConfig,
        handler: Arc<dyn RtcEventHandler>,
        incoming_tracks: Vec<IncomingTrackMeta>,
    ) -> Result<Arc<Self>, webrtc::Error> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if config.ice_servers.is_empty() {
            vec![]
        } else {
            vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }]
        };

        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await?,
        );

        let ice_handler = Arc::clone(&handler);
        pc.on_ice_candidate(Box::new(move |candidate| {
            let handler = Arc::clone(&ice_handler);
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => handler.on_local_ice(IceCandidate::from(init)).await,
                    Err(e) => warn!(error = %e, "failed to serialize local ICE candidate"),
                }
            })
        }));

        let pending = Arc::new(Mutex::new(incoming_tracks));
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let handler = Arc::clone(&handler);
            let pending = Arc::clone(&pending);
            Box::pin(async move {
                let kind = track.kind().to_string();
                let meta = {
                    let mut pending = pending.lock().unwrap_or_else(|e| e.into_inner());
                    pending
                        .iter()
                        .position(|m| m.kind == kind)
                        .map(|i| pending.remove(i))
                };
                let Some(meta) = meta else {
                    warn!(track_kind = %kind, ssrc = track.ssrc(), "remote track without matching offer metadata, dropping");
                    return;
                };
                debug!(
                    client_track_id = %meta.id,
                    participant_id = %meta.participant_id,
                    track_kind = %kind,
                    "remote track received"
                );
                // The track handler slot stays blocked until this future
                // resolves, so the pump must run on its own task.
                tokio::spawn(async move {
                    handler.on_remote_track(track, meta).await;
                });
            })
        }));

        Ok(Arc::new(Self {
            pc,
            closed: AtomicBool::new(false),
        }))
    }

    /// Applies a remote offer and produces the local answer, waiting
    /// for ICE gathering up to the 5 s ceiling.
    pub async fn handle_offer(
        &self,
        offer: RTCSessionDescription,
    ) -> Result<RTCSessionDescription, PeerError> {
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(PeerError::SdpRejected)?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(PeerError::AnswerFailed)?;

        let mut gather_complete = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(PeerError::AnswerFailed)?;

        let _ = tokio::time::timeout(ICE_GATHER_CEILING, gather_complete.recv()).await;

        self.pc
            .local_description()
            .await
            .ok_or(PeerError::NoLocalDescription)
    }

    /// Applies a remote answer to a connection that previously sent an
    /// offer.
    pub async fn handle_answer(&self, answer: RTCSessionDescription) -> Result<(), PeerError> {
        if self.pc.signaling_state() != RTCSignalingState::HaveLocalOffer {
            return Err(PeerError::UnexpectedAnswer);
        }
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(PeerError::SdpRejected)
    }

    /// Adds a remote ICE candidate. Ignored once the peer is closed.
    pub async fn handle_ice(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.pc
            .add_ice_candidate(candidate.into())
            .await
            .map_err(PeerError::IceFailed)
    }

    /// Removes every attached sender's track and closes the underlying
    /// connection. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for sender in self.pc.get_senders().await {
            if sender.track().await.is_some() {
                if let Err(e) = self.pc.remove_track(&sender).await {
                    warn!(error = %e, "failed to remove sender track on close");
                }
            }
        }
        if let Err(e) = self.pc.close().await {
            warn!(error = %e, "error while closing peer connection");
        }
    }

    // --- state queries and mutations used by the renegotiation loop ---

    pub fn connection_state(&self) -> RTCPeerConnectionState {
        self.pc.connection_state()
    }

    pub fn signaling_state(&self) -> RTCSignalingState {
        self.pc.signaling_state()
    }

    pub async fn senders(&self) -> Vec<Arc<RTCRtpSender>> {
        self.pc.get_senders().await
    }

    pub async fn receivers(&self) -> Vec<Arc<RTCRtpReceiver>> {
        self.pc.get_receivers().await
    }

    pub async fn remove_track(&self, sender: &Arc<RTCRtpSender>) -> Result<(), webrtc::Error> {
        self.pc.remove_track(sender).await
    }

    /// Attaches a forwarding track. The returned sender's RTCP stream
    /// is drained by a detached task; without a reader the interceptor
    /// chain never sees subscriber feedback.
    pub async fn add_track(
        &self,
        track: Arc<dyn TrackLocal + Send + Sync>,
    ) -> Result<Arc<RTCRtpSender>, webrtc::Error> {
        let sender = self.pc.add_track(track).await?;
        let rtcp_sender = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((_, _)) = rtcp_sender.read(&mut rtcp_buf).await {}
        });
        Ok(sender)
    }

    pub async fn create_offer(&self) -> Result<RTCSessionDescription, webrtc::Error> {
        self.pc.create_offer(None).await
    }

    pub async fn set_local_description(
        &self,
        desc: RTCSessionDescription,
    ) -> Result<(), webrtc::Error> {
        self.pc.set_local_description(desc).await
    }

    pub async fn write_rtcp(
        &self,
        packets: &[Box<dyn webrtc::rtcp::packet::Packet + Send + Sync>],
    ) -> Result<usize, webrtc::Error> {
        self.pc.write_rtcp(packets).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullHandler;

    #[async_trait]
    impl RtcEventHandler for NullHandler {
        async fn on_local_ice(&self, _candidate: IceCandidate) {}
        async fn on_remote_track(&self, _track: Arc<TrackRemote>, _meta: IncomingTrackMeta) {}
    }

    fn local_only_config() -> MediaConfig {
        MediaConfig { ice_servers: vec![] }
    }

    async fn client_offer() -> (Arc<RTCPeerConnection>, RTCSessionDescription) {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().unwrap();
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).unwrap();
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .unwrap(),
        );
        // A data channel gives the offer an m-line without media devices.
        pc.create_data_channel("control", None).await.unwrap();
        let offer = pc.create_offer(None).await.unwrap();
        pc.set_local_description(offer.clone()).await.unwrap();
        (pc, offer)
    }

    #[tokio::test]
    async fn test_handle_offer_produces_answer() {
        let peer = RtcPeer::new(&local_only_config(), Arc::new(NullHandler), vec![])
            .await
            .unwrap();
        let (_client, offer) = client_offer().await;

        let answer = peer.handle_offer(offer).await.unwrap();
        assert_eq!(
            answer.sdp_type,
            webrtc::peer_connection::sdp::sdp_type::RTCSdpType::Answer
        );
        assert!(!answer.sdp.is_empty());

        // After a completed offer/answer the peer is stable, so a stray
        // answer must be refused.
        let stray = answer.clone();
        assert!(matches!(
            peer.handle_answer(stray).await,
            Err(PeerError::UnexpectedAnswer)
        ));

        peer.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_ice_ignored_after_close() {
        let peer = RtcPeer::new(&local_only_config(), Arc::new(NullHandler), vec![])
            .await
            .unwrap();
        peer.close().await;
        peer.close().await;

        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 192.0.2.1 54321 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        assert!(peer.handle_ice(candidate).await.is_ok());
    }
}
