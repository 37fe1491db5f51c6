#![forbid(unsafe_code)]

// Signaling protocol - the JSON envelope exchanged over the WebSocket

use serde::{Deserialize, Serialize};
use thiserror::Error;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Flat control envelope. Every field except `type` is optional and
/// omitted from the wire when empty.
///
/// Client-to-server types: `chat`, `sdp`, `ice`, `get_participants`,
/// `join`. Server-to-client additionally: `error`, `participant_list`,
/// `join_ack`, `participant_left`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub from: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub to: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<RTCSessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice: Option<IceCandidate>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub action: String,
    #[serde(
        rename = "incomingTrackMetaData",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub incoming_tracks: Vec<IncomingTrackMeta>,
    #[serde(
        rename = "outgoingTrackMetaData",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub outgoing_tracks: Vec<OutgoingTrackMeta>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub state: Vec<ParticipantSummary>,
}

impl Message {
    /// Builds an `error` envelope with the given content.
    pub fn error(content: impl Into<String>) -> Self {
        Self {
            kind: "error".to_string(),
            content: content.into(),
            ..Default::default()
        }
    }
}

/// ICE candidate init as it appears on the wire. Null-valued fields are
/// permitted, so none of them are skipped when serializing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    #[serde(default)]
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

/// Track metadata advertised by a publisher alongside an SDP offer.
/// `id` is the client-chosen track identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingTrackMeta {
    pub id: String,
    pub participant_id: String,
    #[serde(default)]
    pub participant_name: String,
    pub kind: String,
}

/// Track metadata attached to server answers and renegotiation offers.
/// `track_id` is the server-allocated forwarding track id the client
/// will see on its receivers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingTrackMeta {
    pub client_track_id: String,
    pub track_id: String,
    pub participant_id: String,
    pub participant_name: String,
    pub kind: String,
}

/// Participant summary used in `state` and in the participant-list
/// payload. `joined_at` is unix seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantSummary {
    pub id: String,
    pub name: String,
    pub role: String,
    pub status: String,
    pub joined_at: u64,
}

/// Decode failures are reported back to the sender as error envelopes;
/// neither closes the connection.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON")]
    InvalidJson(#[source] serde_json::Error),
    #[error("Missing message type")]
    MissingType,
}

impl DecodeError {
    /// The literal content of the error envelope sent in reply.
    pub fn reply(&self) -> &'static str {
        match self {
            DecodeError::InvalidJson(_) => "invalid JSON",
            DecodeError::MissingType => "Missing message type",
        }
    }
}

/// Decodes one signaling frame, distinguishing malformed JSON from an
/// envelope without a `type` discriminator.
pub fn decode(frame: &[u8]) -> Result<Message, DecodeError> {
    let msg: Message = serde_json::from_slice(frame).map_err(DecodeError::InvalidJson)?;
    if msg.kind.is_empty() {
        return Err(DecodeError::MissingType);
    }
    Ok(msg)
}
