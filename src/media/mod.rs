#![forbid(unsafe_code)]

// Media module - webrtc-rs peer connections and RTP forwarding

pub mod config;
pub mod forward;
pub mod peer;

pub use config::MediaConfig;
pub use peer::{PeerError, RtcEventHandler, RtcPeer};
