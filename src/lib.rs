#![forbid(unsafe_code)]

// streamhub library - WebSocket-signaled SFU for real-time audio/video rooms

pub mod media;
pub mod metrics;
pub mod room;
pub mod signaling;

#[cfg(test)]
pub(crate) mod test_support;
