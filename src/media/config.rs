#![forbid(unsafe_code)]

/// ICE configuration for server-side peer connections, loaded from the
/// environment.
#[derive(Debug, Clone)]
pub struct MediaConfig {
    /// STUN/TURN URLs handed to every peer connection. An empty list
    /// restricts gathering to host candidates.
    pub ice_servers: Vec<String>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

impl MediaConfig {
    /// Reads `STUN_URLS` (comma-separated). Unset falls back to the
    /// default public STUN server; an explicitly empty value disables
    /// external servers.
    pub fn from_env() -> Self {
        match std::env::var("STUN_URLS") {
            Ok(urls) => Self {
                ice_servers: urls
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            },
            Err(_) => Self::default(),
        }
    }
}
