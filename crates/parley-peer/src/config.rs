use std::env;

/// Public STUN endpoints used when nothing else is configured.
pub const DEFAULT_STUN_SERVERS: [&str; 5] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
    "stun:stun4.l.google.com:19302",
];

#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// WebSocket URL of the relay.
    pub relay_url: String,
    /// One URL per connectivity-discovery server.
    pub ice_servers: Vec<String>,
    /// Label of the chat data channel opened by the calling side.
    pub data_channel_label: String,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://localhost:8080/ws".to_string(),
            ice_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            data_channel_label: "chat".to_string(),
        }
    }
}

impl PeerConfig {
    /// `PARLEY_RELAY_URL`, `PARLEY_ICE_SERVERS` (comma separated) and
    /// `PARLEY_DISABLE_STUN`, which empties the server list for
    /// same-host setups.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let ice_servers = if env::var("PARLEY_DISABLE_STUN").is_ok() {
            Vec::new()
        } else {
            env::var("PARLEY_ICE_SERVERS")
                .ok()
                .map(|raw| parse_server_list(&raw))
                .filter(|servers| !servers.is_empty())
                .unwrap_or(defaults.ice_servers)
        };

        Self {
            relay_url: env::var("PARLEY_RELAY_URL").unwrap_or(defaults.relay_url),
            ice_servers,
            data_channel_label: defaults.data_channel_label,
        }
    }

    pub fn localhost() -> Self {
        Self {
            ice_servers: Vec::new(),
            ..Self::default()
        }
    }

    pub fn with_relay_url(mut self, url: impl Into<String>) -> Self {
        self.relay_url = url.into();
        self
    }
}

fn parse_server_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
