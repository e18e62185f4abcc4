use parking_lot::Mutex;
use parley_proto::{ChatMessage, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::backend::ChatChannel;
use crate::error::PeerError;

/// Open chat channels keyed by remote identity.
#[derive(Clone, Default)]
pub struct DataChannelManager {
    channels: Arc<Mutex<HashMap<UserId, Arc<dyn ChatChannel>>>>,
}

impl DataChannelManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, remote: UserId, channel: Arc<dyn ChatChannel>) {
        self.channels.lock().insert(remote, channel);
    }

    pub fn detach(&self, remote: &UserId) {
        if self.channels.lock().remove(remote).is_some() {
            debug!(peer = %remote, "chat channel released");
        }
    }

    pub fn is_open(&self, remote: &UserId) -> bool {
        self.channels
            .lock()
            .get(remote)
            .is_some_and(|channel| channel.is_open())
    }

    /// Send over the peer's channel. Returns `Ok(false)` without sending when
    /// there is no open channel; nothing is held for later.
    pub async fn send(&self, remote: &UserId, message: &ChatMessage) -> Result<bool, PeerError> {
        let channel = self.channels.lock().get(remote).cloned();
        let Some(channel) = channel.filter(|c| c.is_open()) else {
            return Ok(false);
        };
        let payload = message.encode()?;
        match channel.send_text(payload).await {
            Ok(()) => Ok(true),
            Err(err) => {
                warn!(peer = %remote, error = %err, "chat channel send failed");
                Ok(false)
            }
        }
    }
}

impl std::fmt::Debug for DataChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannelManager")
            .field("peers", &self.channels.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}
