//! Seam between the session state machine and whatever actually moves media.
//!
//! A [`MediaBackend`] hands out one [`MediaSession`] per remote peer. Every
//! asynchronous signal the session produces (gathered candidates, transport
//! state changes, data channel traffic) flows back through the
//! [`SessionHooks`] it was opened with, so the state machine sees them as
//! ordinary inputs on its own queue.

use async_trait::async_trait;
use parley_proto::{ChatMessage, IceCandidate, UserId};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::channel::DataChannelManager;
use crate::error::PeerError;
use crate::event::{ChatRoute, PeerEvent};
use crate::session::SessionInput;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Connectivity as reported by the media layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    pub fn is_lost(self) -> bool {
        matches!(
            self,
            TransportState::Disconnected | TransportState::Failed | TransportState::Closed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Acquire local capture and build a session towards `remote`.
    async fn open_session(
        &self,
        remote: &UserId,
        hooks: SessionHooks,
    ) -> Result<Box<dyn MediaSession>, PeerError>;
}

#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Create and apply a local offer, returning its SDP.
    async fn create_offer(&self) -> Result<String, PeerError>;
    /// Create and apply a local answer, returning its SDP.
    async fn create_answer(&self) -> Result<String, PeerError>;
    async fn apply_remote(&self, kind: SdpKind, sdp: &str) -> Result<(), PeerError>;
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;
    /// Open the ordered chat channel. It is reported through
    /// [`SessionHooks::channel_open`] once usable.
    async fn open_chat_channel(&self, label: &str) -> Result<(), PeerError>;
    /// Start or stop sending the local track of `kind`. The track stays
    /// negotiated, so re-enabling needs no renegotiation.
    async fn set_track_enabled(&self, kind: MediaKind, enabled: bool) -> Result<(), PeerError>;
    async fn close(&self);

    async fn set_audio_enabled(&self, enabled: bool) -> Result<(), PeerError> {
        self.set_track_enabled(MediaKind::Audio, enabled).await
    }

    async fn set_video_enabled(&self, enabled: bool) -> Result<(), PeerError> {
        self.set_track_enabled(MediaKind::Video, enabled).await
    }
}

#[async_trait]
pub trait ChatChannel: Send + Sync {
    fn is_open(&self) -> bool;
    async fn send_text(&self, text: String) -> Result<(), PeerError>;
}

/// Callback handle given to a media session. It only holds a weak handle on
/// the session's input queue, so callbacks never keep a session alive.
#[derive(Clone)]
pub struct SessionHooks {
    remote: UserId,
    inputs: mpsc::WeakUnboundedSender<SessionInput>,
    channels: DataChannelManager,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl SessionHooks {
    pub(crate) fn new(
        remote: UserId,
        inputs: mpsc::UnboundedSender<SessionInput>,
        channels: DataChannelManager,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            remote,
            inputs: inputs.downgrade(),
            channels,
            events,
        }
    }

    pub fn remote(&self) -> &UserId {
        &self.remote
    }

    pub fn local_candidate(&self, candidate: IceCandidate) {
        self.input(SessionInput::LocalCandidate(candidate));
    }

    pub fn transport_state(&self, state: TransportState) {
        self.input(SessionInput::Transport(state));
    }

    fn input(&self, input: SessionInput) {
        match self.inputs.upgrade() {
            Some(inputs) => {
                let _ = inputs.send(input);
            }
            None => trace!(peer = %self.remote, "session gone; media callback dropped"),
        }
    }

    pub fn remote_track(&self, kind: MediaKind) {
        debug!(peer = %self.remote, kind = kind.as_str(), "remote track arrived");
        let _ = self.events.send(PeerEvent::RemoteTrack {
            peer: self.remote.clone(),
            kind,
        });
    }

    pub fn channel_open(&self, channel: Arc<dyn ChatChannel>) {
        debug!(peer = %self.remote, "chat channel open");
        self.channels.attach(self.remote.clone(), channel);
    }

    pub fn channel_message(&self, payload: &str) {
        match ChatMessage::decode(payload) {
            Ok(message) => {
                let _ = self.events.send(PeerEvent::Chat {
                    message,
                    route: ChatRoute::DataChannel,
                });
            }
            Err(err) => warn!(peer = %self.remote, error = %err, "undecodable chat payload"),
        }
    }
}
