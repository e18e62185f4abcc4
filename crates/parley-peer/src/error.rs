use parley_proto::{EnvelopeError, UserId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("local media unavailable: {0}")]
    MediaUnavailable(String),
    #[error("signaling error: {0}")]
    Signaling(String),
    #[error("media backend error: {0}")]
    Backend(String),
    #[error("data channel closed")]
    ChannelClosed,
    #[error("a session with {0} is already active")]
    SessionActive(UserId),
    #[error("no session with {0}")]
    NoSession(UserId),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

impl PeerError {
    pub(crate) fn relay_gone() -> Self {
        PeerError::Signaling("relay connection closed".into())
    }
}
