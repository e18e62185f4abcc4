use parley_proto::{ChatMessage, UserId, UserPresence};

use crate::backend::MediaKind;
use crate::session::SessionState;

/// Which path a chat message travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRoute {
    DataChannel,
    Relay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    TransportLost,
}

/// Notifications for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    IncomingCall { from: UserId },
    StateChanged { peer: UserId, state: SessionState },
    CallEnded { peer: UserId, reason: EndReason },
    CallFailed { peer: UserId, error: String },
    RemoteTrack { peer: UserId, kind: MediaKind },
    Chat { message: ChatMessage, route: ChatRoute },
    Presence { users: Vec<UserPresence> },
}
