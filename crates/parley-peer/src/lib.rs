//! Client side of parley: per-peer call negotiation over the relay, a chat
//! channel on top of each established session, and the relay connection.

pub mod backend;
pub mod channel;
pub mod config;
pub mod error;
pub mod event;
pub mod loopback;
pub mod manager;
pub mod rtc;
pub mod session;
pub mod signaling;

pub use backend::{
    ChatChannel, MediaBackend, MediaKind, MediaSession, SdpKind, SessionHooks, TransportState,
};
pub use channel::DataChannelManager;
pub use config::PeerConfig;
pub use error::PeerError;
pub use event::{ChatRoute, EndReason, PeerEvent};
pub use loopback::{LoopbackBackend, LoopbackNetwork};
pub use manager::PeerManager;
pub use rtc::{LocalTrack, MediaConstraints, RtcBackend};
pub use session::SessionState;
pub use signaling::RelayClient;
