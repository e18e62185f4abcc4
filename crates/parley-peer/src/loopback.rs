//! In-process media backend.
//!
//! Two [`LoopbackBackend`]s sharing a [`LoopbackNetwork`] behave like a pair
//! of real peers as far as signaling is concerned: each side produces a
//! synthetic description plus two host candidates, and the pair reports
//! `Connected` once both sides applied a remote description and at least one
//! remote candidate. Descriptions and candidates still travel through the
//! relay, so calls exercise the full signaling path without a network stack.
//! Every loopback endpoint publishes one audio and one video track, each of
//! which can be paused through the session.

use async_trait::async_trait;
use parking_lot::Mutex;
use parley_proto::{IceCandidate, UserId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::backend::{
    ChatChannel, MediaBackend, MediaKind, MediaSession, SdpKind, SessionHooks, TransportState,
};
use crate::error::PeerError;

const CANDIDATES_PER_SIDE: u16 = 2;

type Pair = (UserId, UserId);

struct Endpoint {
    hooks: SessionHooks,
    remote_described: bool,
    remote_candidates: usize,
    wants_channel: bool,
    connected: bool,
    link: Option<Arc<AtomicBool>>,
    audio: bool,
    video: bool,
}

impl Endpoint {
    fn sending(&mut self, kind: MediaKind) -> &mut bool {
        match kind {
            MediaKind::Audio => &mut self.audio,
            MediaKind::Video => &mut self.video,
        }
    }

    fn ready(&self) -> bool {
        self.remote_described && self.remote_candidates > 0 && !self.connected
    }
}

/// Shared medium joining loopback endpoints by `(local, remote)` pair.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    endpoints: Arc<Mutex<HashMap<Pair, Endpoint>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remote candidates applied by `local`'s session towards `remote`.
    pub fn candidates_applied(&self, local: &UserId, remote: &UserId) -> usize {
        self.endpoints
            .lock()
            .get(&(local.clone(), remote.clone()))
            .map_or(0, |ep| ep.remote_candidates)
    }

    pub fn is_connected(&self, local: &UserId, remote: &UserId) -> bool {
        self.endpoints
            .lock()
            .get(&(local.clone(), remote.clone()))
            .is_some_and(|ep| ep.connected)
    }

    /// Whether `local`'s session towards `remote` is sending its `kind` track.
    pub fn is_sending(&self, local: &UserId, remote: &UserId, kind: MediaKind) -> bool {
        self.endpoints
            .lock()
            .get_mut(&(local.clone(), remote.clone()))
            .is_some_and(|ep| *ep.sending(kind))
    }

    fn attach(&self, local: &UserId, remote: &UserId, hooks: SessionHooks) {
        self.endpoints.lock().insert(
            (local.clone(), remote.clone()),
            Endpoint {
                hooks,
                remote_described: false,
                remote_candidates: 0,
                wants_channel: false,
                connected: false,
                link: None,
                audio: true,
                video: true,
            },
        );
    }

    fn update(&self, local: &UserId, remote: &UserId, f: impl FnOnce(&mut Endpoint)) {
        if let Some(endpoint) = self
            .endpoints
            .lock()
            .get_mut(&(local.clone(), remote.clone()))
        {
            f(endpoint);
        }
        self.try_connect(local, remote);
    }

    fn try_connect(&self, local: &UserId, remote: &UserId) {
        let ours = (local.clone(), remote.clone());
        let theirs = (remote.clone(), local.clone());
        let (our_hooks, their_hooks, link) = {
            let mut endpoints = self.endpoints.lock();
            let both_ready = endpoints.get(&ours).is_some_and(Endpoint::ready)
                && endpoints.get(&theirs).is_some_and(Endpoint::ready);
            if !both_ready {
                return;
            }
            let wants_channel = endpoints.get(&ours).is_some_and(|ep| ep.wants_channel)
                || endpoints.get(&theirs).is_some_and(|ep| ep.wants_channel);
            let link = wants_channel.then(|| Arc::new(AtomicBool::new(true)));

            let mut hooks = Vec::with_capacity(2);
            for key in [&ours, &theirs] {
                if let Some(endpoint) = endpoints.get_mut(key) {
                    endpoint.connected = true;
                    endpoint.link = link.clone();
                    hooks.push(endpoint.hooks.clone());
                }
            }
            let their_hooks = hooks.pop();
            let our_hooks = hooks.pop();
            match (our_hooks, their_hooks) {
                (Some(ours), Some(theirs)) => (ours, theirs, link),
                _ => return,
            }
        };

        debug!(local = %local, remote = %remote, channel = link.is_some(), "loopback pair connected");
        if let Some(open) = link {
            our_hooks.channel_open(Arc::new(LoopbackChannel {
                open: open.clone(),
                peer: their_hooks.clone(),
            }));
            their_hooks.channel_open(Arc::new(LoopbackChannel {
                open,
                peer: our_hooks.clone(),
            }));
        }
        for kind in [MediaKind::Audio, MediaKind::Video] {
            our_hooks.remote_track(kind);
            their_hooks.remote_track(kind);
        }
        our_hooks.transport_state(TransportState::Connected);
        their_hooks.transport_state(TransportState::Connected);
    }

    fn detach(&self, local: &UserId, remote: &UserId) {
        let peer_hooks = {
            let mut endpoints = self.endpoints.lock();
            let Some(endpoint) = endpoints.remove(&(local.clone(), remote.clone())) else {
                return;
            };
            if let Some(link) = &endpoint.link {
                link.store(false, Ordering::SeqCst);
            }
            endpoints
                .get(&(remote.clone(), local.clone()))
                .filter(|peer| peer.connected)
                .map(|peer| peer.hooks.clone())
        };
        if let Some(hooks) = peer_hooks {
            hooks.transport_state(TransportState::Disconnected);
        }
    }
}

/// Loopback stand-in for local capture plus a peer connection factory.
#[derive(Clone)]
pub struct LoopbackBackend {
    local: UserId,
    network: LoopbackNetwork,
    media_available: bool,
}

impl LoopbackBackend {
    pub fn new(network: LoopbackNetwork, local: impl Into<UserId>) -> Self {
        Self {
            local: local.into(),
            network,
            media_available: true,
        }
    }

    /// Simulate a device without capture hardware.
    pub fn without_media(mut self) -> Self {
        self.media_available = false;
        self
    }

    pub fn local(&self) -> &UserId {
        &self.local
    }
}

#[async_trait]
impl MediaBackend for LoopbackBackend {
    async fn open_session(
        &self,
        remote: &UserId,
        hooks: SessionHooks,
    ) -> Result<Box<dyn MediaSession>, PeerError> {
        if !self.media_available {
            return Err(PeerError::MediaUnavailable("no capture device".into()));
        }
        self.network.attach(&self.local, remote, hooks.clone());
        Ok(Box::new(LoopbackSession {
            local: self.local.clone(),
            remote: remote.clone(),
            network: self.network.clone(),
            hooks,
        }))
    }
}

struct LoopbackSession {
    local: UserId,
    remote: UserId,
    network: LoopbackNetwork,
    hooks: SessionHooks,
}

impl LoopbackSession {
    fn describe(&self, kind: &str) -> String {
        format!(
            "v=0\r\no=parley-loopback 0 0 IN IP4 127.0.0.1\r\ns={kind} {} to {}\r\n",
            self.local, self.remote
        )
    }

    fn gather(&self) {
        for n in 1..=CANDIDATES_PER_SIDE {
            self.hooks.local_candidate(IceCandidate {
                candidate: format!("candidate:{n} 1 udp 2122260223 127.0.0.1 {} typ host", 50000 + n),
                sdp_mline_index: Some(0),
                sdp_mid: Some("0".into()),
            });
        }
    }
}

#[async_trait]
impl MediaSession for LoopbackSession {
    async fn create_offer(&self) -> Result<String, PeerError> {
        let sdp = self.describe("offer");
        self.gather();
        Ok(sdp)
    }

    async fn create_answer(&self) -> Result<String, PeerError> {
        let sdp = self.describe("answer");
        self.gather();
        Ok(sdp)
    }

    async fn apply_remote(&self, kind: SdpKind, sdp: &str) -> Result<(), PeerError> {
        if !sdp.starts_with("v=0") {
            return Err(PeerError::Backend(format!("unparseable {kind:?} description")));
        }
        self.network
            .update(&self.local, &self.remote, |ep| ep.remote_described = true);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        if !candidate.candidate.starts_with("candidate:") {
            return Err(PeerError::Backend(format!(
                "malformed candidate `{}`",
                candidate.candidate
            )));
        }
        self.network
            .update(&self.local, &self.remote, |ep| ep.remote_candidates += 1);
        Ok(())
    }

    async fn open_chat_channel(&self, _label: &str) -> Result<(), PeerError> {
        self.network
            .update(&self.local, &self.remote, |ep| ep.wants_channel = true);
        Ok(())
    }

    async fn set_track_enabled(&self, kind: MediaKind, enabled: bool) -> Result<(), PeerError> {
        let mut endpoints = self.network.endpoints.lock();
        let endpoint = endpoints
            .get_mut(&(self.local.clone(), self.remote.clone()))
            .ok_or_else(|| PeerError::Backend("loopback endpoint detached".into()))?;
        *endpoint.sending(kind) = enabled;
        Ok(())
    }

    async fn close(&self) {
        self.network.detach(&self.local, &self.remote);
    }
}

struct LoopbackChannel {
    open: Arc<AtomicBool>,
    peer: SessionHooks,
}

#[async_trait]
impl ChatChannel for LoopbackChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: String) -> Result<(), PeerError> {
        if !self.is_open() {
            return Err(PeerError::ChannelClosed);
        }
        self.peer.channel_message(&text);
        Ok(())
    }
}
