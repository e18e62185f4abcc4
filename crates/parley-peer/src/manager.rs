use parking_lot::Mutex;
use parley_proto::{ChatMessage, Envelope, PresenceStatus, UserId, UserPresence};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

use crate::backend::{MediaBackend, MediaKind, SessionHooks};
use crate::channel::DataChannelManager;
use crate::config::PeerConfig;
use crate::error::PeerError;
use crate::event::{ChatRoute, PeerEvent};
use crate::session::{PeerSession, SessionContext, SessionInput, SessionState};

struct SessionEntry {
    generation: u64,
    inputs: mpsc::UnboundedSender<SessionInput>,
    state: watch::Receiver<SessionState>,
}

impl SessionEntry {
    fn is_live(&self) -> bool {
        !self.state.borrow().is_terminal() && !self.inputs.is_closed()
    }
}

struct ManagerInner {
    ctx: SessionContext,
    sessions: Mutex<HashMap<UserId, SessionEntry>>,
    next_generation: AtomicU64,
}

impl ManagerInner {
    /// Drop the table entry for a finished session unless a newer session
    /// for the same peer has replaced it.
    fn finish(&self, remote: &UserId, generation: u64, state: SessionState) {
        let mut sessions = self.sessions.lock();
        if sessions
            .get(remote)
            .is_some_and(|entry| entry.generation == generation)
        {
            sessions.remove(remote);
        }
        debug!(peer = %remote, generation, %state, active = sessions.len(), "session finished");
    }
}

/// Client-side façade: one serialized session task per remote peer plus the
/// chat channels and the event stream for the UI.
#[derive(Clone)]
pub struct PeerManager {
    inner: Arc<ManagerInner>,
}

impl PeerManager {
    /// `outbound` carries envelopes to the relay.
    pub fn new(
        local: UserId,
        backend: Arc<dyn MediaBackend>,
        config: &PeerConfig,
        outbound: mpsc::UnboundedSender<Envelope>,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let ctx = SessionContext {
            local,
            backend,
            outbound,
            events,
            channels: DataChannelManager::new(),
            channel_label: config.data_channel_label.clone(),
        };
        let manager = Self {
            inner: Arc::new(ManagerInner {
                ctx,
                sessions: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        };
        (manager, events_rx)
    }

    pub fn local_id(&self) -> &UserId {
        &self.inner.ctx.local
    }

    /// Start a call. Resolves once the offer is on its way to the relay.
    pub async fn call(&self, remote: &UserId) -> Result<(), PeerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut sessions = self.inner.sessions.lock();
            if sessions.get(remote).is_some_and(SessionEntry::is_live) {
                return Err(PeerError::SessionActive(remote.clone()));
            }
            let inputs = self.spawn_session(&mut sessions, remote.clone());
            inputs
                .send(SessionInput::Initiate(reply_tx))
                .map_err(|_| PeerError::NoSession(remote.clone()))?;
        }
        info!(peer = %remote, "calling");
        reply_rx
            .await
            .map_err(|_| PeerError::NoSession(remote.clone()))?
    }

    /// Hang up the call with `remote`. Returns false when there was none.
    pub fn hang_up(&self, remote: &UserId) -> bool {
        match self.inputs_for(remote) {
            Some(inputs) => inputs.send(SessionInput::Hangup).is_ok(),
            None => false,
        }
    }

    /// Mute or unmute the microphone track sent to `remote`.
    pub async fn set_audio_enabled(&self, remote: &UserId, enabled: bool) -> Result<(), PeerError> {
        self.set_track_enabled(remote, MediaKind::Audio, enabled).await
    }

    /// Pause or resume the camera track sent to `remote`.
    pub async fn set_video_enabled(&self, remote: &UserId, enabled: bool) -> Result<(), PeerError> {
        self.set_track_enabled(remote, MediaKind::Video, enabled).await
    }

    async fn set_track_enabled(
        &self,
        remote: &UserId,
        kind: MediaKind,
        enabled: bool,
    ) -> Result<(), PeerError> {
        let no_session = || PeerError::NoSession(remote.clone());
        let inputs = self.inputs_for(remote).ok_or_else(no_session)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        inputs
            .send(SessionInput::SetTrack {
                kind,
                enabled,
                reply: reply_tx,
            })
            .map_err(|_| no_session())?;
        reply_rx.await.map_err(|_| no_session())?
    }

    pub fn end_all(&self) {
        let sessions = self.inner.sessions.lock();
        for (remote, entry) in sessions.iter() {
            debug!(peer = %remote, "ending call");
            let _ = entry.inputs.send(SessionInput::Hangup);
        }
    }

    /// Dispatch one envelope received from the relay.
    pub fn handle_envelope(&self, envelope: Envelope) {
        match envelope {
            Envelope::Offer { ref from, .. } => {
                let from = from.clone();
                let inputs = {
                    let mut sessions = self.inner.sessions.lock();
                    match sessions.get(&from).filter(|entry| entry.is_live()) {
                        Some(entry) => entry.inputs.clone(),
                        None => self.spawn_session(&mut sessions, from.clone()),
                    }
                };
                let _ = inputs.send(SessionInput::Remote(envelope));
            }
            Envelope::Answer { ref from, .. }
            | Envelope::IceCandidate { ref from, .. }
            | Envelope::CallEnd { ref from, .. } => match self.inputs_for(from) {
                Some(inputs) => {
                    let _ = inputs.send(SessionInput::Remote(envelope));
                }
                None => {
                    debug!(peer = %from, kind = %envelope.kind(), "no session for envelope; ignored")
                }
            },
            Envelope::TextMessage {
                from,
                text,
                timestamp,
                ..
            } => self.emit(PeerEvent::Chat {
                message: ChatMessage {
                    from,
                    text,
                    timestamp,
                },
                route: ChatRoute::Relay,
            }),
            Envelope::Registered { online_users, .. } => self.emit(PeerEvent::Presence {
                users: online_users
                    .into_iter()
                    .map(|id| UserPresence {
                        id,
                        status: PresenceStatus::Online,
                    })
                    .collect(),
            }),
            Envelope::UserOnline { user_id } => self.presence(user_id, PresenceStatus::Online),
            Envelope::UserOffline { user_id } => self.presence(user_id, PresenceStatus::Offline),
            Envelope::UsersList { users } => self.emit(PeerEvent::Presence { users }),
            other @ (Envelope::Register { .. } | Envelope::GetUsers { .. }) => {
                debug!(kind = %other.kind(), "client-bound envelope ignored");
            }
        }
    }

    /// Send chat to `to`, preferring the direct channel and falling back to
    /// a relayed `text-message`.
    pub async fn send_text(
        &self,
        to: &UserId,
        text: impl Into<String>,
    ) -> Result<ChatRoute, PeerError> {
        let message = ChatMessage::new(self.local_id().clone(), text);
        if self.inner.ctx.channels.send(to, &message).await? {
            return Ok(ChatRoute::DataChannel);
        }
        self.inner
            .ctx
            .outbound
            .send(Envelope::TextMessage {
                from: message.from,
                to: to.clone(),
                text: message.text,
                timestamp: message.timestamp,
            })
            .map_err(|_| PeerError::relay_gone())?;
        Ok(ChatRoute::Relay)
    }

    pub fn state(&self, remote: &UserId) -> Option<SessionState> {
        self.inner
            .sessions
            .lock()
            .get(remote)
            .map(|entry| *entry.state.borrow())
    }

    pub fn watch_state(&self, remote: &UserId) -> Option<watch::Receiver<SessionState>> {
        self.inner
            .sessions
            .lock()
            .get(remote)
            .map(|entry| entry.state.clone())
    }

    /// Wait until the session with `remote` reaches `target` or ends.
    /// Returns the state it stopped at.
    pub async fn wait_for_state(
        &self,
        remote: &UserId,
        target: SessionState,
    ) -> Result<SessionState, PeerError> {
        let mut rx = self
            .watch_state(remote)
            .ok_or_else(|| PeerError::NoSession(remote.clone()))?;
        let reached = rx
            .wait_for(|state| *state == target || state.is_terminal())
            .await
            .map(|state| *state);
        Ok(reached.unwrap_or_else(|_| *rx.borrow()))
    }

    pub fn active_peers(&self) -> Vec<UserId> {
        self.inner.sessions.lock().keys().cloned().collect()
    }

    pub fn has_open_channel(&self, remote: &UserId) -> bool {
        self.inner.ctx.channels.is_open(remote)
    }

    fn inputs_for(&self, remote: &UserId) -> Option<mpsc::UnboundedSender<SessionInput>> {
        self.inner
            .sessions
            .lock()
            .get(remote)
            .map(|entry| entry.inputs.clone())
    }

    fn spawn_session(
        &self,
        sessions: &mut HashMap<UserId, SessionEntry>,
        remote: UserId,
    ) -> mpsc::UnboundedSender<SessionInput> {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (inputs, inputs_rx) = mpsc::unbounded_channel();
        let hooks = SessionHooks::new(
            remote.clone(),
            inputs.clone(),
            self.inner.ctx.channels.clone(),
            self.inner.ctx.events.clone(),
        );
        let (session, state) = PeerSession::new(self.inner.ctx.clone(), remote.clone(), hooks);
        sessions.insert(
            remote.clone(),
            SessionEntry {
                generation,
                inputs: inputs.clone(),
                state,
            },
        );

        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let state = session.run(inputs_rx).await;
            match inner.upgrade() {
                Some(inner) => inner.finish(&remote, generation, state),
                None => debug!(peer = %remote, %state, "session ended after its manager"),
            }
        });
        inputs
    }

    fn presence(&self, id: UserId, status: PresenceStatus) {
        self.emit(PeerEvent::Presence {
            users: vec![UserPresence { id, status }],
        });
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.inner.ctx.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackBackend, LoopbackNetwork};
    use tokio::time::{timeout, Duration};

    fn manager(
        name: &str,
        network: &LoopbackNetwork,
    ) -> (
        PeerManager,
        mpsc::UnboundedReceiver<Envelope>,
        mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let backend = Arc::new(LoopbackBackend::new(network.clone(), name));
        let (manager, events) = PeerManager::new(
            UserId::from(name),
            backend,
            &PeerConfig::localhost(),
            outbound,
        );
        (manager, outbound_rx, events)
    }

    async fn next_outbound(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Envelope {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("outbound closed")
    }

    #[test_timeout::tokio_timeout_test]
    async fn second_call_to_same_peer_is_rejected() {
        let network = LoopbackNetwork::new();
        let (alice, mut outbound, _events) = manager("alice", &network);
        let bob = UserId::from("bob");

        alice.call(&bob).await.expect("first call");
        assert!(matches!(next_outbound(&mut outbound).await, Envelope::Offer { .. }));
        assert_eq!(alice.state(&bob), Some(SessionState::AwaitingAnswer));

        let err = alice.call(&bob).await.unwrap_err();
        assert!(matches!(err, PeerError::SessionActive(peer) if peer == bob));
    }

    #[test_timeout::tokio_timeout_test]
    async fn hang_up_removes_session() {
        let network = LoopbackNetwork::new();
        let (alice, mut outbound, _events) = manager("alice", &network);
        let bob = UserId::from("bob");

        alice.call(&bob).await.expect("call");
        let mut state = alice.watch_state(&bob).expect("session");
        assert!(alice.hang_up(&bob));
        state
            .wait_for(|s| *s == SessionState::Closed)
            .await
            .expect("closed");

        let mut saw_call_end = false;
        while let Ok(envelope) = outbound.try_recv() {
            saw_call_end |= matches!(envelope, Envelope::CallEnd { .. });
        }
        assert!(saw_call_end);

        for _ in 0..100 {
            if alice.active_peers().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(alice.active_peers().is_empty());
        assert!(!alice.hang_up(&bob));
    }

    #[test_timeout::tokio_timeout_test]
    async fn end_all_closes_every_session() {
        let network = LoopbackNetwork::new();
        let (alice, _outbound, _events) = manager("alice", &network);
        let bob = UserId::from("bob");
        let carol = UserId::from("carol");

        alice.call(&bob).await.expect("call bob");
        alice.call(&carol).await.expect("call carol");
        let mut states = vec![
            alice.watch_state(&bob).expect("bob session"),
            alice.watch_state(&carol).expect("carol session"),
        ];

        alice.end_all();
        for state in &mut states {
            timeout(Duration::from_secs(5), state.wait_for(|s| *s == SessionState::Closed))
                .await
                .expect("timed out")
                .expect("closed");
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn dropping_the_manager_ends_its_sessions() {
        let network = LoopbackNetwork::new();
        let (alice, mut outbound, _events) = manager("alice", &network);
        let bob = UserId::from("bob");

        alice.call(&bob).await.expect("call");
        let mut state = alice.watch_state(&bob).expect("session");
        assert!(matches!(next_outbound(&mut outbound).await, Envelope::Offer { .. }));
        drop(alice);

        timeout(Duration::from_secs(5), state.wait_for(|s| *s == SessionState::Closed))
            .await
            .expect("session task should end")
            .expect("closed");
        let mut saw_call_end = false;
        while let Ok(envelope) = outbound.try_recv() {
            saw_call_end |= matches!(envelope, Envelope::CallEnd { .. });
        }
        assert!(saw_call_end);
        assert!(!network.is_connected(&UserId::from("alice"), &bob));
    }

    #[test_timeout::tokio_timeout_test]
    async fn chat_falls_back_to_relay_without_channel() {
        let network = LoopbackNetwork::new();
        let (alice, mut outbound, _events) = manager("alice", &network);
        let bob = UserId::from("bob");

        let route = alice.send_text(&bob, "ping").await.expect("send");
        assert_eq!(route, ChatRoute::Relay);
        match next_outbound(&mut outbound).await {
            Envelope::TextMessage { from, to, text, .. } => {
                assert_eq!(from.as_str(), "alice");
                assert_eq!(to, bob);
                assert_eq!(text, "ping");
            }
            other => panic!("expected text-message, got {other:?}"),
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn relay_envelopes_surface_as_events() {
        let network = LoopbackNetwork::new();
        let (alice, _outbound, mut events) = manager("alice", &network);

        alice.handle_envelope(Envelope::UserOffline {
            user_id: UserId::from("carol"),
        });
        alice.handle_envelope(Envelope::text(UserId::from("bob"), UserId::from("alice"), "hi"));
        alice.handle_envelope(Envelope::Answer {
            from: UserId::from("dave"),
            to: UserId::from("alice"),
            sdp: "v=0".into(),
        });

        assert_eq!(
            events.recv().await,
            Some(PeerEvent::Presence {
                users: vec![UserPresence {
                    id: UserId::from("carol"),
                    status: PresenceStatus::Offline,
                }],
            })
        );
        match events.recv().await {
            Some(PeerEvent::Chat { message, route }) => {
                assert_eq!(message.from.as_str(), "bob");
                assert_eq!(message.text, "hi");
                assert_eq!(route, ChatRoute::Relay);
            }
            other => panic!("expected chat, got {other:?}"),
        }
        assert!(events.try_recv().is_err());
        assert!(alice.active_peers().is_empty());
    }
}
