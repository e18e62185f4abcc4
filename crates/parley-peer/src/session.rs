//! Per-peer negotiation state machine.
//!
//! Each [`PeerSession`] runs as one task draining a single input queue, so
//! relay envelopes and media callbacks for the same peer are applied one at
//! a time. Unexpected envelopes are logged and dropped; only backend errors
//! move a session to [`SessionState::Failed`].

use parley_proto::{Envelope, IceCandidate, UserId};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::backend::{
    MediaBackend, MediaKind, MediaSession, SdpKind, SessionHooks, TransportState,
};
use crate::channel::DataChannelManager;
use crate::error::PeerError;
use crate::event::{EndReason, PeerEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Offering,
    AwaitingAnswer,
    Negotiating,
    Connected,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Offering => "offering",
            SessionState::AwaitingAnswer => "awaiting-answer",
            SessionState::Negotiating => "negotiating",
            SessionState::Connected => "connected",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        }
    }

    fn accepts_candidates(self) -> bool {
        matches!(
            self,
            SessionState::Offering
                | SessionState::AwaitingAnswer
                | SessionState::Negotiating
                | SessionState::Connected
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) enum SessionInput {
    Initiate(oneshot::Sender<Result<(), PeerError>>),
    Remote(Envelope),
    Transport(TransportState),
    LocalCandidate(IceCandidate),
    SetTrack {
        kind: MediaKind,
        enabled: bool,
        reply: oneshot::Sender<Result<(), PeerError>>,
    },
    Hangup,
}

/// Everything a session shares with its manager.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub(crate) local: UserId,
    pub(crate) backend: Arc<dyn MediaBackend>,
    pub(crate) outbound: mpsc::UnboundedSender<Envelope>,
    pub(crate) events: mpsc::UnboundedSender<PeerEvent>,
    pub(crate) channels: DataChannelManager,
    pub(crate) channel_label: String,
}

pub(crate) struct PeerSession {
    ctx: SessionContext,
    remote: UserId,
    hooks: SessionHooks,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    media: Option<Box<dyn MediaSession>>,
    remote_described: bool,
    pending_candidates: Vec<IceCandidate>,
}

impl PeerSession {
    pub(crate) fn new(
        ctx: SessionContext,
        remote: UserId,
        hooks: SessionHooks,
    ) -> (Self, watch::Receiver<SessionState>) {
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let session = Self {
            ctx,
            remote,
            hooks,
            state: SessionState::Idle,
            state_tx,
            media: None,
            remote_described: false,
            pending_candidates: Vec::new(),
        };
        (session, state_rx)
    }

    /// Apply inputs until the session reaches a terminal state.
    pub(crate) async fn run(
        mut self,
        mut inputs: mpsc::UnboundedReceiver<SessionInput>,
    ) -> SessionState {
        while let Some(input) = inputs.recv().await {
            self.handle(input).await;
            if self.state.is_terminal() {
                break;
            }
        }
        if !self.state.is_terminal() {
            debug!(peer = %self.remote, "session inputs closed; hanging up");
            self.hang_up().await;
        }
        self.state
    }

    async fn handle(&mut self, input: SessionInput) {
        match input {
            SessionInput::Initiate(reply) => {
                let result = self.initiate().await;
                let _ = reply.send(result);
            }
            SessionInput::Remote(envelope) => self.on_envelope(envelope).await,
            SessionInput::Transport(state) => self.on_transport(state).await,
            SessionInput::LocalCandidate(candidate) => self.on_local_candidate(candidate),
            SessionInput::SetTrack {
                kind,
                enabled,
                reply,
            } => {
                let _ = reply.send(self.set_track(kind, enabled).await);
            }
            SessionInput::Hangup => self.hang_up().await,
        }
    }

    async fn initiate(&mut self) -> Result<(), PeerError> {
        if self.state != SessionState::Idle {
            debug!(peer = %self.remote, state = %self.state, "call already in progress");
            return Err(PeerError::SessionActive(self.remote.clone()));
        }
        let result = self.start_offer().await;
        if let Err(err) = &result {
            self.fail(err).await;
        }
        result
    }

    async fn start_offer(&mut self) -> Result<(), PeerError> {
        let media = self
            .ctx
            .backend
            .open_session(&self.remote, self.hooks.clone())
            .await?;
        self.media = Some(media);
        self.transition(SessionState::Offering);

        let media = self.media()?;
        media.open_chat_channel(&self.ctx.channel_label).await?;
        let sdp = media.create_offer().await?;
        self.send(Envelope::Offer {
            from: self.ctx.local.clone(),
            to: self.remote.clone(),
            sdp,
        })?;
        self.transition(SessionState::AwaitingAnswer);
        info!(peer = %self.remote, "offer sent");
        Ok(())
    }

    async fn accept_offer(&mut self, sdp: &str) -> Result<(), PeerError> {
        let media = self
            .ctx
            .backend
            .open_session(&self.remote, self.hooks.clone())
            .await?;
        self.media = Some(media);
        self.apply_remote(SdpKind::Offer, sdp).await?;

        let answer = self.media()?.create_answer().await?;
        self.send(Envelope::Answer {
            from: self.ctx.local.clone(),
            to: self.remote.clone(),
            sdp: answer,
        })?;
        self.transition(SessionState::Negotiating);
        info!(peer = %self.remote, "answered incoming call");
        let _ = self.ctx.events.send(PeerEvent::IncomingCall {
            from: self.remote.clone(),
        });
        Ok(())
    }

    async fn on_envelope(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::Offer { sdp, .. } => {
                if self.state != SessionState::Idle {
                    warn!(peer = %self.remote, state = %self.state, "offer ignored");
                    return;
                }
                if let Err(err) = self.accept_offer(&sdp).await {
                    self.fail(&err).await;
                }
            }
            Envelope::Answer { sdp, .. } => {
                if self.state != SessionState::AwaitingAnswer {
                    warn!(peer = %self.remote, state = %self.state, "unexpected answer ignored");
                    return;
                }
                match self.apply_remote(SdpKind::Answer, &sdp).await {
                    Ok(()) => self.transition(SessionState::Negotiating),
                    Err(err) => self.fail(&err).await,
                }
            }
            Envelope::IceCandidate {
                candidate,
                sdp_mline_index,
                sdp_mid,
                ..
            } => {
                self.on_remote_candidate(IceCandidate {
                    candidate,
                    sdp_mline_index,
                    sdp_mid,
                })
                .await
            }
            Envelope::CallEnd { .. } => {
                info!(peer = %self.remote, "remote hung up");
                self.close(EndReason::RemoteHangup).await;
            }
            other => debug!(peer = %self.remote, kind = %other.kind(), "envelope ignored by session"),
        }
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        if !self.state.accepts_candidates() {
            debug!(peer = %self.remote, state = %self.state, "candidate ignored");
            return;
        }
        if !self.remote_described {
            debug!(peer = %self.remote, "candidate buffered until remote description");
            self.pending_candidates.push(candidate);
            return;
        }
        self.add_candidate(candidate).await;
    }

    async fn add_candidate(&self, candidate: IceCandidate) {
        let Some(media) = self.media.as_deref() else {
            return;
        };
        if let Err(err) = media.add_remote_candidate(candidate).await {
            warn!(peer = %self.remote, error = %err, "failed to add remote candidate");
        }
    }

    async fn apply_remote(&mut self, kind: SdpKind, sdp: &str) -> Result<(), PeerError> {
        self.media()?.apply_remote(kind, sdp).await?;
        self.remote_described = true;
        for candidate in std::mem::take(&mut self.pending_candidates) {
            self.add_candidate(candidate).await;
        }
        Ok(())
    }

    async fn on_transport(&mut self, state: TransportState) {
        match state {
            TransportState::Connected if self.state == SessionState::Negotiating => {
                info!(peer = %self.remote, "peer connected");
                self.transition(SessionState::Connected);
            }
            TransportState::Connected | TransportState::Connecting => {
                debug!(peer = %self.remote, state = %self.state, transport = ?state, "transport update");
            }
            lost => {
                if self.state == SessionState::Idle || self.state.is_terminal() {
                    return;
                }
                info!(peer = %self.remote, transport = ?lost, "transport lost");
                self.close(EndReason::TransportLost).await;
            }
        }
    }

    async fn set_track(&self, kind: MediaKind, enabled: bool) -> Result<(), PeerError> {
        let media = match self.media.as_deref() {
            Some(media) if !self.state.is_terminal() => media,
            _ => return Err(PeerError::NoSession(self.remote.clone())),
        };
        media.set_track_enabled(kind, enabled).await?;
        info!(peer = %self.remote, kind = kind.as_str(), enabled, "local track toggled");
        Ok(())
    }

    fn on_local_candidate(&self, candidate: IceCandidate) {
        if self.state == SessionState::Idle || self.state.is_terminal() {
            return;
        }
        let envelope =
            Envelope::candidate_for(self.ctx.local.clone(), self.remote.clone(), candidate);
        if let Err(err) = self.send(envelope) {
            warn!(peer = %self.remote, error = %err, "failed to forward local candidate");
        }
    }

    async fn hang_up(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        let call_end = Envelope::CallEnd {
            from: self.ctx.local.clone(),
            to: self.remote.clone(),
        };
        if let Err(err) = self.send(call_end) {
            warn!(peer = %self.remote, error = %err, "call-end not sent");
        }
        self.close(EndReason::LocalHangup).await;
    }

    async fn close(&mut self, reason: EndReason) {
        self.release().await;
        self.transition(SessionState::Closed);
        let _ = self.ctx.events.send(PeerEvent::CallEnded {
            peer: self.remote.clone(),
            reason,
        });
    }

    async fn fail(&mut self, err: &PeerError) {
        warn!(peer = %self.remote, error = %err, "call failed");
        self.release().await;
        self.transition(SessionState::Failed);
        let _ = self.ctx.events.send(PeerEvent::CallFailed {
            peer: self.remote.clone(),
            error: err.to_string(),
        });
    }

    async fn release(&mut self) {
        if let Some(media) = self.media.take() {
            media.close().await;
        }
        self.ctx.channels.detach(&self.remote);
        self.pending_candidates.clear();
    }

    fn transition(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        debug!(peer = %self.remote, from = %self.state, to = %next, "session transition");
        self.state = next;
        self.state_tx.send_replace(next);
        let _ = self.ctx.events.send(PeerEvent::StateChanged {
            peer: self.remote.clone(),
            state: next,
        });
    }

    fn media(&self) -> Result<&dyn MediaSession, PeerError> {
        self.media
            .as_deref()
            .ok_or_else(|| PeerError::Backend("no media session".into()))
    }

    fn send(&self, envelope: Envelope) -> Result<(), PeerError> {
        self.ctx
            .outbound
            .send(envelope)
            .map_err(|_| PeerError::relay_gone())
    }
}
