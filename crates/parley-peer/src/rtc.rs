//! Media backend over the `webrtc` crate.

use async_trait::async_trait;
use parley_proto::{IceCandidate, UserId};
use std::sync::Arc;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::backend::{
    ChatChannel, MediaBackend, MediaKind, MediaSession, SdpKind, SessionHooks, TransportState,
};
use crate::config::PeerConfig;
use crate::error::PeerError;

/// Which local tracks a call carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }
}

fn build_api() -> Result<API, PeerError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(backend_error)?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(backend_error)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn backend_error<E: std::fmt::Display>(err: E) -> PeerError {
    PeerError::Backend(err.to_string())
}

fn media_kind(codec: RTPCodecType) -> Option<MediaKind> {
    match codec {
        RTPCodecType::Audio => Some(MediaKind::Audio),
        RTPCodecType::Video => Some(MediaKind::Video),
        _ => None,
    }
}

fn transport_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    match state {
        RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        _ => None,
    }
}

/// A locally captured track. Each one is shared by every peer connection
/// the backend opens; samples written here reach each peer whose session has
/// the track enabled.
#[derive(Clone)]
pub struct LocalTrack {
    kind: MediaKind,
    track: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    fn new(local: &UserId, kind: MediaKind) -> Self {
        let mime_type = match kind {
            MediaKind::Audio => MIME_TYPE_OPUS,
            MediaKind::Video => MIME_TYPE_VP8,
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            kind.as_str().to_owned(),
            format!("parley-{local}"),
        ));
        Self { kind, track }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }

    pub async fn write_sample(&self, sample: &Sample) -> Result<(), PeerError> {
        self.track.write_sample(sample).await.map_err(backend_error)
    }

    fn as_track_local(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.track) as Arc<dyn TrackLocal + Send + Sync>
    }
}

struct LocalSender {
    track: LocalTrack,
    rtp: Arc<RTCRtpSender>,
}

pub struct RtcBackend {
    api: API,
    ice_servers: Vec<String>,
    tracks: Vec<LocalTrack>,
}

impl RtcBackend {
    pub fn new(
        local: UserId,
        config: &PeerConfig,
        constraints: MediaConstraints,
    ) -> Result<Self, PeerError> {
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(LocalTrack::new(&local, MediaKind::Audio));
        }
        if constraints.video {
            tracks.push(LocalTrack::new(&local, MediaKind::Video));
        }
        Ok(Self {
            api: build_api()?,
            ice_servers: config.ice_servers.clone(),
            tracks,
        })
    }

    /// Tracks the caller feeds with captured samples.
    pub fn local_tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn local_track(&self, kind: MediaKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|track| track.kind == kind)
    }

    fn configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }

    async fn add_local_tracks(&self, pc: &RTCPeerConnection) -> Result<Vec<LocalSender>, PeerError> {
        let mut senders = Vec::with_capacity(self.tracks.len());
        for track in &self.tracks {
            let rtp = pc.add_track(track.as_track_local()).await.map_err(|err| {
                PeerError::MediaUnavailable(format!("{} track: {err}", track.kind.as_str()))
            })?;
            senders.push(LocalSender {
                track: track.clone(),
                rtp,
            });
        }
        Ok(senders)
    }
}

#[async_trait]
impl MediaBackend for RtcBackend {
    async fn open_session(
        &self,
        remote: &UserId,
        hooks: SessionHooks,
    ) -> Result<Box<dyn MediaSession>, PeerError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.configuration())
                .await
                .map_err(backend_error)?,
        );
        let senders = match self.add_local_tracks(&pc).await {
            Ok(senders) => senders,
            Err(err) => {
                let _ = pc.close().await;
                return Err(err);
            }
        };

        let candidate_hooks = hooks.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let hooks = candidate_hooks.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => hooks.local_candidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mline_index: init.sdp_mline_index,
                        sdp_mid: init.sdp_mid,
                    }),
                    Err(err) => warn!(error = %err, "failed to serialize local candidate"),
                }
            })
        }));

        let state_hooks = hooks.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let hooks = state_hooks.clone();
            Box::pin(async move {
                debug!(peer = %hooks.remote(), ?state, "peer connection state changed");
                if let Some(state) = transport_state(state) {
                    hooks.transport_state(state);
                }
            })
        }));

        let track_hooks = hooks.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let hooks = track_hooks.clone();
            Box::pin(async move {
                match media_kind(track.kind()) {
                    Some(kind) => hooks.remote_track(kind),
                    None => {
                        debug!(peer = %hooks.remote(), id = %track.id(), "remote track of unknown kind")
                    }
                }
            })
        }));

        let channel_hooks = hooks.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let hooks = channel_hooks.clone();
            Box::pin(async move {
                debug!(peer = %hooks.remote(), label = dc.label(), "remote data channel announced");
                wire_channel(dc, hooks);
            })
        }));

        Ok(Box::new(RtcSession { pc, hooks, senders }))
    }
}

fn wire_channel(dc: Arc<RTCDataChannel>, hooks: SessionHooks) {
    let open_hooks = hooks.clone();
    let open_dc = Arc::clone(&dc);
    dc.on_open(Box::new(move || {
        let hooks = open_hooks.clone();
        let dc = Arc::clone(&open_dc);
        Box::pin(async move {
            hooks.channel_open(Arc::new(RtcChatChannel { dc }));
        })
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let hooks = hooks.clone();
        Box::pin(async move {
            if !msg.is_string {
                trace!(peer = %hooks.remote(), len = msg.data.len(), "binary chat frame ignored");
                return;
            }
            match std::str::from_utf8(&msg.data) {
                Ok(text) => hooks.channel_message(text),
                Err(_) => warn!(peer = %hooks.remote(), "non-UTF8 chat frame"),
            }
        })
    }));
}

struct RtcSession {
    pc: Arc<RTCPeerConnection>,
    hooks: SessionHooks,
    senders: Vec<LocalSender>,
}

#[async_trait]
impl MediaSession for RtcSession {
    async fn create_offer(&self) -> Result<String, PeerError> {
        let offer = self.pc.create_offer(None).await.map_err(backend_error)?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .map_err(backend_error)?;
        Ok(sdp)
    }

    async fn create_answer(&self) -> Result<String, PeerError> {
        let answer = self.pc.create_answer(None).await.map_err(backend_error)?;
        let sdp = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .map_err(backend_error)?;
        Ok(sdp)
    }

    async fn apply_remote(&self, kind: SdpKind, sdp: &str) -> Result<(), PeerError> {
        let description = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp.to_owned()),
            SdpKind::Answer => RTCSessionDescription::answer(sdp.to_owned()),
        }
        .map_err(backend_error)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(backend_error)
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc.add_ice_candidate(init).await.map_err(backend_error)
    }

    async fn open_chat_channel(&self, label: &str) -> Result<(), PeerError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(backend_error)?;
        wire_channel(dc, self.hooks.clone());
        Ok(())
    }

    async fn set_track_enabled(&self, kind: MediaKind, enabled: bool) -> Result<(), PeerError> {
        let sender = self
            .senders
            .iter()
            .find(|sender| sender.track.kind == kind)
            .ok_or_else(|| PeerError::MediaUnavailable(format!("no local {} track", kind.as_str())))?;
        let track = enabled.then(|| sender.track.as_track_local());
        sender.rtp.replace_track(track).await.map_err(backend_error)
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            warn!(peer = %self.hooks.remote(), error = %err, "peer connection close failed");
        }
    }
}

struct RtcChatChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl ChatChannel for RtcChatChannel {
    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<(), PeerError> {
        self.dc
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|err| match self.dc.ready_state() {
                RTCDataChannelState::Open => backend_error(err),
                _ => PeerError::ChannelClosed,
            })
    }
}
