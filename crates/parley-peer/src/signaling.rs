use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use parley_proto::{Envelope, EnvelopeError, UserId};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::PeerError;
use crate::manager::PeerManager;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

enum Outgoing {
    Envelope(Envelope),
    Close,
}

/// WebSocket connection to the relay, registered under one identity.
pub struct RelayClient {
    identity: UserId,
    online_at_register: Vec<UserId>,
    envelopes: mpsc::UnboundedSender<Envelope>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayClient {
    /// Connect, register as `identity` and wait for the relay's ack.
    pub async fn connect(relay_url: &str, identity: UserId) -> Result<Self, PeerError> {
        let url = websocket_url(relay_url)?;
        let (ws_stream, _) = timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| PeerError::Signaling(format!("timed out connecting to {url}")))?
            .map_err(|err| PeerError::Signaling(format!("websocket connect failed: {err}")))?;
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let register = Envelope::Register {
            user_id: identity.clone(),
        };
        ws_write
            .send(Message::Text(register.encode()?.into()))
            .await
            .map_err(|err| PeerError::Signaling(format!("register failed: {err}")))?;

        let online_at_register = timeout(CONNECT_TIMEOUT, async {
            while let Some(frame) = ws_read.next().await {
                let frame =
                    frame.map_err(|err| PeerError::Signaling(format!("relay read failed: {err}")))?;
                if let Message::Text(text) = frame {
                    if let Ok(Envelope::Registered { online_users, .. }) =
                        Envelope::decode(text.as_str())
                    {
                        return Ok(online_users);
                    }
                }
            }
            Err(PeerError::relay_gone())
        })
        .await
        .map_err(|_| PeerError::Signaling("timed out waiting for registration".into()))??;
        info!(user = %identity, online = online_at_register.len(), "registered with relay");

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Outgoing>();
        let (envelopes, mut envelopes_rx) = mpsc::unbounded_channel::<Envelope>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Envelope>();

        let forward = outgoing.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(envelope) = envelopes_rx.recv().await {
                if forward.send(Outgoing::Envelope(envelope)).is_err() {
                    break;
                }
            }
        });

        let writer = tokio::spawn(async move {
            while let Some(item) = outgoing_rx.recv().await {
                match item {
                    Outgoing::Envelope(envelope) => match envelope.encode() {
                        Ok(text) => {
                            if ws_write.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!(error = %err, "dropping unencodable envelope"),
                    },
                    Outgoing::Close => {
                        let _ = ws_write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            debug!("relay writer ended");
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text.as_str().to_owned(),
                    Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        warn!(error = %err, "relay websocket error");
                        break;
                    }
                };
                match Envelope::decode(&text) {
                    Ok(envelope) => {
                        if inbound_tx.send(envelope).is_err() {
                            break;
                        }
                    }
                    Err(EnvelopeError::UnknownKind(kind)) => {
                        debug!(%kind, "unknown envelope kind from relay")
                    }
                    Err(err) => warn!(error = %err, "malformed envelope from relay"),
                }
            }
            info!("relay connection closed");
        });

        Ok(Self {
            identity,
            online_at_register,
            envelopes,
            outgoing,
            inbound: Mutex::new(Some(inbound_rx)),
            writer: Mutex::new(Some(writer)),
            tasks: Mutex::new(vec![forwarder, reader]),
        })
    }

    pub fn identity(&self) -> &UserId {
        &self.identity
    }

    /// Identities the relay reported online in its registration ack.
    pub fn online_at_register(&self) -> &[UserId] {
        &self.online_at_register
    }

    /// Sender for envelopes bound to the relay, as handed to [`PeerManager::new`].
    pub fn sender(&self) -> mpsc::UnboundedSender<Envelope> {
        self.envelopes.clone()
    }

    /// Take the inbound envelope stream. Only the first call gets it.
    pub fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<Envelope>> {
        self.inbound.lock().take()
    }

    /// Feed every inbound envelope to `manager`.
    pub fn dispatch_to(&self, manager: PeerManager) -> Result<(), PeerError> {
        let mut inbound = self
            .take_inbound()
            .ok_or_else(|| PeerError::Signaling("inbound stream already taken".into()))?;
        let dispatcher = tokio::spawn(async move {
            while let Some(envelope) = inbound.recv().await {
                manager.handle_envelope(envelope);
            }
        });
        self.tasks.lock().push(dispatcher);
        Ok(())
    }

    /// Ask the relay for everyone else who is online. The reply arrives on
    /// the inbound stream as `users-list`.
    pub fn request_users(&self) -> Result<(), PeerError> {
        self.envelopes
            .send(Envelope::GetUsers {
                user_id: self.identity.clone(),
            })
            .map_err(|_| PeerError::relay_gone())
    }

    /// Send a close frame and stop the background tasks.
    pub async fn close(&self) {
        let _ = self.outgoing.send(Outgoing::Close);
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if timeout(Duration::from_secs(1), writer).await.is_err() {
                debug!("relay writer did not finish closing");
            }
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.lock().take() {
            writer.abort();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

fn websocket_url(raw: &str) -> Result<Url, PeerError> {
    let mut url = Url::parse(raw)
        .map_err(|err| PeerError::Signaling(format!("invalid relay url {raw}: {err}")))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(PeerError::Signaling(format!(
                "unsupported relay url scheme `{other}`"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| PeerError::Signaling("invalid websocket scheme".into()))?;
    Ok(url)
}
