use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use parley_proto::{Envelope, EnvelopeError, UserId};
use tracing::{debug, info, warn};

use crate::registry::{Connection, Outbound};
use crate::relay::Relay;

/// WebSocket upgrade handler
pub async fn websocket_handler(ws: WebSocketUpgrade, State(relay): State<Relay>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, relay))
}

/// Drive one client socket until either side closes it.
async fn handle_socket(socket: WebSocket, relay: Relay) {
    let (connection, mut outbound_rx) = Connection::channel();
    let connection_id = connection.id();
    let (mut sender, mut receiver) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(outbound) = outbound_rx.recv().await {
            match outbound {
                Outbound::Envelope(envelope) => match envelope.encode() {
                    Ok(text) => {
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(error = %err, "dropping unencodable envelope"),
                },
                Outbound::Close => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        debug!(connection = %connection_id, "writer task ended");
    });

    debug!(connection = %connection_id, "websocket connected");
    let mut identity: Option<UserId> = None;

    loop {
        let frame = tokio::select! {
            frame = receiver.next() => frame,
            _ = connection.closed() => {
                debug!(connection = %connection_id, "writer closed; ending reader");
                break;
            }
        };
        let Some(frame) = frame else { break };

        let msg = match frame {
            Ok(m) => m,
            Err(e) => {
                warn!(connection = %connection_id, error = %e, "websocket error");
                break;
            }
        };

        let text = match msg {
            Message::Text(text) => text,
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    debug!(connection = %connection_id, "ignoring non-UTF8 binary frame");
                    continue;
                }
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        match Envelope::decode(&text) {
            Ok(envelope) => handle_envelope(&relay, &connection, &mut identity, envelope),
            Err(EnvelopeError::UnknownKind(kind)) => {
                info!(connection = %connection_id, %kind, "ignoring unknown envelope kind");
            }
            Err(err) => {
                warn!(connection = %connection_id, error = %err, "ignoring malformed envelope");
            }
        }
    }

    if let Some(identity) = identity.take() {
        relay.disconnect(&identity, connection_id);
    }
    writer.abort();
    debug!(connection = %connection_id, "websocket disconnected");
}

fn handle_envelope(
    relay: &Relay,
    connection: &Connection,
    identity: &mut Option<UserId>,
    envelope: Envelope,
) {
    match envelope {
        Envelope::Register { user_id } => {
            if let Some(previous) = identity.take() {
                if previous != user_id {
                    relay.disconnect(&previous, connection.id());
                }
            }
            relay.register(user_id.clone(), connection.clone());
            *identity = Some(user_id);
        }
        other => {
            let kind = other.kind();
            let outcome = relay.route(connection, other);
            debug!(connection = %connection.id(), %kind, outcome = outcome.as_str(), "routed");
        }
    }
}
