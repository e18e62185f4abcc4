use futures_util::{SinkExt, StreamExt};
use parley_proto::{Envelope, PresenceStatus, UserId, UserPresence};
use parley_relay::Relay;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_relay() -> (SocketAddr, Relay) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let relay = Relay::new();
    let served = relay.clone();
    tokio::spawn(async move {
        parley_relay::serve(listener, served, std::future::pending())
            .await
            .expect("serve");
    });
    (addr, relay)
}

async fn connect(addr: SocketAddr) -> Socket {
    let (socket, _) = connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("connect");
    socket
}

async fn send(socket: &mut Socket, envelope: &Envelope) {
    let text = envelope.encode().expect("encode");
    socket
        .send(Message::Text(text.into()))
        .await
        .expect("send");
}

async fn next_envelope(socket: &mut Socket) -> Envelope {
    loop {
        let frame = timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for envelope")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = frame {
            return Envelope::decode(text.as_str()).expect("decode");
        }
    }
}

async fn register(addr: SocketAddr, name: &str) -> (Socket, Vec<UserId>) {
    let mut socket = connect(addr).await;
    send(
        &mut socket,
        &Envelope::Register {
            user_id: UserId::from(name),
        },
    )
    .await;
    match next_envelope(&mut socket).await {
        Envelope::Registered {
            user_id,
            online_users,
        } => {
            assert_eq!(user_id.as_str(), name);
            (socket, online_users)
        }
        other => panic!("expected registered, got {other:?}"),
    }
}

async fn wait_until<F: Fn() -> bool>(check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[test_timeout::tokio_timeout_test]
async fn offer_reaches_registered_peer() {
    let (addr, relay) = start_relay().await;
    let (mut alice, _) = register(addr, "alice").await;
    let (mut bob, online) = register(addr, "bob").await;
    assert_eq!(online, vec![UserId::from("alice")]);
    assert_eq!(
        next_envelope(&mut alice).await,
        Envelope::UserOnline {
            user_id: UserId::from("bob")
        }
    );

    let offer = Envelope::Offer {
        from: UserId::from("alice"),
        to: UserId::from("bob"),
        sdp: "v=0".into(),
    };
    send(&mut alice, &offer).await;
    assert_eq!(next_envelope(&mut bob).await, offer);
    assert!(relay.is_linked(&UserId::from("alice"), &UserId::from("bob")));
}

#[test_timeout::tokio_timeout_test]
async fn queued_envelopes_arrive_in_order_after_ack() {
    let (addr, relay) = start_relay().await;
    let (mut alice, _) = register(addr, "alice").await;
    let (mut earlier_bob, _) = register(addr, "bob").await;
    earlier_bob.close(None).await.expect("close");
    wait_until(|| !relay.is_reachable(&UserId::from("bob"))).await;

    let offer = Envelope::Offer {
        from: UserId::from("alice"),
        to: UserId::from("bob"),
        sdp: "v=0".into(),
    };
    let hello = Envelope::text(UserId::from("alice"), UserId::from("bob"), "hello");
    send(&mut alice, &offer).await;
    send(&mut alice, &hello).await;
    wait_until(|| relay.pending_for(&UserId::from("bob")) == 2).await;

    let (mut bob, _) = register(addr, "bob").await;
    assert_eq!(next_envelope(&mut bob).await, offer);
    assert_eq!(next_envelope(&mut bob).await, hello);
    assert_eq!(relay.pending_for(&UserId::from("bob")), 0);
}

#[test_timeout::tokio_timeout_test]
async fn second_registration_replaces_first() {
    let (addr, relay) = start_relay().await;
    let (mut first, _) = register(addr, "alice").await;
    let (_second, _) = register(addr, "alice").await;

    let closed = timeout(Duration::from_secs(5), async {
        while let Some(frame) = first.next().await {
            match frame {
                Ok(Message::Close(_)) | Err(_) => return true,
                Ok(_) => continue,
            }
        }
        true
    })
    .await
    .expect("first connection should be closed");
    assert!(closed);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(relay.identities(), vec![UserId::from("alice")]);
    assert!(relay.is_reachable(&UserId::from("alice")));
}

#[test_timeout::tokio_timeout_test]
async fn get_users_lists_other_reachable_users() {
    let (addr, _relay) = start_relay().await;
    let (_alice, _) = register(addr, "alice").await;
    let (mut bob, _) = register(addr, "bob").await;

    send(
        &mut bob,
        &Envelope::GetUsers {
            user_id: UserId::from("bob"),
        },
    )
    .await;
    assert_eq!(
        next_envelope(&mut bob).await,
        Envelope::UsersList {
            users: vec![UserPresence {
                id: UserId::from("alice"),
                status: PresenceStatus::Online,
            }],
        }
    );
}

#[test_timeout::tokio_timeout_test]
async fn get_users_never_lists_the_sender() {
    let (addr, _relay) = start_relay().await;
    let (mut alice, _) = register(addr, "alice").await;
    let (_bob, _) = register(addr, "bob").await;
    assert!(matches!(
        next_envelope(&mut alice).await,
        Envelope::UserOnline { .. }
    ));

    send(
        &mut alice,
        &Envelope::GetUsers {
            user_id: UserId::from("bob"),
        },
    )
    .await;
    assert_eq!(
        next_envelope(&mut alice).await,
        Envelope::UsersList {
            users: vec![UserPresence {
                id: UserId::from("bob"),
                status: PresenceStatus::Online,
            }],
        }
    );
}

#[test_timeout::tokio_timeout_test]
async fn malformed_frames_keep_connection_open() {
    let (addr, _relay) = start_relay().await;
    let (mut alice, _) = register(addr, "alice").await;

    alice
        .send(Message::Text("not json".to_string().into()))
        .await
        .expect("send");
    alice
        .send(Message::Text(r#"{"type":"teleport","to":"bob"}"#.to_string().into()))
        .await
        .expect("send");
    send(
        &mut alice,
        &Envelope::GetUsers {
            user_id: UserId::from("alice"),
        },
    )
    .await;
    assert_eq!(
        next_envelope(&mut alice).await,
        Envelope::UsersList { users: vec![] }
    );
}

#[test_timeout::tokio_timeout_test]
async fn disconnect_notifies_call_partner() {
    let (addr, relay) = start_relay().await;
    let (mut alice, _) = register(addr, "alice").await;
    let (mut bob, _) = register(addr, "bob").await;
    next_envelope(&mut alice).await;

    send(
        &mut alice,
        &Envelope::Offer {
            from: UserId::from("alice"),
            to: UserId::from("bob"),
            sdp: "v=0".into(),
        },
    )
    .await;
    next_envelope(&mut bob).await;

    alice.close(None).await.expect("close");
    assert_eq!(
        next_envelope(&mut bob).await,
        Envelope::UserOffline {
            user_id: UserId::from("alice")
        }
    );
    wait_until(|| !relay.is_reachable(&UserId::from("alice"))).await;
    assert!(!relay.is_linked(&UserId::from("bob"), &UserId::from("alice")));
}

#[test_timeout::tokio_timeout_test]
async fn health_reports_occupancy() {
    let (addr, _relay) = start_relay().await;
    let (_alice, _) = register(addr, "alice").await;

    let mut stream = TcpStream::connect(addr).await.expect("connect");
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .expect("write");
    let mut response = String::new();
    stream.read_to_string(&mut response).await.expect("read");
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains(r#""status":"ok""#));
    assert!(response.contains(r#""online":1"#));
}
