//! End-to-end tests: a real server on an ephemeral port, driven by a
//! WebSocket client.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time;
use tokio_tungstenite::tungstenite;

use wavelink::{Server, Transport};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Start the server in the background. Returns its address.
async fn start_server(server: &Server) -> SocketAddr {
    let app = server.router();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    addr
}

async fn connect(addr: SocketAddr) -> WsStream {
    let url = format!("ws://{addr}/socket.io/");
    let (ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("ws connect");
    ws
}

/// Next protocol text frame, skipping liveness pings and WebSocket-level
/// control frames.
async fn next_text(ws: &mut WsStream) -> String {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for frame")
            .expect("stream ended")
            .expect("ws read error");
        match msg {
            tungstenite::Message::Text(text) => {
                if text == "2" {
                    continue; // server liveness ping
                }
                return text;
            }
            tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) => continue,
            other => panic!("expected text frame, got {other:?}"),
        }
    }
}

async fn send_text(ws: &mut WsStream, text: &str) {
    ws.send(tungstenite::Message::Text(text.to_string()))
        .await
        .expect("send");
}

/// Connect and consume the open sequence. Returns (stream, sid).
async fn connect_and_handshake(addr: SocketAddr) -> (WsStream, String) {
    let mut ws = connect(addr).await;

    let open = next_text(&mut ws).await;
    assert!(open.starts_with('0'), "expected open header, got {open}");
    let header: serde_json::Value = serde_json::from_str(&open[1..]).unwrap();
    let sid = header["sid"].as_str().unwrap().to_string();

    let connect_frame = next_text(&mut ws).await;
    assert!(
        connect_frame.starts_with("40"),
        "expected connect frame, got {connect_frame}"
    );

    (ws, sid)
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

#[tokio::test]
async fn open_handshake_sends_header_then_connect() {
    let server = Server::new(Transport::v4());
    let addr = start_server(&server).await;
    let mut ws = connect(addr).await;

    let open = next_text(&mut ws).await;
    assert!(open.starts_with('0'));
    let header: serde_json::Value = serde_json::from_str(&open[1..]).unwrap();
    let sid = header["sid"].as_str().unwrap().to_string();
    assert_eq!(sid.len(), 20);
    assert!(sid
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '='));
    assert!(header["upgrades"].as_array().unwrap().is_empty());
    assert_eq!(header["pingInterval"], 25000);
    assert_eq!(header["pingTimeout"], 20000);

    let connect_frame = next_text(&mut ws).await;
    assert!(connect_frame.starts_with("40"));
    let payload: serde_json::Value = serde_json::from_str(&connect_frame[2..]).unwrap();
    assert_eq!(payload["sid"].as_str().unwrap(), sid);

    // The channel is registered under the same sid.
    assert_eq!(server.amount_of_sids(), 1);
    assert!(server.get(&sid).is_ok());
}

#[tokio::test]
async fn binary_transport_sends_connect_as_record() {
    let server = Server::new(Transport::v4().with_binary(true));
    let addr = start_server(&server).await;
    let mut ws = connect(addr).await;

    // The open header stays a text frame regardless of mode.
    let open = next_text(&mut ws).await;
    assert!(open.starts_with('0'));
    let header: serde_json::Value = serde_json::from_str(&open[1..]).unwrap();
    let sid = header["sid"].as_str().unwrap().to_string();

    // The CONNECT follows as a MessagePack record in a binary frame.
    let msg = time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timeout")
        .expect("stream ended")
        .expect("read error");
    let tungstenite::Message::Binary(bytes) = msg else {
        panic!("expected binary frame, got {msg:?}");
    };
    let record = wavelink::protocol::binary::decode_record(&bytes).unwrap();
    assert_eq!(record.kind, wavelink::MessageKind::Connect);
    assert_eq!(record.nsp, "/");
    assert_eq!(record.args[0]["sid"].as_str().unwrap(), sid);
}

// ---------------------------------------------------------------------------
// Events and acknowledgements
// ---------------------------------------------------------------------------

#[tokio::test]
async fn event_with_ack_id_gets_the_handler_reply() {
    let server = Server::new(Transport::v4());
    server.on("msg", |_, _| async move { Ok(Some(json!(["ok", 1]))) });
    let addr = start_server(&server).await;
    let (mut ws, _sid) = connect_and_handshake(addr).await;

    send_text(&mut ws, r#"42/chat,7["msg","hi"]"#).await;
    assert_eq!(next_text(&mut ws).await, r#"43/chat,7["ok",1]"#);
}

#[tokio::test]
async fn handler_without_return_value_sends_empty_ack() {
    let server = Server::new(Transport::v4());
    server.on("fire", |_, _| async move { Ok(None) });
    let addr = start_server(&server).await;
    let (mut ws, _sid) = connect_and_handshake(addr).await;

    send_text(&mut ws, r#"423["fire"]"#).await;
    assert_eq!(next_text(&mut ws).await, "433[]");
}

#[tokio::test]
async fn failing_handler_fires_error_event_and_keeps_channel_alive() {
    let server = Server::new(Transport::v4());
    server.on("boom", |_, _| async move {
        Err(wavelink::Error::Handler("exploded".into()))
    });
    server.on(wavelink::event::ERROR, |channel, args| async move {
        // Surface the failure back to the peer so the test can observe it.
        channel.emit("error-report", args).await?;
        Ok(None)
    });
    server.on("ping-me", |_, _| async move { Ok(Some(json!("pong"))) });
    let addr = start_server(&server).await;
    let (mut ws, _sid) = connect_and_handshake(addr).await;

    send_text(&mut ws, r#"42["boom"]"#).await;
    let report = next_text(&mut ws).await;
    assert!(report.starts_with(r#"42["error-report","boom""#), "got {report}");

    // Channel still works.
    send_text(&mut ws, r#"421["ping-me"]"#).await;
    assert_eq!(next_text(&mut ws).await, r#"431["pong"]"#);
}

#[tokio::test]
async fn server_emit_ack_times_out_without_a_reply() {
    let server = Server::new(Transport::v4());
    server.on("probe", |channel, _| async move {
        let err = channel
            .emit_ack("slow", vec![], Duration::from_millis(10))
            .await
            .expect_err("no reply expected");
        Ok(Some(json!([err.to_string(), channel.pending_acks()])))
    });
    let addr = start_server(&server).await;
    let (mut ws, _sid) = connect_and_handshake(addr).await;

    send_text(&mut ws, r#"425["probe"]"#).await;
    // First the solicited event goes out with its allocated ack id...
    assert_eq!(next_text(&mut ws).await, r#"421["slow"]"#);
    // ...then the probe's own ack reports the timeout and an empty
    // correlator.
    assert_eq!(
        next_text(&mut ws).await,
        r#"435["acknowledgement timed out",0]"#
    );
}

#[tokio::test]
async fn server_emit_ack_resolves_with_the_client_reply() {
    let server = Server::new(Transport::v4());
    server.on("probe", |channel, _| async move {
        let value = channel
            .emit_ack("question", vec![json!(21)], Duration::from_secs(5))
            .await?;
        Ok(Some(json!(["answered", value])))
    });
    let addr = start_server(&server).await;
    let (mut ws, _sid) = connect_and_handshake(addr).await;

    send_text(&mut ws, r#"429["probe"]"#).await;
    assert_eq!(next_text(&mut ws).await, r#"421["question",21]"#);

    // Answer the server's ack id 1 like a client would.
    send_text(&mut ws, "431[42]").await;
    assert_eq!(next_text(&mut ws).await, r#"439["answered",[42]]"#);
}

// ---------------------------------------------------------------------------
// Rooms and broadcast
// ---------------------------------------------------------------------------

fn room_server() -> Server {
    let server = Server::new(Transport::v4());
    server.on("join", |channel, args| async move {
        let room = args[0].as_str().unwrap_or("lobby").to_string();
        channel.join(&room)?;
        Ok(None)
    });
    server.on("share", |channel, args| async move {
        let room = args[0].as_str().unwrap_or("lobby").to_string();
        channel.broadcast_to(&room, "x", args[1..].to_vec())?;
        Ok(None)
    });
    server
}

#[tokio::test]
async fn broadcast_to_room_excludes_the_sender() {
    let server = room_server();
    let addr = start_server(&server).await;

    let (mut a, _) = connect_and_handshake(addr).await;
    let (mut b, _) = connect_and_handshake(addr).await;
    let (mut c, _) = connect_and_handshake(addr).await;

    // Join with acks so we know the server processed each join.
    for ws in [&mut a, &mut b, &mut c] {
        send_text(ws, r#"421["join","r"]"#).await;
        assert_eq!(next_text(ws).await, "431[]");
    }
    assert_eq!(server.amount("r"), 3);

    send_text(&mut a, r#"42["share","r","a"]"#).await;

    assert_eq!(next_text(&mut b).await, r#"42["x","a"]"#);
    assert_eq!(next_text(&mut c).await, r#"42["x","a"]"#);

    // The sender hears nothing.
    let quiet = time::timeout(Duration::from_millis(200), a.next()).await;
    assert!(quiet.is_err(), "sender received its own broadcast: {quiet:?}");
}

#[tokio::test]
async fn broadcast_all_reaches_every_channel() {
    let server = Server::new(Transport::v4());
    let addr = start_server(&server).await;

    let (mut a, _) = connect_and_handshake(addr).await;
    let (mut b, _) = connect_and_handshake(addr).await;

    server.broadcast_all("news", vec![json!("hello")]);

    assert_eq!(next_text(&mut a).await, r#"42["news","hello"]"#);
    assert_eq!(next_text(&mut b).await, r#"42["news","hello"]"#);
}

#[tokio::test]
async fn disconnect_cleans_the_registries() {
    let server = room_server();
    let addr = start_server(&server).await;

    let (mut a, sid) = connect_and_handshake(addr).await;
    send_text(&mut a, r#"421["join","r"]"#).await;
    assert_eq!(next_text(&mut a).await, "431[]");
    assert_eq!(server.amount("r"), 1);
    assert_eq!(server.amount_of_rooms(), 1);

    // Protocol-level DISCONNECT.
    send_text(&mut a, "41").await;

    // The room bucket is pruned and the sid entry removed.
    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.amount("r"), 0);
    assert_eq!(server.amount_of_rooms(), 0);
    assert_eq!(server.amount_of_sids(), 0);
    assert!(matches!(
        server.get(&sid),
        Err(wavelink::Error::ConnectionNotFound)
    ));
}

// ---------------------------------------------------------------------------
// Liveness
// ---------------------------------------------------------------------------

#[tokio::test]
async fn v4_unresponsive_peer_is_closed_after_the_deadline() {
    let server = Server::new(
        Transport::v4().with_ping(Duration::from_millis(50), Duration::from_millis(30)),
    );
    let addr = start_server(&server).await;
    let (mut ws, _sid) = connect_and_handshake(addr).await;

    // Never answer any PING; the server must end the session.
    let closed = time::timeout(Duration::from_millis(500), async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) => break,
                Some(Ok(tungstenite::Message::Close(_))) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "server did not close an unresponsive peer");

    time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.amount_of_sids(), 0);
}

#[tokio::test]
async fn v4_pong_keeps_the_channel_alive() {
    let server = Server::new(
        Transport::v4().with_ping(Duration::from_millis(50), Duration::from_millis(30)),
    );
    let addr = start_server(&server).await;
    let (mut ws, _sid) = connect_and_handshake(addr).await;

    // Answer pings for several deadline windows.
    let answered = time::timeout(Duration::from_millis(400), async {
        let mut pings = 0;
        while pings < 5 {
            match ws.next().await {
                Some(Ok(tungstenite::Message::Text(text))) if text == "2" => {
                    pings += 1;
                    ws.send(tungstenite::Message::Text("3".to_string()))
                        .await
                        .expect("pong");
                }
                Some(Ok(_)) => continue,
                other => panic!("stream ended early: {other:?}"),
            }
        }
        pings
    })
    .await
    .expect("expected five pings");
    assert_eq!(answered, 5);
    assert_eq!(server.amount_of_sids(), 1);
}

#[tokio::test]
async fn v3_client_pings_get_pongs_and_refresh_the_deadline() {
    let server = Server::new(
        Transport::v3().with_ping(Duration::from_millis(50), Duration::from_millis(30)),
    );
    let addr = start_server(&server).await;
    let (mut ws, _sid) = connect_and_handshake(addr).await;

    // Ping past the original 80ms window several times.
    for _ in 0..4 {
        send_text(&mut ws, "2").await;
        assert_eq!(next_text(&mut ws).await, "3");
        time::sleep(Duration::from_millis(40)).await;
    }
    assert_eq!(server.amount_of_sids(), 1);

    // Stop pinging: the idle deadline expires and the channel goes away.
    let closed = time::timeout(Duration::from_millis(500), async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) => break,
                Some(Ok(tungstenite::Message::Close(_))) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "server did not idle out a silent v3 peer");

    time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.amount_of_sids(), 0);
}

// ---------------------------------------------------------------------------
// HTTP surface
// ---------------------------------------------------------------------------

#[tokio::test]
async fn configured_headers_ride_every_response() {
    let server = Server::new(Transport::v4());
    server.enable_cors("https://app.example");
    server.add_header("X-Backend", "wavelink");
    let addr = start_server(&server).await;

    // A plain GET (no upgrade) is rejected but still carries the headers.
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /socket.io/ HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    let response = response.to_lowercase();

    assert!(response.contains("access-control-allow-origin: https://app.example"));
    assert!(response.contains("access-control-allow-credentials: true"));
    assert!(response.contains("x-backend: wavelink"));
}
