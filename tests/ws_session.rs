//! End-to-end scenarios over a real bound socket: a tungstenite client talks
//! to the served router the way a browser frontend would. The shell is pinned
//! to `cat` so output is deterministic.
#![cfg(unix)]

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use term_relay::config::ServerConfig;
use term_relay::protocol::{self, FrameKind};
use term_relay::state::AppState;
use term_relay::ws;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server() -> (String, AppState) {
    let state = AppState::new(ServerConfig {
        shell: "cat".to_string(),
        ..ServerConfig::default()
    });
    let app = ws::router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("ws://{addr}/ws"), state)
}

async fn connect(url: &str) -> Client {
    let (client, _response) = tokio_tungstenite::connect_async(url).await.unwrap();
    client
}

/// Receive the next codec frame, skipping transport-level traffic.
async fn next_frame(client: &mut Client) -> Option<(FrameKind, Vec<u8>)> {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(10), client.next())
            .await
            .expect("server went quiet")?;
        match message.expect("websocket read") {
            Message::Binary(bytes) => {
                let (frame, _) = protocol::decode(&bytes).expect("server sent valid frame");
                return Some((frame.kind, frame.payload.to_vec()));
            }
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}

async fn send_frame(client: &mut Client, bytes: Vec<u8>) {
    client.send(Message::Binary(bytes.into())).await.unwrap();
}

/// Collect DATA payloads until `needle` appears, failing on any ERROR frame.
async fn expect_data_containing(client: &mut Client, needle: &[u8]) {
    let mut seen = Vec::new();
    loop {
        match next_frame(client).await {
            Some((FrameKind::Data, payload)) => {
                seen.extend_from_slice(&payload);
                if seen.windows(needle.len()).any(|w| w == needle) {
                    return;
                }
            }
            Some((FrameKind::Error, payload)) => {
                panic!("unexpected error frame: {:?}", String::from_utf8_lossy(&payload))
            }
            Some(_) => continue,
            None => panic!("connection closed before {needle:?} appeared in {seen:?}"),
        }
    }
}

async fn wait_for_empty_registry(state: &AppState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while state.session_count() > 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "session never left the registry"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn echo_through_the_shell() {
    let (url, state) = start_server().await;
    let mut client = connect(&url).await;

    send_frame(
        &mut client,
        protocol::encode(FrameKind::Data, b"hi\n").unwrap(),
    )
    .await;
    expect_data_containing(&mut client, b"hi").await;

    send_frame(&mut client, protocol::encode(FrameKind::Close, b"").unwrap()).await;
    wait_for_empty_registry(&state).await;
}

#[tokio::test]
async fn malformed_resize_gets_one_error_and_session_survives() {
    let (url, state) = start_server().await;
    let mut client = connect(&url).await;

    // RESIZE with a 3-byte payload, straight off the wire.
    send_frame(&mut client, vec![0x02, 0x03, 0x00, 0x01, 0x00, 0x02]).await;
    let (kind, payload) = next_frame(&mut client).await.expect("reply expected");
    assert_eq!(kind, FrameKind::Error);
    let text = String::from_utf8(payload).unwrap();
    assert!(text.contains("resize"), "got {text:?}");

    // Subsequent DATA still functions.
    send_frame(
        &mut client,
        protocol::encode(FrameKind::Data, b"still-up\n").unwrap(),
    )
    .await;
    expect_data_containing(&mut client, b"still-up").await;

    send_frame(&mut client, protocol::encode(FrameKind::Close, b"").unwrap()).await;
    wait_for_empty_registry(&state).await;
}

#[tokio::test]
async fn unknown_frame_type_gets_an_error() {
    let (url, state) = start_server().await;
    let mut client = connect(&url).await;

    send_frame(&mut client, vec![0x7f, 0x00, 0x00]).await;
    let (kind, payload) = next_frame(&mut client).await.expect("reply expected");
    assert_eq!(kind, FrameKind::Error);
    assert!(String::from_utf8(payload).unwrap().contains("0x7f"));

    // Session is still open: a second probe gets a second report.
    send_frame(&mut client, vec![0x7f, 0x00, 0x00]).await;
    let (kind, _) = next_frame(&mut client).await.expect("reply expected");
    assert_eq!(kind, FrameKind::Error);

    send_frame(&mut client, protocol::encode(FrameKind::Close, b"").unwrap()).await;
    wait_for_empty_registry(&state).await;
}

#[tokio::test]
async fn close_frame_shuts_the_connection_down() {
    let (url, state) = start_server().await;
    let mut client = connect(&url).await;

    // Spawn the shell first so teardown covers the child as well.
    send_frame(
        &mut client,
        protocol::encode(FrameKind::Data, b"bye\n").unwrap(),
    )
    .await;
    expect_data_containing(&mut client, b"bye").await;

    send_frame(&mut client, protocol::encode(FrameKind::Close, b"").unwrap()).await;

    // The server closes the transport; everything after that is ignorable
    // shell output followed by the close.
    loop {
        match next_frame(&mut client).await {
            Some((FrameKind::Error, payload)) => {
                panic!("unexpected error frame: {:?}", String::from_utf8_lossy(&payload))
            }
            Some(_) => continue,
            None => break,
        }
    }
    wait_for_empty_registry(&state).await;
}

#[tokio::test]
async fn control_before_any_data_reports_no_pty() {
    let (url, state) = start_server().await;
    let mut client = connect(&url).await;

    send_frame(&mut client, vec![0x03, 0x01, 0x00, 0x02]).await;
    let (kind, payload) = next_frame(&mut client).await.expect("reply expected");
    assert_eq!(kind, FrameKind::Error);
    assert!(String::from_utf8(payload).unwrap().contains("no pty"));

    send_frame(&mut client, protocol::encode(FrameKind::Close, b"").unwrap()).await;
    wait_for_empty_registry(&state).await;
}
