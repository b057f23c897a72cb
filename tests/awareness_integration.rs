//! Presence fan-out tests over real WebSocket connections.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use yrelay::awareness::{encode_entries, AwarenessTracker, ClientId};
use yrelay::protocol::{Message, SyncMessage};
use yrelay::server::{RelayConfig, RelayServer};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_test_server() -> u16 {
    let port = free_port().await;
    let config = RelayConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..RelayConfig::default()
    };
    let server = RelayServer::new(config);
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

async fn connect(port: u16, doc: &str) -> WsClient {
    let url = format!("ws://127.0.0.1:{port}/{doc}");
    let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    ws
}

async fn send_awareness(ws: &mut WsClient, entries: &[(ClientId, u32, Option<&[u8]>)]) {
    let msg = Message::Awareness(encode_entries(entries));
    ws.send(WsMessage::Binary(msg.encode().into())).await.unwrap();
}

async fn recv_frame(ws: &mut WsClient) -> Message {
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("Timed out waiting for a frame")
            .expect("Stream ended unexpectedly")
            .unwrap();
        if let WsMessage::Binary(data) = frame {
            let bytes: Vec<u8> = data.into();
            return Message::decode(&bytes).unwrap();
        }
    }
}

/// Receive the next awareness frame, skipping sync traffic.
async fn recv_awareness(ws: &mut WsClient) -> Vec<u8> {
    loop {
        if let Message::Awareness(block) = recv_frame(ws).await {
            return block;
        }
    }
}

async fn expect_silence(ws: &mut WsClient) {
    let result = timeout(Duration::from_millis(300), async {
        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Binary(data))) => {
                    let bytes: Vec<u8> = data.into();
                    return Message::decode(&bytes).unwrap();
                }
                Some(Ok(_)) => continue,
                other => panic!("Stream error while expecting silence: {other:?}"),
            }
        }
    })
    .await;
    assert!(result.is_err(), "Expected no frame, got {result:?}");
}

#[tokio::test]
async fn test_awareness_broadcast_includes_originator() {
    let port = start_test_server().await;
    let mut a = connect(port, "doc").await;
    let mut b = connect(port, "doc").await;
    let _ = recv_frame(&mut a).await;
    let _ = recv_frame(&mut b).await;

    send_awareness(&mut a, &[(7, 1, Some(b"cursor"))]).await;

    for ws in [&mut a, &mut b] {
        let block = recv_awareness(ws).await;
        let mut replica = AwarenessTracker::new();
        let change = replica.apply(None, &block).unwrap();
        assert_eq!(change.added, vec![7]);
        assert_eq!(replica.state_of(7), Some(&b"cursor"[..]));
    }
}

#[tokio::test]
async fn test_awareness_catchup_on_join() {
    let port = start_test_server().await;
    let mut a = connect(port, "doc").await;
    let _ = recv_frame(&mut a).await;
    send_awareness(&mut a, &[(7, 1, Some(b"here"))]).await;
    let _ = recv_awareness(&mut a).await; // own echo
    tokio::time::sleep(Duration::from_millis(50)).await;

    // A newly joined connection is caught up before any broadcasts:
    // step1 first, then the presence snapshot.
    let mut b = connect(port, "doc").await;
    match recv_frame(&mut b).await {
        Message::Sync(SyncMessage::Step1(_)) => {}
        other => panic!("Expected step1 first, got {other:?}"),
    }
    let snapshot = recv_awareness(&mut b).await;
    let mut replica = AwarenessTracker::new();
    let change = replica.apply(None, &snapshot).unwrap();
    assert_eq!(change.added, vec![7]);
}

#[tokio::test]
async fn test_stale_awareness_not_rebroadcast() {
    let port = start_test_server().await;
    let mut a = connect(port, "doc").await;
    let mut b = connect(port, "doc").await;
    let _ = recv_frame(&mut a).await;
    let _ = recv_frame(&mut b).await;

    send_awareness(&mut a, &[(5, 2, Some(b"fresh"))]).await;
    let _ = recv_awareness(&mut b).await;

    // Out-of-order delivery of an older version is ignored entirely
    send_awareness(&mut a, &[(5, 1, Some(b"stale"))]).await;
    expect_silence(&mut b).await;

    // A later join still sees the fresh state
    let mut c = connect(port, "doc").await;
    let _ = recv_frame(&mut c).await;
    let snapshot = recv_awareness(&mut c).await;
    let mut replica = AwarenessTracker::new();
    replica.apply(None, &snapshot).unwrap();
    assert_eq!(replica.state_of(5), Some(&b"fresh"[..]));
}

#[tokio::test]
async fn test_disconnect_tombstones_controlled_clients_once() {
    let port = start_test_server().await;
    let mut a = connect(port, "doc").await;
    let mut b = connect(port, "doc").await;
    let _ = recv_frame(&mut a).await;
    let _ = recv_frame(&mut b).await;

    send_awareness(&mut a, &[(5, 1, Some(b"x")), (6, 1, Some(b"y"))]).await;
    let mut replica = AwarenessTracker::new();
    let block = recv_awareness(&mut b).await;
    let change = replica.apply(None, &block).unwrap();
    assert_eq!(change.added, vec![5, 6]);

    a.close(None).await.unwrap();

    let block = recv_awareness(&mut b).await;
    let change = replica.apply(None, &block).unwrap();
    assert_eq!(change.removed, vec![5, 6]);
    assert_eq!(replica.present_count(), 0);

    // Exactly once
    expect_silence(&mut b).await;
}

#[tokio::test]
async fn test_explicit_tombstone_propagates() {
    let port = start_test_server().await;
    let mut a = connect(port, "doc").await;
    let mut b = connect(port, "doc").await;
    let _ = recv_frame(&mut a).await;
    let _ = recv_frame(&mut b).await;

    send_awareness(&mut a, &[(9, 1, Some(b"typing"))]).await;
    let mut replica = AwarenessTracker::new();
    replica.apply(None, &recv_awareness(&mut b).await).unwrap();

    send_awareness(&mut a, &[(9, 2, None)]).await;
    let change = replica.apply(None, &recv_awareness(&mut b).await).unwrap();
    assert_eq!(change.removed, vec![9]);
}
