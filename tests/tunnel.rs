//! End-to-end tunnel scenarios over real sockets.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use udptun::prelude::*;
use udptun::{ServerStats, TunnelClient};

const WAIT: Duration = Duration::from_secs(5);

async fn start_server(max_clients: usize, heartbeat: Duration) -> (TunnelServer, u16) {
    let server = TunnelServerBuilder::new()
        .bind("127.0.0.1", 0)
        .max_clients(max_clients)
        .heartbeat_interval(heartbeat)
        .build();
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();
    (server, port)
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 40,
        initial_backoff: Duration::from_millis(50),
        max_backoff: Duration::from_millis(200),
        jitter: 0.0,
    }
}

async fn connect_client(port: u16) -> (TunnelClient, PacketReceiver) {
    let (client, receiver) = TunnelClientBuilder::new()
        .server("127.0.0.1", port)
        .retry_policy(fast_retry())
        .build();
    client.connect().await.unwrap();
    (client, receiver)
}

/// Raw line-protocol peer, for driving the server without client logic.
struct RawPeer {
    reader: tokio::io::Lines<BufReader<OwnedReadHalf>>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl RawPeer {
    async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half).lines(),
            writer: write_half,
        }
    }

    async fn send_line(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    async fn recv_json(&mut self) -> Value {
        let line = timeout(WAIT, self.reader.next_line())
            .await
            .expect("timed out waiting for frame")
            .unwrap()
            .expect("connection closed while waiting for frame");
        serde_json::from_str(&line).unwrap()
    }
}

#[tokio::test]
async fn test_packet_roundtrip_echo() {
    let (server, port) = start_server(100, Duration::from_secs(30)).await;
    let (client, mut packets) = connect_client(port).await;

    let sent = Packet::new(&b"Hello"[..], "127.0.0.1", 5000).unwrap();
    client.send_packet(sent).await.unwrap();

    let echoed = timeout(WAIT, packets.recv())
        .await
        .expect("timed out waiting for echo")
        .expect("receiver closed");
    assert_eq!(echoed.payload(), b"Hello");
    // Reflected: server addressing as source, original source as destination
    assert_eq!(echoed.source_port(), port);
    assert_eq!(echoed.dest_addr().map(|a| a.to_string()), Some("127.0.0.1".into()));
    assert_eq!(echoed.dest_port(), Some(5000));

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_ack_drains_pending_buffer() {
    let (server, port) = start_server(100, Duration::from_secs(30)).await;
    let (client, mut packets) = connect_client(port).await;

    for i in 0u8..5 {
        let packet = Packet::new(vec![i], "127.0.0.1", 6000).unwrap();
        client.send_packet(packet).await.unwrap();
    }
    for _ in 0..5 {
        timeout(WAIT, packets.recv()).await.unwrap().unwrap();
    }

    // The server acks every reliable frame, so the buffer must empty
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if client.metrics().pending == Some(0) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "pending never drained");
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(client.metrics().packets_received, 5);

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_admission_rejects_over_capacity() {
    let (server, port) = start_server(1, Duration::from_secs(30)).await;

    // First peer completes a roundtrip, so its session is registered
    let mut first = RawPeer::connect(port).await;
    let frame = json!({
        "payload": "aa",
        "source_addr": "127.0.0.1",
        "source_port": 5000,
        "dest_addr": null,
        "dest_port": null,
    });
    first.send_line(&frame.to_string()).await;
    let echo = first.recv_json().await;
    assert_eq!(echo["payload"], "aa");
    assert_eq!(server.session_count(), 1);

    // Second peer is dropped without any frame
    let mut second = RawPeer::connect(port).await;
    let outcome = timeout(WAIT, second.reader.next_line())
        .await
        .expect("timed out waiting for rejection");
    match outcome {
        Ok(None) | Err(_) => {}
        Ok(Some(line)) => panic!("rejected peer received a frame: {line}"),
    }
    assert_eq!(server.session_count(), 1);

    server.stop().await;
}

#[tokio::test]
async fn test_idle_connection_receives_heartbeats() {
    let (server, port) = start_server(100, Duration::from_millis(200)).await;
    let mut peer = RawPeer::connect(port).await;

    let first = peer.recv_json().await;
    let second = peer.recv_json().await;
    for beat in [&first, &second] {
        assert_eq!(beat["payload"], "");
        assert_eq!(beat["_meta"]["requires_ack"], true);
    }
    assert_ne!(first["_meta"]["id"], second["_meta"]["id"]);

    server.stop().await;
}

#[tokio::test]
async fn test_invalid_json_keeps_connection_open() {
    let (server, port) = start_server(100, Duration::from_secs(30)).await;
    let mut peer = RawPeer::connect(port).await;

    peer.send_line("this is not json").await;
    let reply = peer.recv_json().await;
    assert!(reply["error"].is_string());

    // Still usable afterwards
    let frame = json!({
        "payload": "bb",
        "source_addr": "127.0.0.1",
        "source_port": 7000,
        "dest_addr": null,
        "dest_port": null,
    });
    peer.send_line(&frame.to_string()).await;
    let echo = peer.recv_json().await;
    assert_eq!(echo["payload"], "bb");
    assert_eq!(server.counters().protocol_errors, 1);

    server.stop().await;
}

#[tokio::test]
async fn test_client_reconnects_after_server_restart() {
    let (server, port) = start_server(100, Duration::from_secs(30)).await;
    let (client, mut packets) = connect_client(port).await;

    client
        .send_packet(Packet::new(&b"one"[..], "127.0.0.1", 5000).unwrap())
        .await
        .unwrap();
    timeout(WAIT, packets.recv()).await.unwrap().unwrap();

    server.stop().await;
    drop(server);

    // Recovery kicks in once the client notices the dead connection
    let deadline = tokio::time::Instant::now() + WAIT;
    while client.is_connected() {
        assert!(tokio::time::Instant::now() < deadline, "loss never noticed");
        sleep(Duration::from_millis(20)).await;
    }

    let restarted = TunnelServerBuilder::new()
        .bind("127.0.0.1", port)
        .build();
    restarted.start().await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !client.is_connected() {
        assert!(tokio::time::Instant::now() < deadline, "never reconnected");
        sleep(Duration::from_millis(50)).await;
    }

    client
        .send_packet(Packet::new(&b"two"[..], "127.0.0.1", 5000).unwrap())
        .await
        .unwrap();
    let echoed = timeout(WAIT, packets.recv()).await.unwrap().unwrap();
    assert_eq!(echoed.payload(), b"two");

    client.close().await;
    restarted.stop().await;
}

#[tokio::test]
async fn test_server_counters_track_traffic() {
    let (server, port) = start_server(100, Duration::from_secs(30)).await;
    assert_eq!(server.counters(), ServerStats::default());

    let (client, mut packets) = connect_client(port).await;
    client
        .send_packet(Packet::new(&b"ping"[..], "127.0.0.1", 5000).unwrap())
        .await
        .unwrap();
    timeout(WAIT, packets.recv()).await.unwrap().unwrap();

    let stats = server.counters();
    assert_eq!(stats.connections, 1);
    assert!(stats.packets_in >= 1);
    // Ack plus echo
    assert!(stats.packets_out >= 2);
    assert!(stats.bytes_in > 0);
    assert_eq!(stats.protocol_errors, 0);

    client.close().await;
    server.stop().await;
}
