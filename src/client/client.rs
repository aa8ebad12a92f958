//! High-level tunnel client API.
//!
//! Provides [`TunnelClient`] for forwarding UDP packets to a tunnel server
//! over one persistent TCP connection, with automatic reconnection and
//! optional reliable delivery.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::core::constants::{DEFAULT_SERVER_HOST, DEFAULT_SERVER_PORT};
use crate::core::{ClientError, Packet};
use crate::recovery::{
    ChannelConfig, ConnectFn, ConnectionManager, ReliableChannel, RetryPolicy, SendFn,
};
use crate::wire::{AckFrame, Frame, PayloadFrame};

/// Default depth of the received-packet queue handed to the consumer.
pub const DEFAULT_RECV_QUEUE: usize = 256;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Tunnel server address.
    pub server_host: String,
    /// Tunnel server port.
    pub server_port: u16,
    /// Whether packets are sent through the reliable channel.
    pub reliable_delivery: bool,
    /// Reconnection policy.
    pub retry: RetryPolicy,
    /// Reliable-delivery settings (ignored when disabled).
    pub channel: ChannelConfig,
    /// Received-packet queue depth.
    pub recv_queue: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_host: DEFAULT_SERVER_HOST.to_string(),
            server_port: DEFAULT_SERVER_PORT,
            reliable_delivery: true,
            retry: RetryPolicy::default(),
            channel: ChannelConfig::default(),
            recv_queue: DEFAULT_RECV_QUEUE,
        }
    }
}

/// Builder for [`TunnelClient`].
#[derive(Debug, Default)]
pub struct TunnelClientBuilder {
    config: ClientConfig,
}

impl TunnelClientBuilder {
    /// Create a new client builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the server address.
    pub fn server(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.server_host = host.into();
        self.config.server_port = port;
        self
    }

    /// Enable or disable reliable delivery.
    pub fn reliable_delivery(mut self, enabled: bool) -> Self {
        self.config.reliable_delivery = enabled;
        self
    }

    /// Set the reconnection policy.
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    /// Set the reliable-delivery settings.
    pub fn channel_config(mut self, channel: ChannelConfig) -> Self {
        self.config.channel = channel;
        self
    }

    /// Set the received-packet queue depth.
    pub fn recv_queue(mut self, depth: usize) -> Self {
        self.config.recv_queue = depth;
        self
    }

    /// Build the client and its packet receiver.
    pub fn build(self) -> (TunnelClient, PacketReceiver) {
        TunnelClient::new(self.config)
    }
}

/// Snapshot of client counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMetrics {
    /// Frames written to the tunnel.
    pub packets_sent: u64,
    /// Packets delivered to the receiver.
    pub packets_received: u64,
    /// Bytes written to the tunnel, framing included.
    pub bytes_sent: u64,
    /// Payload bytes received.
    pub bytes_received: u64,
    /// Whether the tunnel connection is currently up.
    pub connected: bool,
    /// Attempts made in the current recovery, zero when healthy.
    pub reconnect_attempts: u32,
    /// Unacknowledged frames (reliable mode only).
    pub pending: Option<usize>,
    /// Pending-buffer capacity (reliable mode only).
    pub pending_capacity: Option<usize>,
}

/// Receiving side for packets coming back through the tunnel.
pub struct PacketReceiver {
    rx: mpsc::Receiver<Packet>,
}

impl PacketReceiver {
    /// Receive the next packet from the server.
    ///
    /// Returns `None` once the client is closed.
    pub async fn recv(&mut self) -> Option<Packet> {
        self.rx.recv().await
    }
}

#[derive(Default)]
struct Counters {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

struct ClientShared {
    config: ClientConfig,
    writer: Mutex<Option<OwnedWriteHalf>>,
    reader_task: StdMutex<Option<JoinHandle<()>>>,
    packet_tx: mpsc::Sender<Packet>,
    counters: Counters,
    manager: OnceLock<ConnectionManager>,
    channel: OnceLock<ReliableChannel>,
    closed: AtomicBool,
    /// Bumped on every successful connect; reader tasks carry the value
    /// they were spawned with so superseded readers cannot report loss.
    generation: AtomicU64,
}

impl ClientShared {
    /// Write one frame plus the line terminator and flush.
    async fn write_frame(&self, frame: &Frame) -> io::Result<()> {
        let line = frame.encode().map_err(io::Error::other)?;
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "not connected to server",
            ));
        };
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_sent
            .fetch_add(line.len() as u64 + 1, Ordering::Relaxed);
        Ok(())
    }

    fn on_connection_lost(&self, generation: u64) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        // A reader outlived its connection; the report is stale
        if self.generation.load(Ordering::SeqCst) != generation {
            log::debug!("ignoring loss report from superseded reader");
            return;
        }
        if let Some(manager) = self.manager.get() {
            manager.connection_lost();
        }
    }

    /// Read line-delimited frames until EOF or a read error.
    async fn response_loop(self: Arc<Self>, read_half: OwnedReadHalf, generation: u64) {
        let mut lines = BufReader::new(read_half).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => self.handle_line(&line).await,
                Ok(None) => {
                    log::info!("server closed connection");
                    self.on_connection_lost(generation);
                    return;
                }
                Err(e) => {
                    log::error!("read error on tunnel connection: {e}");
                    self.on_connection_lost(generation);
                    return;
                }
            }
        }
    }

    async fn handle_line(&self, line: &str) {
        let frame = match Frame::decode(line) {
            Ok(frame) => frame,
            Err(e) => {
                // Skip the offending line, keep the connection open
                log::error!("invalid frame from server: {e}");
                return;
            }
        };

        match frame {
            Frame::Ack(ack) => {
                if let Some(channel) = self.channel.get() {
                    channel.acknowledge(&ack.id);
                }
            }
            Frame::Error(err) => {
                log::warn!("server reported error: {}", err.error);
            }
            Frame::Payload(payload) => {
                if let Some(meta) = &payload.meta {
                    if meta.requires_ack {
                        let reply = Frame::Ack(AckFrame {
                            id: meta.id.clone(),
                        });
                        if let Err(e) = self.write_frame(&reply).await {
                            log::error!("failed to send acknowledgment: {e}");
                        }
                    }
                }
                match payload.to_packet() {
                    Ok(packet) => {
                        self.counters
                            .packets_received
                            .fetch_add(1, Ordering::Relaxed);
                        self.counters
                            .bytes_received
                            .fetch_add(packet.size() as u64, Ordering::Relaxed);
                        if self.packet_tx.send(packet).await.is_err() {
                            log::debug!("packet receiver dropped, discarding packet");
                        }
                    }
                    Err(e) => log::error!("undecodable payload frame: {e}"),
                }
            }
        }
    }
}

/// A tunnel client: forwards UDP packets to the server over one TCP
/// connection and delivers response packets through a [`PacketReceiver`].
///
/// # Example
///
/// ```ignore
/// let (client, mut packets) = TunnelClientBuilder::new()
///     .server("10.0.0.5", 11223)
///     .build();
///
/// client.connect().await?;
/// client.send_packet(Packet::new(&b"hello"[..], "127.0.0.1", 5000)?).await?;
///
/// while let Some(packet) = packets.recv().await {
///     // hand back to the local UDP front-end
/// }
/// ```
pub struct TunnelClient {
    shared: Arc<ClientShared>,
    manager: ConnectionManager,
    channel: Option<ReliableChannel>,
}

impl TunnelClient {
    /// Create a client and its packet receiver. No connection is made
    /// until [`connect`](Self::connect) or the first
    /// [`send_packet`](Self::send_packet).
    pub fn new(config: ClientConfig) -> (Self, PacketReceiver) {
        let (packet_tx, packet_rx) = mpsc::channel(config.recv_queue.max(1));
        let retry = config.retry.clone();
        let reliable = config.reliable_delivery;
        let channel_config = config.channel.clone();

        let shared = Arc::new(ClientShared {
            config,
            writer: Mutex::new(None),
            reader_task: StdMutex::new(None),
            packet_tx,
            counters: Counters::default(),
            manager: OnceLock::new(),
            channel: OnceLock::new(),
            closed: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        });

        let channel = reliable.then(|| {
            let send_shared = shared.clone();
            let send_fn: SendFn = Arc::new(move |frame| {
                let shared = send_shared.clone();
                Box::pin(async move { shared.write_frame(&frame).await })
            });
            ReliableChannel::new(send_fn, channel_config)
        });
        if let Some(channel) = &channel {
            let _ = shared.channel.set(channel.clone());
        }

        let connect_shared = shared.clone();
        let connect_fn: ConnectFn = Arc::new(move || {
            let shared = connect_shared.clone();
            Box::pin(async move {
                let host = shared.config.server_host.clone();
                let port = shared.config.server_port;
                let stream = TcpStream::connect((host.as_str(), port)).await?;
                let (read_half, write_half) = stream.into_split();
                *shared.writer.lock().await = Some(write_half);

                let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
                let reader_shared = shared.clone();
                let handle = tokio::spawn(async move {
                    reader_shared.response_loop(read_half, generation).await;
                });
                if let Some(previous) = shared.reader_task.lock().unwrap().replace(handle) {
                    previous.abort();
                }

                if let Some(channel) = shared.channel.get() {
                    channel.start();
                }
                log::info!("connected to server at {host}:{port}");
                Ok(())
            })
        });
        let manager = ConnectionManager::new(connect_fn, retry);
        let _ = shared.manager.set(manager.clone());

        (
            Self {
                shared,
                manager,
                channel,
            },
            PacketReceiver { rx: packet_rx },
        )
    }

    /// Connect to the server, retrying per the retry policy on failure.
    pub async fn connect(&self) -> Result<(), ClientError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        self.manager.connect().await?;
        Ok(())
    }

    /// Forward one UDP packet through the tunnel.
    ///
    /// Connects on demand. With reliable delivery the frame is buffered
    /// and retransmitted until acknowledged; ultimate failure after retry
    /// exhaustion is observable only through metrics. Without it, a write
    /// failure reports the connection lost and surfaces the error.
    pub async fn send_packet(&self, packet: Packet) -> Result<(), ClientError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        if !self.manager.is_connected() {
            self.manager.connect().await?;
        }

        let frame = PayloadFrame::from_packet(&packet);
        match &self.channel {
            Some(channel) => {
                let id = channel.send(frame).await;
                log::debug!("forwarded {} bytes as packet {id}", packet.size());
                Ok(())
            }
            None => match self.shared.write_frame(&Frame::Payload(frame)).await {
                Ok(()) => {
                    log::debug!("forwarded {} bytes to server", packet.size());
                    Ok(())
                }
                Err(e) => {
                    log::warn!("connection lost during send: {e}");
                    self.manager.connection_lost();
                    Err(ClientError::SendFailed(e))
                }
            },
        }
    }

    /// Whether the tunnel connection is currently up.
    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    /// Snapshot of the client's counters and connection state.
    pub fn metrics(&self) -> ClientMetrics {
        let counters = &self.shared.counters;
        ClientMetrics {
            packets_sent: counters.packets_sent.load(Ordering::Relaxed),
            packets_received: counters.packets_received.load(Ordering::Relaxed),
            bytes_sent: counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: counters.bytes_received.load(Ordering::Relaxed),
            connected: self.manager.is_connected(),
            reconnect_attempts: self.manager.retry_count(),
            pending: self.channel.as_ref().map(ReliableChannel::pending),
            pending_capacity: self.channel.as_ref().map(ReliableChannel::capacity),
        }
    }

    /// Close the tunnel: stop the reliable channel, cancel recovery and
    /// the reader task, and shut the socket down. Idempotent.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("closing connection to server");
        if let Some(channel) = &self.channel {
            channel.stop().await;
        }
        self.manager.reset();
        if let Some(task) = self.shared.reader_task.lock().unwrap().take() {
            task.abort();
        }
        if let Some(mut writer) = self.shared.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}

impl Drop for TunnelClient {
    fn drop(&mut self) {
        // Best-effort cancellation when dropped without close()
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            if let Some(channel) = &self.channel {
                channel.abort();
            }
            self.manager.reset();
            if let Some(task) = self.shared.reader_task.lock().unwrap().take() {
                task.abort();
            }
        }
    }
}
