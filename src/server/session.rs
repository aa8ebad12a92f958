//! Per-connection session loop.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;

use crate::core::constants::MAX_CONSECUTIVE_ERRORS;
use crate::core::unix_timestamp;
use crate::server::server::ServerShared;
use crate::wire::{AckFrame, ErrorFrame, Frame, Meta, PayloadFrame};

/// Record of one connected client.
#[derive(Debug, Clone)]
pub struct ClientSession {
    /// Session id, `"host:port"` of the peer.
    pub id: String,
    /// Peer address.
    pub peer: SocketAddr,
    /// When the connection was accepted.
    pub connected_at: SystemTime,
    /// When the last frame arrived from this client.
    pub last_active: SystemTime,
}

impl ClientSession {
    pub(crate) fn new(peer: SocketAddr) -> Self {
        let now = SystemTime::now();
        Self {
            id: peer.to_string(),
            peer,
            connected_at: now,
            last_active: now,
        }
    }
}

struct Session {
    shared: Arc<ServerShared>,
    id: String,
    peer: SocketAddr,
    writer: OwnedWriteHalf,
    seq: u32,
    consecutive_errors: u32,
}

/// Drive one client connection until EOF, shutdown, or error ceiling.
pub(crate) async fn run(
    shared: Arc<ServerShared>,
    stream: TcpStream,
    peer: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    let heartbeat_interval = shared.heartbeat_interval;
    let (read_half, write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut session = Session {
        shared,
        id: peer.to_string(),
        peer,
        writer: write_half,
        seq: 0,
        consecutive_errors: 0,
    };

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            next = timeout(heartbeat_interval, lines.next_line()) => match next {
                // Idle: probe the client
                Err(_) => {
                    if session.send_heartbeat().await.is_err() {
                        break;
                    }
                }
                Ok(Ok(Some(line))) => {
                    if !session.handle_line(&line).await {
                        break;
                    }
                }
                Ok(Ok(None)) => {
                    log::info!("client {peer} closed connection");
                    break;
                }
                Ok(Err(e)) => {
                    log::error!("read error from {peer}: {e}");
                    session
                        .shared
                        .counters
                        .connection_errors
                        .fetch_add(1, Ordering::Relaxed);
                    if session.note_error() {
                        break;
                    }
                }
            }
        }
    }
}

impl Session {
    fn next_meta(&mut self, requires_ack: bool) -> Meta {
        let meta = Meta::fresh(self.seq, requires_ack);
        self.seq = self.seq.wrapping_add(1);
        meta
    }

    fn note_error(&mut self) -> bool {
        self.consecutive_errors += 1;
        if self.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
            log::warn!(
                "too many consecutive errors from {}, disconnecting",
                self.peer
            );
            return true;
        }
        false
    }

    fn touch(&self) {
        if let Some(record) = self.shared.sessions.lock().unwrap().get_mut(&self.id) {
            record.session.last_active = SystemTime::now();
        }
    }

    async fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        let line = frame.encode().map_err(io::Error::other)?;
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        let counters = &self.shared.counters;
        counters.packets_out.fetch_add(1, Ordering::Relaxed);
        counters
            .bytes_out
            .fetch_add(line.len() as u64 + 1, Ordering::Relaxed);
        Ok(())
    }

    /// Send an empty ack-required payload frame sourced from the server.
    async fn send_heartbeat(&mut self) -> io::Result<()> {
        let (source_addr, source_port) = self.shared.server_source();
        let meta = self.next_meta(true);
        log::debug!("sending heartbeat {} to {}", meta.id, self.peer);
        let frame = Frame::Payload(PayloadFrame {
            payload: String::new(),
            source_addr,
            source_port,
            dest_addr: None,
            dest_port: None,
            timestamp: Some(meta.timestamp),
            meta: Some(meta),
        });
        let result = self.write_frame(&frame).await;
        if let Err(e) = &result {
            log::error!("failed to send heartbeat to {}: {e}", self.peer);
            self.shared
                .counters
                .connection_errors
                .fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Process one wire line. Returns false when the session must end.
    async fn handle_line(&mut self, line: &str) -> bool {
        let counters = &self.shared.counters;
        counters.packets_in.fetch_add(1, Ordering::Relaxed);
        counters
            .bytes_in
            .fetch_add(line.len() as u64 + 1, Ordering::Relaxed);
        self.touch();

        match Frame::decode(line) {
            Err(e) => {
                log::error!("invalid frame from {}: {e}", self.peer);
                self.shared
                    .counters
                    .protocol_errors
                    .fetch_add(1, Ordering::Relaxed);
                let meta = self.next_meta(false);
                let reply = Frame::Error(ErrorFrame {
                    error: format!("invalid frame: {e}"),
                    meta: Some(meta),
                });
                if let Err(e) = self.write_frame(&reply).await {
                    log::error!("failed to send error frame to {}: {e}", self.peer);
                    self.shared
                        .counters
                        .connection_errors
                        .fetch_add(1, Ordering::Relaxed);
                    return false;
                }
                !self.note_error()
            }
            Ok(Frame::Ack(ack)) => {
                log::debug!("received ack {} from {}", ack.id, self.peer);
                self.consecutive_errors = 0;
                true
            }
            Ok(Frame::Error(err)) => {
                log::warn!("client {} reported error: {}", self.peer, err.error);
                self.consecutive_errors = 0;
                true
            }
            Ok(Frame::Payload(payload)) => {
                self.consecutive_errors = 0;
                if let Some(meta) = &payload.meta {
                    if meta.requires_ack {
                        let reply = Frame::Ack(AckFrame {
                            id: meta.id.clone(),
                        });
                        if let Err(e) = self.write_frame(&reply).await {
                            log::error!("failed to send ack to {}: {e}", self.peer);
                            self.shared
                                .counters
                                .connection_errors
                                .fetch_add(1, Ordering::Relaxed);
                            return false;
                        }
                    }
                }
                self.echo(payload).await
            }
        }
    }

    /// Reflect the payload back: server address becomes the source, the
    /// packet's own source becomes the destination.
    async fn echo(&mut self, inbound: PayloadFrame) -> bool {
        let (source_addr, source_port) = self.shared.server_source();
        let had_meta = inbound.meta.is_some();

        let mut frame = inbound;
        frame.dest_addr = Some(std::mem::replace(&mut frame.source_addr, source_addr));
        frame.dest_port = Some(std::mem::replace(&mut frame.source_port, source_port));
        frame.timestamp = Some(unix_timestamp());
        frame.meta = had_meta.then(|| self.next_meta(false));

        match self.write_frame(&Frame::Payload(frame)).await {
            Ok(()) => true,
            Err(e) => {
                log::error!("failed to echo packet to {}: {e}", self.peer);
                self.shared
                    .counters
                    .connection_errors
                    .fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}
