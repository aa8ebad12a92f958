//! Tunnel server: listener, admission control, and session bookkeeping.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::constants::{
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_MAX_CLIENTS, DEFAULT_SERVER_HOST, DEFAULT_SERVER_PORT,
};
use crate::core::ServerError;
use crate::server::session::{self, ClientSession};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address.
    pub host: String,
    /// Listen port. Use 0 to let the OS pick one.
    pub port: u16,
    /// Maximum concurrent client sessions.
    pub max_clients: usize,
    /// Idle time before a heartbeat probe is sent.
    pub heartbeat_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_SERVER_HOST.to_string(),
            port: DEFAULT_SERVER_PORT,
            max_clients: DEFAULT_MAX_CLIENTS,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

/// Builder for [`TunnelServer`].
#[derive(Debug, Default)]
pub struct TunnelServerBuilder {
    config: ServerConfig,
}

impl TunnelServerBuilder {
    /// Create a new server builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the listen address.
    pub fn bind(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.host = host.into();
        self.config.port = port;
        self
    }

    /// Set the session limit.
    pub fn max_clients(mut self, max: usize) -> Self {
        self.config.max_clients = max;
        self
    }

    /// Set the idle time before heartbeat probes.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Build the server. It does not listen until `start()`.
    pub fn build(self) -> TunnelServer {
        TunnelServer::new(self.config)
    }
}

/// Snapshot of the server's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerStats {
    /// Connections accepted over the server's lifetime.
    pub connections: u64,
    /// Frames received.
    pub packets_in: u64,
    /// Frames sent.
    pub packets_out: u64,
    /// Bytes received, framing included.
    pub bytes_in: u64,
    /// Bytes sent, framing included.
    pub bytes_out: u64,
    /// Transport-level failures (reads, writes, accepts).
    pub connection_errors: u64,
    /// Frames that failed to decode.
    pub protocol_errors: u64,
}

#[derive(Debug, Default)]
pub(crate) struct ServerCounters {
    pub(crate) connections: AtomicU64,
    pub(crate) packets_in: AtomicU64,
    pub(crate) packets_out: AtomicU64,
    pub(crate) bytes_in: AtomicU64,
    pub(crate) bytes_out: AtomicU64,
    pub(crate) connection_errors: AtomicU64,
    pub(crate) protocol_errors: AtomicU64,
}

impl ServerCounters {
    fn snapshot(&self) -> ServerStats {
        ServerStats {
            connections: self.connections.load(Ordering::Relaxed),
            packets_in: self.packets_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
        }
    }
}

pub(crate) struct SessionRecord {
    pub(crate) session: ClientSession,
    handle: JoinHandle<()>,
}

pub(crate) struct ServerShared {
    pub(crate) max_clients: AtomicUsize,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) counters: ServerCounters,
    pub(crate) sessions: StdMutex<HashMap<String, SessionRecord>>,
    pub(crate) local_addr: OnceLock<SocketAddr>,
}

impl ServerShared {
    /// Address the server stamps as the source of its own frames.
    pub(crate) fn server_source(&self) -> (String, u16) {
        match self.local_addr.get() {
            Some(addr) => (addr.ip().to_string(), addr.port()),
            None => (DEFAULT_SERVER_HOST.to_string(), 0),
        }
    }

    fn admit(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr, shutdown: watch::Receiver<bool>) {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.len() >= self.max_clients.load(Ordering::SeqCst) {
            // Hard reject: close without sending anything
            log::warn!("maximum clients reached, rejecting connection from {peer}");
            drop(stream);
            return;
        }

        self.counters.connections.fetch_add(1, Ordering::Relaxed);
        let session = ClientSession::new(peer);
        let id = session.id.clone();
        log::info!("new connection from {peer}");

        let shared = self.clone();
        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            session::run(shared.clone(), stream, peer, shutdown).await;
            shared.sessions.lock().unwrap().remove(&task_id);
            log::info!("client {task_id} disconnected");
        });
        sessions.insert(id, SessionRecord { session, handle });
    }
}

/// A tunnel server: accepts client connections, acknowledges reliable
/// frames, probes idle clients, and reflects payloads back to their
/// source.
///
/// # Example
///
/// ```ignore
/// let server = TunnelServerBuilder::new().bind("0.0.0.0", 11223).build();
/// server.start().await?;
/// // ...
/// server.stop().await;
/// ```
pub struct TunnelServer {
    config: ServerConfig,
    shared: Arc<ServerShared>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: StdMutex<Option<JoinHandle<()>>>,
}

impl TunnelServer {
    /// Create a server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let shared = Arc::new(ServerShared {
            max_clients: AtomicUsize::new(config.max_clients),
            heartbeat_interval: config.heartbeat_interval,
            counters: ServerCounters::default(),
            sessions: StdMutex::new(HashMap::new()),
            local_addr: OnceLock::new(),
        });
        Self {
            config,
            shared,
            shutdown_tx,
            accept_task: StdMutex::new(None),
        }
    }

    /// Bind the listen address and spawn the accept loop.
    pub async fn start(&self) -> Result<(), ServerError> {
        {
            let task = self.accept_task.lock().unwrap();
            if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
                return Err(ServerError::AlreadyRunning);
            }
        }

        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port))
            .await
            .map_err(ServerError::BindFailed)?;
        let addr = listener.local_addr()?;
        let _ = self.shared.local_addr.set(addr);
        log::info!("server started on {addr}");

        let shared = self.shared.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            accept_loop(shared, listener, shutdown_rx).await;
        });
        *self.accept_task.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Stop accepting, signal every session loop, and join them.
    ///
    /// Idempotent. Dropping the listener closes it.
    pub async fn stop(&self) {
        let task = self.accept_task.lock().unwrap().take();
        let Some(task) = task else {
            return;
        };
        log::info!("stopping server");
        let _ = self.shutdown_tx.send(true);
        let _ = task.await;

        let handles: Vec<JoinHandle<()>> = self
            .shared
            .sessions
            .lock()
            .unwrap()
            .drain()
            .map(|(_, record)| record.handle)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
        log::info!("server stopped");
    }

    /// The bound listen address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr.get().copied()
    }

    /// Number of currently connected clients.
    pub fn session_count(&self) -> usize {
        self.shared.sessions.lock().unwrap().len()
    }

    /// Records of the currently connected clients.
    pub fn sessions(&self) -> Vec<ClientSession> {
        self.shared
            .sessions
            .lock()
            .unwrap()
            .values()
            .map(|record| record.session.clone())
            .collect()
    }

    /// Snapshot of the server's counters.
    pub fn counters(&self) -> ServerStats {
        self.shared.counters.snapshot()
    }

    /// Change the session limit at runtime. Applies to new connections
    /// only; existing sessions are never evicted.
    pub fn set_max_clients(&self, max: usize) {
        self.shared.max_clients.store(max, Ordering::SeqCst);
        log::info!("max clients set to {max}");
    }
}

impl Drop for TunnelServer {
    fn drop(&mut self) {
        // Best-effort cancellation when dropped without stop()
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.accept_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

async fn accept_loop(
    shared: Arc<ServerShared>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => shared.admit(stream, peer, shutdown.clone()),
                Err(e) => {
                    log::error!("accept error: {e}");
                    shared
                        .counters
                        .connection_errors
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
    log::debug!("accept loop stopped");
}
