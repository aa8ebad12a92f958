//! Connection lifecycle and backoff reconnection.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::core::constants::{
    DEFAULT_BACKOFF_JITTER, DEFAULT_CONNECT_MAX_RETRIES, DEFAULT_INITIAL_BACKOFF,
    DEFAULT_MAX_BACKOFF, MIN_BACKOFF,
};
use crate::core::ConnectionError;

/// Boxed future returned by the injected connect function.
pub type ConnectFuture = Pin<Box<dyn Future<Output = Result<(), ConnectionError>> + Send>>;

/// Injected connect function. Each invocation must attempt to establish
/// the underlying connection from scratch.
pub type ConnectFn = Arc<dyn Fn() -> ConnectFuture + Send + Sync>;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// No connection and no recovery in progress.
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// Connection established.
    Connected,
    /// Connection lost; the backoff loop is scheduled or sleeping.
    Reconnecting,
}

/// Reconnection policy: retry ceiling and backoff shape.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per recovery before giving up.
    pub max_retries: u32,
    /// First backoff interval.
    pub initial_backoff: Duration,
    /// Backoff cap.
    pub max_backoff: Duration,
    /// Random jitter fraction applied in either direction.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_CONNECT_MAX_RETRIES,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            jitter: DEFAULT_BACKOFF_JITTER,
        }
    }
}

#[derive(Debug)]
struct Inner {
    retry_count: u32,
    last_error: Option<ConnectionError>,
    reconnect_task: Option<JoinHandle<()>>,
}

/// Owns the connection lifecycle over an injected connect function and
/// drives exponential-backoff reconnection when the connection drops.
///
/// Cloning yields another handle to the same manager; at most one
/// reconnection loop runs per manager.
#[derive(Clone)]
pub struct ConnectionManager {
    connect_fn: ConnectFn,
    policy: RetryPolicy,
    phase: Arc<watch::Sender<ConnectionPhase>>,
    inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("phase", &self.phase())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager over the given connect function.
    pub fn new(connect_fn: ConnectFn, policy: RetryPolicy) -> Self {
        let (phase, _) = watch::channel(ConnectionPhase::Disconnected);
        Self {
            connect_fn,
            policy,
            phase: Arc::new(phase),
            inner: Arc::new(Mutex::new(Inner {
                retry_count: 0,
                last_error: None,
                reconnect_task: None,
            })),
        }
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> ConnectionPhase {
        *self.phase.borrow()
    }

    /// Whether the connection is established.
    pub fn is_connected(&self) -> bool {
        self.phase() == ConnectionPhase::Connected
    }

    /// Attempts made in the current recovery, zero when healthy.
    pub fn retry_count(&self) -> u32 {
        self.inner.lock().unwrap().retry_count
    }

    /// Message of the most recent connection failure, if any.
    pub fn last_error(&self) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .last_error
            .as_ref()
            .map(|e| e.to_string())
    }

    /// Establish the connection.
    ///
    /// Succeeds immediately when already connected. When an attempt is
    /// already in flight, waits for it and reports its outcome. Otherwise
    /// runs a fresh attempt; on failure the reconnection loop is started
    /// (if not already running) and the failure is returned.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        {
            let mut inner = self.inner.lock().unwrap();
            match self.phase() {
                ConnectionPhase::Connected => return Ok(()),
                ConnectionPhase::Connecting => drop(inner),
                ConnectionPhase::Disconnected | ConnectionPhase::Reconnecting => {
                    inner.retry_count = 0;
                    self.phase.send_replace(ConnectionPhase::Connecting);
                    drop(inner);
                    return self.run_attempt().await;
                }
            }
        }
        self.await_in_flight().await
    }

    /// Wait for the in-flight attempt and report its outcome.
    async fn await_in_flight(&self) -> Result<(), ConnectionError> {
        let mut rx = self.phase.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            match current {
                ConnectionPhase::Connected => return Ok(()),
                ConnectionPhase::Connecting => {}
                ConnectionPhase::Disconnected | ConnectionPhase::Reconnecting => {
                    let inner = self.inner.lock().unwrap();
                    return Err(inner.last_error.clone().unwrap_or_else(|| {
                        ConnectionError::ConnectFailed("connection attempt failed".into())
                    }));
                }
            }
            if rx.changed().await.is_err() {
                return Err(ConnectionError::ConnectFailed("manager dropped".into()));
            }
        }
    }

    async fn run_attempt(&self) -> Result<(), ConnectionError> {
        match (self.connect_fn)().await {
            Ok(()) => {
                {
                    let mut inner = self.inner.lock().unwrap();
                    inner.last_error = None;
                    self.phase.send_replace(ConnectionPhase::Connected);
                }
                log::info!("connection established");
                Ok(())
            }
            Err(e) => {
                log::error!("connection failed: {e}");
                {
                    let mut inner = self.inner.lock().unwrap();
                    inner.last_error = Some(e.clone());
                    self.phase.send_replace(ConnectionPhase::Reconnecting);
                    self.spawn_reconnect_loop(&mut inner);
                }
                Err(e)
            }
        }
    }

    /// Report a broken connection (read/write failure, EOF).
    ///
    /// Resets the retry counter and (re)starts the reconnection loop; at
    /// most one loop instance runs per manager. No-op unless currently
    /// connected.
    pub fn connection_lost(&self) {
        let mut inner = self.inner.lock().unwrap();
        if self.phase() != ConnectionPhase::Connected {
            return;
        }
        log::warn!("connection lost, scheduling reconnection");
        inner.retry_count = 0;
        self.phase.send_replace(ConnectionPhase::Reconnecting);
        self.spawn_reconnect_loop(&mut inner);
    }

    /// Force the manager back to `Disconnected`: cancel any running loop
    /// and clear retry state.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(task) = inner.reconnect_task.take() {
            task.abort();
        }
        inner.retry_count = 0;
        inner.last_error = None;
        self.phase.send_replace(ConnectionPhase::Disconnected);
    }

    fn spawn_reconnect_loop(&self, inner: &mut Inner) {
        if inner
            .reconnect_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
        {
            return;
        }
        let manager = self.clone();
        inner.reconnect_task = Some(tokio::spawn(async move {
            manager.reconnect_loop().await;
        }));
    }

    async fn reconnect_loop(&self) {
        loop {
            let attempt = {
                let mut inner = self.inner.lock().unwrap();
                if self.phase() == ConnectionPhase::Connected {
                    return;
                }
                if inner.retry_count >= self.policy.max_retries {
                    log::error!(
                        "giving up after {} reconnection attempts",
                        self.policy.max_retries
                    );
                    self.phase.send_replace(ConnectionPhase::Disconnected);
                    return;
                }
                inner.retry_count += 1;
                inner.retry_count
            };

            let backoff = self.backoff_for(attempt);
            log::info!(
                "reconnection attempt {attempt}/{} in {:.2}s",
                self.policy.max_retries,
                backoff.as_secs_f64()
            );
            sleep(backoff).await;

            if self.phase() == ConnectionPhase::Connected {
                return;
            }

            self.phase.send_replace(ConnectionPhase::Connecting);
            match (self.connect_fn)().await {
                Ok(()) => {
                    let mut inner = self.inner.lock().unwrap();
                    inner.last_error = None;
                    self.phase.send_replace(ConnectionPhase::Connected);
                    log::info!("reconnected after {attempt} attempts");
                    return;
                }
                Err(e) => {
                    log::error!("reconnection attempt {attempt} failed: {e}");
                    let mut inner = self.inner.lock().unwrap();
                    inner.last_error = Some(e);
                    self.phase.send_replace(ConnectionPhase::Reconnecting);
                }
            }
        }
    }

    /// Backoff for the given attempt number: exponential, capped, jittered,
    /// floored at [`MIN_BACKOFF`].
    fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = self.policy.initial_backoff.as_secs_f64() * 2f64.powi(attempt.min(63) as i32);
        let capped = exp.min(self.policy.max_backoff.as_secs_f64());
        let jitter = capped * self.policy.jitter;
        let jittered = if jitter > 0.0 {
            capped + rand::thread_rng().gen_range(-jitter..=jitter)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.max(MIN_BACKOFF.as_secs_f64()))
    }
}
