//! At-least-once delivery channel over an unreliable connection.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};

use super::buffer::PendingBuffer;
use crate::core::constants::{
    DEFAULT_ACK_TIMEOUT, DEFAULT_CHANNEL_MAX_RETRIES, DEFAULT_PENDING_CAPACITY,
    RETRANSMIT_INTERVAL,
};
use crate::wire::{Frame, Meta, PayloadFrame};

/// Boxed future returned by the injected send function.
pub type SendFuture = Pin<Box<dyn Future<Output = std::io::Result<()>> + Send>>;

/// Injected raw send function: writes one frame to the wire.
pub type SendFn = Arc<dyn Fn(Frame) -> SendFuture + Send + Sync>;

/// Reliable-delivery configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Pending-buffer capacity; the oldest entry is evicted beyond it.
    pub capacity: usize,
    /// Time an entry may sit unacknowledged before retransmission.
    pub ack_timeout: Duration,
    /// Retransmissions per packet before silent abandonment.
    pub max_retries: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_PENDING_CAPACITY,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            max_retries: DEFAULT_CHANNEL_MAX_RETRIES,
        }
    }
}

/// Sequences, buffers, (re)transmits, and acknowledges frames.
///
/// Provides at-least-once delivery with best-effort ordering: every frame
/// is buffered before the first wire attempt, retransmitted on a fixed
/// cadence while unacknowledged, and silently abandoned once the retry
/// ceiling is reached. Cloning yields another handle to the same channel.
#[derive(Clone)]
pub struct ReliableChannel {
    send_fn: SendFn,
    config: ChannelConfig,
    buffer: Arc<Mutex<PendingBuffer>>,
    next_seq: Arc<AtomicU32>,
    retransmit_task: Arc<Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>>,
}

impl std::fmt::Debug for ReliableChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliableChannel")
            .field("config", &self.config)
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

impl ReliableChannel {
    /// Create a channel over the given raw send function.
    pub fn new(send_fn: SendFn, config: ChannelConfig) -> Self {
        let buffer = PendingBuffer::new(config.capacity, config.ack_timeout);
        Self {
            send_fn,
            config,
            buffer: Arc::new(Mutex::new(buffer)),
            next_seq: Arc::new(AtomicU32::new(0)),
            retransmit_task: Arc::new(Mutex::new(None)),
        }
    }

    /// Launch the retransmit loop. No-op when already started.
    pub fn start(&self) {
        let mut task = self.retransmit_task.lock().unwrap();
        if task.as_ref().is_some_and(|(_, handle)| !handle.is_finished()) {
            return;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let channel = self.clone();
        let handle = tokio::spawn(async move {
            channel.retransmit_loop(shutdown_rx).await;
        });
        *task = Some((shutdown_tx, handle));
    }

    /// Stop the retransmit loop and clear the buffer.
    ///
    /// Any still-unacknowledged frames are lost. Idempotent.
    pub async fn stop(&self) {
        let task = self.retransmit_task.lock().unwrap().take();
        if let Some((shutdown_tx, handle)) = task {
            let _ = shutdown_tx.send(true);
            let _ = handle.await;
        }
        self.buffer.lock().unwrap().clear();
    }

    /// Cancel the retransmit loop without waiting for it to finish.
    ///
    /// For use from synchronous teardown paths such as `Drop`.
    pub(crate) fn abort(&self) {
        if let Some((shutdown_tx, handle)) = self.retransmit_task.lock().unwrap().take() {
            let _ = shutdown_tx.send(true);
            handle.abort();
        }
    }

    /// Send a frame with delivery tracking, returning its id.
    ///
    /// The frame is stamped with `_meta` (ack required), buffered *before*
    /// the wire attempt so that a disconnect between buffering and the
    /// write still yields a retry, then transmitted. A transmission
    /// failure is logged, not raised: the entry stays buffered and the
    /// retransmit loop will retry it.
    pub async fn send(&self, mut frame: PayloadFrame) -> String {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let meta = Meta::fresh(seq, true);
        let id = meta.id.clone();
        frame.meta = Some(meta);
        let frame = Frame::Payload(frame);

        self.buffer.lock().unwrap().add(id.clone(), frame.clone());

        match (self.send_fn)(frame).await {
            Ok(()) => log::debug!("sent packet {id}"),
            Err(e) => log::error!("error sending packet {id}: {e}"),
        }
        id
    }

    /// Acknowledge receipt of a frame.
    pub fn acknowledge(&self, id: &str) {
        self.buffer.lock().unwrap().acknowledge(id);
        log::debug!("acknowledged packet {id}");
    }

    /// Number of frames awaiting acknowledgment.
    pub fn pending(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }

    /// Configured pending-buffer capacity.
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    async fn retransmit_loop(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = interval(RETRANSMIT_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
    }

    /// One retransmit sweep: resend every overdue entry, dropping those
    /// past the retry ceiling.
    async fn sweep(&self) {
        let due = self.buffer.lock().unwrap().due_for_retry(Instant::now());
        for entry in due {
            if entry.retries >= self.config.max_retries {
                log::warn!("max retries reached for packet {}, giving up", entry.id);
                self.buffer.lock().unwrap().acknowledge(&entry.id);
                continue;
            }
            log::debug!("retransmitting packet {} (retry {})", entry.id, entry.retries);
            if let Err(e) = (self.send_fn)(entry.frame).await {
                log::error!("error retransmitting packet {}: {e}", entry.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn payload_frame() -> PayloadFrame {
        PayloadFrame {
            payload: "48656c6c6f".into(),
            source_addr: "127.0.0.1".into(),
            source_port: 5000,
            dest_addr: None,
            dest_port: None,
            timestamp: None,
            meta: None,
        }
    }

    /// Send fn that records every transmitted frame.
    fn recording() -> (SendFn, Arc<Mutex<Vec<Frame>>>) {
        let sent: Arc<Mutex<Vec<Frame>>> = Arc::new(Mutex::new(Vec::new()));
        let log = sent.clone();
        let send: SendFn = Arc::new(move |frame| {
            let log = log.clone();
            Box::pin(async move {
                log.lock().unwrap().push(frame);
                Ok(())
            })
        });
        (send, sent)
    }

    fn config(max_retries: u32) -> ChannelConfig {
        ChannelConfig {
            capacity: 10,
            ack_timeout: Duration::from_secs(1),
            max_retries,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_acked_packet_sent_exactly_once() {
        let (send, sent) = recording();
        let channel = ReliableChannel::new(send, config(5));
        channel.start();

        let id = channel.send(payload_frame()).await;
        assert_eq!(channel.pending(), 1);

        channel.acknowledge(&id);
        assert_eq!(channel.pending(), 0);

        advance(Duration::from_secs(10)).await;
        assert_eq!(sent.lock().unwrap().len(), 1);

        channel.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_packet_retransmitted_then_abandoned() {
        let (send, sent) = recording();
        let channel = ReliableChannel::new(send, config(2));
        channel.start();

        channel.send(payload_frame()).await;

        for _ in 0..10 {
            advance(Duration::from_secs(1)).await;
        }

        // Original transmission plus one retry; the second due sweep hits
        // the ceiling and drops the entry instead of resending.
        assert_eq!(sent.lock().unwrap().len(), 2);
        assert_eq!(channel.pending(), 0);

        // Never resent again
        advance(Duration::from_secs(10)).await;
        assert_eq!(sent.lock().unwrap().len(), 2);

        channel.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_keeps_entry_buffered() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let send: SendFn = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(std::io::Error::other("broken pipe")) })
        });
        let channel = ReliableChannel::new(send, config(5));
        channel.start();

        // Failure is swallowed; the entry stays buffered for retry
        let id = channel.send(payload_frame()).await;
        assert_eq!(channel.pending(), 1);

        for _ in 0..4 {
            advance(Duration::from_secs(1)).await;
        }
        assert!(attempts.load(Ordering::SeqCst) >= 2);
        assert_eq!(channel.pending(), 1);

        channel.acknowledge(&id);
        channel.stop().await;
    }

    #[tokio::test]
    async fn test_stop_clears_buffer_and_is_idempotent() {
        let (send, _) = recording();
        let channel = ReliableChannel::new(send, config(5));
        channel.start();
        // Restart while running is a no-op
        channel.start();

        channel.send(payload_frame()).await;
        assert_eq!(channel.pending(), 1);

        channel.stop().await;
        assert_eq!(channel.pending(), 0);
        channel.stop().await;
    }

    #[tokio::test]
    async fn test_sequence_wraps_at_u32() {
        let (send, sent) = recording();
        let channel = ReliableChannel::new(send, config(5));
        channel.next_seq.store(u32::MAX, Ordering::Relaxed);

        channel.send(payload_frame()).await;
        channel.send(payload_frame()).await;

        let sent = sent.lock().unwrap();
        let seqs: Vec<u32> = sent
            .iter()
            .map(|f| f.meta().unwrap().seq)
            .collect();
        assert_eq!(seqs, vec![u32::MAX, 0]);
    }

    #[tokio::test]
    async fn test_ids_carry_sequence() {
        let (send, _) = recording();
        let channel = ReliableChannel::new(send, config(5));

        let first = channel.send(payload_frame()).await;
        let second = channel.send(payload_frame()).await;
        assert!(first.ends_with(":0"));
        assert!(second.ends_with(":1"));
    }
}
