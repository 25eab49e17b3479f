//! Durable relay queue.
//!
//! Producers append events to an on-disk log; a drain task moves them, oldest
//! first, into two bounded in-memory queues (keys and power) read by the
//! dispatch loop. The log survives process replacement, so anything the
//! dispatch loop has not received before a crash or self-restart is replayed
//! by the next process that opens the same directory.
//!
//! ```text
//!  producers ──enqueue──▶ queue.log ──drain task──▶ keys  (mpsc, bounded)
//!                                               └──▶ power (mpsc, bounded)
//! ```
//!
//! Delivery is at-least-once: the cursor advances only past events the
//! dispatch loop has actually received. Items still sitting in an egress
//! queue when the process is replaced stay uncommitted and are replayed.

mod store;

pub use store::QueueItem;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::types::{Error, Event, KeyPress, PowerEvent, QueueConfig, Result};
use store::LogStore;

/// Receiving ends of the egress queues, owned by the dispatch loop.
#[derive(Debug)]
pub struct EventStreams {
    pub keys: Egress<KeyPress>,
    pub power: Egress<PowerEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Keys,
    Power,
}

/// One egress queue. Receiving an item marks its log line as delivered.
#[derive(Debug)]
pub struct Egress<T> {
    rx: mpsc::Receiver<T>,
    stream: Stream,
    receipts: Arc<parking_lot::Mutex<Receipts>>,
    wake: Arc<Notify>,
}

impl<T> Egress<T> {
    /// Next item, or `None` once the queue is closed and empty. Cancel safe.
    pub async fn recv(&mut self) -> Option<T> {
        let item = self.rx.recv().await?;
        self.receipts.lock().received(self.stream);
        self.wake.notify_one();
        Some(item)
    }
}

#[derive(Debug)]
struct Slot {
    end: u64,
    stream: Option<Stream>,
    received: bool,
}

/// Log lines read by the drain task but not yet committed, oldest first.
#[derive(Debug, Default)]
struct Receipts {
    slots: VecDeque<Slot>,
    /// Highest offset whose lines have all been received.
    ready: Option<u64>,
}

impl Receipts {
    fn sent(&mut self, stream: Stream, end: u64) {
        self.slots.push_back(Slot {
            end,
            stream: Some(stream),
            received: false,
        });
    }

    fn skipped(&mut self, end: u64) {
        self.slots.push_back(Slot {
            end,
            stream: None,
            received: true,
        });
        self.settle();
    }

    fn received(&mut self, stream: Stream) {
        if let Some(slot) = self
            .slots
            .iter_mut()
            .find(|s| s.stream == Some(stream) && !s.received)
        {
            slot.received = true;
        }
        self.settle();
    }

    fn settle(&mut self) {
        while self.slots.front().is_some_and(|s| s.received) {
            if let Some(slot) = self.slots.pop_front() {
                self.ready = Some(slot.end);
            }
        }
    }

    fn take_ready(&mut self) -> Option<u64> {
        self.ready.take()
    }

    fn restore(&mut self, end: u64) {
        self.ready = Some(self.ready.map_or(end, |r| r.max(end)));
    }
}

/// Run `f` on the blocking pool while holding the store lock.
async fn with_store<R, F>(store: &Arc<Mutex<LogStore>>, f: F) -> Result<R>
where
    F: FnOnce(&mut LogStore) -> Result<R> + Send + 'static,
    R: Send + 'static,
{
    let mut guard = Arc::clone(store).lock_owned().await;
    tokio::task::spawn_blocking(move || f(&mut guard))
        .await
        .map_err(|e| Error::storage(format!("queue I/O task failed: {}", e)))?
}

/// Cloneable producer handle.
#[derive(Debug, Clone)]
pub struct QueueIngress {
    store: Arc<Mutex<LogStore>>,
    wake: Arc<Notify>,
    closed: Arc<AtomicBool>,
}

impl QueueIngress {
    /// Persist an event for delivery.
    ///
    /// Returns the sequence id, or `None` when the event was dropped because
    /// the queue is closed or the log could not be written. Drops are logged.
    pub async fn enqueue(&self, event: impl Into<Event>) -> Option<u64> {
        let event = event.into();
        if self.closed.load(Ordering::Acquire) {
            tracing::warn!(event_type = event.type_tag(), "Queue closed, dropping event");
            return None;
        }

        let closed = self.closed.clone();
        let appended = with_store(&self.store, move |store| {
            if closed.load(Ordering::Acquire) {
                return Ok(None);
            }
            store.append(&event).map(Some)
        })
        .await;

        match appended {
            Ok(Some(seq)) => {
                self.wake.notify_one();
                tracing::debug!(seq, event_type = event.type_tag(), "Event enqueued");
                Some(seq)
            }
            Ok(None) => {
                tracing::warn!(event_type = event.type_tag(), "Queue closed, dropping event");
                None
            }
            Err(e) => {
                tracing::error!(
                    event_type = event.type_tag(),
                    error = %e,
                    "Failed to persist event, dropping it"
                );
                None
            }
        }
    }
}

/// Crash-durable buffer between the event sources and the dispatch loop.
#[derive(Debug)]
pub struct DurableQueue {
    dir: PathBuf,
    ingress: QueueIngress,
    receipts: Arc<parking_lot::Mutex<Receipts>>,
    cancel: CancellationToken,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl DurableQueue {
    /// Open (or recover) the queue in `dir` and start the drain task.
    ///
    /// Must be called from within a tokio runtime. Failure to open the log is
    /// fatal for the caller.
    pub fn open(dir: impl Into<PathBuf>, config: &QueueConfig) -> Result<(Self, EventStreams)> {
        let dir = dir.into();
        let store = LogStore::open(&dir).map_err(|e| {
            Error::storage(format!("cannot open queue at {}: {}", dir.display(), e))
        })?;

        tracing::info!(
            dir = %dir.display(),
            backlog_bytes = store.backlog_bytes(),
            next_seq = store.next_seq(),
            "Durable queue opened"
        );

        let capacity = config.capacity.max(1);
        let (keys_tx, keys_rx) = mpsc::channel(capacity);
        let (power_tx, power_rx) = mpsc::channel(capacity);

        let ingress = QueueIngress {
            store: Arc::new(Mutex::new(store)),
            wake: Arc::new(Notify::new()),
            closed: Arc::new(AtomicBool::new(false)),
        };
        let receipts = Arc::new(parking_lot::Mutex::new(Receipts::default()));
        let cancel = CancellationToken::new();

        let drain = tokio::spawn(drain_loop(
            Drain {
                store: ingress.store.clone(),
                wake: ingress.wake.clone(),
                receipts: receipts.clone(),
                cancel: cancel.clone(),
                keys_tx,
                power_tx,
            },
            config.poll_interval,
        ));

        let streams = EventStreams {
            keys: Egress {
                rx: keys_rx,
                stream: Stream::Keys,
                receipts: receipts.clone(),
                wake: ingress.wake.clone(),
            },
            power: Egress {
                rx: power_rx,
                stream: Stream::Power,
                receipts: receipts.clone(),
                wake: ingress.wake.clone(),
            },
        };

        Ok((
            Self {
                dir,
                ingress,
                receipts,
                cancel,
                drain: Mutex::new(Some(drain)),
            },
            streams,
        ))
    }

    /// Persist an event for delivery. See [`QueueIngress::enqueue`].
    pub async fn enqueue(&self, event: impl Into<Event>) -> Option<u64> {
        self.ingress.enqueue(event).await
    }

    /// Producer handle for listener tasks.
    pub fn ingress(&self) -> QueueIngress {
        self.ingress.clone()
    }

    /// Queue directory (carried across a self-restart).
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stop accepting events, stop the drain task and close both egress queues.
    ///
    /// `delete_on_disk` removes the directory and must only be set on a
    /// graceful shutdown; before a recovery restart the log has to survive,
    /// and whatever the dispatch loop has not received yet stays in it.
    /// Calling this more than once is harmless.
    pub async fn close(&self, delete_on_disk: bool) -> Result<()> {
        self.ingress.closed.store(true, Ordering::Release);
        self.cancel.cancel();

        if let Some(handle) = self.drain.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Queue drain task ended abnormally");
            }
        }

        let ready = self.receipts.lock().take_ready();
        let dir = self.dir.clone();
        // Runs after any append that was already in progress.
        with_store(&self.ingress.store, move |store| {
            if delete_on_disk {
                return match std::fs::remove_dir_all(&dir) {
                    Ok(()) => {
                        tracing::info!(dir = %dir.display(), "Queue directory removed");
                        Ok(())
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(e.into()),
                };
            }
            if let Some(end) = ready {
                if let Err(e) = store.commit(end) {
                    tracing::error!(error = %e, "Failed to persist queue cursor on close");
                }
            }
            tracing::info!(
                dir = %dir.display(),
                backlog_bytes = store.backlog_bytes(),
                "Queue closed, log kept on disk"
            );
            Ok(())
        })
        .await
    }
}

struct Drain {
    store: Arc<Mutex<LogStore>>,
    wake: Arc<Notify>,
    receipts: Arc<parking_lot::Mutex<Receipts>>,
    cancel: CancellationToken,
    keys_tx: mpsc::Sender<KeyPress>,
    power_tx: mpsc::Sender<PowerEvent>,
}

impl Drain {
    /// Persist the cursor past every line the dispatch loop has received.
    async fn commit_received(&self) {
        let Some(end) = self.receipts.lock().take_ready() else {
            return;
        };
        if let Err(e) = with_store(&self.store, move |store| store.commit(end)).await {
            tracing::error!(error = %e, "Failed to persist queue cursor");
            self.receipts.lock().restore(end);
        }
    }

    async fn idle(&self, poll_interval: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = self.wake.notified() => true,
            _ = tokio::time::sleep(poll_interval) => true,
        }
    }
}

/// Move events from the log into the egress queues until cancelled.
async fn drain_loop(drain: Drain, poll_interval: Duration) {
    loop {
        if drain.cancel.is_cancelled() {
            break;
        }
        drain.commit_received().await;

        let entry = match with_store(&drain.store, |store| store.peek()).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                // Woken early by an enqueue or a receipt; the timeout only
                // bounds a missed wakeup.
                if !drain.idle(poll_interval).await {
                    break;
                }
                continue;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to read queue log");
                if !drain.idle(poll_interval).await {
                    break;
                }
                continue;
            }
        };

        let end = entry.end;
        match entry.decode() {
            Ok((seq, Event::Key(key))) => {
                drain.receipts.lock().sent(Stream::Keys, end);
                if !hand_off(&drain.keys_tx, key, &drain.cancel).await {
                    break;
                }
                tracing::trace!(seq, "Key event handed off");
            }
            Ok((seq, Event::Power(power))) => {
                drain.receipts.lock().sent(Stream::Power, end);
                if !hand_off(&drain.power_tx, power, &drain.cancel).await {
                    break;
                }
                tracing::trace!(seq, "Power event handed off");
            }
            Err(e) => {
                tracing::error!(end, error = %e, "Skipping unreadable queue item");
                drain.receipts.lock().skipped(end);
            }
        }
        drain.store.lock().await.advance(end);
    }
    tracing::debug!("Queue drain task stopped");
}

/// Send into a bounded egress queue, waiting while it is full.
///
/// Returns false if cancelled or the receiver is gone; the item then stays
/// uncommitted and is replayed later.
async fn hand_off<T>(tx: &mpsc::Sender<T>, item: T, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}
