//! Priority-ordered, multi-worker frame dispatcher.
//!
//! The dispatcher decouples frame arrival from frame handling.  The receive
//! loop calls [`PacketDispatcher::enqueue`], which inserts the frame into a
//! priority queue and releases one semaphore permit; each worker waits on the
//! semaphore, pops the best entry under the queue mutex, and invokes the
//! registered handler outside the lock.
//!
//! Ordering: entries are served highest priority first, FIFO within equal
//! priority (a monotonically increasing enqueue sequence breaks ties).  Both
//! guarantees hold only within one dispatcher instance; each session owns its
//! own dispatcher, so handlers of unrelated sessions never interfere.
//!
//! Failure semantics: the dispatcher itself never fails.  A handler error is
//! caught at the dispatch boundary, logged with the frame's kind, and does
//! not affect the worker or other queued entries.  A frame whose kind has no
//! registered handler is logged and dropped.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};

use lanlink_core::Frame;
use thiserror::Error;
use tokio::sync::{Mutex as TokioMutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Error raised inside a registered handler.  Fully isolated at the dispatch
/// boundary: it is logged and never propagates past the worker.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    /// Builds a handler error from any displayable cause.
    pub fn new(cause: impl std::fmt::Display) -> Self {
        Self(cause.to_string())
    }
}

/// Boxed future returned by a frame handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;

/// A registered frame handler.
pub type Handler = Arc<dyn Fn(Frame) -> HandlerFuture + Send + Sync>;

struct Registration {
    priority: i32,
    handler: Handler,
}

/// A queued frame with its scheduling key.
struct QueueEntry {
    frame: Frame,
    priority: i32,
    seq: u64,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    /// Max-heap order: higher priority wins, then the lower (earlier)
    /// sequence number.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Inner {
    handlers: RwLock<HashMap<String, Registration>>,
    queue: StdMutex<BinaryHeap<QueueEntry>>,
    seq: AtomicU64,
    signal: Semaphore,
    workers: TokioMutex<Vec<JoinHandle<()>>>,
}

/// Priority-ordered router from inbound frames to registered handlers.
///
/// Cheap to clone; clones share the same queue, handler table, and workers.
#[derive(Clone)]
pub struct PacketDispatcher {
    inner: Arc<Inner>,
}

impl PacketDispatcher {
    /// Creates an empty dispatcher with no workers running.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                handlers: RwLock::new(HashMap::new()),
                queue: StdMutex::new(BinaryHeap::new()),
                seq: AtomicU64::new(0),
                signal: Semaphore::new(0),
                workers: TokioMutex::new(Vec::new()),
            }),
        }
    }

    /// Registers `handler` for frames of `kind` at the given priority
    /// (higher is served first).  Overwrites any prior registration for that
    /// kind — last write wins.
    pub fn register_handler<F>(&self, kind: &str, priority: i32, handler: F)
    where
        F: Fn(Frame) -> HandlerFuture + Send + Sync + 'static,
    {
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if handlers
            .insert(
                kind.to_string(),
                Registration {
                    priority,
                    handler: Arc::new(handler),
                },
            )
            .is_some()
        {
            debug!(kind, "handler registration replaced");
        }
    }

    /// Queues a frame for dispatch and wakes one worker.
    ///
    /// The frame's priority is the one its kind was registered with, or 0
    /// when the kind is unregistered.
    pub fn enqueue(&self, frame: Frame) {
        let priority = {
            let handlers = self
                .inner
                .handlers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            handlers.get(&frame.kind).map(|r| r.priority).unwrap_or(0)
        };
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        debug!(kind = %frame.kind, priority, seq, "enqueue frame");

        {
            let mut queue = self
                .inner
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            queue.push(QueueEntry {
                frame,
                priority,
                seq,
            });
        }
        self.inner.signal.add_permits(1);
    }

    /// Launches `worker_count` concurrent dispatch workers.
    pub async fn init(&self, worker_count: usize) {
        let mut workers = self.inner.workers.lock().await;
        for index in 0..worker_count {
            let inner = Arc::clone(&self.inner);
            workers.push(tokio::spawn(worker_loop(inner, index)));
        }
    }

    /// Stops all workers cooperatively: no new dequeues start, in-flight
    /// handler invocations finish, and all worker tasks are awaited.
    /// Idempotent.
    pub async fn stop(&self) {
        self.inner.signal.close();
        let mut workers = self.inner.workers.lock().await;
        for handle in workers.drain(..) {
            let _ = handle.await;
        }
    }

    /// Number of frames currently waiting for a worker.
    pub fn pending(&self) -> usize {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for PacketDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

async fn worker_loop(inner: Arc<Inner>, index: usize) {
    debug!(worker = index, "dispatch worker started");
    loop {
        // A closed semaphore means stop() ran: drain no further.
        let permit = match inner.signal.acquire().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        permit.forget();

        let entry = {
            let mut queue = inner.queue.lock().unwrap_or_else(PoisonError::into_inner);
            queue.pop()
        };
        let Some(entry) = entry else { continue };

        let kind = entry.frame.kind.clone();
        let handler = {
            let handlers = inner.handlers.read().unwrap_or_else(PoisonError::into_inner);
            handlers.get(&kind).map(|r| Arc::clone(&r.handler))
        };

        match handler {
            Some(handler) => {
                // Invoked outside the queue lock so slow handlers never
                // block enqueues or other workers.
                if let Err(e) = handler(entry.frame).await {
                    error!(kind = %kind, error = %e, "handler failed");
                }
            }
            None => warn!(kind = %kind, "no handler registered; frame dropped"),
        }
    }
    debug!(worker = index, "dispatch worker stopped");
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Registers a handler that forwards each frame's kind to `tx`.
    fn record_kinds(
        dispatcher: &PacketDispatcher,
        kind: &str,
        priority: i32,
        tx: mpsc::UnboundedSender<String>,
    ) {
        dispatcher.register_handler(kind, priority, move |frame| {
            let tx = tx.clone();
            Box::pin(async move {
                tx.send(frame.kind).map_err(HandlerError::new)?;
                Ok(())
            })
        });
    }

    async fn collect(rx: &mut mpsc::UnboundedReceiver<String>, n: usize) -> Vec<String> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let item = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for dispatch")
                .expect("channel closed");
            out.push(item);
        }
        out
    }

    #[tokio::test]
    async fn test_higher_priority_is_served_first() {
        let dispatcher = PacketDispatcher::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        record_kinds(&dispatcher, "Low", 0, tx.clone());
        record_kinds(&dispatcher, "High", 10, tx);

        // Enqueue in the "wrong" order, before any worker runs.
        dispatcher.enqueue(Frame::control("Low"));
        dispatcher.enqueue(Frame::control("High"));
        dispatcher.init(1).await;

        assert_eq!(collect(&mut rx, 2).await, vec!["High", "Low"]);
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_equal_priority_is_fifo() {
        let dispatcher = PacketDispatcher::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let order = Arc::new(StdMutex::new(Vec::new()));
        {
            let order = Arc::clone(&order);
            dispatcher.register_handler("Message", 5, move |frame| {
                let order = Arc::clone(&order);
                let tx = tx.clone();
                Box::pin(async move {
                    if let lanlink_core::FrameBody::Message { text, .. } = frame.body {
                        order.lock().unwrap().push(text);
                    }
                    tx.send(frame.kind).map_err(HandlerError::new)?;
                    Ok(())
                })
            });
        }

        for i in 0..10 {
            dispatcher.enqueue(Frame::message(i.to_string(), ""));
        }
        dispatcher.init(1).await;
        collect(&mut rx, 10).await;

        let seen = order.lock().unwrap().clone();
        let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        assert_eq!(seen, expected, "equal-priority frames must stay FIFO");
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_handler_failure_does_not_stop_the_worker() {
        let dispatcher = PacketDispatcher::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.register_handler("Boom", 0, |_frame| {
            Box::pin(async { Err(HandlerError::new("deliberate failure")) })
        });
        record_kinds(&dispatcher, "Fine", 0, tx);

        dispatcher.enqueue(Frame::control("Boom"));
        dispatcher.enqueue(Frame::control("Fine"));
        dispatcher.init(1).await;

        assert_eq!(collect(&mut rx, 1).await, vec!["Fine"]);
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_unregistered_kind_is_dropped_not_fatal() {
        let dispatcher = PacketDispatcher::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        record_kinds(&dispatcher, "Known", 0, tx);

        dispatcher.enqueue(Frame::control("Mystery"));
        dispatcher.enqueue(Frame::control("Known"));
        dispatcher.init(1).await;

        assert_eq!(collect(&mut rx, 1).await, vec!["Known"]);
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_reregistration_last_write_wins() {
        let dispatcher = PacketDispatcher::new();
        let (tx_old, mut rx_old) = mpsc::unbounded_channel();
        let (tx_new, mut rx_new) = mpsc::unbounded_channel();
        record_kinds(&dispatcher, "Ping", 0, tx_old);
        record_kinds(&dispatcher, "Ping", 0, tx_new);

        dispatcher.enqueue(Frame::ping());
        dispatcher.init(1).await;

        assert_eq!(collect(&mut rx_new, 1).await, vec!["Ping"]);
        assert!(rx_old.try_recv().is_err(), "replaced handler must not run");
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_stop_prevents_new_dequeues() {
        let dispatcher = PacketDispatcher::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        record_kinds(&dispatcher, "Late", 0, tx);

        dispatcher.init(1).await;
        dispatcher.stop().await;
        dispatcher.enqueue(Frame::control("Late"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err(), "no dequeue may start after stop");
        assert_eq!(dispatcher.pending(), 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dispatcher = PacketDispatcher::new();
        dispatcher.init(2).await;
        dispatcher.stop().await;
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_multiple_workers_drain_the_queue() {
        let dispatcher = PacketDispatcher::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        record_kinds(&dispatcher, "Work", 0, tx);

        for _ in 0..50 {
            dispatcher.enqueue(Frame::control("Work"));
        }
        dispatcher.init(4).await;

        assert_eq!(collect(&mut rx, 50).await.len(), 50);
        assert_eq!(dispatcher.pending(), 0);
        dispatcher.stop().await;
    }
}
