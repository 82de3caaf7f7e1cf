//! Priority-fair intake queue for incoming generation requests.
//!
//! Requests are buffered in a priority heap and drained by a fixed
//! worker pool. The priority class depends on how recently the
//! requester was last served, so one chatty requester cannot starve
//! others while brand-new arrivals still get low latency:
//!
//! - never seen before          → 0 (served first)
//! - not served for > 5 minutes → 1
//! - not served for > 60 s      → 2
//! - served within the last 60 s → 3
//!
//! Ties break on enqueue order (strict FIFO within a class). The
//! "last served" stamp is taken when a worker *starts* a request, so
//! priority reflects queue residency rather than output latency.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// One incoming question waiting for generation.
#[derive(Debug, Clone)]
pub struct IntakeRequest {
    pub requester_chat: String,
    pub requester_user: String,
    pub requester_name: String,
    pub source_text: String,
    pub source_message_ref: Option<String>,
    pub conversation_label: Option<String>,
}

/// What an intake worker does with a claimed request.
#[async_trait]
pub trait IntakeHandler: Send + Sync {
    async fn handle(&self, request: IntakeRequest) -> anyhow::Result<()>;
}

// ── Heap entry ───────────────────────────────────────────────────

struct QueuedIntake {
    priority: u8,
    /// Monotonic sequence number: FIFO tie-break within a class.
    seq: u64,
    request: IntakeRequest,
}

impl PartialEq for QueuedIntake {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueuedIntake {}
impl PartialOrd for QueuedIntake {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedIntake {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.priority, self.seq).cmp(&(other.priority, other.seq))
    }
}

struct IntakeInner {
    heap: BinaryHeap<Reverse<QueuedIntake>>,
    next_seq: u64,
}

// ── Queue ────────────────────────────────────────────────────────

pub struct IntakeQueue {
    inner: Mutex<IntakeInner>,
    /// When each requester was last *picked up* by a worker.
    last_served: Mutex<HashMap<String, Instant>>,
    notify: Notify,
    cancel: CancellationToken,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl IntakeQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(IntakeInner {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
            last_served: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            cancel: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Enqueue a request. Never drops work; returns the assigned
    /// priority class.
    pub fn submit(&self, request: IntakeRequest) -> u8 {
        let priority = self.priority_for(&request.requester_user);
        let queue_size = {
            let mut inner = self.inner.lock();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.heap.push(Reverse(QueuedIntake {
                priority,
                seq,
                request,
            }));
            inner.heap.len()
        };
        self.notify.notify_one();
        tracing::info!(priority, queue_size, "generation request queued");
        priority
    }

    fn priority_for(&self, requester: &str) -> u8 {
        match self.last_served.lock().get(requester) {
            None => 0,
            Some(at) => {
                let elapsed = at.elapsed().as_secs();
                if elapsed > 300 {
                    1
                } else if elapsed > 60 {
                    2
                } else {
                    3
                }
            }
        }
    }

    pub fn queue_size(&self) -> usize {
        self.inner.lock().heap.len()
    }

    fn pop(&self) -> Option<IntakeRequest> {
        let item = self.inner.lock().heap.pop()?;
        let request = item.0.request;
        // Stamp at pick-up, not completion.
        self.last_served
            .lock()
            .insert(request.requester_user.clone(), Instant::now());
        Some(request)
    }

    /// Wait for the next request, or `None` once shutdown begins.
    async fn next(&self) -> Option<IntakeRequest> {
        loop {
            if let Some(request) = self.pop() {
                return Some(request);
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }

    /// Start `n` workers that each process one request fully before
    /// pulling the next. A failure on one request is logged and the
    /// worker keeps going.
    pub fn run_workers(self: &Arc<Self>, n: usize, handler: Arc<dyn IntakeHandler>) {
        let mut workers = self.workers.lock();
        for worker_id in 0..n {
            let queue = Arc::clone(self);
            let handler = Arc::clone(&handler);
            workers.push(tokio::spawn(async move {
                tracing::info!(worker_id, "intake worker started");
                while let Some(request) = queue.next().await {
                    let requester = request.requester_user.clone();
                    if let Err(e) = handler.handle(request).await {
                        tracing::error!(worker_id, requester = %requester, "intake worker failed on request: {e:#}");
                    }
                }
                tracing::info!(worker_id, "intake worker stopped");
            }));
        }
        tracing::info!(workers = n, "intake worker pool running");
    }

    /// Cooperative shutdown: signal workers to stop, let in-flight
    /// work finish, then return.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("intake worker panicked during shutdown: {e}");
            }
        }
        tracing::info!("intake queue stopped");
    }
}

impl Default for IntakeQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration;

    fn request(user: &str, text: &str) -> IntakeRequest {
        IntakeRequest {
            requester_chat: "chat-1".into(),
            requester_user: user.into(),
            requester_name: user.into(),
            source_text: text.into(),
            source_message_ref: None,
            conversation_label: None,
        }
    }

    /// Handler that records processing order.
    struct RecordingHandler {
        seen: Mutex<Vec<String>>,
        processed: AtomicUsize,
    }

    impl RecordingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                processed: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl IntakeHandler for RecordingHandler {
        async fn handle(&self, request: IntakeRequest) -> anyhow::Result<()> {
            self.seen.lock().push(request.source_text.clone());
            self.processed.fetch_add(1, AtomicOrdering::SeqCst);
            if request.source_text == "boom" {
                anyhow::bail!("generator unavailable");
            }
            Ok(())
        }
    }

    async fn wait_for(handler: &RecordingHandler, count: usize) {
        for _ in 0..200 {
            if handler.processed.load(AtomicOrdering::SeqCst) >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "handler saw {} of {count} requests",
            handler.processed.load(AtomicOrdering::SeqCst)
        );
    }

    #[test]
    fn first_ever_requester_outranks_recently_served() {
        let queue = IntakeQueue::new();
        // B was served 10 seconds ago.
        queue
            .last_served
            .lock()
            .insert("user-B".into(), Instant::now());

        assert_eq!(queue.submit(request("user-B", "from B")), 3);
        assert_eq!(queue.submit(request("user-A", "from A")), 0);

        // A is served first despite enqueueing second.
        assert_eq!(queue.pop().unwrap().source_text, "from A");
        assert_eq!(queue.pop().unwrap().source_text, "from B");
    }

    #[test]
    fn same_class_drains_fifo() {
        let queue = IntakeQueue::new();
        queue.submit(request("u1", "first"));
        queue.submit(request("u2", "second"));
        queue.submit(request("u3", "third"));

        assert_eq!(queue.pop().unwrap().source_text, "first");
        assert_eq!(queue.pop().unwrap().source_text, "second");
        assert_eq!(queue.pop().unwrap().source_text, "third");
    }

    #[test]
    fn priority_classes_follow_recency() {
        let queue = IntakeQueue::new();
        let now = Instant::now();
        {
            let mut served = queue.last_served.lock();
            served.insert("stale".into(), now - Duration::from_secs(301));
            served.insert("idle".into(), now - Duration::from_secs(61));
            served.insert("busy".into(), now - Duration::from_secs(5));
        }

        assert_eq!(queue.priority_for("brand-new"), 0);
        assert_eq!(queue.priority_for("stale"), 1);
        assert_eq!(queue.priority_for("idle"), 2);
        assert_eq!(queue.priority_for("busy"), 3);
    }

    #[test]
    fn pick_up_stamps_last_served() {
        let queue = IntakeQueue::new();
        queue.submit(request("u1", "q"));
        assert_eq!(queue.priority_for("u1"), 0);
        queue.pop().unwrap();
        assert_eq!(queue.priority_for("u1"), 3);
    }

    #[tokio::test]
    async fn workers_drain_the_queue() {
        let queue = Arc::new(IntakeQueue::new());
        let handler = RecordingHandler::new();
        queue.run_workers(3, handler.clone());

        for i in 0..10 {
            queue.submit(request(&format!("u{i}"), &format!("q{i}")));
        }

        wait_for(&handler, 10).await;
        assert_eq!(queue.queue_size(), 0);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn handler_failure_does_not_stop_the_worker() {
        let queue = Arc::new(IntakeQueue::new());
        let handler = RecordingHandler::new();
        queue.run_workers(1, handler.clone());

        queue.submit(request("u1", "boom"));
        queue.submit(request("u1", "fine"));

        wait_for(&handler, 2).await;
        assert_eq!(handler.seen.lock().as_slice(), ["boom", "fine"]);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_finishes_in_flight_work() {
        let queue = Arc::new(IntakeQueue::new());
        let handler = RecordingHandler::new();
        queue.run_workers(2, handler.clone());

        queue.submit(request("u1", "q1"));
        queue.submit(request("u2", "q2"));
        wait_for(&handler, 2).await;

        queue.shutdown().await;
        assert_eq!(handler.processed.load(AtomicOrdering::SeqCst), 2);

        // After shutdown, workers are gone and nothing processes.
        queue.submit(request("u3", "q3"));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(handler.processed.load(AtomicOrdering::SeqCst), 2);
    }
}
