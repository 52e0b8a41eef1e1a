//! Cross-thread work queues.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::SeqCst;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};

/// A FIFO queue whose handles can be cloned into any thread that needs to
/// produce or consume. Holding both channel ends in one value means a
/// `put` can never observe a disconnected channel.
///
/// Every `put` counts as outstanding work until a consumer acknowledges
/// it with [`WorkQueue::task_done`]; [`WorkQueue::wait_idle`] blocks until
/// all work has been acknowledged, not merely dequeued. This is what lets
/// shutdown wait for a worker that has taken a job but not yet pushed its
/// results.
pub struct WorkQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    unfinished: Arc<AtomicUsize>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            unfinished: self.unfinished.clone(),
        }
    }
}

impl<T> WorkQueue<T> {
    pub fn unbounded() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            unfinished: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            unfinished: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Blocking put; applies backpressure when the queue is bounded.
    pub fn put(&self, item: T) {
        self.unfinished.fetch_add(1, SeqCst);
        let _ = self.tx.send(item);
    }

    /// Non-blocking get. The item stays counted as outstanding until
    /// `task_done` is called for it.
    pub fn try_get(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Acknowledge one previously fetched item as fully processed.
    pub fn task_done(&self) {
        let _ = self
            .unfinished
            .fetch_update(SeqCst, SeqCst, |n| n.checked_sub(1));
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Discard everything currently queued, acknowledging each dropped
    /// item. Returns how many items were dropped.
    pub fn drain(&self) -> usize {
        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            self.task_done();
            dropped += 1;
        }
        dropped
    }

    /// Block until every put item has been acknowledged, polling at
    /// `poll` intervals.
    pub fn wait_idle(&self, poll: Duration) {
        while self.unfinished.load(SeqCst) != 0 {
            std::thread::sleep(poll);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let q = WorkQueue::unbounded();
        q.put(1);
        q.put(2);
        q.put(3);
        assert_eq!(q.len(), 3);
        assert_eq!(q.try_get(), Some(1));
        assert_eq!(q.try_get(), Some(2));
        assert_eq!(q.try_get(), Some(3));
        assert_eq!(q.try_get(), None);
    }

    #[test]
    fn drain_counts_dropped_items() {
        let q = WorkQueue::unbounded();
        for i in 0..10 {
            q.put(i);
        }
        assert_eq!(q.drain(), 10);
        assert!(q.is_empty());
        // drained items are acknowledged, so the queue is idle
        q.wait_idle(Duration::from_millis(1));
    }

    #[test]
    fn wait_idle_needs_task_done_not_just_dequeue() {
        let q = WorkQueue::bounded(4);
        q.put("a");

        let consumer = {
            let q = q.clone();
            std::thread::spawn(move || {
                let item = q.try_get().unwrap();
                // the item is out of the queue but still outstanding
                std::thread::sleep(Duration::from_millis(100));
                q.task_done();
                item
            })
        };

        let started = std::time::Instant::now();
        q.wait_idle(Duration::from_millis(5));
        assert!(started.elapsed() >= Duration::from_millis(90));
        assert_eq!(consumer.join().unwrap(), "a");
    }

    #[test]
    fn excess_task_done_saturates_at_zero() {
        let q: WorkQueue<u8> = WorkQueue::unbounded();
        q.task_done();
        q.put(1);
        assert_eq!(q.try_get(), Some(1));
        q.task_done();
        q.wait_idle(Duration::from_millis(1));
    }

    #[test]
    fn clones_share_the_same_queue() {
        let q = WorkQueue::bounded(4);
        let q2 = q.clone();
        q.put("a");
        assert_eq!(q2.try_get(), Some("a"));
    }
}
