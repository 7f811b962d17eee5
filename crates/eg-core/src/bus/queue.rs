use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::Notify;

use super::BusMessage;

// ---------------------------------------------------------------------------
// DropOldestQueue — bounded delivery queue backing one subscription
// ---------------------------------------------------------------------------

/// Bounded FIFO with drop-oldest overflow. Pushing never blocks: when the
/// queue is at capacity the oldest pending message is discarded and the drop
/// counter incremented.
pub(super) struct DropOldestQueue {
    buf: Mutex<VecDeque<BusMessage>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl DropOldestQueue {
    pub(super) fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0, "queue capacity is validated at subscribe");
        Self {
            buf: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue without blocking; drops the oldest entry on overflow.
    pub(super) fn push(&self, msg: BusMessage) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut buf = self.buf.lock().expect("queue lock poisoned");
            if buf.len() == self.capacity {
                buf.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            buf.push_back(msg);
        }
        self.notify.notify_one();
    }

    /// Await the next message; `None` once the queue is closed and drained.
    pub(super) async fn recv(&self) -> Option<BusMessage> {
        loop {
            {
                let mut buf = self.buf.lock().expect("queue lock poisoned");
                if let Some(msg) = buf.pop_front() {
                    return Some(msg);
                }
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking pop, for drain loops.
    pub(super) fn try_recv(&self) -> Option<BusMessage> {
        self.buf.lock().expect("queue lock poisoned").pop_front()
    }

    pub(super) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub(super) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(super) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub(super) fn len(&self) -> usize {
        self.buf.lock().expect("queue lock poisoned").len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn msg(n: u8) -> BusMessage {
        BusMessage {
            subject: format!("t.{n}"),
            payload: Bytes::from(vec![n]),
            reply: None,
        }
    }

    #[tokio::test]
    async fn fifo_within_capacity() {
        let q = DropOldestQueue::new(4);
        for n in 0..3 {
            q.push(msg(n));
        }
        for n in 0..3 {
            assert_eq!(q.recv().await.unwrap().payload[0], n);
        }
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        let q = DropOldestQueue::new(4);
        for n in 0..6 {
            q.push(msg(n));
        }
        assert_eq!(q.dropped(), 2);
        // The last 4 survive, in publish order.
        for n in 2..6 {
            assert_eq!(q.recv().await.unwrap().payload[0], n);
        }
    }

    #[tokio::test]
    async fn close_drains_then_returns_none() {
        let q = DropOldestQueue::new(4);
        q.push(msg(1));
        q.close();
        assert!(q.recv().await.is_some());
        assert!(q.recv().await.is_none());
    }

    #[tokio::test]
    async fn recv_wakes_on_push() {
        let q = std::sync::Arc::new(DropOldestQueue::new(4));
        let q2 = std::sync::Arc::clone(&q);
        let waiter = tokio::spawn(async move { q2.recv().await });
        tokio::task::yield_now().await;
        q.push(msg(7));
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.payload[0], 7);
    }
}
