mod queue;
pub mod stream;
pub mod subject;

pub use stream::{PersistentStream, PullConsumer, StreamEntry};
pub use subject::{
    aggregated_subject, alert_subject, error_subject, processed_subject, raw_subject,
    subject_matches,
};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use orion_error::prelude::*;

use crate::error::{CoreReason, CoreResult};
use queue::DropOldestQueue;

// ---------------------------------------------------------------------------
// BusMessage
// ---------------------------------------------------------------------------

/// One delivered bus message. `reply` is set only for request/reply traffic.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Bytes,
    pub reply: Option<String>,
}

// ---------------------------------------------------------------------------
// Bus — embedded process-local pub/sub
// ---------------------------------------------------------------------------

struct SubEntry {
    id: u64,
    pattern: String,
    group: Option<String>,
    queue: Arc<DropOldestQueue>,
}

struct BusInner {
    subs: RwLock<Vec<Arc<SubEntry>>>,
    /// Round-robin cursor per queue-group name.
    group_cursors: Mutex<HashMap<String, usize>>,
    next_id: AtomicU64,
    next_inbox: AtomicU64,
    default_queue_size: usize,
    stream: RwLock<Option<Arc<PersistentStream>>>,
}

/// Embedded message bus. Publish is non-blocking: a full subscription queue
/// drops its oldest pending message and records the drop; no at-least-once
/// guarantee is made for non-persistent subjects.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    pub fn new(default_queue_size: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subs: RwLock::new(Vec::new()),
                group_cursors: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                next_inbox: AtomicU64::new(1),
                default_queue_size: default_queue_size.max(1),
                stream: RwLock::new(None),
            }),
        }
    }

    /// Attach the durable stream; publishes matching its subject set are
    /// appended before fan-out.
    pub fn attach_stream(&self, stream: Arc<PersistentStream>) {
        *self.inner.stream.write().expect("bus lock poisoned") = Some(stream);
    }

    pub fn stream(&self) -> Option<Arc<PersistentStream>> {
        self.inner.stream.read().expect("bus lock poisoned").clone()
    }

    /// Publish `payload` under `subject`.
    ///
    /// Fan-out to subscribers always completes; a durable-stream append
    /// failure is surfaced to the publisher afterwards as `Storage`.
    pub fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> CoreResult<()> {
        self.publish_message(BusMessage {
            subject: subject.to_string(),
            payload: payload.into(),
            reply: None,
        })
    }

    fn publish_message(&self, msg: BusMessage) -> CoreResult<()> {
        subject::validate_subject(&msg.subject)
            .map_err(|e| StructError::from(CoreReason::Config).with_detail(e))?;

        let stream_err = match self.stream() {
            Some(stream) if stream.accepts(&msg.subject) => {
                stream.append(&msg.subject, &msg.payload).err()
            }
            _ => None,
        };

        let matching: Vec<Arc<SubEntry>> = {
            let subs = self.inner.subs.read().expect("bus lock poisoned");
            subs.iter()
                .filter(|s| subject_matches(&s.pattern, &msg.subject))
                .cloned()
                .collect()
        };

        // Ungrouped subscriptions all receive the message; grouped ones
        // load-balance round-robin within the group name.
        let mut groups: HashMap<&str, Vec<&Arc<SubEntry>>> = HashMap::new();
        for entry in &matching {
            match &entry.group {
                None => entry.queue.push(msg.clone()),
                Some(g) => groups.entry(g.as_str()).or_default().push(entry),
            }
        }
        if !groups.is_empty() {
            let mut cursors = self.inner.group_cursors.lock().expect("bus lock poisoned");
            for (group, members) in groups {
                let cursor = cursors.entry(group.to_string()).or_insert(0);
                let pick = *cursor % members.len();
                *cursor = cursor.wrapping_add(1);
                members[pick].queue.push(msg.clone());
            }
        }

        match stream_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Subscribe to `pattern`. `queue_size = None` uses the bus default;
    /// an explicit zero is rejected at configuration time.
    pub fn subscribe(
        &self,
        pattern: &str,
        group: Option<&str>,
        queue_size: Option<usize>,
    ) -> CoreResult<Subscription> {
        subject::validate_pattern(pattern)
            .map_err(|e| StructError::from(CoreReason::Config).with_detail(e))?;
        let capacity = match queue_size {
            Some(0) => {
                return Err(StructError::from(CoreReason::Config)
                    .with_detail(format!("subscription queue size 0 for {pattern:?}")));
            }
            Some(n) => n,
            None => self.inner.default_queue_size,
        };

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(SubEntry {
            id,
            pattern: pattern.to_string(),
            group: group.map(str::to_string),
            queue: Arc::new(DropOldestQueue::new(capacity)),
        });
        self.inner
            .subs
            .write()
            .expect("bus lock poisoned")
            .push(Arc::clone(&entry));

        Ok(Subscription {
            entry,
            bus: Arc::downgrade(&self.inner),
        })
    }

    /// Synchronous request/reply over an ephemeral `_inbox` subject. Used by
    /// the plugin supervisor's control channel only.
    pub async fn request(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> CoreResult<Bytes> {
        let inbox = format!(
            "_inbox.{}",
            self.inner.next_inbox.fetch_add(1, Ordering::Relaxed)
        );
        let sub = self.subscribe(&inbox, None, Some(1))?;
        self.publish_message(BusMessage {
            subject: subject.to_string(),
            payload: payload.into(),
            reply: Some(inbox),
        })?;

        match tokio::time::timeout(timeout, sub.recv()).await {
            Ok(Some(reply)) => Ok(reply.payload),
            Ok(None) => Err(StructError::from(CoreReason::Plugin)
                .with_detail("reply subscription closed")),
            Err(_) => Err(StructError::from(CoreReason::Plugin)
                .with_detail(format!("request to {subject:?} timed out after {timeout:?}"))),
        }
    }

    /// Snapshot of per-subscription drop counters for telemetry.
    pub fn subscription_stats(&self) -> Vec<SubscriptionStats> {
        let subs = self.inner.subs.read().expect("bus lock poisoned");
        subs.iter()
            .map(|s| SubscriptionStats {
                pattern: s.pattern.clone(),
                group: s.group.clone(),
                queued: s.queue.len(),
                dropped: s.queue.dropped(),
            })
            .collect()
    }
}

impl BusInner {
    fn remove(&self, id: u64) {
        let mut subs = self.subs.write().expect("bus lock poisoned");
        subs.retain(|s| s.id != id);
    }
}

#[derive(Debug, Clone)]
pub struct SubscriptionStats {
    pub pattern: String,
    pub group: Option<String>,
    pub queued: usize,
    pub dropped: u64,
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Handle to one subscription. Dropping it (or calling [`close`]) detaches
/// the queue from the bus.
///
/// [`close`]: Subscription::close
pub struct Subscription {
    entry: Arc<SubEntry>,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Await the next matching message; `None` after [`close`](Self::close).
    pub async fn recv(&self) -> Option<BusMessage> {
        self.entry.queue.recv().await
    }

    /// Non-blocking pop, for drain loops during shutdown.
    pub fn try_recv(&self) -> Option<BusMessage> {
        self.entry.queue.try_recv()
    }

    pub fn pattern(&self) -> &str {
        &self.entry.pattern
    }

    /// Messages discarded because this subscription's queue was full.
    pub fn dropped(&self) -> u64 {
        self.entry.queue.dropped()
    }

    pub fn close(&self) {
        self.entry.queue.close();
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.entry.id);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.entry.queue.is_closed()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fanout_to_all_ungrouped() {
        let bus = Bus::new(16);
        let a = bus.subscribe("raw.>", None, None).unwrap();
        let b = bus.subscribe("raw.*.temp", None, None).unwrap();
        let c = bus.subscribe("processed.>", None, None).unwrap();

        bus.publish("raw.d1.temp", &b"x"[..]).unwrap();

        assert_eq!(a.recv().await.unwrap().subject, "raw.d1.temp");
        assert_eq!(b.recv().await.unwrap().subject, "raw.d1.temp");
        assert_eq!(c.try_recv().map(|m| m.subject), None);
    }

    #[tokio::test]
    async fn queue_group_load_balances() {
        let bus = Bus::new(16);
        let a = bus.subscribe("raw.>", Some("workers"), None).unwrap();
        let b = bus.subscribe("raw.>", Some("workers"), None).unwrap();

        for i in 0..6 {
            bus.publish(&format!("raw.d1.k{i}"), &b"x"[..]).unwrap();
        }

        let mut got_a = 0;
        while a.try_recv().is_some() {
            got_a += 1;
        }
        let mut got_b = 0;
        while b.try_recv().is_some() {
            got_b += 1;
        }
        assert_eq!(got_a + got_b, 6);
        assert_eq!(got_a, 3);
        assert_eq!(got_b, 3);
    }

    #[tokio::test]
    async fn drop_oldest_preserves_publish_order_of_survivors() {
        let bus = Bus::new(16);
        let sub = bus.subscribe("s.>", None, Some(4)).unwrap();

        for i in 0..6u8 {
            bus.publish("s.t", vec![i]).unwrap();
        }

        let mut seen = Vec::new();
        while let Some(m) = sub.try_recv() {
            seen.push(m.payload[0]);
        }
        assert_eq!(seen, vec![2, 3, 4, 5]);
        assert_eq!(sub.dropped(), 2);
    }

    #[tokio::test]
    async fn zero_queue_size_rejected() {
        let bus = Bus::new(16);
        assert!(bus.subscribe("raw.>", None, Some(0)).is_err());
    }

    #[tokio::test]
    async fn publish_wildcard_subject_rejected() {
        let bus = Bus::new(16);
        assert!(bus.publish("raw.*.temp", &b"x"[..]).is_err());
    }

    #[tokio::test]
    async fn dropped_subscription_stops_matching() {
        let bus = Bus::new(16);
        {
            let _sub = bus.subscribe("raw.>", None, None).unwrap();
            assert_eq!(bus.subscription_stats().len(), 1);
        }
        assert_eq!(bus.subscription_stats().len(), 0);
    }

    #[tokio::test]
    async fn request_reply_round_trip() {
        let bus = Bus::new(16);
        let server = bus.subscribe("ctl.ping", None, None).unwrap();
        let bus2 = bus.clone();
        tokio::spawn(async move {
            let msg = server.recv().await.unwrap();
            let reply = msg.reply.unwrap();
            bus2.publish(&reply, &b"pong"[..]).unwrap();
        });

        let reply = bus
            .request("ctl.ping", &b"ping"[..], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(&reply[..], b"pong");
    }

    #[tokio::test]
    async fn request_times_out_without_responder() {
        let bus = Bus::new(16);
        let err = bus
            .request("ctl.nobody", &b"hi"[..], Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
