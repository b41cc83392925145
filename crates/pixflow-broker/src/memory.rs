//! In-process partitioned log
//!
//! Used by the single-process pipeline and by every test. Semantics mirror the
//! subset of a real broker the stages rely on: per-key partition affinity,
//! per-partition ordering, per-group committed offsets and replay from the
//! committed position on re-subscribe. A subscription is the only member of
//! its group, so it owns every partition of the topic.

use crate::error::{BrokerError, Result};
use crate::message::{partition_for, Delivery, Message};
use crate::{Broker, Subscription};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Default partition count for new topics
pub const DEFAULT_PARTITIONS: u32 = 4;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Entry {
    seq: u64,
    message: Message,
}

struct TopicLog {
    name: String,
    partitions: Vec<Mutex<Vec<Entry>>>,
    next_seq: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
    /// Committed position (next offset to read) per partition, by group
    committed: Mutex<HashMap<String, Vec<u64>>>,
}

impl TopicLog {
    fn new(name: &str, partitions: u32) -> Self {
        Self {
            name: name.to_string(),
            partitions: (0..partitions.max(1)).map(|_| Mutex::new(Vec::new())).collect(),
            next_seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
            committed: Mutex::new(HashMap::new()),
        }
    }

    fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }
}

/// In-memory [`Broker`] implementation
pub struct MemoryBroker {
    partitions: u32,
    topics: DashMap<String, Arc<TopicLog>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(DEFAULT_PARTITIONS)
    }
}

impl MemoryBroker {
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: partitions.max(1),
            topics: DashMap::new(),
        }
    }

    fn topic(&self, name: &str) -> Arc<TopicLog> {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(TopicLog::new(name, self.partitions)))
            .clone()
    }

    /// All messages of a topic in global publish order
    pub fn snapshot(&self, topic: &str) -> Vec<Message> {
        let log = self.topic(topic);
        let mut entries: Vec<(u64, Message)> = log
            .partitions
            .iter()
            .flat_map(|p| {
                lock(p)
                    .iter()
                    .map(|e| (e.seq, e.message.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, m)| m).collect()
    }

    /// Number of messages ever published to a topic
    pub fn len(&self, topic: &str) -> usize {
        self.topic(topic).partitions.iter().map(|p| lock(p).len()).sum()
    }

    pub fn is_empty(&self, topic: &str) -> bool {
        self.len(topic) == 0
    }

    /// Committed position (next offset to read) of `group` on one partition
    pub fn committed(&self, topic: &str, group: &str, partition: u32) -> u64 {
        let log = self.topic(topic);
        let committed = lock(&log.committed);
        committed
            .get(group)
            .and_then(|offsets| offsets.get(partition as usize).copied())
            .unwrap_or(0)
    }

    pub fn is_closed(&self, topic: &str) -> bool {
        self.topic(topic).closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, message: Message) -> Result<()> {
        let log = self.topic(topic);
        if log.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::TopicClosed(topic.to_string()));
        }

        let partition = partition_for(&message.key, log.partition_count());
        let offset = {
            let mut entries = lock(&log.partitions[partition as usize]);
            let seq = log.next_seq.fetch_add(1, Ordering::SeqCst);
            entries.push(Entry { seq, message });
            entries.len() - 1
        };
        trace!(topic, partition, offset, "Message appended");

        log.notify.notify_waiters();
        Ok(())
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<Box<dyn Subscription>> {
        let log = self.topic(topic);
        let positions = {
            let committed = lock(&log.committed);
            committed
                .get(group)
                .cloned()
                .unwrap_or_else(|| vec![0; log.partitions.len()])
        };
        debug!(topic, group, ?positions, "Subscribed to in-memory topic");

        Ok(Box::new(MemorySubscription {
            log,
            group: group.to_string(),
            cursor: Mutex::new(Cursor {
                positions,
                next_partition: 0,
            }),
        }))
    }

    async fn close_topic(&self, topic: &str) -> Result<()> {
        let log = self.topic(topic);
        log.closed.store(true, Ordering::SeqCst);
        log.notify.notify_waiters();
        debug!(topic, "Topic closed");
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

struct Cursor {
    positions: Vec<u64>,
    next_partition: usize,
}

struct MemorySubscription {
    log: Arc<TopicLog>,
    group: String,
    cursor: Mutex<Cursor>,
}

impl MemorySubscription {
    /// Take the next unread message, rotating across partitions
    fn try_next(&self) -> Option<Delivery> {
        let mut cursor = lock(&self.cursor);
        let count = self.log.partitions.len();

        for step in 0..count {
            let partition = (cursor.next_partition + step) % count;
            let position = cursor.positions[partition];
            let entries = lock(&self.log.partitions[partition]);
            if let Some(entry) = entries.get(position as usize) {
                let delivery = Delivery {
                    topic: self.log.name.clone(),
                    partition: partition as u32,
                    offset: position,
                    message: entry.message.clone(),
                };
                drop(entries);
                cursor.positions[partition] = position + 1;
                cursor.next_partition = (partition + 1) % count;
                return Some(delivery);
            }
        }

        None
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&self) -> Result<Option<Delivery>> {
        loop {
            let notified = self.log.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_next() {
                return Ok(Some(delivery));
            }
            if self.log.closed.load(Ordering::SeqCst) {
                // a publish may have landed between the read and the close check
                return Ok(self.try_next());
            }

            notified.await;
        }
    }

    async fn commit(&self, delivery: &Delivery) -> Result<()> {
        if delivery.topic != self.log.name {
            return Err(BrokerError::Commit(format!(
                "delivery from topic '{}' committed on subscription to '{}'",
                delivery.topic, self.log.name
            )));
        }

        let mut committed = lock(&self.log.committed);
        let offsets = committed
            .entry(self.group.clone())
            .or_insert_with(|| vec![0; self.log.partitions.len()]);
        let slot = offsets
            .get_mut(delivery.partition as usize)
            .ok_or_else(|| BrokerError::Commit(format!("unknown partition {}", delivery.partition)))?;
        *slot = (*slot).max(delivery.offset + 1);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_then_consume_until_closed() {
        let broker = MemoryBroker::new(2);
        for i in 0..5 {
            broker
                .publish("ingest", Message::new(format!("k{}", i), format!("v{}", i)))
                .await
                .unwrap();
        }
        broker.close_topic("ingest").await.unwrap();

        let sub = broker.subscribe("ingest", "downloader").await.unwrap();
        let mut seen = Vec::new();
        while let Some(delivery) = sub.next().await.unwrap() {
            seen.push(delivery.message.value_str().unwrap().to_string());
        }
        seen.sort();
        assert_eq!(seen, vec!["v0", "v1", "v2", "v3", "v4"]);
    }

    #[tokio::test]
    async fn test_publish_after_close_is_rejected() {
        let broker = MemoryBroker::default();
        broker.close_topic("errors").await.unwrap();
        let err = broker.publish("errors", Message::new("k", "v")).await;
        assert!(matches!(err, Err(BrokerError::TopicClosed(_))));
    }

    #[tokio::test]
    async fn test_snapshot_preserves_publish_order() {
        let broker = MemoryBroker::new(8);
        for i in 0..20 {
            broker
                .publish("ingest", Message::new(format!("key-{}", i), i.to_string()))
                .await
                .unwrap();
        }
        let values: Vec<String> = broker
            .snapshot("ingest")
            .iter()
            .map(|m| m.value_str().unwrap().to_string())
            .collect();
        let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
        assert_eq!(values, expected);
    }
}
