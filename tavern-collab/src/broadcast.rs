//! Topic fan-out for the signaling relay.
//!
//! Each topic owns one tokio broadcast channel; every subscriber holds a
//! receiver that buffers up to `capacity` messages. Slow subscribers lag and
//! drop, they never block publishers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// One relayed message. `from` is the relay connection that published it.
#[derive(Debug, Clone)]
pub struct Relayed {
    pub from: u64,
    pub text: Arc<str>,
}

#[derive(Debug, Clone, Default)]
pub struct TopicStats {
    pub messages_sent: u64,
    pub subscribers: usize,
}

/// Subscribers of a single topic.
pub struct TopicGroup {
    sender: broadcast::Sender<Relayed>,
    subscribers: RwLock<HashSet<u64>>,
    capacity: usize,
    messages_sent: AtomicU64,
}

impl TopicGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            subscribers: RwLock::new(HashSet::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Register a connection. `None` when the topic is full.
    pub async fn subscribe(&self, conn: u64, max: usize) -> Option<broadcast::Receiver<Relayed>> {
        let mut subs = self.subscribers.write().await;
        if !subs.contains(&conn) && subs.len() >= max {
            return None;
        }
        subs.insert(conn);
        Some(self.sender.subscribe())
    }

    pub async fn unsubscribe(&self, conn: u64) -> bool {
        self.subscribers.write().await.remove(&conn)
    }

    /// Fan out to every receiver, the publisher's included. Returns the
    /// receiver count.
    pub fn publish(&self, from: u64, text: Arc<str>) -> usize {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.sender.send(Relayed { from, text }).unwrap_or(0)
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn stats(&self) -> TopicStats {
        TopicStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            subscribers: self.subscriber_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Topic name → group.
pub struct TopicManager {
    topics: RwLock<HashMap<String, Arc<TopicGroup>>>,
    default_capacity: usize,
}

impl TopicManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    pub async fn get_or_create(&self, topic: &str) -> Arc<TopicGroup> {
        // Fast path: read lock
        {
            let topics = self.topics.read().await;
            if let Some(group) = topics.get(topic) {
                return group.clone();
            }
        }

        let mut topics = self.topics.write().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(TopicGroup::new(self.default_capacity)))
            .clone()
    }

    pub async fn get(&self, topic: &str) -> Option<Arc<TopicGroup>> {
        self.topics.read().await.get(topic).cloned()
    }

    pub async fn remove_if_empty(&self, topic: &str) -> bool {
        let mut topics = self.topics.write().await;
        if let Some(group) = topics.get(topic) {
            if group.subscriber_count().await == 0 {
                topics.remove(topic);
                return true;
            }
        }
        false
    }

    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_topic_fan_out() {
        let group = TopicGroup::new(16);
        let mut rx1 = group.subscribe(1, 10).await.unwrap();
        let mut rx2 = group.subscribe(2, 10).await.unwrap();

        assert_eq!(group.publish(1, Arc::from("hi")), 2);
        assert_eq!(&*rx1.recv().await.unwrap().text, "hi");
        let got = rx2.recv().await.unwrap();
        assert_eq!(got.from, 1);
        assert_eq!(group.stats().await.messages_sent, 1);
    }

    #[tokio::test]
    async fn test_subscriber_limit() {
        let group = TopicGroup::new(16);
        assert!(group.subscribe(1, 1).await.is_some());
        assert!(group.subscribe(2, 1).await.is_none());
        // Re-subscribing an existing member is fine.
        assert!(group.subscribe(1, 1).await.is_some());
    }

    #[tokio::test]
    async fn test_manager_get_or_create() {
        let manager = TopicManager::new(16);
        let a = manager.get_or_create("room").await;
        let b = manager.get_or_create("room").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.topic_count().await, 1);
    }

    #[tokio::test]
    async fn test_manager_cleanup() {
        let manager = TopicManager::new(16);
        let group = manager.get_or_create("room").await;
        let _rx = group.subscribe(7, 10).await;
        assert!(!manager.remove_if_empty("room").await);
        group.unsubscribe(7).await;
        assert!(manager.remove_if_empty("room").await);
        assert!(manager.get("room").await.is_none());
    }
}
