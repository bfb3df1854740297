//! Concurrency-safe accumulating counter map.
//!
//! Writes stay off the hot path: producers submit an entry to a bounded
//! queue and move on, and a single consumer task serializes updates into
//! the map. Snapshots read under the map lock. Backpressure is possible if
//! producers outpace the consumer; each connection produces one entry, so
//! the queue depth covers typical inter-arrival times.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

/// Queue depth for inbound updates.
const QUEUE_DEPTH: usize = 64;

/// A single counter update.
#[derive(Debug, Clone)]
pub struct Entry {
    pub key: String,
    pub delta: i64,
    pub client: String,
}

#[derive(Default)]
struct Inner {
    tx: Option<mpsc::Sender<Entry>>,
    consumer: Option<JoinHandle<()>>,
}

/// An accumulating map of `key -> i64`, updated through a queue.
pub struct CounterMap {
    map: Arc<RwLock<HashMap<String, i64>>>,
    inner: Mutex<Inner>,
}

impl CounterMap {
    pub fn new() -> Self {
        CounterMap {
            map: Arc::new(RwLock::new(HashMap::new())),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Obtain the update queue, creating it and starting the consumer on
    /// first use.
    pub async fn put(&self) -> mpsc::Sender<Entry> {
        let mut inner = self.inner.lock().await;
        if let Some(tx) = &inner.tx {
            return tx.clone();
        }

        let (tx, mut rx) = mpsc::channel::<Entry>(QUEUE_DEPTH);
        let map = Arc::clone(&self.map);
        inner.consumer = Some(tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                let mut map = map.write().await;
                *map.entry(entry.key).or_insert(0) += entry.delta;
            }
        }));
        inner.tx = Some(tx.clone());
        tx
    }

    /// Obtain a copy of the underlying map. Entries still in the queue are
    /// not yet visible; the snapshot is eventually consistent.
    pub async fn copy(&self) -> HashMap<String, i64> {
        self.map.read().await.clone()
    }

    /// Close the update queue and wait for the consumer to drain it. The
    /// held sender is dropped; producers holding their own clones keep the
    /// consumer alive until they drop too.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.tx.take();
        if let Some(consumer) = inner.consumer.take() {
            let _ = consumer.await;
        }
    }
}

impl Default for CounterMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accumulates_all_queued_entries() {
        let map = CounterMap::new();
        let tx = map.put().await;

        for i in 0..100_000u32 {
            tx.send(Entry {
                key: format!("k{}", i % 7),
                delta: 1,
                client: "10.0.0.1".to_string(),
            })
            .await
            .unwrap();
        }
        drop(tx);
        map.close().await;

        let snapshot = map.copy().await;
        let total: i64 = snapshot.values().sum();
        assert_eq!(total, 100_000);
    }

    #[tokio::test]
    async fn put_returns_the_same_queue() {
        let map = CounterMap::new();
        let tx1 = map.put().await;
        let tx2 = map.put().await;

        tx1.send(Entry {
            key: "a".to_string(),
            delta: 2,
            client: String::new(),
        })
        .await
        .unwrap();
        tx2.send(Entry {
            key: "a".to_string(),
            delta: 3,
            client: String::new(),
        })
        .await
        .unwrap();

        drop(tx1);
        drop(tx2);
        map.close().await;

        assert_eq!(map.copy().await.get("a"), Some(&5));
    }

    #[tokio::test]
    async fn negative_deltas_accumulate() {
        let map = CounterMap::new();
        let tx = map.put().await;
        for delta in [5i64, -2, -3, 7] {
            tx.send(Entry {
                key: "net".to_string(),
                delta,
                client: String::new(),
            })
            .await
            .unwrap();
        }
        drop(tx);
        map.close().await;
        assert_eq!(map.copy().await.get("net"), Some(&7));
    }
}
