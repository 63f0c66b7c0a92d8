//! Process-wide change broadcaster
//!
//! Fans mutation events from the leader's write path out to any number of
//! subscriber channels. The upstream source is consumed by a single pump
//! task, started lazily on the first subscription. Publication never blocks:
//! a subscriber whose buffer is full simply misses events and is expected to
//! reconnect and replay.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::store::KeyValue;

/// Per-subscriber buffer capacity.
const SUBSCRIBER_BUFFER: usize = 100;

pub struct Broadcaster {
    source: Mutex<Option<mpsc::Receiver<KeyValue>>>,
    subscribers: Arc<Mutex<Vec<mpsc::Sender<KeyValue>>>>,
    cancel: CancellationToken,
}

impl Broadcaster {
    /// Create a broadcaster over the given upstream event source. The source
    /// is not consumed until somebody subscribes.
    pub fn new(source: mpsc::Receiver<KeyValue>, cancel: CancellationToken) -> Self {
        Self {
            source: Mutex::new(Some(source)),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            cancel,
        }
    }

    /// Register a new subscriber. Events arrive in source order; dropping
    /// the returned receiver unsubscribes.
    pub fn subscribe(&self) -> mpsc::Receiver<KeyValue> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers
            .lock()
            .expect("subscriber list mutex poisoned")
            .push(tx);

        // First subscriber connects the upstream.
        if let Some(source) = self
            .source
            .lock()
            .expect("broadcast source mutex poisoned")
            .take()
        {
            let subscribers = self.subscribers.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(pump(source, subscribers, cancel));
        }

        rx
    }
}

async fn pump(
    mut source: mpsc::Receiver<KeyValue>,
    subscribers: Arc<Mutex<Vec<mpsc::Sender<KeyValue>>>>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = source.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        subscribers
            .lock()
            .expect("subscriber list mutex poisoned")
            .retain(|tx| match tx.try_send(event.clone()) {
                Ok(()) => true,
                // Slow subscriber: drop the event for it, keep the stream.
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(key: &str, revision: i64) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            revision,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_fan_out_in_source_order() {
        let (tx, rx) = mpsc::channel(16);
        let broadcaster = Broadcaster::new(rx, CancellationToken::new());

        let mut sub1 = broadcaster.subscribe();
        let mut sub2 = broadcaster.subscribe();

        for revision in 1..=3 {
            tx.send(kv("foo", revision)).await.unwrap();
        }

        for sub in [&mut sub1, &mut sub2] {
            for revision in 1..=3 {
                let event = sub.recv().await.unwrap();
                assert_eq!(event.revision, revision);
            }
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_events() {
        let (tx, rx) = mpsc::channel(512);
        let broadcaster = Broadcaster::new(rx, CancellationToken::new());

        let mut slow = broadcaster.subscribe();
        let mut fast = broadcaster.subscribe();

        // Overrun the slow subscriber's buffer while the fast one keeps up.
        let total = SUBSCRIBER_BUFFER as i64 + 50;
        for revision in 1..=total {
            tx.send(kv("foo", revision)).await.unwrap();
            let event = fast.recv().await.unwrap();
            assert_eq!(event.revision, revision);
        }

        // The slow subscriber kept its buffered prefix and lost the rest;
        // publishing never blocked on it.
        for revision in 1..=(SUBSCRIBER_BUFFER as i64) {
            let event = slow.try_recv().unwrap();
            assert_eq!(event.revision, revision);
        }
        assert!(slow.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_removed() {
        let (tx, rx) = mpsc::channel(16);
        let broadcaster = Broadcaster::new(rx, CancellationToken::new());

        let first = broadcaster.subscribe();
        let mut second = broadcaster.subscribe();
        drop(first);

        tx.send(kv("foo", 1)).await.unwrap();
        assert_eq!(second.recv().await.unwrap().revision, 1);
        assert_eq!(broadcaster.subscribers.lock().unwrap().len(), 1);
    }
}
