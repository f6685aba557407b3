//! Topic-based notification hub.
//!
//! Components publish observable notifications ("offline attendance recorded",
//! "network status changed", "session updated") as JSON envelopes on a topic; UI
//! shells and background tasks subscribe to the topics they care about. Uses Tokio
//! broadcast channels per topic.

use crate::clock::{SharedClock, system_clock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};

type Topic = String;
type Sender = broadcast::Sender<String>;
type Receiver = broadcast::Receiver<String>;

const CHANNEL_CAPACITY: usize = 100;

/// An event knows its stable name and the topic it belongs to.
pub trait Event: Serialize {
    const NAME: &'static str;
    /// Return the canonical topic path (e.g., "device" or "attendance:session:<id>").
    fn topic_path(&self) -> String;
}

/// Standard event envelope sent on every topic.
#[derive(Serialize)]
pub struct EventEnvelope<'a, T> {
    pub event: &'a str,
    pub topic: &'a str,
    pub payload: T,
    pub ts: String,
}

/// Manages broadcast channels per topic.
///
/// - Lazily creates broadcast channels per topic on first subscription
/// - Removes topics when their subscriber count drops to zero after sending
/// - Stamps envelopes from the clock it was built with
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<RwLock<HashMap<Topic, Sender>>>,
    clock: SharedClock,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(system_clock())
    }
}

impl EventBus {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            inner: Arc::default(),
            clock,
        }
    }

    /// Subscribes to the given topic, creating it if necessary.
    pub async fn subscribe(&self, topic: &str) -> Receiver {
        let mut map = self.inner.write().await;
        map.entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Broadcasts a message to all subscribers of `topic`.
    ///
    /// If the topic does not exist, it's a no-op.
    pub async fn broadcast<T: Into<String>>(&self, topic: &str, msg: T) {
        let mut map = self.inner.write().await;
        if let Some(sender) = map.get(topic) {
            let _ = sender.send(msg.into());
            if sender.receiver_count() == 0 {
                tracing::debug!("Removing topic '{topic}' due to no subscribers.");
                map.remove(topic);
            }
        }
    }

    /// Wraps `ev` in an [`EventEnvelope`] and broadcasts it on its own topic.
    pub async fn emit<E: Event>(&self, ev: &E) {
        let topic = ev.topic_path();
        let env = EventEnvelope {
            event: E::NAME,
            topic: &topic,
            payload: ev,
            ts: self.clock.now().to_rfc3339(),
        };
        match serde_json::to_string(&env) {
            Ok(json) => self.broadcast(&topic, json).await,
            Err(e) => tracing::warn!(event = E::NAME, "Failed to serialize event: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};
    use tokio::time::{Duration, timeout};

    #[derive(Serialize)]
    struct Ping {
        n: u32,
    }

    impl Event for Ping {
        const NAME: &'static str = "test.ping";
        fn topic_path(&self) -> String {
            "test".into()
        }
    }

    #[tokio::test]
    async fn it_broadcasts_to_all_subscribers() {
        let bus = EventBus::default();
        let mut r1 = bus.subscribe("test").await;
        let mut r2 = bus.subscribe("test").await;

        bus.emit(&Ping { n: 7 }).await;

        for rx in [&mut r1, &mut r2] {
            let raw = timeout(Duration::from_millis(50), rx.recv())
                .await
                .unwrap()
                .unwrap();
            let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
            assert_eq!(v["event"], "test.ping");
            assert_eq!(v["payload"]["n"], 7);
        }
    }

    #[tokio::test]
    async fn it_stamps_envelopes_from_its_clock() {
        let at = Utc.with_ymd_and_hms(2025, 3, 3, 8, 0, 0).unwrap();
        let bus = EventBus::new(Arc::new(ManualClock::new(at)));
        let mut rx = bus.subscribe("test").await;

        bus.emit(&Ping { n: 1 }).await;

        let raw = timeout(Duration::from_millis(50), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["ts"], at.to_rfc3339());
    }

    #[tokio::test]
    async fn it_ignores_topics_without_subscribers() {
        let bus = EventBus::default();
        bus.broadcast("nobody", "hello").await;
        assert!(bus.inner.read().await.is_empty());
    }

    #[tokio::test]
    async fn it_drops_topic_once_all_receivers_are_gone() {
        let bus = EventBus::default();
        let rx = bus.subscribe("short-lived").await;
        drop(rx);

        bus.broadcast("short-lived", "bye").await;
        assert!(!bus.inner.read().await.contains_key("short-lived"));
    }
}
