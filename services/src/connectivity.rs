//! Online/offline state for the capture path.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use util::clock::SharedClock;
use util::config::AppConfig;
use util::events::{Event, EventBus};

pub const DEVICE_TOPIC: &str = "device";

#[derive(Debug, Serialize)]
pub struct NetworkStatusChanged {
    pub online: bool,
    pub at: DateTime<Utc>,
}

impl Event for NetworkStatusChanged {
    const NAME: &'static str = "network.status_changed";

    fn topic_path(&self) -> String {
        DEVICE_TOPIC.into()
    }
}

/// Shared connectivity flag. Watchers see every transition; the bus gets a
/// `network.status_changed` notification per transition.
#[derive(Clone)]
pub struct Connectivity {
    state: Arc<watch::Sender<bool>>,
    events: EventBus,
    clock: SharedClock,
}

impl Connectivity {
    pub fn new(initially_online: bool, events: EventBus, clock: SharedClock) -> Self {
        let (tx, _) = watch::channel(initially_online);
        Self {
            state: Arc::new(tx),
            events,
            clock,
        }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// Returns true when the state actually changed.
    pub async fn set_online(&self, online: bool) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if changed {
            tracing::info!(online, "network status changed");
            self.events
                .emit(&NetworkStatusChanged {
                    online,
                    at: self.clock.now(),
                })
                .await;
        }
        changed
    }

    /// Ask `probe` and record the answer.
    pub async fn refresh(&self, probe: &dyn ConnectivityProbe) -> bool {
        let online = probe.probe().await;
        self.set_online(online).await;
        online
    }
}

#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn probe(&self) -> bool;
}

/// Any HTTP response from the validation host counts as reachable.
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn from_config() -> Result<Self, reqwest::Error> {
        let config = AppConfig::global();
        Self::new(
            config.validation_url.clone(),
            Duration::from_secs(config.network_timeout_secs),
        )
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn probe(&self) -> bool {
        match self.client.head(&self.url).send().await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(url = %self.url, error = %e, "connectivity probe failed");
                false
            }
        }
    }
}
