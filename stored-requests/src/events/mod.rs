//! Asynchronous updates of cached stored data.
//!
//! Producers discover changes to stored data and publish them as [`Save`] and
//! [`Invalidation`] events on a pair of unbounded channels. An [`EventListener`] drains
//! the channels of one or more producers and applies the events to a cache.
//!
//! - [`HttpEvents`](http::HttpEvents) polls an HTTP endpoint.
//! - [`DatabaseEventProducer`](database::DatabaseEventProducer) polls SQL queries.
//! - [`api::router`] accepts pushed events over HTTP.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::{
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::fetcher::StoredMap;

pub mod api;
pub mod database;
pub mod http;
pub mod listener;

pub use listener::EventListener;

/// Data to add to, or overwrite in, the caches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Save {
    #[serde(default)]
    pub requests: StoredMap,
    #[serde(default)]
    pub imps: StoredMap,
    #[serde(default)]
    pub responses: StoredMap,
    #[serde(default)]
    pub accounts: StoredMap,
}

impl Save {
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
            && self.imps.is_empty()
            && self.responses.is_empty()
            && self.accounts.is_empty()
    }
}

/// IDs to drop from the caches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invalidation {
    #[serde(default)]
    pub requests: Vec<String>,
    #[serde(default)]
    pub imps: Vec<String>,
    #[serde(default)]
    pub responses: Vec<String>,
    #[serde(default)]
    pub accounts: Vec<String>,
}

impl Invalidation {
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
            && self.imps.is_empty()
            && self.responses.is_empty()
            && self.accounts.is_empty()
    }
}

/// The receiving side of a producer, handed to an [`EventListener`].
#[derive(Debug)]
pub struct EventChannels {
    pub saves: UnboundedReceiver<Save>,
    pub invalidations: UnboundedReceiver<Invalidation>,
}

/// The sending side of a producer. Cloning shares the same channels.
#[derive(Debug, Clone)]
pub struct EventSenders {
    saves: UnboundedSender<Save>,
    invalidations: UnboundedSender<Invalidation>,
}

pub fn event_channels() -> (EventSenders, EventChannels) {
    let (saves_tx, saves_rx) = unbounded_channel();
    let (invalidations_tx, invalidations_rx) = unbounded_channel();
    (
        EventSenders { saves: saves_tx, invalidations: invalidations_tx },
        EventChannels { saves: saves_rx, invalidations: invalidations_rx },
    )
}

impl EventSenders {
    /// Publishes `save` unless it's empty. Returns `false` if nobody is listening
    /// anymore.
    pub fn save(&self, save: Save) -> bool {
        if save.is_empty() {
            return true;
        }
        let sent = self.saves.send(save).is_ok();
        if !sent {
            tracing::debug!("Dropping save event, the listener is gone");
        }
        sent
    }

    /// Publishes `invalidation` unless it's empty. Returns `false` if nobody is
    /// listening anymore.
    pub fn invalidate(&self, invalidation: Invalidation) -> bool {
        if invalidation.is_empty() {
            return true;
        }
        let sent = self.invalidations.send(invalidation).is_ok();
        if !sent {
            tracing::debug!("Dropping invalidation event, the listener is gone");
        }
        sent
    }

    pub fn is_closed(&self) -> bool {
        self.saves.is_closed() && self.invalidations.is_closed()
    }
}

/// A background task that runs until told to stop.
#[derive(Debug)]
pub struct TaskHandle {
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TaskHandle {
    pub(crate) fn spawn<F, Fut>(run: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let stop = CancellationToken::new();
        let task = tokio::spawn(run(stop.clone()));
        Self { stop, task: Mutex::new(Some(task)) }
    }

    /// Signals the task to exit. Calling it more than once has no further effect.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Stops the task and waits for it to exit.
    pub async fn shutdown(&self) {
        self.stop();
        let task = self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::error!(error = %err, "Background stored data task failed");
            }
        }
    }
}
