use futures::{
    StreamExt,
    stream::{self, BoxStream},
};
use tokio::sync::mpsc::UnboundedReceiver;

use super::{EventChannels, Invalidation, Save, TaskHandle};
use crate::cache::Cache;

#[derive(Debug)]
enum Event {
    Save(Save),
    Invalidation(Invalidation),
}

fn receiver_stream<T, F>(receiver: UnboundedReceiver<T>, wrap: F) -> BoxStream<'static, Event>
where
    T: Send + 'static,
    F: Fn(T) -> Event + Send + 'static,
{
    stream::unfold((receiver, wrap), |(mut receiver, wrap)| async move {
        let event = receiver.recv().await?;
        Some((wrap(event), (receiver, wrap)))
    })
    .boxed()
}

/// Applies the events of one or more producers to a [`Cache`].
///
/// Events from one channel are applied in the order they were sent. The listener runs
/// until [`stop`](EventListener::stop) is called or every producer has gone away.
#[derive(Debug)]
pub struct EventListener {
    task: TaskHandle,
}

impl EventListener {
    pub fn spawn(cache: Cache, producers: Vec<EventChannels>) -> Self {
        let streams = producers.into_iter().flat_map(|channels| {
            [
                receiver_stream(channels.saves, Event::Save),
                receiver_stream(channels.invalidations, Event::Invalidation),
            ]
        });
        let mut events = stream::select_all(streams);
        let task = TaskHandle::spawn(move |stop| async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    event = events.next() => match event {
                        Some(event) => apply(&cache, event).await,
                        None => {
                            tracing::debug!("Every event producer is gone, stopping the listener");
                            break;
                        }
                    },
                }
            }
        });
        Self { task }
    }

    /// Stops applying events. Calling it more than once has no further effect.
    pub fn stop(&self) {
        self.task.stop();
    }

    /// Stops the listener and waits until it no longer touches the cache.
    pub async fn shutdown(&self) {
        self.task.shutdown().await;
    }
}

async fn apply(cache: &Cache, event: Event) {
    match event {
        Event::Save(save) => {
            tracing::debug!(
                requests = save.requests.len(),
                imps = save.imps.len(),
                responses = save.responses.len(),
                accounts = save.accounts.len(),
                "Saving stored data"
            );
            cache.requests.save(&save.requests).await;
            cache.imps.save(&save.imps).await;
            cache.responses.save(&save.responses).await;
            cache.accounts.save(&save.accounts).await;
        }
        Event::Invalidation(invalidation) => {
            tracing::debug!(
                requests = invalidation.requests.len(),
                imps = invalidation.imps.len(),
                responses = invalidation.responses.len(),
                accounts = invalidation.accounts.len(),
                "Invalidating stored data"
            );
            cache.requests.invalidate(&invalidation.requests).await;
            cache.imps.invalidate(&invalidation.imps).await;
            cache.responses.invalidate(&invalidation.responses).await;
            cache.accounts.invalidate(&invalidation.accounts).await;
        }
    }
}
