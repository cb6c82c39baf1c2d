//! Polling of an HTTP endpoint for stored data changes.
//!
//! On start the producer fetches `GET {endpoint}` and publishes everything as one
//! [`Save`], retrying on every tick until that full load succeeds. Then, on every tick,
//! it fetches `GET {endpoint}?last-modified={RFC 3339}` with the time of the last
//! successful poll. Entries of the form
//! `{"deleted": true}` in a delta are published as an [`Invalidation`], the rest as a
//! [`Save`].

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::Value;
use tokio::time::MissedTickBehavior;
use tracing::instrument;
use url::Url;

use super::{EventChannels, EventSenders, Invalidation, Save, TaskHandle, event_channels};
use crate::{
    context::FetchContext,
    fetcher::{FetchError, FetchErrorKind, StoredMap},
};

#[derive(Debug, Default, Deserialize)]
struct Changes {
    #[serde(default)]
    requests: StoredMap,
    #[serde(default)]
    imps: StoredMap,
    #[serde(default)]
    responses: StoredMap,
    #[serde(default)]
    accounts: StoredMap,
}

/// Moves the `{"deleted": true}` entries out of `changes`, returning their IDs.
fn extract_deleted(changes: &mut StoredMap) -> Vec<String> {
    let mut deleted: Vec<String> = changes
        .iter()
        .filter(|(_, json)| {
            json.parse::<Value>()
                .is_ok_and(|value| value.get("deleted") == Some(&Value::Bool(true)))
        })
        .map(|(id, _)| id.clone())
        .collect();
    deleted.sort();
    for id in &deleted {
        changes.remove(id);
    }
    deleted
}

#[derive(Debug)]
pub struct HttpEvents {
    client: reqwest::Client,
    endpoint: Url,
    timeout: Duration,
    senders: EventSenders,
    last_update: Option<DateTime<Utc>>,
}

impl HttpEvents {
    pub fn new(
        client: reqwest::Client,
        endpoint: &str,
        timeout: Duration,
    ) -> Result<(Self, EventChannels), FetchError> {
        let endpoint = Url::parse(endpoint)?;
        let (senders, channels) = event_channels();
        let events = Self { client, endpoint, timeout, senders, last_update: None };
        Ok((events, channels))
    }

    /// The time sent as `last-modified` on the next delta poll, `None` until a full load
    /// has succeeded.
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    async fn get(&self, ctx: &FetchContext, url: Url) -> Result<Changes, FetchError> {
        let ctx = ctx.child_with_timeout(self.timeout);
        let response = ctx.run(self.client.get(url).send()).await??;
        let status = response.status();
        let body = ctx.run(response.bytes()).await??;
        if status != reqwest::StatusCode::OK {
            return Err(FetchErrorKind::HttpStatus {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            }
            .into());
        }
        Ok(serde_json::from_slice(&body)?)
    }

    /// Loads every stored object and publishes them as one save. On success `now`
    /// becomes the watermark.
    #[instrument(skip(self, ctx), fields(endpoint = %self.endpoint))]
    pub async fn fetch_all(
        &mut self,
        ctx: &FetchContext,
        now: DateTime<Utc>,
    ) -> Result<(), FetchError> {
        let changes = self.get(ctx, self.endpoint.clone()).await?;
        self.senders.save(Save {
            requests: changes.requests,
            imps: changes.imps,
            responses: changes.responses,
            accounts: changes.accounts,
        });
        self.last_update = Some(now);
        Ok(())
    }

    /// Fetches the changes since the last successful poll, or everything if no full load
    /// has succeeded yet. On success `now` becomes the new watermark.
    #[instrument(skip(self, ctx), fields(endpoint = %self.endpoint))]
    pub async fn refresh(
        &mut self,
        ctx: &FetchContext,
        now: DateTime<Utc>,
    ) -> Result<(), FetchError> {
        let Some(since) = self.last_update else {
            return self.fetch_all(ctx, now).await;
        };
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("last-modified", &since.to_rfc3339_opts(SecondsFormat::Secs, true));
        let mut changes = self.get(ctx, url).await?;

        let invalidation = Invalidation {
            requests: extract_deleted(&mut changes.requests),
            imps: extract_deleted(&mut changes.imps),
            responses: extract_deleted(&mut changes.responses),
            accounts: extract_deleted(&mut changes.accounts),
        };
        self.senders.save(Save {
            requests: changes.requests,
            imps: changes.imps,
            responses: changes.responses,
            accounts: changes.accounts,
        });
        self.senders.invalidate(invalidation);
        self.last_update = Some(now);
        Ok(())
    }

    /// Loads everything now, then polls for changes every `refresh_rate` until stopped.
    /// A failed poll is logged and retried on the next tick, a failed full load included.
    pub fn start(mut self, refresh_rate: Duration) -> TaskHandle {
        TaskHandle::spawn(move |stop| async move {
            let ctx = FetchContext::with_cancellation(stop.clone());
            if let Err(err) = self.fetch_all(&ctx, Utc::now()).await {
                tracing::error!(error = %err, "Failed to load stored data over HTTP");
            }
            let mut ticker = tokio::time::interval(refresh_rate);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.refresh(&ctx, Utc::now()).await {
                            if ctx.check().is_err() {
                                break;
                            }
                            tracing::error!(error = %err, "Failed to refresh stored data over HTTP");
                        }
                    }
                }
            }
            tracing::debug!("Stopped polling stored data over HTTP");
        })
    }
}
