//! Multi-relay query engine: concurrent fan-out, dedup with
//! latest-timestamp-wins resolution, progress reporting, cooperative
//! cancellation, and publish fan-out.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::event::{DedupKey, Event};
use crate::filter::Filter;
use crate::relay::{self, NetOptions, PublishOutcome, RelayDescriptor};

/// Tunables threaded through every query.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// A relay is abandoned after this long without a completion marker.
    pub per_relay_timeout: Duration,
    /// The whole query resolves with partial results after this long.
    pub overall_deadline: Duration,
    /// Verify id and signature of every received record; invalid records
    /// are skipped, not fatal.
    pub verify: bool,
    /// Connection-level options.
    pub net: NetOptions,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            per_relay_timeout: Duration::from_secs(10),
            overall_deadline: Duration::from_secs(30),
            verify: true,
            net: NetOptions::default(),
        }
    }
}

/// Progress updates emitted while a query runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryUpdate {
    /// A record passed dedup; `count` is the running accepted total.
    Accepted {
        /// Running count of accepted records.
        count: usize,
    },
    /// One relay finished or was abandoned.
    RelayDone {
        /// The relay's address.
        url: String,
    },
}

/// Insertion-ordered accumulator applying the dedup rule.
///
/// Plain records are kept once by id. Replaceable and addressable records
/// keep only the greatest-timestamp instance per key, in the slot where the
/// key first appeared; a later-arriving record with a smaller or equal
/// timestamp for an already-seen key is discarded, not merged.
#[derive(Debug, Default)]
pub struct Accumulator {
    slots: Vec<Event>,
    by_key: HashMap<DedupKey, usize>,
}

impl Accumulator {
    /// Empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a record. Returns `true` only when a new key was accepted,
    /// which is when progress counters advance.
    pub fn offer(&mut self, ev: Event) -> bool {
        let key = DedupKey::of(&ev);
        match self.by_key.get(&key) {
            None => {
                self.by_key.insert(key, self.slots.len());
                self.slots.push(ev);
                true
            }
            Some(&idx) => {
                if ev.created_at > self.slots[idx].created_at {
                    self.slots[idx] = ev;
                }
                false
            }
        }
    }

    /// Number of accepted records.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when nothing was accepted.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Consume into the accepted records, first-accepted order.
    pub fn into_events(self) -> Vec<Event> {
        self.slots
    }
}

/// Fan a query out to every relay in `relays` concurrently and merge the
/// answers into one deduplicated, insertion-ordered list.
///
/// Per-relay failures and timeouts are absorbed; cancellation resolves with
/// whatever was accumulated. An empty relay set returns an empty list
/// immediately.
pub async fn query(
    filter: &Filter,
    relays: &[RelayDescriptor],
    opts: &QueryOptions,
    cancel: &CancellationToken,
) -> Vec<Event> {
    query_inner(filter, relays, opts, cancel, None).await
}

/// Like [`query`], but streams [`QueryUpdate`]s into `updates` while
/// running. Callback-style consumers wrap the receiving end; pull-style
/// consumers read it directly.
pub async fn query_with_updates(
    filter: &Filter,
    relays: &[RelayDescriptor],
    opts: &QueryOptions,
    cancel: &CancellationToken,
    updates: mpsc::Sender<QueryUpdate>,
) -> Vec<Event> {
    query_inner(filter, relays, opts, cancel, Some(updates)).await
}

/// Callback-style adapter over [`query_with_updates`]: `on_progress` is
/// called with the running accepted count, once per newly-accepted record.
pub async fn query_with_progress<F>(
    filter: &Filter,
    relays: &[RelayDescriptor],
    opts: &QueryOptions,
    cancel: &CancellationToken,
    mut on_progress: F,
) -> Vec<Event>
where
    F: FnMut(usize),
{
    let (tx, mut rx) = mpsc::channel(32);
    let query = query_with_updates(filter, relays, opts, cancel, tx);
    tokio::pin!(query);
    let mut closed = false;
    loop {
        tokio::select! {
            events = &mut query => {
                while let Ok(update) = rx.try_recv() {
                    if let QueryUpdate::Accepted { count } = update {
                        on_progress(count);
                    }
                }
                return events;
            }
            update = rx.recv(), if !closed => {
                match update {
                    Some(QueryUpdate::Accepted { count }) => on_progress(count),
                    Some(QueryUpdate::RelayDone { .. }) => {}
                    None => closed = true,
                }
            }
        }
    }
}

async fn query_inner(
    filter: &Filter,
    relays: &[RelayDescriptor],
    opts: &QueryOptions,
    cancel: &CancellationToken,
    updates: Option<mpsc::Sender<QueryUpdate>>,
) -> Vec<Event> {
    if relays.is_empty() {
        return Vec::new();
    }
    let deadline = Instant::now() + opts.overall_deadline;
    let (tx, mut rx) = mpsc::channel::<Event>(64);
    let mut workers = FuturesUnordered::new();
    for relay in relays {
        let url = relay.url.clone();
        let filter = filter.clone();
        let net = opts.net.clone();
        let per_relay = opts.per_relay_timeout;
        let tx = tx.clone();
        workers.push(async move {
            if let Err(e) = relay::fetch_once(&url, &filter, per_relay, &net, tx).await {
                debug!(relay = url, error = %e, "relay contributed nothing");
            }
            url
        });
    }
    drop(tx);

    let mut acc = Accumulator::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep_until(deadline) => break,
            done = workers.next(), if !workers.is_empty() => {
                if let (Some(url), Some(updates)) = (done, &updates) {
                    let _ = updates.send(QueryUpdate::RelayDone { url }).await;
                }
            }
            ev = rx.recv() => {
                let Some(ev) = ev else { break };
                if !filter.matches(&ev) {
                    debug!(id = ev.id, "skipping off-filter record");
                    continue;
                }
                if opts.verify {
                    if let Err(e) = ev.verify() {
                        debug!(id = ev.id, error = %e, "skipping unauthentic record");
                        continue;
                    }
                }
                if acc.offer(ev) {
                    if let Some(updates) = &updates {
                        let _ = updates
                            .send(QueryUpdate::Accepted { count: acc.len() })
                            .await;
                    }
                }
            }
        }
    }
    acc.into_events()
}

/// Outcome of a publish fan-out.
#[derive(Debug, Clone, Default)]
pub struct PublishReport {
    /// Relays that acknowledged the event.
    pub accepted: Vec<String>,
    /// Relays that rejected or failed, with the reason.
    pub rejected: Vec<(String, String)>,
}

/// Fan a signed event out to every relay in `relays`.
///
/// Success criteria is acceptance by at least one relay; per-relay
/// rejections are recorded in the report. Only total rejection is an error.
pub async fn publish(
    event: &Event,
    relays: &[RelayDescriptor],
    opts: &QueryOptions,
) -> crate::error::Result<PublishReport> {
    let mut workers = FuturesUnordered::new();
    for relay in relays {
        let url = relay.url.clone();
        workers.push(async move {
            let outcome =
                relay::publish_once(&url, event, opts.per_relay_timeout, &opts.net).await;
            (url, outcome)
        });
    }
    let mut report = PublishReport::default();
    while let Some((url, outcome)) = workers.next().await {
        match outcome {
            Ok(PublishOutcome::Accepted) => report.accepted.push(url),
            Ok(PublishOutcome::Rejected(reason)) => report.rejected.push((url, reason)),
            Err(e) => report.rejected.push((url, e.to_string())),
        }
    }
    if report.accepted.is_empty() {
        return Err(crate::error::Error::PublishRejectedByAllRelays);
    }
    Ok(report)
}

/// Race a set of attempts: resolve with the first to produce a value, bounded
/// by `deadline` and `cancel`. Losers are dropped mid-flight.
///
/// This is the one race-with-timeout combinator in the crate; lookups that
/// only need the first answering relay build on it instead of
/// re-implementing the pattern per call site.
pub async fn race_first<T, F>(
    attempts: impl IntoIterator<Item = F>,
    deadline: Duration,
    cancel: &CancellationToken,
) -> Option<T>
where
    F: Future<Output = Option<T>>,
{
    let mut pending: FuturesUnordered<F> = attempts.into_iter().collect();
    let until = Instant::now() + deadline;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = sleep_until(until) => return None,
            next = pending.next() => match next {
                Some(Some(value)) => return Some(value),
                Some(None) => continue,
                None => return None,
            },
        }
    }
}
