//! Graph scanners: walk the seed's follow list with bounded concurrency and
//! evaluate a predicate per candidate, streaming progress and matches.
//!
//! All scanners share one harness. Candidates are checked by a fixed pool of
//! in-flight workers; each completed check advances the progress counter,
//! and matches are surfaced the moment they are found so callers can render
//! incrementally. Cancellation stops issuing new candidate work and lets
//! in-flight fetches drain, then resolves with whatever matched so far.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::event::{KIND_MUTE_LIST, KIND_POST, KIND_PROFILE};
use crate::filter::Filter;
use crate::model::{fetch_follow_list, fetch_profile, fetch_relay_list, MuteList, Profile};
use crate::pool::{self, QueryOptions};
use crate::relay::RelayDescriptor;

/// Concurrent in-flight candidate checks per scan.
pub const SCAN_WORKER_CAP: usize = 8;
/// Upper bound on reciprocity second-pass lookups per scan.
pub const SECOND_PASS_CAP: usize = 25;
/// Profile enrichment batch size for the network-wide mute search.
pub const ENRICH_BATCH: usize = 20;
/// Pacing delay between enrichment batches.
pub const ENRICH_PACING: Duration = Duration::from_millis(250);
/// How many recent posts a per-candidate post scan samples.
pub const RECENT_POST_SAMPLE: usize = 50;
/// Default distinct-participant threshold for hellthread detection.
pub const HELLTHREAD_THRESHOLD: usize = 25;

/// Incremental output of a scan, streamed over a channel. Callback-style
/// consumers wrap the receiving end; pull-style consumers read it directly.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent<M> {
    /// A candidate finished, match or not.
    Progress { done: usize, total: usize },
    /// A candidate matched the predicate.
    Match(M),
}

/// Tunables threaded through every scan.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Concurrent in-flight candidate checks.
    pub concurrency: usize,
    /// Options for the underlying relay queries.
    pub query: QueryOptions,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            concurrency: SCAN_WORKER_CAP,
            query: QueryOptions::default(),
        }
    }
}

/// Run `check` over `candidates` with bounded concurrency.
///
/// Emits a [`ScanEvent::Match`] immediately per match and a
/// [`ScanEvent::Progress`] after every candidate. Once `cancel` fires no new
/// candidate is started; in-flight checks drain naturally.
async fn scan<M, F, Fut>(
    candidates: Vec<String>,
    concurrency: usize,
    cancel: &CancellationToken,
    events: &mpsc::Sender<ScanEvent<M>>,
    check: F,
) -> Vec<M>
where
    M: Clone,
    F: Fn(String) -> Fut,
    Fut: Future<Output = Option<M>>,
{
    let total = candidates.len();
    let mut pending = candidates.into_iter();
    let mut workers = FuturesUnordered::new();
    for candidate in pending.by_ref().take(concurrency.max(1)) {
        workers.push(check(candidate));
    }
    let mut matches = Vec::new();
    let mut done = 0;
    while let Some(outcome) = workers.next().await {
        done += 1;
        if let Some(m) = outcome {
            let _ = events.send(ScanEvent::Match(m.clone())).await;
            matches.push(m);
        }
        let _ = events.send(ScanEvent::Progress { done, total }).await;
        if !cancel.is_cancelled() {
            if let Some(candidate) = pending.next() {
                workers.push(check(candidate));
            }
        }
    }
    matches
}

/// Callback-style adapter over a scan's event stream. Spawns a task that
/// drives `on_progress(done, total)` and `on_match` until the scan drops
/// its sender.
pub fn forward_events<M, P, H>(
    mut rx: mpsc::Receiver<ScanEvent<M>>,
    mut on_progress: P,
    mut on_match: H,
) -> tokio::task::JoinHandle<()>
where
    M: Send + 'static,
    P: FnMut(usize, usize) + Send + 'static,
    H: FnMut(M) + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(ev) = rx.recv().await {
            match ev {
                ScanEvent::Progress { done, total } => on_progress(done, total),
                ScanEvent::Match(m) => on_match(m),
            }
        }
    })
}

/// Fetch the seed's follow list or fail the scan; a scan without candidates
/// is undetermined, not an empty result.
async fn seed_follows(
    seed: &str,
    relays: &[RelayDescriptor],
    opts: &ScanOptions,
    cancel: &CancellationToken,
) -> Result<Vec<String>> {
    match fetch_follow_list(seed, relays, &opts.query, cancel).await {
        Some(list) => Ok(list.follows),
        None => Err(Error::RecordParseFailure(
            "no follow list found for the scanned identity".into(),
        )),
    }
}

/// A follow that does not follow back.
#[derive(Debug, Clone, PartialEq)]
pub struct ReciprocityResult {
    pub pubkey: String,
    pub profile: Option<Profile>,
    /// Whether any follow list was found for the candidate at all. `false`
    /// means the verdict rests on absence of evidence, not on an explicit
    /// list that omits the seed.
    pub list_found: bool,
}

/// Scan the seed's follows for candidates that do not follow back.
///
/// Verdicts resting on the shared relay set alone are prone to
/// relay-selection mismatches, so up to [`SECOND_PASS_CAP`] non-reciprocal
/// candidates get a second lookup against their own declared relay list
/// before being reported; past the cap the first-pass verdict stands.
pub async fn check_reciprocal_follows(
    seed: &str,
    relays: &[RelayDescriptor],
    opts: &ScanOptions,
    cancel: &CancellationToken,
    events: mpsc::Sender<ScanEvent<ReciprocityResult>>,
) -> Result<Vec<ReciprocityResult>> {
    let candidates = seed_follows(seed, relays, opts, cancel).await?;
    let second_pass_used = AtomicUsize::new(0);
    let matches = scan(candidates, opts.concurrency, cancel, &events, |candidate| {
        let second_pass_used = &second_pass_used;
        async move {
            let first = fetch_follow_list(&candidate, relays, &opts.query, cancel).await;
            let mut list_found = first.is_some();
            let mut follows_back = first.map(|l| l.contains(seed)).unwrap_or(false);
            if !follows_back
                && second_pass_used.fetch_add(1, Ordering::Relaxed) < SECOND_PASS_CAP
            {
                if let Some(own_relays) =
                    fetch_relay_list(&candidate, relays, &opts.query, cancel).await
                {
                    if !own_relays.is_empty() {
                        if let Some(list) =
                            fetch_follow_list(&candidate, &own_relays, &opts.query, cancel)
                                .await
                        {
                            list_found = true;
                            follows_back = list.contains(seed);
                        }
                    }
                }
            }
            if follows_back {
                return None;
            }
            let profile = fetch_profile(&candidate, relays, &opts.query, cancel).await;
            Some(ReciprocityResult {
                pubkey: candidate,
                profile,
                list_found,
            })
        }
    })
    .await;
    Ok(matches)
}

/// A follow whose verified identifier lives on the queried domain.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainMatch {
    pub pubkey: String,
    pub profile: Profile,
    /// The matched domain as declared in the profile, lowercased.
    pub domain: String,
}

/// Scan the seed's follows for profiles whose verified-identifier domain
/// equals `domain` exactly (case-insensitive; `sub.example.com` does not
/// match a query for `example.com`).
pub async fn search_follows_by_domain(
    seed: &str,
    domain: &str,
    relays: &[RelayDescriptor],
    opts: &ScanOptions,
    cancel: &CancellationToken,
    events: mpsc::Sender<ScanEvent<DomainMatch>>,
) -> Result<Vec<DomainMatch>> {
    let candidates = seed_follows(seed, relays, opts, cancel).await?;
    let want = domain.trim().to_ascii_lowercase();
    let matches = scan(candidates, opts.concurrency, cancel, &events, |candidate| {
        let want = &want;
        async move {
            let profile = fetch_profile(&candidate, relays, &opts.query, cancel).await?;
            let found = profile.nip05_domain()?;
            if found != *want {
                return None;
            }
            Some(DomainMatch {
                pubkey: candidate,
                profile,
                domain: found,
            })
        }
    })
    .await;
    Ok(matches)
}

/// A follow with recent posts attributed to the queried client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientMatch {
    pub pubkey: String,
    pub profile: Option<Profile>,
    /// Matching posts in the sampled window.
    pub count: usize,
    /// Timestamp of the most recent matching post.
    pub last_seen: u64,
}

/// Scan the seed's follows for identities whose recent posts carry a
/// `client` attribution tag equal to `client`.
pub async fn find_follows_using_client(
    seed: &str,
    client: &str,
    relays: &[RelayDescriptor],
    opts: &ScanOptions,
    cancel: &CancellationToken,
    events: mpsc::Sender<ScanEvent<ClientMatch>>,
) -> Result<Vec<ClientMatch>> {
    let candidates = seed_follows(seed, relays, opts, cancel).await?;
    let matches = scan(candidates, opts.concurrency, cancel, &events, |candidate| {
        async move {
            let filter = Filter::new()
                .authors([candidate.as_str()])
                .kinds([KIND_POST])
                .limit(RECENT_POST_SAMPLE);
            let posts = pool::query(&filter, relays, &opts.query, cancel).await;
            let mut count = 0;
            let mut last_seen = 0;
            for post in &posts {
                if post.tag_values("client").any(|v| v == client) {
                    count += 1;
                    last_seen = last_seen.max(post.created_at);
                }
            }
            if count == 0 {
                return None;
            }
            let profile = fetch_profile(&candidate, relays, &opts.query, cancel).await;
            Some(ClientMatch {
                pubkey: candidate,
                profile,
                count,
                last_seen,
            })
        }
    })
    .await;
    Ok(matches)
}

/// A follow posting top-level posts that tag an excessive number of
/// participants.
#[derive(Debug, Clone, PartialEq)]
pub struct HellthreadMatch {
    pub pubkey: String,
    pub profile: Option<Profile>,
    /// Distinct participants tagged by the worst offending post.
    pub max_tag_count: usize,
    /// How many sampled posts met the threshold.
    pub hellthread_count: usize,
    /// Id of the worst offending post.
    pub worst_post_id: String,
}

/// Scan the seed's follows for identities whose recent top-level posts tag
/// at least `threshold` distinct participants. Replies (posts carrying an
/// `e` tag) are not counted.
pub async fn find_follows_posting_hellthreads(
    seed: &str,
    threshold: usize,
    relays: &[RelayDescriptor],
    opts: &ScanOptions,
    cancel: &CancellationToken,
    events: mpsc::Sender<ScanEvent<HellthreadMatch>>,
) -> Result<Vec<HellthreadMatch>> {
    let candidates = seed_follows(seed, relays, opts, cancel).await?;
    let matches = scan(candidates, opts.concurrency, cancel, &events, |candidate| {
        async move {
            let filter = Filter::new()
                .authors([candidate.as_str()])
                .kinds([KIND_POST])
                .limit(RECENT_POST_SAMPLE);
            let posts = pool::query(&filter, relays, &opts.query, cancel).await;
            let mut max_tag_count = 0;
            let mut hellthread_count = 0;
            let mut worst_post_id = String::new();
            for post in &posts {
                if post.tag("e").is_some() {
                    continue;
                }
                let participants: HashSet<&str> = post.tag_values("p").collect();
                if participants.len() >= threshold {
                    hellthread_count += 1;
                    if participants.len() > max_tag_count {
                        max_tag_count = participants.len();
                        worst_post_id = post.id.clone();
                    }
                }
            }
            if hellthread_count == 0 {
                return None;
            }
            let profile = fetch_profile(&candidate, relays, &opts.query, cancel).await;
            Some(HellthreadMatch {
                pubkey: candidate,
                profile,
                max_tag_count,
                hellthread_count,
                worst_post_id,
            })
        }
    })
    .await;
    Ok(matches)
}

/// An identity whose mute list names the searched target.
#[derive(Debug, Clone, PartialEq)]
pub struct MuterResult {
    pub pubkey: String,
    pub profile: Option<Profile>,
    /// Timestamp of the muter's mute-list record.
    pub listed_at: u64,
}

/// Search the whole relay set for mute lists naming `target`.
///
/// Inverts the usual direction: instead of walking the seed's follows it
/// queries for any mute-list record tagging the target, keeps the latest
/// record per author, and enriches the authors with profile data in
/// [`ENRICH_BATCH`]-sized batches with a pacing delay, emitting matches per
/// batch so callers can render partial results.
pub async fn search_mutes_network_wide(
    target: &str,
    relays: &[RelayDescriptor],
    opts: &ScanOptions,
    cancel: &CancellationToken,
    events: mpsc::Sender<ScanEvent<MuterResult>>,
) -> Vec<MuterResult> {
    let filter = Filter::new().kinds([KIND_MUTE_LIST]).tag_p([target]);
    let records = pool::query(&filter, relays, &opts.query, cancel).await;
    // dedup already keeps the latest record per author; the latest version
    // may no longer name the target, so re-check the parsed list
    let muters: Vec<(String, u64)> = records
        .iter()
        .filter(|ev| {
            MuteList::from_event(ev)
                .map(|l| l.mutes_identity(target))
                .unwrap_or(false)
        })
        .map(|ev| (ev.pubkey.clone(), ev.created_at))
        .collect();

    let total = muters.len();
    let mut results = Vec::with_capacity(total);
    let mut done = 0;
    for batch in muters.chunks(ENRICH_BATCH) {
        if cancel.is_cancelled() {
            break;
        }
        let authors: Vec<&str> = batch.iter().map(|(pk, _)| pk.as_str()).collect();
        let filter = Filter::new().authors(authors).kinds([KIND_PROFILE]);
        let mut profiles: HashMap<String, Profile> = HashMap::new();
        for ev in pool::query(&filter, relays, &opts.query, cancel).await {
            match Profile::from_event(&ev) {
                Ok(p) => {
                    profiles.insert(ev.pubkey, p);
                }
                Err(e) => debug!(pubkey = ev.pubkey, error = %e, "skipping unparseable profile"),
            }
        }
        for (pubkey, listed_at) in batch {
            let result = MuterResult {
                pubkey: pubkey.clone(),
                profile: profiles.remove(pubkey),
                listed_at: *listed_at,
            };
            let _ = events.send(ScanEvent::Match(result.clone())).await;
            results.push(result);
            done += 1;
            let _ = events.send(ScanEvent::Progress { done, total }).await;
        }
        if done < total {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(ENRICH_PACING) => {}
            }
        }
    }
    results
}
