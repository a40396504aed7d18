//! Record shapes the application reads and writes: mute lists, profiles,
//! follow lists, relay lists, community packs, and deletion requests.
//!
//! Parsing is tolerant. Unknown tags are ignored, per-record damage is a
//! typed [`Error::RecordParseFailure`] the callers skip, and an absent
//! record is always distinguishable from an empty one (fetchers return
//! `Option`).

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::event::{
    Event, EventTemplate, Tag, KIND_DELETION, KIND_FOLLOWS, KIND_MUTE_LIST, KIND_PACK,
    KIND_PROFILE, KIND_RELAY_LIST,
};
use crate::filter::Filter;
use crate::pool::{self, PublishReport, QueryOptions};
use crate::relay::{self, RelayDescriptor, RelayRole, RelaySource};
use crate::signer::{Session, Signer};

/// One muted value with its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuteEntry {
    /// The muted value: a hex pubkey, a word, a hashtag, or an event id.
    pub value: String,
    /// Optional free-text reason recorded alongside the entry.
    pub reason: Option<String>,
    /// Private entries live encrypted in the record's content, visible only
    /// to the owner.
    pub private: bool,
}

impl MuteEntry {
    /// A public entry with no reason.
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            reason: None,
            private: false,
        }
    }

    /// Attach a reason.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Mark as private.
    pub fn private(mut self) -> Self {
        self.private = true;
        self
    }
}

/// The owner's mute list: four unordered collections.
///
/// Values are unique within each collection; offering a duplicate value is a
/// no-op. Kind-10000 records whose tags carry none of the list shapes parse
/// as an empty list, not a failure; [`Error::RecordParseFailure`] is
/// reserved for structurally broken records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MuteList {
    /// Muted identities (hex pubkeys, `p` tags).
    pub identities: Vec<MuteEntry>,
    /// Muted words (`word` tags).
    pub words: Vec<MuteEntry>,
    /// Muted hashtags (`t` tags).
    pub hashtags: Vec<MuteEntry>,
    /// Muted threads (event ids, `e` tags).
    pub threads: Vec<MuteEntry>,
    /// Timestamp of the record this list was parsed from, zero for a list
    /// built from scratch.
    pub updated_at: u64,
    /// Undecrypted private payload carried in the record's content, kept
    /// until the owner unlocks it.
    private_payload: Option<String>,
}

fn push_unique(entries: &mut Vec<MuteEntry>, entry: MuteEntry) {
    if !entries.iter().any(|e| e.value == entry.value) {
        entries.push(entry);
    }
}

/// Which collection a tag belongs to, with the index its reason occupies.
/// `p` and `e` tags keep slot 2 for a relay hint, so their reason sits at 3;
/// `word` and `t` have no hint slot.
fn tag_route(kind: &str) -> Option<(Collection, usize)> {
    match kind {
        "p" => Some((Collection::Identities, 3)),
        "word" => Some((Collection::Words, 2)),
        "t" => Some((Collection::Hashtags, 2)),
        "e" => Some((Collection::Threads, 3)),
        _ => None,
    }
}

#[derive(Clone, Copy)]
enum Collection {
    Identities,
    Words,
    Hashtags,
    Threads,
}

impl MuteList {
    /// Parse a kind-10000 record. Only public entries are produced; an
    /// encrypted private payload in the content is retained for
    /// [`MuteList::unlock_private`].
    pub fn from_event(ev: &Event) -> Result<Self> {
        if ev.kind != KIND_MUTE_LIST {
            return Err(Error::RecordParseFailure(format!(
                "expected kind {KIND_MUTE_LIST}, got {}",
                ev.kind
            )));
        }
        let mut list = MuteList {
            updated_at: ev.created_at,
            private_payload: (!ev.content.is_empty()).then(|| ev.content.clone()),
            ..Default::default()
        };
        for tag in &ev.tags {
            let Some(kind) = tag.kind() else { continue };
            let Some((collection, reason_idx)) = tag_route(kind) else {
                continue;
            };
            let Some(value) = tag.value() else { continue };
            let entry = MuteEntry {
                value: value.to_string(),
                reason: tag.0.get(reason_idx).filter(|r| !r.is_empty()).cloned(),
                private: false,
            };
            push_unique(list.collection_mut(collection), entry);
        }
        Ok(list)
    }

    fn collection_mut(&mut self, c: Collection) -> &mut Vec<MuteEntry> {
        match c {
            Collection::Identities => &mut self.identities,
            Collection::Words => &mut self.words,
            Collection::Hashtags => &mut self.hashtags,
            Collection::Threads => &mut self.threads,
        }
    }

    /// Whether any collection holds entries.
    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
            && self.words.is_empty()
            && self.hashtags.is_empty()
            && self.threads.is_empty()
    }

    /// Whether the given identity (hex pubkey) is muted, public or private.
    pub fn mutes_identity(&self, pubkey: &str) -> bool {
        self.identities.iter().any(|e| e.value == pubkey)
    }

    /// Add to the muted identities, skipping duplicates.
    pub fn add_identity(&mut self, entry: MuteEntry) {
        push_unique(&mut self.identities, entry);
    }

    /// Add to the muted words, skipping duplicates.
    pub fn add_word(&mut self, entry: MuteEntry) {
        push_unique(&mut self.words, entry);
    }

    /// Add to the muted hashtags, skipping duplicates.
    pub fn add_hashtag(&mut self, entry: MuteEntry) {
        push_unique(&mut self.hashtags, entry);
    }

    /// Add to the muted threads, skipping duplicates.
    pub fn add_thread(&mut self, entry: MuteEntry) {
        push_unique(&mut self.threads, entry);
    }

    /// Decrypt the private payload with the owner's signer and merge the
    /// entries it carries, marked private. A list with no payload is a
    /// no-op. The payload is an encrypted JSON array of tag arrays, same
    /// shapes as the public tags.
    pub async fn unlock_private(&mut self, signer: &dyn Signer, owner: &str) -> Result<()> {
        let Some(payload) = self.private_payload.take() else {
            return Ok(());
        };
        let plain = signer.decrypt(owner, &payload).await?;
        let tags: Vec<Tag> = serde_json::from_str(&plain)
            .map_err(|e| Error::RecordParseFailure(format!("bad private payload: {e}")))?;
        for tag in &tags {
            let Some((collection, reason_idx)) = tag.kind().and_then(tag_route) else {
                continue;
            };
            let Some(value) = tag.value() else { continue };
            let entry = MuteEntry {
                value: value.to_string(),
                reason: tag.0.get(reason_idx).filter(|r| !r.is_empty()).cloned(),
                private: true,
            };
            push_unique(self.collection_mut(collection), entry);
        }
        Ok(())
    }

    /// Build the unsigned record: public entries as tags, private entries
    /// encrypted to the owner in the content.
    pub async fn to_template(&self, signer: &dyn Signer, owner: &str) -> Result<EventTemplate> {
        let mut tags = Vec::new();
        let mut private_tags = Vec::new();
        for (entries, kind, reason_idx) in [
            (&self.identities, "p", 3),
            (&self.words, "word", 2),
            (&self.hashtags, "t", 2),
            (&self.threads, "e", 3),
        ] {
            for entry in entries.iter() {
                let mut fields = vec![kind.to_string(), entry.value.clone()];
                if let Some(reason) = &entry.reason {
                    while fields.len() < reason_idx {
                        fields.push(String::new());
                    }
                    fields.push(reason.clone());
                }
                let tag = Tag(fields);
                if entry.private {
                    private_tags.push(tag);
                } else {
                    tags.push(tag);
                }
            }
        }
        let content = if private_tags.is_empty() {
            String::new()
        } else {
            let plain = serde_json::to_string(&private_tags)?;
            signer.encrypt(owner, &plain).await?
        };
        Ok(EventTemplate::now(KIND_MUTE_LIST, tags, content))
    }
}

/// Kind-0 profile metadata. Content is a JSON object; unknown fields are
/// ignored, missing ones default.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Profile {
    pub name: Option<String>,
    pub display_name: Option<String>,
    pub about: Option<String>,
    pub picture: Option<String>,
    /// Verified identifier, `local-part@domain`.
    pub nip05: Option<String>,
}

impl Profile {
    /// Parse a kind-0 record's content.
    pub fn from_event(ev: &Event) -> Result<Self> {
        if ev.kind != KIND_PROFILE {
            return Err(Error::RecordParseFailure(format!(
                "expected kind {KIND_PROFILE}, got {}",
                ev.kind
            )));
        }
        serde_json::from_str(&ev.content)
            .map_err(|e| Error::RecordParseFailure(format!("bad profile json: {e}")))
    }

    /// Best available display string.
    pub fn display(&self) -> Option<&str> {
        self.display_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.name.as_deref().filter(|s| !s.is_empty()))
    }

    /// Domain part of the verified identifier, lowercased. The whole
    /// identifier is the domain when it carries no `@`.
    pub fn nip05_domain(&self) -> Option<String> {
        let id = self.nip05.as_deref()?.trim();
        if id.is_empty() {
            return None;
        }
        let domain = id.rsplit('@').next().unwrap_or(id);
        Some(domain.to_ascii_lowercase())
    }
}

/// Kind-3 follow list: the identities the author follows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FollowList {
    /// Followed hex pubkeys, in record order, deduplicated.
    pub follows: Vec<String>,
    pub updated_at: u64,
}

impl FollowList {
    /// Parse a kind-3 record's `p` tags.
    pub fn from_event(ev: &Event) -> Result<Self> {
        if ev.kind != KIND_FOLLOWS {
            return Err(Error::RecordParseFailure(format!(
                "expected kind {KIND_FOLLOWS}, got {}",
                ev.kind
            )));
        }
        let mut follows: Vec<String> = Vec::new();
        for value in ev.tag_values("p") {
            if !follows.iter().any(|f| f == value) {
                follows.push(value.to_string());
            }
        }
        Ok(Self {
            follows,
            updated_at: ev.created_at,
        })
    }

    /// Whether the list contains the given pubkey.
    pub fn contains(&self, pubkey: &str) -> bool {
        self.follows.iter().any(|f| f == pubkey)
    }
}

/// Parse a kind-10002 relay-list record into descriptors.
///
/// Each `r` tag carries a URL and an optional `read`/`write` marker; no
/// marker means both. Unparseable URLs are skipped.
pub fn relay_list_from_event(ev: &Event) -> Result<Vec<RelayDescriptor>> {
    if ev.kind != KIND_RELAY_LIST {
        return Err(Error::RecordParseFailure(format!(
            "expected kind {KIND_RELAY_LIST}, got {}",
            ev.kind
        )));
    }
    let mut out = Vec::new();
    for tag in &ev.tags {
        if tag.kind() != Some("r") {
            continue;
        }
        let Some(url) = tag.value() else { continue };
        let role = match tag.0.get(2).map(String::as_str) {
            Some("read") => RelayRole::Read,
            Some("write") => RelayRole::Write,
            _ => RelayRole::Both,
        };
        match RelayDescriptor::new(url, role, RelaySource::RelayListRecord) {
            Ok(d) => out.push(d),
            Err(e) => debug!(url, error = %e, "skipping unparseable relay-list entry"),
        }
    }
    Ok(out)
}

/// An addressable, categorized people list.
#[derive(Debug, Clone, PartialEq)]
pub struct Pack {
    /// Stable address tag (`d`), derived from the title via [`slug`].
    pub address: String,
    pub title: String,
    pub description: Option<String>,
    /// Category hashtags (`t` tags).
    pub categories: Vec<String>,
    /// Member hex pubkeys (`p` tags).
    pub members: Vec<String>,
    /// Author hex pubkey.
    pub author: String,
    pub updated_at: u64,
}

impl Pack {
    /// Parse an addressable pack record. The `d` tag is required; `title`
    /// falls back to the older `name` tag.
    pub fn from_event(ev: &Event) -> Result<Self> {
        if ev.kind != KIND_PACK {
            return Err(Error::RecordParseFailure(format!(
                "expected kind {KIND_PACK}, got {}",
                ev.kind
            )));
        }
        let address = ev
            .address_tag()
            .ok_or_else(|| Error::RecordParseFailure("pack record missing d tag".into()))?
            .to_string();
        let title = ev
            .tag("title")
            .or_else(|| ev.tag("name"))
            .and_then(|t| t.value())
            .unwrap_or(&address)
            .to_string();
        Ok(Self {
            address,
            title,
            description: ev.tag("description").and_then(|t| t.value()).map(Into::into),
            categories: ev.tag_values("t").map(Into::into).collect(),
            members: ev.tag_values("p").map(Into::into).collect(),
            author: ev.pubkey.clone(),
            updated_at: ev.created_at,
        })
    }

    /// The `kind:author:address` coordinate used by `a` tags.
    pub fn coordinate(&self) -> String {
        format!("{KIND_PACK}:{}:{}", self.author, self.address)
    }
}

/// Derive a stable, reproducible address tag from a display name:
/// lowercase, whitespace and underscores to hyphens, strip everything
/// outside `[a-z0-9-.]`, collapse repeated hyphens, trim edge hyphens.
pub fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_hyphen = false;
    for c in name.to_lowercase().chars() {
        let c = if c.is_whitespace() || c == '_' { '-' } else { c };
        match c {
            'a'..='z' | '0'..='9' | '.' => {
                out.push(c);
                prev_hyphen = false;
            }
            '-' => {
                if !prev_hyphen {
                    out.push('-');
                }
                prev_hyphen = true;
            }
            _ => {}
        }
    }
    out.trim_matches('-').to_string()
}

/// Sign the owner's mute list and fan it out to the write relays.
pub async fn publish_mute_list(
    session: &Session,
    list: &MuteList,
    relays: &[RelayDescriptor],
    opts: &QueryOptions,
) -> Result<PublishReport> {
    let template = list
        .to_template(session.signer.as_ref(), &session.pubkey)
        .await?;
    let event = session.signer.sign(template).await?;
    pool::publish(&event, relays, opts).await
}

/// Build, sign, and publish a new pack. Returns the publish report and the
/// derived address so the caller can predict the record's coordinate.
pub async fn publish_pack(
    session: &Session,
    title: &str,
    description: Option<&str>,
    members: &[String],
    categories: &[String],
    relays: &[RelayDescriptor],
    opts: &QueryOptions,
) -> Result<(PublishReport, String)> {
    let address = slug(title);
    if address.is_empty() {
        return Err(Error::RecordParseFailure(
            "pack title yields an empty address".into(),
        ));
    }
    let mut tags = vec![Tag::new(&["d", &address]), Tag::new(&["title", title])];
    if let Some(description) = description.filter(|d| !d.is_empty()) {
        tags.push(Tag::new(&["description", description]));
    }
    for category in categories {
        tags.push(Tag::new(&["t", category]));
    }
    for member in members {
        tags.push(Tag::new(&["p", member]));
    }
    let event = session
        .signer
        .sign(EventTemplate::now(KIND_PACK, tags, String::new()))
        .await?;
    let report = pool::publish(&event, relays, opts).await?;
    Ok((report, address))
}

/// Republish an existing pack under its original address. The replaceable
/// rule makes the new record supersede the old one.
pub async fn update_pack(
    session: &Session,
    pack: &Pack,
    relays: &[RelayDescriptor],
    opts: &QueryOptions,
) -> Result<PublishReport> {
    let mut tags = vec![
        Tag::new(&["d", &pack.address]),
        Tag::new(&["title", &pack.title]),
    ];
    if let Some(description) = pack.description.as_deref().filter(|d| !d.is_empty()) {
        tags.push(Tag::new(&["description", description]));
    }
    for category in &pack.categories {
        tags.push(Tag::new(&["t", category]));
    }
    for member in &pack.members {
        tags.push(Tag::new(&["p", member]));
    }
    let event = session
        .signer
        .sign(EventTemplate::now(KIND_PACK, tags, String::new()))
        .await?;
    pool::publish(&event, relays, opts).await
}

/// What a deletion request points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeletionTarget {
    /// A plain event id (`e` tag).
    Event(String),
    /// An addressable coordinate `kind:author:address` (`a` tag).
    Address(String),
}

/// Publish a kind-5 deletion request for the given target.
pub async fn publish_deletion_request(
    session: &Session,
    target: &DeletionTarget,
    relays: &[RelayDescriptor],
    opts: &QueryOptions,
) -> Result<PublishReport> {
    let tag = match target {
        DeletionTarget::Event(id) => Tag::new(&["e", id]),
        DeletionTarget::Address(coord) => Tag::new(&["a", coord]),
    };
    let event = session
        .signer
        .sign(EventTemplate::now(KIND_DELETION, vec![tag], String::new()))
        .await?;
    pool::publish(&event, relays, opts).await
}

/// Request deletion of a pack by its address, then confirm nothing further;
/// relays that honor deletion stop serving the record.
pub async fn delete_pack(
    session: &Session,
    pack: &Pack,
    relays: &[RelayDescriptor],
    opts: &QueryOptions,
) -> Result<PublishReport> {
    publish_deletion_request(
        session,
        &DeletionTarget::Address(pack.coordinate()),
        relays,
        opts,
    )
    .await
}

/// Fetch the latest record of `kind` by `author` across `relays`. `None`
/// means no relay produced one, which is distinct from an empty record.
pub async fn fetch_latest(
    author: &str,
    kind: u32,
    relays: &[RelayDescriptor],
    opts: &QueryOptions,
    cancel: &CancellationToken,
) -> Option<Event> {
    let filter = Filter::new().authors([author]).kinds([kind]).limit(1);
    pool::query(&filter, relays, opts, cancel)
        .await
        .into_iter()
        .next()
}

/// Fetch and parse an author's profile.
pub async fn fetch_profile(
    pubkey: &str,
    relays: &[RelayDescriptor],
    opts: &QueryOptions,
    cancel: &CancellationToken,
) -> Option<Profile> {
    let ev = fetch_latest(pubkey, KIND_PROFILE, relays, opts, cancel).await?;
    match Profile::from_event(&ev) {
        Ok(p) => Some(p),
        Err(e) => {
            debug!(pubkey, error = %e, "skipping unparseable profile");
            None
        }
    }
}

/// Fetch and parse an author's mute list. `None` means no record was found
/// anywhere, `Some` with empty collections means an explicitly empty list.
pub async fn fetch_mute_list(
    pubkey: &str,
    relays: &[RelayDescriptor],
    opts: &QueryOptions,
    cancel: &CancellationToken,
) -> Option<MuteList> {
    let ev = fetch_latest(pubkey, KIND_MUTE_LIST, relays, opts, cancel).await?;
    MuteList::from_event(&ev).ok()
}

/// Fetch and parse an author's follow list.
pub async fn fetch_follow_list(
    pubkey: &str,
    relays: &[RelayDescriptor],
    opts: &QueryOptions,
    cancel: &CancellationToken,
) -> Option<FollowList> {
    let ev = fetch_latest(pubkey, KIND_FOLLOWS, relays, opts, cancel).await?;
    FollowList::from_event(&ev).ok()
}

/// Fetch and parse an author's declared relay list.
///
/// Unlike the aggregating fetchers this races the relays and takes the
/// first answer; declared relay lists rarely conflict and the reciprocity
/// second pass issues many of these lookups.
pub async fn fetch_relay_list(
    pubkey: &str,
    relays: &[RelayDescriptor],
    opts: &QueryOptions,
    cancel: &CancellationToken,
) -> Option<Vec<RelayDescriptor>> {
    let filter = Filter::new()
        .authors([pubkey])
        .kinds([KIND_RELAY_LIST])
        .limit(1);
    let attempts = relays.iter().map(|relay| {
        let filter = filter.clone();
        let url = relay.url.clone();
        async move {
            let (tx, mut rx) = mpsc::channel(8);
            let fetch = relay::fetch_once(&url, &filter, opts.per_relay_timeout, &opts.net, tx);
            let collect = async {
                let mut latest: Option<Event> = None;
                while let Some(ev) = rx.recv().await {
                    if !filter.matches(&ev) {
                        continue;
                    }
                    if opts.verify && ev.verify().is_err() {
                        continue;
                    }
                    if latest.as_ref().map_or(true, |l| ev.created_at > l.created_at) {
                        latest = Some(ev);
                    }
                }
                latest
            };
            let (fetched, latest) = tokio::join!(fetch, collect);
            if let Err(e) = fetched {
                debug!(relay = url, error = %e, "relay-list lookup contributed nothing");
            }
            latest
        }
    });
    let ev = pool::race_first(attempts, opts.overall_deadline, cancel).await?;
    relay_list_from_event(&ev).ok()
}

/// Full-text profile search (relays supporting the `search` filter field).
/// Returns `(pubkey, profile)` pairs, unparseable profiles skipped.
pub async fn search_profiles(
    text: &str,
    relays: &[RelayDescriptor],
    limit: usize,
    opts: &QueryOptions,
    cancel: &CancellationToken,
) -> Vec<(String, Profile)> {
    let filter = Filter::new()
        .kinds([KIND_PROFILE])
        .search(text)
        .limit(limit);
    pool::query(&filter, relays, opts, cancel)
        .await
        .into_iter()
        .filter_map(|ev| {
            let profile = Profile::from_event(&ev).ok()?;
            Some((ev.pubkey, profile))
        })
        .collect()
}
