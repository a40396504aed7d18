//! Nostr event model, canonical hashing, and signature verification.

use secp256k1::{schnorr::Signature, Keypair, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Kind of a profile metadata record.
pub const KIND_PROFILE: u32 = 0;
/// Kind of a short text post.
pub const KIND_POST: u32 = 1;
/// Kind of a follow list.
pub const KIND_FOLLOWS: u32 = 3;
/// Kind of a deletion request.
pub const KIND_DELETION: u32 = 5;
/// Kind of the owner's mute list.
pub const KIND_MUTE_LIST: u32 = 10000;
/// Kind of the owner's declared relay list.
pub const KIND_RELAY_LIST: u32 = 10002;
/// Kind of remote-signer RPC envelopes.
pub const KIND_SIGNER_RPC: u32 = 24133;
/// Kind of an addressable, categorized people list ("pack").
pub const KIND_PACK: u32 = 30000;

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// Tags appear as small arrays where the first element denotes the type and
/// the following elements hold data. The ones this crate interprets:
///
/// - `p` – references another author's public key
/// - `e` – links to another event ID
/// - `a` – addresses a replaceable record (`kind:pubkey:d-tag`)
/// - `d` – address identifier for addressable records
/// - `t` – free-form topic, hashtag, or pack category
/// - `word` – a muted word
/// - `r` – a relay URL, optionally followed by a `read`/`write` marker
/// - `client` – attribution of the posting client
///
/// Unknown tags are carried verbatim and ignored by business logic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Build a tag from string slices.
    pub fn new(fields: &[&str]) -> Self {
        Tag(fields.iter().map(|s| s.to_string()).collect())
    }

    /// The tag's type marker (first element), if any.
    pub fn kind(&self) -> Option<&str> {
        self.0.first().map(|s| s.as_str())
    }

    /// The tag's primary value (second element), if any.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(|s| s.as_str())
    }
}

/// Signed, timestamped, typed unit of data on the wire.
///
/// Serializes bit-exact to the protocol shape:
///
/// ```json
/// {
///   "id": "aa11…",
///   "pubkey": "deadbeef…",
///   "created_at": 1700000000,
///   "kind": 10000,
///   "tags": [["p", "…"], ["word", "spam"]],
///   "content": "",
///   "sig": "…"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 over the canonical form).
    pub id: String,
    /// Author public key (hex, x-only).
    pub pubkey: String,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Kind number distinguishing the record's purpose.
    pub kind: u32,
    /// Ordered tag arrays.
    pub tags: Vec<Tag>,
    /// Free-text content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    /// First tag of the given type, if present.
    pub fn tag(&self, kind: &str) -> Option<&Tag> {
        self.tags.iter().find(|t| t.kind() == Some(kind))
    }

    /// Values of every tag of the given type.
    pub fn tag_values<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a str> {
        self.tags
            .iter()
            .filter(move |t| t.kind() == Some(kind))
            .filter_map(|t| t.value())
    }

    /// The `d` (address) tag value for addressable records.
    pub fn address_tag(&self) -> Option<&str> {
        self.tag("d").and_then(|t| t.value())
    }

    /// Verify that the id matches the canonical hash and the signature is a
    /// valid Schnorr signature by `pubkey` over that hash.
    pub fn verify(&self) -> Result<()> {
        let hash = event_hash(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )?;
        if hex::encode(hash) != self.id {
            return Err(Error::RecordParseFailure("event id mismatch".into()));
        }
        let sig_bytes = hex::decode(&self.sig)
            .map_err(|e| Error::RecordParseFailure(format!("bad signature hex: {e}")))?;
        let sig = Signature::from_slice(&sig_bytes)
            .map_err(|e| Error::RecordParseFailure(format!("bad signature: {e}")))?;
        let pk_bytes = hex::decode(&self.pubkey)
            .map_err(|e| Error::RecordParseFailure(format!("bad pubkey hex: {e}")))?;
        let pk = XOnlyPublicKey::from_slice(&pk_bytes)
            .map_err(|e| Error::RecordParseFailure(format!("bad pubkey: {e}")))?;
        let secp = Secp256k1::verification_only();
        let msg = Message::from_digest_slice(&hash)
            .map_err(|e| Error::RecordParseFailure(e.to_string()))?;
        secp.verify_schnorr(&sig, &msg, &pk)
            .map_err(|e| Error::RecordParseFailure(format!("signature invalid: {e}")))
    }
}

/// Unsigned event shape handed to a signer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventTemplate {
    /// Kind number of the record to create.
    pub kind: u32,
    /// Unix timestamp, usually "now".
    pub created_at: u64,
    /// Ordered tag arrays.
    pub tags: Vec<Tag>,
    /// Free-text content body.
    pub content: String,
}

impl EventTemplate {
    /// Template stamped with the current wall-clock time.
    pub fn now(kind: u32, tags: Vec<Tag>, content: String) -> Self {
        let created_at = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            kind,
            created_at,
            tags,
            content,
        }
    }

    /// Hash and sign the template with a raw keypair, producing a complete
    /// event. Remote signers do this on their side instead.
    pub fn sign_with_keypair(self, keypair: &Keypair) -> Result<Event> {
        let secp = Secp256k1::new();
        let pubkey = hex::encode(keypair.x_only_public_key().0.serialize());
        let hash = event_hash(
            &pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )?;
        let msg =
            Message::from_digest_slice(&hash).map_err(|e| Error::Crypto(e.to_string()))?;
        let sig = secp.sign_schnorr_no_aux_rand(&msg, keypair);
        Ok(Event {
            id: hex::encode(hash),
            pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig: hex::encode(sig.as_ref()),
        })
    }
}

/// Recompute the canonical event hash from its signed fields:
/// `SHA-256(JSON([0, pubkey, created_at, kind, tags, content]))`.
pub fn event_hash(
    pubkey: &str,
    created_at: u64,
    kind: u32,
    tags: &[Tag],
    content: &str,
) -> Result<[u8; 32]> {
    let arr = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
    let data = serde_json::to_vec(&arr)?;
    Ok(Sha256::digest(&data).into())
}

/// Kinds replaced per `(author, kind)` key.
pub fn is_replaceable(kind: u32) -> bool {
    kind == KIND_PROFILE || kind == KIND_FOLLOWS || (10000..20000).contains(&kind)
}

/// Kinds replaced per `(author, kind, d-tag)` key.
pub fn is_addressable(kind: u32) -> bool {
    (30000..40000).contains(&kind)
}

/// Key under which a record competes for latest-timestamp-wins resolution.
///
/// Plain records dedup by id; replaceable and addressable records collapse to
/// a single authoritative instance per author key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupKey {
    /// Plain record, keyed by event id.
    Id(String),
    /// Replaceable record, keyed by `(author, kind)`.
    Replaceable(String, u32),
    /// Addressable record, keyed by `(author, kind, d-tag)`.
    Addressable(String, u32, String),
}

impl DedupKey {
    /// Compute the dedup key for an event.
    pub fn of(ev: &Event) -> Self {
        if is_addressable(ev.kind) {
            let d = ev.address_tag().unwrap_or_default().to_string();
            DedupKey::Addressable(ev.pubkey.clone(), ev.kind, d)
        } else if is_replaceable(ev.kind) {
            DedupKey::Replaceable(ev.pubkey.clone(), ev.kind)
        } else {
            DedupKey::Id(ev.id.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keypair(seed: u8) -> Keypair {
        let secp = Secp256k1::new();
        Keypair::from_seckey_slice(&secp, &[seed; 32]).unwrap()
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let kp = test_keypair(1);
        let tpl = EventTemplate {
            kind: KIND_POST,
            created_at: 1,
            tags: vec![Tag::new(&["t", "news"])],
            content: "hello".into(),
        };
        let ev = tpl.sign_with_keypair(&kp).unwrap();
        ev.verify().unwrap();
    }

    #[test]
    fn verify_rejects_tampered_content() {
        let kp = test_keypair(1);
        let tpl = EventTemplate {
            kind: KIND_POST,
            created_at: 1,
            tags: vec![],
            content: "hello".into(),
        };
        let mut ev = tpl.sign_with_keypair(&kp).unwrap();
        ev.content = "goodbye".into();
        assert!(ev.verify().is_err());
    }

    #[test]
    fn verify_rejects_bad_signature() {
        let kp = test_keypair(1);
        let tpl = EventTemplate {
            kind: KIND_POST,
            created_at: 1,
            tags: vec![],
            content: String::new(),
        };
        let mut ev = tpl.sign_with_keypair(&kp).unwrap();
        ev.sig.replace_range(0..2, "00");
        assert!(ev.verify().is_err());
    }

    #[test]
    fn dedup_key_variants() {
        let mut ev = Event {
            id: "aa".into(),
            pubkey: "p1".into(),
            created_at: 1,
            kind: KIND_POST,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        };
        assert_eq!(DedupKey::of(&ev), DedupKey::Id("aa".into()));
        ev.kind = KIND_MUTE_LIST;
        assert_eq!(
            DedupKey::of(&ev),
            DedupKey::Replaceable("p1".into(), KIND_MUTE_LIST)
        );
        ev.kind = KIND_PACK;
        ev.tags = vec![Tag::new(&["d", "slug"])];
        assert_eq!(
            DedupKey::of(&ev),
            DedupKey::Addressable("p1".into(), KIND_PACK, "slug".into())
        );
    }

    #[test]
    fn event_hash_matches_reference() {
        let pubkey = "00".repeat(32);
        let expected: [u8; 32] = {
            let obj = serde_json::json!([0, pubkey, 1, 1, Vec::<Tag>::new(), ""]);
            Sha256::digest(serde_json::to_vec(&obj).unwrap()).into()
        };
        assert_eq!(event_hash(&pubkey, 1, 1, &[], "").unwrap(), expected);
    }

    #[test]
    fn tag_accessors() {
        let ev = Event {
            id: "aa".into(),
            pubkey: "p1".into(),
            created_at: 1,
            kind: KIND_FOLLOWS,
            tags: vec![
                Tag::new(&["p", "x"]),
                Tag::new(&["p", "y"]),
                Tag::new(&["t", "z"]),
            ],
            content: String::new(),
            sig: String::new(),
        };
        let follows: Vec<&str> = ev.tag_values("p").collect();
        assert_eq!(follows, vec!["x", "y"]);
        assert_eq!(ev.tag("t").and_then(|t| t.value()), Some("z"));
    }
}
