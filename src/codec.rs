//! bech32 identifier codec for keys, events, and addressable records.
//!
//! Converts between the protocol's human-readable identifiers (`npub…`,
//! `note…`, and the TLV-carrying `nevent…`/`nprofile…`/`naddr…` forms with
//! optional relay hints) and raw hex. Pure and side-effect free.

use bech32::{Bech32, Hrp};

use crate::error::{Error, Result};

const TLV_SPECIAL: u8 = 0;
const TLV_RELAY: u8 = 1;
const TLV_AUTHOR: u8 = 2;
const TLV_KIND: u8 = 3;

/// A decoded identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A public key (`npub`).
    Npub(String),
    /// A secret key (`nsec`).
    Nsec(String),
    /// A bare event id (`note`).
    Note(String),
    /// An event pointer with optional relay hints and author (`nevent`).
    Nevent {
        /// Event id, hex.
        id: String,
        /// Relay hints.
        relays: Vec<String>,
        /// Author public key, hex, if embedded.
        author: Option<String>,
    },
    /// A profile pointer with relay hints (`nprofile`).
    Nprofile {
        /// Public key, hex.
        pubkey: String,
        /// Relay hints.
        relays: Vec<String>,
    },
    /// An addressable-record pointer (`naddr`).
    Naddr {
        /// Author public key, hex.
        pubkey: String,
        /// Record kind.
        kind: u32,
        /// The `d` tag identifier.
        identifier: String,
        /// Relay hints.
        relays: Vec<String>,
    },
}

fn hrp(name: &str) -> Result<Hrp> {
    Hrp::parse(name).map_err(|e| Error::MalformedIdentifier(e.to_string()))
}

fn encode(prefix: &str, data: &[u8]) -> Result<String> {
    bech32::encode::<Bech32>(hrp(prefix)?, data)
        .map_err(|e| Error::MalformedIdentifier(e.to_string()))
}

fn decode_hex32(s: &str, what: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(s)
        .map_err(|e| Error::MalformedIdentifier(format!("bad {what} hex: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| Error::MalformedIdentifier(format!("{what} must be 32 bytes")))
}

/// Encode a hex public key as `npub…`.
pub fn hex_to_npub(pubkey: &str) -> Result<String> {
    encode("npub", &decode_hex32(pubkey, "pubkey")?)
}

/// Decode an `npub…` identifier to a hex public key.
pub fn npub_to_hex(npub: &str) -> Result<String> {
    match decode(npub)? {
        Decoded::Npub(pk) => Ok(pk),
        _ => Err(Error::MalformedIdentifier("expected npub".into())),
    }
}

/// Encode a hex event id as `note…`.
pub fn hex_to_note(id: &str) -> Result<String> {
    encode("note", &decode_hex32(id, "event id")?)
}

/// Encode a hex event id as `nevent…` with relay hints.
pub fn hex_to_nevent(id: &str, relays: &[String], author: Option<&str>) -> Result<String> {
    let mut data = Vec::new();
    push_tlv(&mut data, TLV_SPECIAL, &decode_hex32(id, "event id")?)?;
    for r in relays {
        push_tlv(&mut data, TLV_RELAY, r.as_bytes())?;
    }
    if let Some(a) = author {
        push_tlv(&mut data, TLV_AUTHOR, &decode_hex32(a, "author")?)?;
    }
    encode("nevent", &data)
}

/// Encode a profile pointer as `nprofile…` with relay hints.
pub fn hex_to_nprofile(pubkey: &str, relays: &[String]) -> Result<String> {
    let mut data = Vec::new();
    push_tlv(&mut data, TLV_SPECIAL, &decode_hex32(pubkey, "pubkey")?)?;
    for r in relays {
        push_tlv(&mut data, TLV_RELAY, r.as_bytes())?;
    }
    encode("nprofile", &data)
}

/// Encode an addressable-record pointer as `naddr…`.
pub fn to_naddr(pubkey: &str, kind: u32, identifier: &str, relays: &[String]) -> Result<String> {
    let mut data = Vec::new();
    push_tlv(&mut data, TLV_SPECIAL, identifier.as_bytes())?;
    for r in relays {
        push_tlv(&mut data, TLV_RELAY, r.as_bytes())?;
    }
    push_tlv(&mut data, TLV_AUTHOR, &decode_hex32(pubkey, "pubkey")?)?;
    push_tlv(&mut data, TLV_KIND, &kind.to_be_bytes())?;
    encode("naddr", &data)
}

/// Decode any supported identifier.
pub fn decode(ident: &str) -> Result<Decoded> {
    let (hrp, data) =
        bech32::decode(ident).map_err(|e| Error::MalformedIdentifier(e.to_string()))?;
    match hrp.as_str() {
        "npub" => Ok(Decoded::Npub(hex32(&data)?)),
        "nsec" => Ok(Decoded::Nsec(hex32(&data)?)),
        "note" => Ok(Decoded::Note(hex32(&data)?)),
        "nevent" => {
            let tlv = parse_tlv(&data)?;
            let id = tlv_special32(&tlv)?;
            Ok(Decoded::Nevent {
                id,
                relays: tlv_relays(&tlv),
                author: tlv_author(&tlv)?,
            })
        }
        "nprofile" => {
            let tlv = parse_tlv(&data)?;
            let pubkey = tlv_special32(&tlv)?;
            Ok(Decoded::Nprofile {
                pubkey,
                relays: tlv_relays(&tlv),
            })
        }
        "naddr" => {
            let tlv = parse_tlv(&data)?;
            let identifier = tlv
                .iter()
                .find(|(t, _)| *t == TLV_SPECIAL)
                .map(|(_, v)| String::from_utf8_lossy(v).into_owned())
                .ok_or_else(|| Error::MalformedIdentifier("naddr missing identifier".into()))?;
            let pubkey = tlv_author(&tlv)?
                .ok_or_else(|| Error::MalformedIdentifier("naddr missing author".into()))?;
            let kind = tlv
                .iter()
                .find(|(t, _)| *t == TLV_KIND)
                .and_then(|(_, v)| <[u8; 4]>::try_from(v.as_slice()).ok())
                .map(u32::from_be_bytes)
                .ok_or_else(|| Error::MalformedIdentifier("naddr missing kind".into()))?;
            Ok(Decoded::Naddr {
                pubkey,
                kind,
                identifier,
                relays: tlv_relays(&tlv),
            })
        }
        other => Err(Error::MalformedIdentifier(format!(
            "unknown prefix: {other}"
        ))),
    }
}

fn hex32(data: &[u8]) -> Result<String> {
    if data.len() != 32 {
        return Err(Error::MalformedIdentifier(format!(
            "expected 32 bytes, got {}",
            data.len()
        )));
    }
    Ok(hex::encode(data))
}

fn push_tlv(out: &mut Vec<u8>, tag: u8, value: &[u8]) -> Result<()> {
    let len = u8::try_from(value.len()).map_err(|_| {
        Error::MalformedIdentifier(format!("TLV value too long: {} bytes", value.len()))
    })?;
    out.push(tag);
    out.push(len);
    out.extend_from_slice(value);
    Ok(())
}

fn parse_tlv(data: &[u8]) -> Result<Vec<(u8, Vec<u8>)>> {
    let mut entries = Vec::new();
    let mut i = 0;
    while i + 2 <= data.len() {
        let tag = data[i];
        let len = data[i + 1] as usize;
        let end = i + 2 + len;
        if end > data.len() {
            return Err(Error::MalformedIdentifier("truncated TLV entry".into()));
        }
        entries.push((tag, data[i + 2..end].to_vec()));
        i = end;
    }
    if i != data.len() {
        return Err(Error::MalformedIdentifier("trailing TLV bytes".into()));
    }
    Ok(entries)
}

fn tlv_special32(tlv: &[(u8, Vec<u8>)]) -> Result<String> {
    tlv.iter()
        .find(|(t, _)| *t == TLV_SPECIAL)
        .map(|(_, v)| hex32(v))
        .ok_or_else(|| Error::MalformedIdentifier("missing TLV payload".into()))?
}

fn tlv_relays(tlv: &[(u8, Vec<u8>)]) -> Vec<String> {
    tlv.iter()
        .filter(|(t, _)| *t == TLV_RELAY)
        .filter_map(|(_, v)| String::from_utf8(v.clone()).ok())
        .collect()
}

fn tlv_author(tlv: &[(u8, Vec<u8>)]) -> Result<Option<String>> {
    tlv.iter()
        .find(|(t, _)| *t == TLV_AUTHOR)
        .map(|(_, v)| hex32(v))
        .transpose()
}
