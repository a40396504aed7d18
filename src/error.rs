//! Error taxonomy shared across the crate.

use thiserror::Error;

/// Errors surfaced by the client core.
///
/// Per-relay and per-record failures are absorbed inside the query engine and
/// never reach callers through this type; only failures that invalidate an
/// entire operation do.
#[derive(Error, Debug)]
pub enum Error {
    /// A bech32 identifier failed checksum validation or carried an unknown
    /// prefix.
    #[error("malformed identifier: {0}")]
    MalformedIdentifier(String),

    /// No in-process signer was offered by the host application.
    #[error("no local signer available")]
    NoLocalSigner,

    /// The signer refused to perform the requested action.
    #[error("signer rejected the request: {0}")]
    SignerRejected(String),

    /// The signer connect handshake did not complete before its deadline.
    #[error("signer connect timed out")]
    SignerTimeout,

    /// A connected signer stopped answering request round-trips.
    #[error("no signer response before the per-call deadline")]
    SignerUnreachable,

    /// A signer request was issued while another was still in flight.
    #[error("a signer request is already in flight")]
    SignerBusy,

    /// A single relay could not be reached or dropped the connection.
    /// Non-fatal for multi-relay operations; surfaced only by single-relay
    /// calls.
    #[error("relay unreachable: {url}: {reason}")]
    RelayUnreachable { url: String, reason: String },

    /// Every write relay rejected (or failed to acknowledge) a publish.
    #[error("publish rejected by all relays")]
    PublishRejectedByAllRelays,

    /// A record could not satisfy the structural contract of its kind.
    #[error("record parse failure: {0}")]
    RecordParseFailure(String),

    /// The caller cancelled the operation. This is a normal completion path
    /// for queries and scans (they return partial results instead); only
    /// operations that cannot produce a partial value, such as a signer
    /// connect, surface it.
    #[error("cancelled")]
    Cancelled,

    /// Encryption or decryption of a payload failed.
    #[error("crypto failure: {0}")]
    Crypto(String),

    /// A URL could not be parsed.
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    /// JSON (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
