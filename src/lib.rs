//! Protocol client core for a Nostr mute-list manager.
//!
//! Talks to an arbitrary, unreliable set of independent relays over the
//! publish/subscribe wire protocol, reconciles their inconsistent and
//! duplicate answers into one deduplicated view, brokers local and remote
//! signing sessions, and runs the social-graph scanners the moderation UI is
//! built on. Every operation takes its relay set explicitly; nothing reads
//! ambient state, and nothing is persisted here.
//!
//! Layering, leaves first: [`codec`] (identifiers) → [`relay`] (one
//! connection) → [`pool`] (fan-out, dedup, cancellation) → [`model`] and
//! [`scan`]. Signing lives in [`signer`] with the relay-carried transports
//! in [`bunker`]; [`nip44`] is the payload encryption both depend on.

pub mod bunker;
pub mod codec;
pub mod error;
pub mod event;
pub mod filter;
pub mod model;
pub mod nip44;
pub mod pool;
pub mod relay;
pub mod scan;
pub mod signer;

pub use bunker::{BunkerConnection, BunkerUrl};
pub use error::{Error, Result};
pub use event::{Event, EventTemplate, Tag};
pub use filter::Filter;
pub use model::{FollowList, MuteEntry, MuteList, Pack, Profile};
pub use pool::{PublishReport, QueryOptions, QueryUpdate};
pub use relay::{NetOptions, RelayDescriptor, RelayRole, RelaySource, DEFAULT_RELAYS};
pub use scan::{ScanEvent, ScanOptions};
pub use signer::{connect_local, LocalSigner, Session, SessionState, Signer};
