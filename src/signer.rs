//! Signer sessions: one request/response contract over two transports.
//!
//! A [`Signer`] performs the four operations every publishing flow needs:
//! sign a template, report its public key, and encrypt/decrypt payloads for a
//! peer. [`LocalSigner`] is the in-process variant; the relay-carried remote
//! variants live in [`crate::bunker`].

use std::sync::Arc;

use async_trait::async_trait;
use secp256k1::{Keypair, Secp256k1};

use crate::error::{Error, Result};
use crate::event::{Event, EventTemplate};
use crate::nip44;
use crate::relay::RelayDescriptor;

/// The request/response contract both transports implement.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Hex public key of the identity this signer controls.
    async fn public_key(&self) -> Result<String>;
    /// Hash and sign a template into a complete event.
    async fn sign(&self, template: EventTemplate) -> Result<Event>;
    /// Encrypt a payload for `peer` (hex public key).
    async fn encrypt(&self, peer: &str, plaintext: &str) -> Result<String>;
    /// Decrypt a payload from `peer` (hex public key).
    async fn decrypt(&self, peer: &str, ciphertext: &str) -> Result<String>;
}

/// Lifecycle of a signer connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing started.
    Idle,
    /// Handshake in flight.
    Connecting,
    /// The remote signer asked the human to visit an authorization URL;
    /// still listening for the follow-up response.
    AwaitingAuthChallenge,
    /// Handshake complete; requests may be issued.
    Connected,
    /// Closed by the caller after connecting.
    Closed,
    /// Handshake failed or timed out.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
}

/// An authenticated application session.
///
/// Held in memory for the life of the application session and never
/// persisted by the core. The relay set travels with it so callers thread it
/// explicitly into every operation.
#[derive(Clone)]
pub struct Session {
    /// The user's hex public key.
    pub pubkey: String,
    /// The signer backing this session.
    pub signer: Arc<dyn Signer>,
    /// The relay set associated with the session.
    pub relays: Vec<RelayDescriptor>,
}

impl Session {
    /// Build a session by asking the signer for its public key.
    pub async fn new(signer: Arc<dyn Signer>, relays: Vec<RelayDescriptor>) -> Result<Self> {
        let pubkey = signer.public_key().await?;
        Ok(Self {
            pubkey,
            signer,
            relays,
        })
    }
}

/// Decides whether the in-process signer performs a requested signature.
/// The host application wires its consent UI in here; the default approves
/// everything.
pub type SignPolicy = dyn Fn(&EventTemplate) -> bool + Send + Sync;

/// In-process signer holding a raw keypair.
///
/// Completes synchronously. A policy hook models the human approval step of
/// a browser-extension signer: denial maps to [`Error::SignerRejected`].
pub struct LocalSigner {
    keypair: Keypair,
    pubkey: String,
    policy: Option<Box<SignPolicy>>,
}

impl LocalSigner {
    /// Build from a 32-byte secret key.
    pub fn from_secret_key(secret: &[u8; 32]) -> Result<Self> {
        let secp = Secp256k1::new();
        let keypair = Keypair::from_seckey_slice(&secp, secret)
            .map_err(|e| Error::Crypto(format!("bad secret key: {e}")))?;
        let pubkey = hex::encode(keypair.x_only_public_key().0.serialize());
        Ok(Self {
            keypair,
            pubkey,
            policy: None,
        })
    }

    /// Generate a fresh random keypair (used for ephemeral transport keys).
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let keypair = Keypair::new(&secp, &mut rand::thread_rng());
        let pubkey = hex::encode(keypair.x_only_public_key().0.serialize());
        Self {
            keypair,
            pubkey,
            policy: None,
        }
    }

    /// Install a consent policy consulted before every signature.
    pub fn with_policy(mut self, policy: Box<SignPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }
}

#[async_trait]
impl Signer for LocalSigner {
    async fn public_key(&self) -> Result<String> {
        Ok(self.pubkey.clone())
    }

    async fn sign(&self, template: EventTemplate) -> Result<Event> {
        if let Some(policy) = &self.policy {
            if !policy(&template) {
                return Err(Error::SignerRejected("denied by policy".into()));
            }
        }
        template.sign_with_keypair(&self.keypair)
    }

    async fn encrypt(&self, peer: &str, plaintext: &str) -> Result<String> {
        nip44::encrypt(&self.keypair.secret_key(), peer, plaintext)
    }

    async fn decrypt(&self, peer: &str, ciphertext: &str) -> Result<String> {
        nip44::decrypt(&self.keypair.secret_key(), peer, ciphertext)
    }
}

/// Connect using an in-process signer offered by the host application.
///
/// This is the local-extension transport: presence of the capability moves
/// straight to `connected`; absence fails immediately.
pub async fn connect_local(
    provider: Option<Arc<dyn Signer>>,
    relays: Vec<RelayDescriptor>,
) -> Result<Session> {
    let signer = provider.ok_or(Error::NoLocalSigner)?;
    Session::new(signer, relays).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Tag, KIND_POST};

    fn template() -> EventTemplate {
        EventTemplate {
            kind: KIND_POST,
            created_at: 1,
            tags: vec![Tag::new(&["t", "x"])],
            content: "hi".into(),
        }
    }

    #[tokio::test]
    async fn local_signer_signs_verifiable_events() {
        let signer = LocalSigner::from_secret_key(&[7u8; 32]).unwrap();
        let ev = signer.sign(template()).await.unwrap();
        ev.verify().unwrap();
        assert_eq!(ev.pubkey, signer.public_key().await.unwrap());
    }

    #[tokio::test]
    async fn local_signer_policy_denial_maps_to_rejected() {
        let signer = LocalSigner::from_secret_key(&[7u8; 32])
            .unwrap()
            .with_policy(Box::new(|_| false));
        assert!(matches!(
            signer.sign(template()).await,
            Err(Error::SignerRejected(_))
        ));
    }

    #[tokio::test]
    async fn local_signer_encrypts_for_peer() {
        let alice = LocalSigner::from_secret_key(&[1u8; 32]).unwrap();
        let bob = LocalSigner::from_secret_key(&[2u8; 32]).unwrap();
        let alice_pk = alice.public_key().await.unwrap();
        let bob_pk = bob.public_key().await.unwrap();
        let ct = alice.encrypt(&bob_pk, "psst").await.unwrap();
        assert_eq!(bob.decrypt(&alice_pk, &ct).await.unwrap(), "psst");
    }

    #[tokio::test]
    async fn connect_local_without_capability_fails() {
        assert!(matches!(
            connect_local(None, vec![]).await,
            Err(Error::NoLocalSigner)
        ));
    }

    #[tokio::test]
    async fn connect_local_with_capability_yields_session() {
        let signer: Arc<dyn Signer> = Arc::new(LocalSigner::from_secret_key(&[7u8; 32]).unwrap());
        let session = connect_local(Some(signer.clone()), vec![]).await.unwrap();
        assert_eq!(session.pubkey, signer.public_key().await.unwrap());
    }
}
