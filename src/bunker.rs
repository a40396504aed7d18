//! Remote signer transports: bunker connections and self-initiated
//! connect URIs.
//!
//! Both variants speak the same encrypted request/response protocol over
//! relay-carried kind-24133 events: requests are NIP-44 encrypted JSON
//! `{id, method, params}` envelopes signed by an ephemeral client key, and
//! responses are matched back by id. An `auth_url` response parks the
//! session in the awaiting-auth-challenge state until the human finishes the
//! browser flow or the caller gives up.

use std::sync::Mutex as StdMutex;
use std::time::Duration;

use secp256k1::{Keypair, Secp256k1};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};
use crate::event::{Event, EventTemplate, Tag, KIND_SIGNER_RPC};
use crate::filter::Filter;
use crate::nip44;
use crate::relay::{self, NetOptions};
use crate::signer::{Session, SessionState, Signer};

/// Default deadline for a single request/response round-trip.
pub const CALL_DEADLINE: Duration = Duration::from_secs(30);
/// Default deadline for the connect handshake. Generous because the
/// auth-challenge flow is human-paced.
pub const CONNECT_DEADLINE: Duration = Duration::from_secs(120);

/// Parsed `bunker://` connection URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BunkerUrl {
    /// The remote signer's declared public key, hex.
    pub signer_pubkey: String,
    /// Relays the remote signer listens on.
    pub relays: Vec<String>,
    /// Optional shared secret proving the URL holder.
    pub secret: Option<String>,
}

impl BunkerUrl {
    /// Parse `bunker://<hex-pubkey>?relay=…&relay=…&secret=…`.
    pub fn parse(input: &str) -> Result<Self> {
        let url = Url::parse(input)?;
        if url.scheme() != "bunker" {
            return Err(Error::MalformedIdentifier(format!(
                "expected bunker:// url, got {}",
                url.scheme()
            )));
        }
        let signer_pubkey = url
            .host_str()
            .ok_or_else(|| Error::MalformedIdentifier("bunker url missing pubkey".into()))?
            .to_string();
        if hex::decode(&signer_pubkey).map(|b| b.len()) != Ok(32) {
            return Err(Error::MalformedIdentifier(
                "bunker url pubkey must be 32 hex bytes".into(),
            ));
        }
        let mut relays = Vec::new();
        let mut secret = None;
        for (k, v) in url.query_pairs() {
            match k.as_ref() {
                "relay" => relays.push(v.into_owned()),
                "secret" => secret = Some(v.into_owned()),
                _ => {}
            }
        }
        if relays.is_empty() {
            return Err(Error::MalformedIdentifier(
                "bunker url carries no relays".into(),
            ));
        }
        Ok(Self {
            signer_pubkey,
            relays,
            secret,
        })
    }
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    id: &'a str,
    method: &'a str,
    params: &'a [String],
}

#[derive(Deserialize)]
struct RpcResponse {
    id: String,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Callback invoked when the remote signer demands a human authorization
/// step; receives the URL to visit.
pub type AuthChallengeHook = Arc<dyn Fn(String) + Send + Sync>;

/// A remote signer connection over relay-carried encrypted messages.
///
/// Covers both the remote-bunker variant (built from a [`BunkerUrl`]) and
/// the self-initiated connect-URI variant (built by
/// [`BunkerConnection::generate`]). Implements [`Signer`] once connected.
pub struct BunkerConnection {
    client_key: Keypair,
    client_pubkey: String,
    relays: Vec<String>,
    /// Remote signer's transport key; unknown for the connect-URI variant
    /// until the counterparty answers.
    signer_pubkey: StdMutex<Option<String>>,
    /// The identity the signer controls, cached after connect.
    user_pubkey: StdMutex<Option<String>>,
    secret: Option<String>,
    state: StdMutex<SessionState>,
    /// Single-flight gate: a second request while one is outstanding is
    /// rejected, never interleaved.
    gate: Mutex<()>,
    incoming: Mutex<mpsc::Receiver<Event>>,
    outgoing: Vec<mpsc::Sender<Event>>,
    cancel: CancellationToken,
    auth_hook: StdMutex<Option<AuthChallengeHook>>,
    call_deadline: Duration,
}

impl BunkerConnection {
    /// Open listeners toward a remote signer described by a `bunker://` URL.
    pub fn to_bunker(url: &BunkerUrl, net: &NetOptions) -> Self {
        Self::open(
            url.relays.clone(),
            Some(url.signer_pubkey.clone()),
            url.secret.clone(),
            net,
        )
    }

    /// Generate the self-initiated variant: an ephemeral keypair and a
    /// one-time URI to show the human (e.g. as a scannable code). The
    /// counterparty signer answers on the embedded relay.
    pub fn generate(relay: &str, app_name: &str, net: &NetOptions) -> (Self, String) {
        let secret = relay::subscription_id();
        let conn = Self::open(vec![relay.to_string()], None, Some(secret.clone()), net);
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("relay", relay)
            .append_pair("secret", &secret)
            .append_pair("name", app_name)
            .finish();
        let uri = format!("nostrconnect://{}?{query}", conn.client_pubkey);
        (conn, uri)
    }

    fn open(
        relays: Vec<String>,
        signer_pubkey: Option<String>,
        secret: Option<String>,
        net: &NetOptions,
    ) -> Self {
        let secp = Secp256k1::new();
        let client_key = Keypair::new(&secp, &mut rand::thread_rng());
        let client_pubkey = hex::encode(client_key.x_only_public_key().0.serialize());
        let cancel = CancellationToken::new();
        let (evt_tx, evt_rx) = mpsc::channel(32);
        let filter = Filter::new()
            .kinds([KIND_SIGNER_RPC])
            .tag_p([client_pubkey.clone()]);
        let outgoing = relays
            .iter()
            .map(|r| {
                relay::spawn_listener(
                    r.clone(),
                    filter.clone(),
                    net.clone(),
                    evt_tx.clone(),
                    cancel.clone(),
                )
            })
            .collect();
        Self {
            client_key,
            client_pubkey,
            relays,
            signer_pubkey: StdMutex::new(signer_pubkey),
            user_pubkey: StdMutex::new(None),
            secret,
            state: StdMutex::new(SessionState::Idle),
            gate: Mutex::new(()),
            incoming: Mutex::new(evt_rx),
            outgoing,
            cancel,
            auth_hook: StdMutex::new(None),
            call_deadline: CALL_DEADLINE,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    /// Relays this connection listens on.
    pub fn relays(&self) -> &[String] {
        &self.relays
    }

    /// Cancel the connection. Safe from any state; releases the held
    /// listening connections and makes pending calls resolve.
    pub fn cancel(&self) {
        self.set_state(SessionState::Cancelled);
        self.cancel.cancel();
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap() = state;
    }

    fn remote_pubkey(&self) -> Result<String> {
        self.signer_pubkey
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::SignerUnreachable)
    }

    /// Run the connect handshake against a remote bunker. Surfaces an
    /// auth-challenge URL through `on_auth` (at most once) and keeps
    /// listening until the signer acknowledges, the deadline elapses, or
    /// the caller cancels. [`CONNECT_DEADLINE`] is the usual deadline.
    pub async fn connect(
        self: &Arc<Self>,
        on_auth: Option<AuthChallengeHook>,
        deadline: Duration,
    ) -> Result<Session> {
        *self.auth_hook.lock().unwrap() = on_auth;
        self.set_state(SessionState::Connecting);
        let remote = self.remote_pubkey()?;
        let mut params = vec![remote.clone()];
        if let Some(secret) = &self.secret {
            params.push(secret.clone());
        }
        let ack = self.rpc("connect", params, deadline).await;
        self.finish_connect(ack).await
    }

    /// Await the counterparty of a generated connect URI. The responder
    /// must echo the one-time secret before it is trusted.
    pub async fn await_connect_uri(
        self: &Arc<Self>,
        on_auth: Option<AuthChallengeHook>,
        deadline: Duration,
    ) -> Result<Session> {
        *self.auth_hook.lock().unwrap() = on_auth;
        self.set_state(SessionState::Connecting);
        let secret = self.secret.clone().unwrap_or_default();
        let until = Instant::now() + deadline;
        let handshake = {
            let _guard = self.gate.try_lock().map_err(|_| Error::SignerBusy)?;
            let mut incoming = self.incoming.lock().await;
            loop {
                let ev = tokio::select! {
                    _ = self.cancel.cancelled() => break Err(Error::Cancelled),
                    _ = sleep_until(until) => break Err(Error::SignerTimeout),
                    ev = incoming.recv() => match ev {
                        Some(ev) => ev,
                        None => break Err(Error::SignerTimeout),
                    },
                };
                // any responder may answer here; trust rests on the secret echo
                match self.open_response(&ev, None) {
                    Some(resp) if resp.result.as_deref() == Some(secret.as_str()) => {
                        break Ok(ev.pubkey.clone());
                    }
                    Some(_) | None => continue,
                }
            }
        };
        match handshake {
            Ok(counterparty) => {
                *self.signer_pubkey.lock().unwrap() = Some(counterparty);
                self.finish_connect(Ok("ack".into())).await
            }
            Err(e) => self.finish_connect(Err(e)).await,
        }
    }

    async fn finish_connect(self: &Arc<Self>, ack: Result<String>) -> Result<Session> {
        if let Err(e) = ack {
            match &e {
                Error::Cancelled => self.set_state(SessionState::Cancelled),
                // a concurrent attempt; the state belongs to the one in flight
                Error::SignerBusy => {}
                _ => {
                    // a cancel that raced the deadline keeps its state
                    if self.state() != SessionState::Cancelled {
                        self.set_state(SessionState::Failed);
                    }
                }
            }
            return Err(e);
        }
        let user = self.rpc("get_public_key", vec![], self.call_deadline).await;
        match user {
            Ok(pubkey) => {
                *self.user_pubkey.lock().unwrap() = Some(pubkey);
                self.set_state(SessionState::Connected);
                let relays = relay::RelayDescriptor::from_urls(
                    self.relays.iter().map(String::as_str),
                    relay::RelaySource::Signer,
                );
                let signer: Arc<dyn Signer> = self.clone();
                Session::new(signer, relays).await
            }
            Err(e) => {
                if self.state() != SessionState::Cancelled {
                    self.set_state(SessionState::Failed);
                }
                Err(e)
            }
        }
    }

    /// One encrypted request/response round-trip.
    async fn rpc(&self, method: &str, params: Vec<String>, deadline: Duration) -> Result<String> {
        let _guard = self.gate.try_lock().map_err(|_| Error::SignerBusy)?;
        let remote = self.remote_pubkey()?;
        let id = relay::subscription_id();
        let request = serde_json::to_string(&RpcRequest {
            id: &id,
            method,
            params: &params,
        })?;
        let content = nip44::encrypt(&self.client_key.secret_key(), &remote, &request)?;
        let event = EventTemplate::now(
            KIND_SIGNER_RPC,
            vec![Tag::new(&["p", &remote])],
            content,
        )
        .sign_with_keypair(&self.client_key)?;
        for out in &self.outgoing {
            let _ = out.send(event.clone()).await;
        }

        let until = Instant::now() + deadline;
        let mut auth_seen = false;
        let mut incoming = self.incoming.lock().await;
        loop {
            let ev = tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                _ = sleep_until(until) => {
                    return Err(if method == "connect" {
                        Error::SignerTimeout
                    } else {
                        Error::SignerUnreachable
                    });
                }
                ev = incoming.recv() => match ev {
                    Some(ev) => ev,
                    None => return Err(Error::SignerUnreachable),
                },
            };
            let Some(resp) = self.open_response(&ev, Some(&remote)) else {
                continue;
            };
            if resp.id != id {
                continue;
            }
            if resp.result.as_deref() == Some("auth_url") {
                // the error field carries the URL in this protocol
                if !auth_seen {
                    auth_seen = true;
                    self.set_state(SessionState::AwaitingAuthChallenge);
                    let hook = self.auth_hook.lock().unwrap().clone();
                    if let Some(hook) = hook {
                        hook(resp.error.clone().unwrap_or_default());
                    }
                }
                continue;
            }
            if let Some(err) = resp.error.filter(|e| !e.is_empty()) {
                return Err(Error::SignerRejected(err));
            }
            return Ok(resp.result.unwrap_or_default());
        }
    }

    /// Authenticate, decrypt, and parse a relay-delivered response event.
    /// Anything unauthentic or malformed is skipped, not fatal.
    fn open_response(&self, ev: &Event, expected_peer: Option<&str>) -> Option<RpcResponse> {
        if ev.kind != KIND_SIGNER_RPC {
            return None;
        }
        if let Some(peer) = expected_peer {
            if ev.pubkey != peer {
                return None;
            }
        }
        if let Err(e) = ev.verify() {
            debug!(id = ev.id, error = %e, "skipping unauthentic signer response");
            return None;
        }
        let plain = nip44::decrypt(&self.client_key.secret_key(), &ev.pubkey, &ev.content).ok()?;
        serde_json::from_str(&plain).ok()
    }
}

#[async_trait::async_trait]
impl Signer for BunkerConnection {
    async fn public_key(&self) -> Result<String> {
        if let Some(pk) = self.user_pubkey.lock().unwrap().clone() {
            return Ok(pk);
        }
        let pk = self.rpc("get_public_key", vec![], self.call_deadline).await?;
        *self.user_pubkey.lock().unwrap() = Some(pk.clone());
        Ok(pk)
    }

    async fn sign(&self, template: EventTemplate) -> Result<Event> {
        let params = vec![serde_json::to_string(&template)?];
        let signed = self.rpc("sign_event", params, self.call_deadline).await?;
        let event: Event = serde_json::from_str(&signed)
            .map_err(|e| Error::SignerRejected(format!("unparseable signed event: {e}")))?;
        event.verify()?;
        Ok(event)
    }

    async fn encrypt(&self, peer: &str, plaintext: &str) -> Result<String> {
        self.rpc(
            "nip44_encrypt",
            vec![peer.to_string(), plaintext.to_string()],
            self.call_deadline,
        )
        .await
    }

    async fn decrypt(&self, peer: &str, ciphertext: &str) -> Result<String> {
        self.rpc(
            "nip44_decrypt",
            vec![peer.to_string(), ciphertext.to_string()],
            self.call_deadline,
        )
        .await
    }
}
