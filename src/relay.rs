//! Single-relay connections: descriptors, WebSocket setup, one-shot fetch and
//! publish, and a long-lived listener for signer traffic.

use std::collections::BTreeSet;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::RngCore;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async, tungstenite::Message, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::event::Event;
use crate::filter::Filter;

/// Relays used when the caller has nothing better.
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.nostr.band",
];

/// Where a relay address was learned from. Tracked as a set per descriptor
/// for diagnostics; multiple sources may contribute the same address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RelaySource {
    /// Embedded hint in an identifier or tag.
    Hint,
    /// The user's declared write relays.
    WriteRelays,
    /// The user's relay-list record.
    RelayListRecord,
    /// Reported by the remote signer.
    Signer,
    /// Built-in defaults.
    Default,
    /// A static relay catalog.
    Catalog,
}

/// Declared role of a relay endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelayRole {
    /// Read-only.
    Read,
    /// Write-only.
    Write,
    /// Both directions.
    Both,
    /// Undeclared.
    #[default]
    Unknown,
}

/// A normalized relay endpoint with its role and provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayDescriptor {
    /// Normalized `ws://`/`wss://` address.
    pub url: String,
    /// Declared role.
    pub role: RelayRole,
    /// Every source that contributed this address.
    pub sources: BTreeSet<RelaySource>,
}

impl RelayDescriptor {
    /// Normalize `url` and build a descriptor.
    pub fn new(url: &str, role: RelayRole, source: RelaySource) -> Result<Self> {
        Ok(Self {
            url: normalize_relay_url(url)?,
            role,
            sources: BTreeSet::from([source]),
        })
    }

    /// Build a descriptor set from plain URLs, skipping unparseable ones.
    pub fn from_urls<'a>(
        urls: impl IntoIterator<Item = &'a str>,
        source: RelaySource,
    ) -> Vec<Self> {
        urls.into_iter()
            .filter_map(|u| Self::new(u, RelayRole::Unknown, source).ok())
            .collect()
    }

    /// The built-in fallback relay set, for callers with nothing better.
    pub fn defaults() -> Vec<Self> {
        Self::from_urls(DEFAULT_RELAYS.iter().copied(), RelaySource::Default)
    }
}

/// Normalize a relay address: lowercase scheme and host, drop default ports,
/// strip a lone trailing slash. Only `ws`/`wss` schemes are accepted.
pub fn normalize_relay_url(input: &str) -> Result<String> {
    let url = Url::parse(input)?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(Error::RelayUnreachable {
                url: input.to_string(),
                reason: format!("unsupported scheme: {other}"),
            })
        }
    }
    let mut s = url.to_string();
    // only a lone trailing slash is stripped; a query or fragment after the
    // path means the last character is not that slash
    if url.path() == "/" && url.query().is_none() && url.fragment().is_none() {
        s.pop();
    }
    Ok(s)
}

/// Network-level options threaded through every connection open.
#[derive(Debug, Clone, Default)]
pub struct NetOptions {
    /// Optional SOCKS5 proxy (`host:port`), e.g. a local Tor listener.
    pub socks5_proxy: Option<String>,
}

/// Blanket trait for boxed async read/write streams.
trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

type Socket = WebSocketStream<Box<dyn AsyncReadWrite + Unpin + Send>>;

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
async fn connect_ws(relay: &str, net: &NetOptions) -> Result<Socket> {
    let fail = |reason: String| Error::RelayUnreachable {
        url: relay.to_string(),
        reason,
    };
    let url = Url::parse(relay)?;
    let host = url.host_str().ok_or_else(|| fail("missing host".into()))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| fail("missing port".into()))?;
    let req = relay
        .into_client_request()
        .map_err(|e| fail(e.to_string()))?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = match &net.socks5_proxy {
        Some(proxy) => Box::new(
            Socks5Stream::connect(proxy.as_str(), (host, port))
                .await
                .map_err(|e| fail(e.to_string()))?,
        ),
        None => Box::new(
            TcpStream::connect((host, port))
                .await
                .map_err(|e| fail(e.to_string()))?,
        ),
    };
    let (ws, _) = client_async(req, stream)
        .await
        .map_err(|e| fail(e.to_string()))?;
    Ok(ws)
}

/// Fresh random subscription id.
pub(crate) fn subscription_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// One logical query against a single relay: send the filter, forward every
/// matching record to `tx`, and stop at the end-of-stored-results marker.
///
/// The whole exchange is bounded by `per_relay_timeout`; a relay that never
/// sends the marker is abandoned without error once the deadline passes.
pub(crate) async fn fetch_once(
    relay: &str,
    filter: &Filter,
    per_relay_timeout: Duration,
    net: &NetOptions,
    tx: mpsc::Sender<Event>,
) -> Result<()> {
    let deadline = Instant::now() + per_relay_timeout;
    let connect = timeout(per_relay_timeout, connect_ws(relay, net))
        .await
        .map_err(|_| Error::RelayUnreachable {
            url: relay.to_string(),
            reason: "connect timed out".into(),
        })??;
    let mut ws = connect;
    let sub = subscription_id();
    let req = json!(["REQ", sub, filter.to_json()]);
    ws.send(Message::Text(req.to_string()))
        .await
        .map_err(|e| Error::RelayUnreachable {
            url: relay.to_string(),
            reason: e.to_string(),
        })?;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            debug!(relay, "abandoning query: no completion marker before deadline");
            break;
        }
        let msg = match timeout(remaining, ws.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                return Err(Error::RelayUnreachable {
                    url: relay.to_string(),
                    reason: e.to_string(),
                })
            }
            Ok(None) => break,
            Err(_) => {
                debug!(relay, "abandoning query: no completion marker before deadline");
                break;
            }
        };
        match msg {
            Message::Text(txt) => {
                if let Ok(val) = serde_json::from_str::<Value>(&txt) {
                    if let Some(arr) = val.as_array() {
                        match arr.first().and_then(|v| v.as_str()) {
                            Some("EVENT") if arr.len() >= 3 => {
                                if let Ok(ev) = serde_json::from_value::<Event>(arr[2].clone()) {
                                    if tx.send(ev).await.is_err() {
                                        // collector gone, caller cancelled
                                        break;
                                    }
                                }
                            }
                            Some("EOSE") => break,
                            _ => {}
                        }
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    let _ = ws.send(Message::Text(json!(["CLOSE", sub]).to_string())).await;
    Ok(())
}

/// Per-relay result of a publish attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Relay acknowledged the event.
    Accepted,
    /// Relay replied with an explicit rejection.
    Rejected(String),
}

/// Send one signed event to a single relay and await its acknowledgement.
pub(crate) async fn publish_once(
    relay: &str,
    event: &Event,
    per_relay_timeout: Duration,
    net: &NetOptions,
) -> Result<PublishOutcome> {
    let unreachable = |reason: String| Error::RelayUnreachable {
        url: relay.to_string(),
        reason,
    };
    let deadline = Instant::now() + per_relay_timeout;
    let mut ws = timeout(per_relay_timeout, connect_ws(relay, net))
        .await
        .map_err(|_| unreachable("connect timed out".into()))??;
    ws.send(Message::Text(json!(["EVENT", event]).to_string()))
        .await
        .map_err(|e| unreachable(e.to_string()))?;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let msg = match timeout(remaining, ws.next()).await {
            Ok(Some(Ok(Message::Text(txt)))) => txt,
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                return Err(unreachable("closed before acknowledgement".into()))
            }
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(e))) => return Err(unreachable(e.to_string())),
            Err(_) => return Err(unreachable("no acknowledgement before deadline".into())),
        };
        if let Ok(val) = serde_json::from_str::<Value>(&msg) {
            if let Some(arr) = val.as_array() {
                if arr.first().and_then(|v| v.as_str()) == Some("OK")
                    && arr.get(1).and_then(|v| v.as_str()) == Some(event.id.as_str())
                {
                    let accepted = arr.get(2).and_then(|v| v.as_bool()).unwrap_or(false);
                    let reason = arr
                        .get(3)
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    return Ok(if accepted {
                        PublishOutcome::Accepted
                    } else {
                        PublishOutcome::Rejected(reason)
                    });
                }
            }
        }
    }
}

/// Handle to a long-lived per-relay subscription used for signer traffic.
///
/// Incoming events matching the filter are forwarded to the shared `evt_tx`;
/// events pushed into the returned sender are published on the same socket.
/// The task ends when the token is cancelled or the relay drops.
pub(crate) fn spawn_listener(
    relay: String,
    filter: Filter,
    net: NetOptions,
    evt_tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
) -> mpsc::Sender<Event> {
    let (out_tx, mut out_rx) = mpsc::channel::<Event>(16);
    tokio::spawn(async move {
        let mut ws = match connect_ws(&relay, &net).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(relay, error = %e, "signer listener connect failed");
                return;
            }
        };
        let sub = subscription_id();
        let req = json!(["REQ", sub, filter.to_json()]);
        if ws.send(Message::Text(req.to_string())).await.is_err() {
            return;
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = ws.send(Message::Close(None)).await;
                    break;
                }
                outgoing = out_rx.recv() => {
                    let Some(ev) = outgoing else { break };
                    let msg = json!(["EVENT", ev]).to_string();
                    if ws.send(Message::Text(msg)).await.is_err() {
                        warn!(relay, "signer listener send failed");
                        break;
                    }
                }
                incoming = ws.next() => {
                    match incoming {
                        Some(Ok(Message::Text(txt))) => {
                            if let Ok(val) = serde_json::from_str::<Value>(&txt) {
                                if let Some(arr) = val.as_array() {
                                    if arr.first().and_then(|v| v.as_str()) == Some("EVENT")
                                        && arr.len() >= 3
                                    {
                                        if let Ok(ev) =
                                            serde_json::from_value::<Event>(arr[2].clone())
                                        {
                                            if evt_tx.send(ev).await.is_err() {
                                                break;
                                            }
                                        }
                                    }
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(relay, error = %e, "signer listener read failed");
                            break;
                        }
                    }
                }
            }
        }
    });
    out_tx
}
