//! End-to-end query and publish fan-out against in-process fake relays.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secp256k1::{Keypair, Secp256k1};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use mutecore::event::{KIND_FOLLOWS, KIND_MUTE_LIST};
use mutecore::model;
use mutecore::pool::{self, QueryUpdate};
use mutecore::relay::{RelayDescriptor, RelaySource};
use mutecore::{Error, Event, EventTemplate, Filter, QueryOptions, Tag};

fn init_logging() {
    let _ = tracing_subscriber::fmt::try_init();
}

fn keypair(seed: u8) -> Keypair {
    let secp = Secp256k1::new();
    Keypair::from_seckey_slice(&secp, &[seed; 32]).unwrap()
}

fn mute_record(kp: &Keypair, created_at: u64, muted: &str) -> Event {
    EventTemplate {
        kind: KIND_MUTE_LIST,
        created_at,
        tags: vec![Tag::new(&["p", muted])],
        content: String::new(),
    }
    .sign_with_keypair(kp)
    .unwrap()
}

/// Serve one subscription: send the given events, then EOSE, then linger.
async fn spawn_serving_relay(events: Vec<Event>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let events = events.clone();
            tokio::spawn(async move {
                let mut ws = accept_async(stream).await.unwrap();
                let sub = match ws.next().await {
                    Some(Ok(Message::Text(txt))) => {
                        let v: Value = serde_json::from_str(&txt).unwrap();
                        assert_eq!(v[0], "REQ");
                        v[1].as_str().unwrap().to_string()
                    }
                    other => panic!("unexpected: {other:?}"),
                };
                for ev in &events {
                    ws.send(Message::Text(json!(["EVENT", sub, ev]).to_string()))
                        .await
                        .unwrap();
                }
                ws.send(Message::Text(json!(["EOSE", sub]).to_string()))
                    .await
                    .unwrap();
                // stay open until the client closes
                while let Some(Ok(msg)) = ws.next().await {
                    if matches!(msg, Message::Close(_)) {
                        break;
                    }
                }
            });
        }
    });
    addr
}

/// Accept a subscription and never answer it.
async fn spawn_stalling_relay() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut ws = accept_async(stream).await.unwrap();
                let _ = ws.next().await;
                tokio::time::sleep(Duration::from_secs(60)).await;
            });
        }
    });
    addr
}

/// Answer every published event with an OK, accepted or rejected.
async fn spawn_publish_relay(accept: bool) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut ws = accept_async(stream).await.unwrap();
                while let Some(Ok(Message::Text(txt))) = ws.next().await {
                    let v: Value = serde_json::from_str(&txt).unwrap();
                    if v[0] == "EVENT" {
                        let id = v[1]["id"].as_str().unwrap();
                        let reply = json!(["OK", id, accept, if accept { "" } else { "blocked" }]);
                        ws.send(Message::Text(reply.to_string())).await.unwrap();
                    }
                }
            });
        }
    });
    addr
}

fn descriptors(addrs: &[SocketAddr]) -> Vec<RelayDescriptor> {
    init_logging();
    let urls: Vec<String> = addrs.iter().map(|a| format!("ws://{a}")).collect();
    RelayDescriptor::from_urls(urls.iter().map(String::as_str), RelaySource::Hint)
}

fn quick_opts() -> QueryOptions {
    QueryOptions {
        per_relay_timeout: Duration::from_millis(500),
        overall_deadline: Duration::from_secs(5),
        ..QueryOptions::default()
    }
}

// Three relays, two serving the same record, one never answering: exactly
// one record comes back and the accepted counter advances exactly once.
#[tokio::test]
async fn duplicate_answers_and_a_dead_relay_yield_one_record() {
    let kp = keypair(1);
    let author = hex::encode(kp.x_only_public_key().0.serialize());
    let record = mute_record(&kp, 100, &"bb".repeat(32));

    let r1 = spawn_serving_relay(vec![record.clone()]).await;
    let r2 = spawn_serving_relay(vec![record.clone()]).await;
    let r3 = spawn_stalling_relay().await;

    let filter = Filter::new().kinds([KIND_MUTE_LIST]).authors([author]);
    let (tx, mut rx) = mpsc::channel(32);
    let result = pool::query_with_updates(
        &filter,
        &descriptors(&[r1, r2, r3]),
        &quick_opts(),
        &CancellationToken::new(),
        tx,
    )
    .await;

    assert_eq!(result, vec![record]);
    let mut accepted = 0;
    while let Some(update) = rx.recv().await {
        if let QueryUpdate::Accepted { count } = update {
            accepted += 1;
            assert_eq!(count, 1);
        }
    }
    assert_eq!(accepted, 1);
}

// Replaceable resolution keeps the newest version regardless of which relay
// answers first.
#[tokio::test]
async fn newer_replaceable_record_wins_across_relays() {
    let kp = keypair(2);
    let old = mute_record(&kp, 100, &"bb".repeat(32));
    let new = mute_record(&kp, 200, &"cc".repeat(32));

    let r1 = spawn_serving_relay(vec![old.clone()]).await;
    let r2 = spawn_serving_relay(vec![new.clone(), old]).await;

    let result = pool::query(
        &Filter::new().kinds([KIND_MUTE_LIST]),
        &descriptors(&[r1, r2]),
        &quick_opts(),
        &CancellationToken::new(),
    )
    .await;
    assert_eq!(result, vec![new]);
}

// Unauthentic records never pass the pool.
#[tokio::test]
async fn tampered_records_are_dropped() {
    let kp = keypair(3);
    let mut forged = mute_record(&kp, 100, &"bb".repeat(32));
    forged.content = "tampered".into();

    let r1 = spawn_serving_relay(vec![forged]).await;
    let result = pool::query(
        &Filter::new().kinds([KIND_MUTE_LIST]),
        &descriptors(&[r1]),
        &quick_opts(),
        &CancellationToken::new(),
    )
    .await;
    assert!(result.is_empty());
}

// Cancellation resolves with what was accumulated, not an error.
#[tokio::test]
async fn cancellation_resolves_with_partial_results() {
    let kp = keypair(4);
    let record = mute_record(&kp, 100, &"bb".repeat(32));
    let r1 = spawn_serving_relay(vec![record.clone()]).await;
    let r2 = spawn_stalling_relay().await;

    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(32);
    let opts = QueryOptions {
        per_relay_timeout: Duration::from_secs(30),
        overall_deadline: Duration::from_secs(30),
        ..QueryOptions::default()
    };
    let relays = descriptors(&[r1, r2]);
    let filter = Filter::new().kinds([KIND_MUTE_LIST]);
    let cancel2 = cancel.clone();
    let task = tokio::spawn(async move {
        pool::query_with_updates(&filter, &relays, &opts, &cancel2, tx).await
    });
    // cancel as soon as the first record lands
    while let Some(update) = rx.recv().await {
        if matches!(update, QueryUpdate::Accepted { .. }) {
            cancel.cancel();
            break;
        }
    }
    let result = task.await.unwrap();
    assert_eq!(result, vec![record]);
}

#[tokio::test]
async fn empty_relay_set_returns_immediately() {
    let result = pool::query(
        &Filter::new(),
        &[],
        &QueryOptions::default(),
        &CancellationToken::new(),
    )
    .await;
    assert!(result.is_empty());
}

// A relay that ignores its filter cannot shadow the requested record: the
// off-filter answer is dropped before aggregation and the mute list is
// still found.
#[tokio::test]
async fn off_filter_records_cannot_shadow_the_requested_record() {
    let kp = keypair(7);
    let author = hex::encode(kp.x_only_public_key().0.serialize());
    let muted = "cc".repeat(32);
    let follows = EventTemplate {
        kind: KIND_FOLLOWS,
        created_at: 300,
        tags: vec![Tag::new(&["p", &"bb".repeat(32)])],
        content: String::new(),
    }
    .sign_with_keypair(&kp)
    .unwrap();
    let record = mute_record(&kp, 100, &muted);

    // the unrelated follows record arrives ahead of the requested one
    let r1 = spawn_serving_relay(vec![follows, record]).await;
    let list = model::fetch_mute_list(
        &author,
        &descriptors(&[r1]),
        &quick_opts(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    assert!(list.mutes_identity(&muted));
}

// All write relays rejecting is the only fatal publish outcome.
#[tokio::test]
async fn publish_rejected_by_every_relay_is_an_error() {
    let kp = keypair(5);
    let record = mute_record(&kp, 100, &"bb".repeat(32));
    let r1 = spawn_publish_relay(false).await;
    let r2 = spawn_publish_relay(false).await;
    let r3 = spawn_publish_relay(false).await;

    let err = pool::publish(&record, &descriptors(&[r1, r2, r3]), &quick_opts()).await;
    assert!(matches!(err, Err(Error::PublishRejectedByAllRelays)));
}

// One acceptance is success; rejections are recorded, not fatal.
#[tokio::test]
async fn publish_succeeds_with_a_single_acceptance() {
    let kp = keypair(6);
    let record = mute_record(&kp, 100, &"bb".repeat(32));
    let r1 = spawn_publish_relay(true).await;
    let r2 = spawn_publish_relay(false).await;

    let report = pool::publish(&record, &descriptors(&[r1, r2]), &quick_opts())
        .await
        .unwrap();
    assert_eq!(report.accepted.len(), 1);
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].1, "blocked");
}
