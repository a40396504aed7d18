//! Remote signer flows against an in-process fake signer that speaks the
//! encrypted kind-24133 protocol over a fake relay.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secp256k1::{Keypair, Secp256k1};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};

use mutecore::bunker::{BunkerConnection, BunkerUrl};
use mutecore::event::KIND_SIGNER_RPC;
use mutecore::{nip44, Error, Event, EventTemplate, NetOptions, SessionState, Tag};

fn keypair(seed: u8) -> Keypair {
    let secp = Secp256k1::new();
    Keypair::from_seckey_slice(&secp, &[seed; 32]).unwrap()
}

fn pubkey_hex(kp: &Keypair) -> String {
    hex::encode(kp.x_only_public_key().0.serialize())
}

/// How the fake signer answers a connect request.
#[derive(Clone, Copy)]
enum ConnectScript {
    /// Acknowledge immediately.
    Ack,
    /// Send an auth-challenge URL (twice, as duplicated relay delivery
    /// would) and never acknowledge.
    AuthChallengeOnly,
    /// Never answer anything.
    Silent,
}

/// One fake relay hosting one fake signer. Decrypts each incoming request
/// with the signer key and answers per the script; `get_public_key` and
/// `sign_event` target the user keypair.
async fn spawn_fake_signer(
    signer_kp: Keypair,
    user_kp: Keypair,
    script: ConnectScript,
) -> SocketAddr {
    let _ = tracing_subscriber::fmt::try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let ws = accept_async(stream).await.unwrap();
            tokio::spawn(serve_signer(ws, signer_kp, user_kp, script));
        }
    });
    addr
}

async fn serve_signer(
    mut ws: WebSocketStream<tokio::net::TcpStream>,
    signer_kp: Keypair,
    user_kp: Keypair,
    script: ConnectScript,
) {
    let mut sub = String::new();
    while let Some(Ok(Message::Text(txt))) = ws.next().await {
        let v: Value = serde_json::from_str(&txt).unwrap();
        match v[0].as_str() {
            Some("REQ") => sub = v[1].as_str().unwrap().to_string(),
            Some("EVENT") => {
                let request: Event = serde_json::from_value(v[1].clone()).unwrap();
                request.verify().unwrap();
                let plain =
                    nip44::decrypt(&signer_kp.secret_key(), &request.pubkey, &request.content)
                        .unwrap();
                let rpc: Value = serde_json::from_str(&plain).unwrap();
                let id = rpc["id"].as_str().unwrap();
                let method = rpc["method"].as_str().unwrap();
                let replies: Vec<Value> = match (method, script) {
                    ("connect", ConnectScript::Ack) => {
                        vec![json!({"id": id, "result": "ack"})]
                    }
                    ("connect", ConnectScript::AuthChallengeOnly) => {
                        let challenge = json!({
                            "id": id,
                            "result": "auth_url",
                            "error": "https://signer.example.com/authorize",
                        });
                        vec![challenge.clone(), challenge]
                    }
                    (_, ConnectScript::Silent) => vec![],
                    ("get_public_key", _) => {
                        vec![json!({"id": id, "result": pubkey_hex(&user_kp)})]
                    }
                    ("sign_event", _) => {
                        let template: EventTemplate =
                            serde_json::from_str(rpc["params"][0].as_str().unwrap()).unwrap();
                        let signed = template.sign_with_keypair(&user_kp).unwrap();
                        vec![json!({
                            "id": id,
                            "result": serde_json::to_string(&signed).unwrap(),
                        })]
                    }
                    _ => vec![json!({"id": id, "error": format!("unknown method {method}")})],
                };
                for reply in replies {
                    let content = nip44::encrypt(
                        &signer_kp.secret_key(),
                        &request.pubkey,
                        &reply.to_string(),
                    )
                    .unwrap();
                    let response = EventTemplate::now(
                        KIND_SIGNER_RPC,
                        vec![Tag::new(&["p", &request.pubkey])],
                        content,
                    )
                    .sign_with_keypair(&signer_kp)
                    .unwrap();
                    ws.send(Message::Text(json!(["EVENT", sub, response]).to_string()))
                        .await
                        .unwrap();
                }
            }
            _ => {}
        }
    }
}

fn bunker_url(signer_kp: &Keypair, addr: SocketAddr) -> BunkerUrl {
    BunkerUrl::parse(&format!(
        "bunker://{}?relay=ws%3A%2F%2F{addr}",
        pubkey_hex(signer_kp)
    ))
    .unwrap()
}

#[tokio::test]
async fn bunker_connect_yields_a_working_session() {
    let signer_kp = keypair(10);
    let user_kp = keypair(11);
    let addr = spawn_fake_signer(signer_kp, user_kp, ConnectScript::Ack).await;

    let conn = Arc::new(BunkerConnection::to_bunker(
        &bunker_url(&signer_kp, addr),
        &NetOptions::default(),
    ));
    let session = conn.connect(None, Duration::from_secs(5)).await.unwrap();
    assert_eq!(conn.state(), SessionState::Connected);
    assert_eq!(session.pubkey, pubkey_hex(&user_kp));

    // a signing round-trip through the remote
    let template = EventTemplate::now(1, vec![], "hello".into());
    let signed = session.signer.sign(template).await.unwrap();
    signed.verify().unwrap();
    assert_eq!(signed.pubkey, pubkey_hex(&user_kp));
    conn.cancel();
}

#[tokio::test]
async fn auth_challenge_then_cancel_ends_cancelled_with_one_callback() {
    let signer_kp = keypair(12);
    let user_kp = keypair(13);
    let addr = spawn_fake_signer(signer_kp, user_kp, ConnectScript::AuthChallengeOnly).await;

    let conn = Arc::new(BunkerConnection::to_bunker(
        &bunker_url(&signer_kp, addr),
        &NetOptions::default(),
    ));
    let invocations = Arc::new(AtomicUsize::new(0));
    let (challenged_tx, mut challenged_rx) = mpsc::channel::<String>(4);
    let hook = {
        let invocations = invocations.clone();
        Arc::new(move |url: String| {
            invocations.fetch_add(1, Ordering::SeqCst);
            let _ = challenged_tx.try_send(url);
        })
    };

    let canceller = conn.clone();
    tokio::spawn(async move {
        // cancel once the human-facing URL surfaced; give the duplicate
        // delivery time to land first
        let url = challenged_rx.recv().await.unwrap();
        assert_eq!(url, "https://signer.example.com/authorize");
        tokio::time::sleep(Duration::from_millis(200)).await;
        canceller.cancel();
    });

    let err = conn.connect(Some(hook), Duration::from_secs(10)).await;
    assert!(matches!(err, Err(Error::Cancelled)));
    assert_eq!(conn.state(), SessionState::Cancelled);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn silent_signer_times_out_and_fails() {
    let signer_kp = keypair(14);
    let user_kp = keypair(15);
    let addr = spawn_fake_signer(signer_kp, user_kp, ConnectScript::Silent).await;

    let conn = Arc::new(BunkerConnection::to_bunker(
        &bunker_url(&signer_kp, addr),
        &NetOptions::default(),
    ));
    let err = conn.connect(None, Duration::from_millis(300)).await;
    assert!(matches!(err, Err(Error::SignerTimeout)));
    assert_eq!(conn.state(), SessionState::Failed);
    conn.cancel();
}

#[tokio::test]
async fn second_request_while_one_is_outstanding_is_busy() {
    let signer_kp = keypair(16);
    let user_kp = keypair(17);
    let addr = spawn_fake_signer(signer_kp, user_kp, ConnectScript::Silent).await;

    let conn = Arc::new(BunkerConnection::to_bunker(
        &bunker_url(&signer_kp, addr),
        &NetOptions::default(),
    ));
    let racing = conn.clone();
    let outstanding =
        tokio::spawn(async move { racing.connect(None, Duration::from_secs(2)).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    let err = conn.connect(None, Duration::from_secs(2)).await;
    assert!(matches!(err, Err(Error::SignerBusy)));
    let _ = outstanding.await.unwrap();
    conn.cancel();
}

#[tokio::test]
async fn connect_uri_flow_trusts_only_the_secret_echo() {
    let signer_kp = keypair(18);
    let user_kp = keypair(19);

    // relay that, on subscription, plays the counterparty signer: echo the
    // secret from the URI, then serve RPCs like the bunker variant
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (conn, uri) = BunkerConnection::generate(
        &format!("ws://{addr}"),
        "mutecore tests",
        &NetOptions::default(),
    );
    let conn = Arc::new(conn);
    let parsed = url::Url::parse(&uri).unwrap();
    let client_pubkey = parsed.host_str().unwrap().to_string();
    let secret: String = parsed
        .query_pairs()
        .find(|(k, _)| k == "secret")
        .map(|(_, v)| v.into_owned())
        .unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let sub = match ws.next().await {
            Some(Ok(Message::Text(txt))) => {
                let v: Value = serde_json::from_str(&txt).unwrap();
                v[1].as_str().unwrap().to_string()
            }
            other => panic!("unexpected: {other:?}"),
        };
        // a wrong-secret response from an imposter must be ignored
        for (kp, echoed) in [(keypair(20), "wrong-secret".to_string()), (signer_kp, secret)] {
            let reply = json!({"id": "handshake", "result": echoed});
            let content =
                nip44::encrypt(&kp.secret_key(), &client_pubkey, &reply.to_string()).unwrap();
            let response = EventTemplate::now(
                KIND_SIGNER_RPC,
                vec![Tag::new(&["p", &client_pubkey])],
                content,
            )
            .sign_with_keypair(&kp)
            .unwrap();
            ws.send(Message::Text(json!(["EVENT", sub, response]).to_string()))
                .await
                .unwrap();
        }
        serve_signer(ws, signer_kp, user_kp, ConnectScript::Ack).await;
    });

    let session = conn
        .await_connect_uri(None, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(conn.state(), SessionState::Connected);
    assert_eq!(session.pubkey, pubkey_hex(&user_kp));
    conn.cancel();
}
