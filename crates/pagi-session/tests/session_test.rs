//! Integration tests for the gateway session against an in-process gateway.
//!
//! `MockConnector` hands every opened link to the test as a `ServerLink`, which plays the
//! gateway side of the protocol frame by frame.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use pagi_session::{
    Connection, ConnectionState, Connector, GatewayChat, GatewayEndpoint, GatewayError,
    GatewayEvent, GatewayResult, GatewaySession, KeyValueStore, MemoryStore, SessionConfig,
    TrustStore,
};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

struct ChannelConnection {
    to_server: mpsc::Sender<String>,
    from_server: mpsc::Receiver<String>,
}

#[async_trait]
impl Connection for ChannelConnection {
    async fn send_text(&mut self, text: String) -> GatewayResult<()> {
        self.to_server
            .send(text)
            .await
            .map_err(|_| GatewayError::Transport("server gone".into()))
    }

    async fn next_text(&mut self) -> Option<GatewayResult<String>> {
        self.from_server.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.from_server.close();
    }
}

/// Gateway side of one link.
struct ServerLink {
    to_client: mpsc::Sender<String>,
    from_client: mpsc::Receiver<String>,
}

impl ServerLink {
    async fn send(&self, frame: Value) {
        self.to_client.send(frame.to_string()).await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        let text = timeout(WAIT, self.from_client.recv())
            .await
            .expect("client frame timeout")
            .expect("client closed");
        serde_json::from_str(&text).unwrap()
    }

    async fn challenge(&self, nonce: &str) {
        self.send(json!({
            "type": "event",
            "event": "connect.challenge",
            "payload": { "nonce": nonce, "ts": 1_700_000_000_000i64 }
        }))
        .await;
    }

    async fn respond_ok(&self, request: &Value, payload: Value) {
        self.send(json!({"type": "res", "id": request["id"], "ok": true, "payload": payload}))
            .await;
    }

    async fn respond_err(&self, request: &Value, code: &str, message: &str) {
        self.send(json!({
            "type": "res",
            "id": request["id"],
            "ok": false,
            "error": { "code": code, "message": message }
        }))
        .await;
    }

    /// Challenge the client and accept its `connect`; returns the connect params.
    async fn accept(&mut self, hello: Value) -> Value {
        self.challenge("nonce-1").await;
        let request = self.recv().await;
        assert_eq!(request["method"], "connect");
        self.respond_ok(&request, hello).await;
        request["params"].clone()
    }
}

struct MockConnector {
    links: mpsc::UnboundedSender<ServerLink>,
    attempts: AtomicUsize,
    fail_with: Option<GatewayError>,
}

impl MockConnector {
    fn new(fail_with: Option<GatewayError>) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerLink>) {
        let (links, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            links,
            attempts: AtomicUsize::new(0),
            fail_with,
        });
        (connector, rx)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _endpoint: &GatewayEndpoint) -> GatewayResult<Box<dyn Connection>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.fail_with {
            return Err(err.clone());
        }
        let (to_server, from_client) = mpsc::channel(32);
        let (to_client, from_server) = mpsc::channel(32);
        let _ = self.links.send(ServerLink {
            to_client,
            from_client,
        });
        Ok(Box::new(ChannelConnection {
            to_server,
            from_server,
        }))
    }
}

fn endpoint() -> GatewayEndpoint {
    GatewayEndpoint::manual("gateway.test", 18789, false)
}

fn hello() -> Value {
    json!({
        "type": "hello-ok",
        "protocol": 3,
        "snapshot": { "sessionDefaults": { "mainSessionKey": "agent:main:main" } }
    })
}

fn build_session(
    config: SessionConfig,
    connector: Arc<MockConnector>,
) -> (GatewaySession, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let trust = Arc::new(TrustStore::new(store.clone()));
    let session = GatewaySession::new(config, store.clone(), trust, connector).unwrap();
    (session, store)
}

async fn next_link(links: &mut mpsc::UnboundedReceiver<ServerLink>) -> ServerLink {
    timeout(WAIT, links.recv())
        .await
        .expect("no connection attempt")
        .expect("connector dropped")
}

async fn wait_for(
    session: &GatewaySession,
    predicate: impl FnMut(&ConnectionState) -> bool,
) -> ConnectionState {
    let mut rx = session.watch_state();
    let state = timeout(WAIT, rx.wait_for(predicate))
        .await
        .expect("state timeout")
        .expect("state channel closed")
        .clone();
    state
}

async fn connected_session() -> (GatewaySession, ServerLink) {
    let (connector, mut links) = MockConnector::new(None);
    let (session, _store) = build_session(SessionConfig::default(), connector);
    session.connect(endpoint()).await;
    let mut link = next_link(&mut links).await;
    link.accept(hello()).await;
    wait_for(&session, ConnectionState::is_connected).await;
    (session, link)
}

#[tokio::test]
async fn test_handshake_signs_challenge() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let (connector, mut links) = MockConnector::new(None);
    let (session, store) = build_session(SessionConfig::default(), connector);
    session.connect(endpoint()).await;

    let mut link = next_link(&mut links).await;
    link.challenge("n-123").await;
    let request = link.recv().await;
    assert_eq!(request["type"], "req");
    assert_eq!(request["method"], "connect");

    let params = &request["params"];
    let device = &params["device"];
    assert_eq!(params["minProtocol"], 3);
    assert_eq!(params["maxProtocol"], 3);
    assert_eq!(params["role"], "operator");
    assert_eq!(device["id"], session.device_id());
    assert_eq!(device["nonce"], "n-123");
    assert!(params.get("auth").is_none());

    let signed_at = device["signedAt"].as_i64().unwrap();
    let expected = format!(
        "v2|{}|pagi-talk|ui|operator||{}||n-123",
        session.device_id(),
        signed_at
    );
    let public_key: [u8; 32] = URL_SAFE_NO_PAD
        .decode(device["publicKey"].as_str().unwrap())
        .unwrap()
        .try_into()
        .unwrap();
    let signature = URL_SAFE_NO_PAD
        .decode(device["signature"].as_str().unwrap())
        .unwrap();
    let key = VerifyingKey::from_bytes(&public_key).unwrap();
    key.verify(
        expected.as_bytes(),
        &Signature::from_slice(&signature).unwrap(),
    )
    .unwrap();

    let mut welcome = hello();
    welcome["auth"] = json!({ "deviceToken": "dev-token-1" });
    link.respond_ok(&request, welcome).await;

    let state = wait_for(&session, ConnectionState::is_connected).await;
    assert_eq!(
        state,
        ConnectionState::Connected {
            session_key: Some("agent:main:main".into())
        }
    );
    assert_eq!(session.main_session_key().as_deref(), Some("agent:main:main"));
    assert_eq!(
        store.get("auth.device_token.operator").unwrap().as_deref(),
        Some("dev-token-1")
    );

    session.disconnect().await;
}

#[tokio::test]
async fn test_issued_device_token_replaces_shared_token() {
    let (connector, mut links) = MockConnector::new(None);
    let config = SessionConfig {
        shared_token: Some("shared-secret".into()),
        ..SessionConfig::default()
    };
    let (session, _store) = build_session(config, connector);
    session.connect(endpoint()).await;

    let mut link = next_link(&mut links).await;
    let mut welcome = hello();
    welcome["auth"] = json!({ "deviceToken": "dev-token-2" });
    let params = link.accept(welcome).await;
    assert_eq!(params["auth"]["token"], "shared-secret");
    wait_for(&session, ConnectionState::is_connected).await;

    // Gateway drops the link; the session reconnects on its own.
    drop(link);
    let mut link = next_link(&mut links).await;
    let params = link.accept(hello()).await;
    assert_eq!(params["auth"]["token"], "dev-token-2");
    wait_for(&session, ConnectionState::is_connected).await;

    session.disconnect().await;
}

#[tokio::test]
async fn test_every_request_resolves_once() {
    let (session, mut link) = connected_session().await;

    let mut handles = Vec::new();
    for i in 0..5u64 {
        let session = session.clone();
        handles.push(tokio::spawn(async move {
            session.request("echo", json!({ "i": i })).await
        }));
    }

    let mut requests = Vec::new();
    for _ in 0..5 {
        requests.push(link.recv().await);
    }
    let ids: HashSet<String> = requests
        .iter()
        .map(|r| r["id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids.len(), 5);

    // Answer out of order.
    for request in requests.iter().rev() {
        link.respond_ok(request, json!({ "i": request["params"]["i"] }))
            .await;
    }
    for (i, handle) in handles.into_iter().enumerate() {
        let payload = handle.await.unwrap().unwrap();
        assert_eq!(payload["i"], i as u64);
    }
    assert_eq!(session.pending_requests(), 0);

    // A duplicate response has nobody left to resolve.
    link.respond_ok(&requests[0], json!({})).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session.pending_requests(), 0);

    session.disconnect().await;
}

#[tokio::test]
async fn test_protocol_error_goes_to_caller_only() {
    let (session, mut link) = connected_session().await;

    let caller = {
        let session = session.clone();
        tokio::spawn(async move { session.request("chat.history", json!({})).await })
    };
    let request = link.recv().await;
    link.respond_err(&request, "INVALID_REQUEST", "sessionKey required")
        .await;

    assert_eq!(
        caller.await.unwrap(),
        Err(GatewayError::Protocol {
            code: "INVALID_REQUEST".into(),
            message: "sessionKey required".into()
        })
    );
    assert!(session.state().is_connected());

    session.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_fails_pending_requests() {
    let (session, mut link) = connected_session().await;

    let pending = {
        let session = session.clone();
        tokio::spawn(async move { session.request("chat.history", json!({})).await })
    };
    let _request = link.recv().await;
    assert_eq!(session.pending_requests(), 1);

    session.disconnect().await;
    assert_eq!(pending.await.unwrap(), Err(GatewayError::Disconnected));
    assert_eq!(session.pending_requests(), 0);
    assert_eq!(session.state(), ConnectionState::Disconnected);

    // Second disconnect is harmless.
    session.disconnect().await;
    assert_eq!(
        session.request("chat.history", json!({})).await,
        Err(GatewayError::NotConnected)
    );
}

#[tokio::test]
async fn test_request_timeout_removes_handle() {
    let (connector, mut links) = MockConnector::new(None);
    let config = SessionConfig {
        request_timeout: Duration::from_millis(200),
        ..SessionConfig::default()
    };
    let (session, _store) = build_session(config, connector);
    session.connect(endpoint()).await;
    let mut link = next_link(&mut links).await;
    link.accept(hello()).await;
    wait_for(&session, ConnectionState::is_connected).await;

    let result = session.request("slow.method", json!({})).await;
    assert_eq!(
        result,
        Err(GatewayError::Timeout {
            method: "slow.method".into(),
            timeout_ms: 200
        })
    );
    assert_eq!(session.pending_requests(), 0);

    session.disconnect().await;
}

#[tokio::test]
async fn test_pairing_required_is_its_own_state() {
    let (connector, mut links) = MockConnector::new(None);
    let (session, _store) = build_session(SessionConfig::default(), connector);
    session.connect(endpoint()).await;

    let mut link = next_link(&mut links).await;
    link.challenge("n").await;
    let request = link.recv().await;
    link.respond_err(&request, "NOT_PAIRED", "pairing required")
        .await;

    let state = wait_for(&session, |s| *s == ConnectionState::WaitingForPairing).await;
    assert_eq!(state, ConnectionState::WaitingForPairing);

    // The loop keeps trying until an operator approves the device.
    let mut retry = next_link(&mut links).await;
    retry.accept(hello()).await;
    wait_for(&session, ConnectionState::is_connected).await;

    session.disconnect().await;
}

#[tokio::test]
async fn test_missing_challenge_fails_attempt() {
    let (connector, mut links) = MockConnector::new(None);
    let config = SessionConfig {
        challenge_timeout: Duration::from_millis(100),
        ..SessionConfig::default()
    };
    let (session, _store) = build_session(config, connector);
    session.connect(endpoint()).await;

    let _silent = next_link(&mut links).await;
    let state = wait_for(&session, |s| matches!(s, ConnectionState::Error(_))).await;
    match state {
        ConnectionState::Error(message) => assert!(message.contains("challenge")),
        other => panic!("unexpected state {:?}", other),
    }

    // Retried after backoff.
    let _second = next_link(&mut links).await;
    session.disconnect().await;
}

#[tokio::test]
async fn test_fingerprint_mismatch_is_not_retried() {
    let mismatch = GatewayError::FingerprintMismatch {
        host: "gateway.test".into(),
        expected: "aa".into(),
        actual: "bb".into(),
    };
    let (connector, _links) = MockConnector::new(Some(mismatch.clone()));
    let (session, _store) = build_session(SessionConfig::default(), connector.clone());
    session.connect(GatewayEndpoint::manual("gateway.test", 18789, true)).await;

    let state = wait_for(&session, |s| matches!(s, ConnectionState::Error(_))).await;
    assert_eq!(state, ConnectionState::Error(mismatch.to_string()));

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);

    session.disconnect().await;
}

#[tokio::test]
async fn test_connect_is_idempotent_for_same_endpoint() {
    let (connector, mut links) = MockConnector::new(None);
    let (session, _store) = build_session(SessionConfig::default(), connector.clone());
    session.connect(endpoint()).await;
    let mut link = next_link(&mut links).await;
    link.accept(hello()).await;
    wait_for(&session, ConnectionState::is_connected).await;

    session.connect(endpoint()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    assert!(session.state().is_connected());

    session.disconnect().await;
}

#[tokio::test]
async fn test_events_arrive_in_order_without_challenge() {
    let (connector, mut links) = MockConnector::new(None);
    let (session, _store) = build_session(SessionConfig::default(), connector);
    let mut events = session.subscribe();
    session.connect(endpoint()).await;

    let mut link = next_link(&mut links).await;
    link.accept(hello()).await;
    wait_for(&session, ConnectionState::is_connected).await;

    link.send(json!({"type": "event", "event": "agent", "seq": 1,
        "payload": {"runId": "r1", "stream": "assistant", "data": {"delta": "Hi"}}}))
        .await;
    link.send(json!({"type": "event", "event": "chat", "seq": 2,
        "payload": {"runId": "r1", "sessionKey": "main", "state": "final"}}))
        .await;
    link.send(json!({"type": "event", "event": "tick", "seq": 3, "payload": {"ts": 1}}))
        .await;

    let first = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert!(matches!(first, GatewayEvent::Agent(ref a) if a.delta() == Some("Hi")));
    let second = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert!(matches!(second, GatewayEvent::Chat(_)));
    let third = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert!(matches!(third, GatewayEvent::Other { ref event, .. } if event == "tick"));

    session.disconnect().await;
}

#[tokio::test]
async fn test_chat_streams_reply_text() {
    let (session, mut link) = connected_session().await;
    let chat = GatewayChat::new(session.clone());
    let mut activity = chat.activity();

    let send = tokio::spawn(async move {
        let run_id = chat.send_message("what's the weather").await;
        (chat, run_id)
    });
    let request = link.recv().await;
    assert_eq!(request["method"], "chat.send");
    assert_eq!(request["params"]["sessionKey"], "agent:main:main");
    assert_eq!(request["params"]["message"], "what's the weather");
    link.respond_ok(&request, json!({ "runId": "run-9" })).await;
    let (chat, run_id) = send.await.unwrap();
    assert_eq!(run_id.unwrap(), "run-9");

    for delta in ["It's sunny.", " Enjoy!"] {
        link.send(json!({"type": "event", "event": "agent",
            "payload": {"runId": "run-9", "stream": "assistant", "data": {"delta": delta}}}))
            .await;
    }
    link.send(json!({"type": "event", "event": "chat",
        "payload": {"runId": "run-9", "state": "final"}}))
        .await;

    let done = timeout(WAIT, activity.wait_for(|a| !a.processing))
        .await
        .unwrap()
        .unwrap()
        .clone();
    assert_eq!(done.run_id.as_deref(), Some("run-9"));
    assert_eq!(done.streaming_text.as_deref(), Some("It's sunny. Enjoy!"));
    assert!(!chat.is_processing());

    session.disconnect().await;
}

#[tokio::test]
async fn test_aborted_run_does_not_leak_into_next_turn() {
    let (session, mut link) = connected_session().await;
    let chat = Arc::new(GatewayChat::new(session.clone()));
    let mut activity = chat.activity();

    let sender = Arc::clone(&chat);
    let first = tokio::spawn(async move { sender.send_message("tell me a story").await });
    let request = link.recv().await;
    link.respond_ok(&request, json!({ "runId": "run-1" })).await;
    assert_eq!(first.await.unwrap().unwrap(), "run-1");
    link.send(json!({"type": "event", "event": "agent",
        "payload": {"runId": "run-1", "stream": "assistant", "data": {"delta": "Once upon"}}}))
        .await;
    timeout(
        WAIT,
        activity.wait_for(|a| a.streaming_text.as_deref() == Some("Once upon")),
    )
    .await
    .unwrap()
    .unwrap();

    let aborter = Arc::clone(&chat);
    let abort = tokio::spawn(async move { aborter.abort().await });
    let request = link.recv().await;
    assert_eq!(request["method"], "chat.abort");
    assert_eq!(request["params"]["runId"], "run-1");
    link.respond_ok(&request, json!({})).await;
    abort.await.unwrap().unwrap();

    // The gateway finishes run-1 and starts run-2 before answering the second chat.send.
    let sender = Arc::clone(&chat);
    let second = tokio::spawn(async move { sender.send_message("second").await });
    let request = link.recv().await;
    assert_eq!(request["params"]["message"], "second");
    link.send(json!({"type": "event", "event": "chat",
        "payload": {"runId": "run-1", "state": "final",
            "message": {"content": [{"type": "text", "text": "stale tail of run one."}]}}}))
        .await;
    link.send(json!({"type": "event", "event": "agent",
        "payload": {"runId": "run-2", "stream": "assistant", "data": {"delta": "Fresh"}}}))
        .await;
    link.respond_ok(&request, json!({ "runId": "run-2" })).await;
    assert_eq!(second.await.unwrap().unwrap(), "run-2");

    link.send(json!({"type": "event", "event": "agent",
        "payload": {"runId": "run-2", "stream": "assistant", "data": {"delta": " answer."}}}))
        .await;
    link.send(json!({"type": "event", "event": "chat",
        "payload": {"runId": "run-2", "state": "final"}}))
        .await;

    let done = timeout(
        WAIT,
        activity.wait_for(|a| a.run_id.as_deref() == Some("run-2") && !a.processing),
    )
    .await
    .unwrap()
    .unwrap()
    .clone();
    assert_eq!(done.streaming_text.as_deref(), Some("Fresh answer."));
    assert!(done.error.is_none());

    session.disconnect().await;
}
