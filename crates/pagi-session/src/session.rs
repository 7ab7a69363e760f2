//! **Gateway session** - owns the duplex link, the authenticated handshake, request/response
//! multiplexing, event fan-out and reconnection.
//!
//! One supervisor task per endpoint runs connection attempts strictly one after another. Each
//! attempt pumps the transport and performs the handshake in the same task, so a new attempt
//! only starts once the previous link, its outbound queue and its pending requests are torn down.

use crate::endpoint::GatewayEndpoint;
use crate::error::{GatewayError, GatewayResult};
use crate::identity::DeviceIdentity;
use crate::protocol::{
    signing_payload, ChallengePayload, Frame, GatewayEvent, CHALLENGE_EVENT, PROTOCOL_VERSION,
};
use crate::store::KeyValueStore;
use crate::transport::{Connection, Connector, WebSocketConnector};
use crate::trust::TrustStore;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

const BASE_BACKOFF_MS: f64 = 350.0;
const BACKOFF_FACTOR: f64 = 1.7;
const MAX_BACKOFF_MS: f64 = 8000.0;
const MAX_BACKOFF_ATTEMPT: u32 = 10;

const OUTBOUND_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 256;
const TOKEN_PREFIX: &str = "auth.device_token.";

/// Delay before reconnect attempt `attempt`: `min(8000, 350 * 1.7^attempt)` ms, growth capped
/// at attempt 10.
pub fn reconnect_delay(attempt: u32) -> Duration {
    let exponent = attempt.min(MAX_BACKOFF_ATTEMPT) as i32;
    let ms = (BASE_BACKOFF_MS * BACKOFF_FACTOR.powi(exponent)).min(MAX_BACKOFF_MS);
    Duration::from_millis(ms as u64)
}

/// Connection state; the session is its only writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// The gateway knows the device but an operator has not approved it yet.
    WaitingForPairing,
    Connected { session_key: Option<String> },
    Error(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }
}

/// Client metadata and timeouts sent with / applied to every connection.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub client_id: String,
    pub client_mode: String,
    pub role: String,
    pub display_name: String,
    pub client_version: String,
    pub platform: String,
    pub locale: String,
    /// Manually configured token, used until the gateway issues a device token.
    pub shared_token: Option<String>,
    pub request_timeout: Duration,
    pub challenge_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_id: "pagi-talk".to_string(),
            client_mode: "ui".to_string(),
            role: "operator".to_string(),
            display_name: "PAGI Talk".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
            locale: "en-US".to_string(),
            shared_token: None,
            request_timeout: Duration::from_secs(30),
            challenge_timeout: Duration::from_secs(5),
        }
    }
}

struct PendingRequest {
    method: String,
    tx: oneshot::Sender<GatewayResult<Value>>,
}

struct Supervisor {
    endpoint: GatewayEndpoint,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

enum LinkEnd {
    Cancelled,
    /// The attempt failed before reaching `Connected`.
    Failed(GatewayError),
    /// A connected link dropped.
    Closed(String),
}

struct Inner {
    config: SessionConfig,
    identity: DeviceIdentity,
    store: Arc<dyn KeyValueStore>,
    trust: Arc<TrustStore>,
    connector: Arc<dyn Connector>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<GatewayEvent>,
    pending: DashMap<String, PendingRequest>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    main_session_key: RwLock<Option<String>>,
    supervisor: tokio::sync::Mutex<Option<Supervisor>>,
}

/// Handle to the gateway session. Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct GatewaySession {
    inner: Arc<Inner>,
}

impl GatewaySession {
    /// Build a session over an arbitrary connector. Loads or creates the device identity.
    pub fn new(
        config: SessionConfig,
        store: Arc<dyn KeyValueStore>,
        trust: Arc<TrustStore>,
        connector: Arc<dyn Connector>,
    ) -> GatewayResult<Self> {
        let identity = DeviceIdentity::get_or_create(store.as_ref())?;
        info!(device_id = %identity.device_id(), client = %config.client_id, "Gateway session created");
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                identity,
                store,
                trust,
                connector,
                state_tx,
                events_tx,
                pending: DashMap::new(),
                outbound: Mutex::new(None),
                main_session_key: RwLock::new(None),
                supervisor: tokio::sync::Mutex::new(None),
            }),
        })
    }

    /// Session over WebSocket with TOFU pinning backed by `store`.
    pub fn with_websocket(config: SessionConfig, store: Arc<dyn KeyValueStore>) -> GatewayResult<Self> {
        let trust = Arc::new(TrustStore::new(Arc::clone(&store)));
        let connector = Arc::new(WebSocketConnector::new(Arc::clone(&trust)));
        Self::new(config, store, trust, connector)
    }

    /// Start the reconnect loop for `endpoint`. No-op while already running for the same
    /// endpoint; a different endpoint fully replaces the previous loop.
    pub async fn connect(&self, endpoint: GatewayEndpoint) {
        let mut supervisor = self.inner.supervisor.lock().await;
        if let Some(current) = supervisor.as_ref() {
            if current.endpoint == endpoint && !current.handle.is_finished() {
                debug!(endpoint = %endpoint, "Already connecting to this gateway");
                return;
            }
        }
        if let Some(previous) = supervisor.take() {
            info!(from = %previous.endpoint, to = %endpoint, "Switching gateway endpoint");
            stop_supervisor(previous).await;
            self.inner.teardown_link();
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(reconnect_loop(
            Arc::clone(&self.inner),
            endpoint.clone(),
            cancel.clone(),
        ));
        *supervisor = Some(Supervisor {
            endpoint,
            cancel,
            handle,
        });
    }

    /// Stop reconnecting, close the link and fail every pending request. Safe in any state.
    pub async fn disconnect(&self) {
        let previous = self.inner.supervisor.lock().await.take();
        if let Some(previous) = previous {
            info!(endpoint = %previous.endpoint, "Disconnecting from gateway");
            stop_supervisor(previous).await;
        }
        self.inner.teardown_link();
        self.inner.set_state(ConnectionState::Disconnected);
    }

    /// Send `method` and await its response (bounded by the request timeout).
    #[instrument(skip(self, params))]
    pub async fn request(&self, method: &str, params: Value) -> GatewayResult<Value> {
        if !self.inner.state_tx.borrow().is_connected() {
            return Err(GatewayError::NotConnected);
        }
        self.inner
            .send_request(method, params, self.inner.config.request_timeout)
            .await
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state_tx.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Inbound events in arrival order. The handshake challenge is never published.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Session key assigned by the gateway on the last successful connect.
    pub fn main_session_key(&self) -> Option<String> {
        self.inner
            .main_session_key
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn device_id(&self) -> &str {
        self.inner.identity.device_id()
    }

    /// Requests currently awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Drop the stored device token; the next connect falls back to the shared token.
    pub fn clear_device_token(&self) -> GatewayResult<()> {
        self.inner.store.remove(&self.inner.token_key())
    }

    /// Forget the pinned certificate for `host` so the next handshake pins again.
    pub fn forget_pin(&self, host: &str) -> GatewayResult<()> {
        self.inner.trust.clear_pin(host)
    }
}

async fn stop_supervisor(supervisor: Supervisor) {
    supervisor.cancel.cancel();
    if let Err(e) = supervisor.handle.await {
        warn!(error = %e, "Reconnect loop ended abnormally");
    }
}

async fn reconnect_loop(inner: Arc<Inner>, endpoint: GatewayEndpoint, cancel: CancellationToken) {
    let mut attempt: u32 = 0;
    while !cancel.is_cancelled() {
        inner.set_state(ConnectionState::Connecting);
        debug!(endpoint = %endpoint, attempt, "Connecting to gateway");

        let end = run_link(&inner, &endpoint, &cancel, &mut attempt).await;
        inner.teardown_link();

        match end {
            LinkEnd::Cancelled => break,
            LinkEnd::Failed(e) if e.is_trust_failure() => {
                error!(endpoint = %endpoint, error = %e, "🔒 Refusing gateway: certificate does not match pin");
                inner.set_state(ConnectionState::Error(e.to_string()));
                return;
            }
            LinkEnd::Failed(GatewayError::PairingRequired(message)) => {
                warn!(device_id = %inner.identity.device_id(), %message, "⏳ Device awaiting pairing approval");
                inner.set_state(ConnectionState::WaitingForPairing);
            }
            LinkEnd::Failed(e) => {
                warn!(endpoint = %endpoint, error = %e, "Gateway connection attempt failed");
                inner.set_state(ConnectionState::Error(e.to_string()));
            }
            LinkEnd::Closed(reason) => {
                warn!(endpoint = %endpoint, %reason, "Gateway link closed");
                inner.set_state(ConnectionState::Error(reason));
            }
        }

        let delay = reconnect_delay(attempt);
        attempt = (attempt + 1).min(MAX_BACKOFF_ATTEMPT);
        debug!(delay_ms = delay.as_millis() as u64, "Waiting before reconnect");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// One connection attempt, from opening the transport until the link drops or is cancelled.
async fn run_link(
    inner: &Arc<Inner>,
    endpoint: &GatewayEndpoint,
    cancel: &CancellationToken,
    attempt: &mut u32,
) -> LinkEnd {
    let connection = tokio::select! {
        _ = cancel.cancelled() => return LinkEnd::Cancelled,
        opened = inner.connector.connect(endpoint) => match opened {
            Ok(connection) => connection,
            Err(e) => return LinkEnd::Failed(e),
        },
    };

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let (challenge_tx, challenge_rx) = oneshot::channel();
    *inner.outbound.lock().unwrap_or_else(PoisonError::into_inner) = Some(outbound_tx);

    let pump = pump(inner, connection, outbound_rx, challenge_tx, cancel);
    let handshake = handshake(inner, challenge_rx);
    tokio::pin!(pump);
    tokio::pin!(handshake);

    let mut connected = false;
    loop {
        tokio::select! {
            reason = &mut pump => {
                if cancel.is_cancelled() {
                    return LinkEnd::Cancelled;
                }
                return if connected {
                    LinkEnd::Closed(reason)
                } else {
                    LinkEnd::Failed(GatewayError::Transport(reason))
                };
            }
            outcome = &mut handshake, if !connected => match outcome {
                Ok(session_key) => {
                    connected = true;
                    *attempt = 0;
                    info!(endpoint = %endpoint, session_key = ?session_key, "✅ Connected to gateway");
                    inner.set_state(ConnectionState::Connected { session_key });
                }
                Err(e) => return LinkEnd::Failed(e),
            },
        }
    }
}

/// Moves frames between the transport and the session until the link ends. Returns the reason.
async fn pump(
    inner: &Inner,
    mut connection: Box<dyn Connection>,
    mut outbound: mpsc::Receiver<String>,
    challenge_tx: oneshot::Sender<ChallengePayload>,
    cancel: &CancellationToken,
) -> String {
    let mut challenge_tx = Some(challenge_tx);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                connection.close().await;
                return "cancelled".to_string();
            }
            Some(text) = outbound.recv() => {
                if let Err(e) = connection.send_text(text).await {
                    return e.to_string();
                }
            }
            inbound = connection.next_text() => match inbound {
                None => return "connection closed by gateway".to_string(),
                Some(Err(e)) => return e.to_string(),
                Some(Ok(text)) => inner.dispatch(&text, &mut challenge_tx),
            },
        }
    }
}

/// Wait for the challenge, sign it and send `connect`. Returns the main session key.
async fn handshake(
    inner: &Inner,
    challenge_rx: oneshot::Receiver<ChallengePayload>,
) -> GatewayResult<Option<String>> {
    let timeout = inner.config.challenge_timeout;
    let challenge = match tokio::time::timeout(timeout, challenge_rx).await {
        Err(_) => return Err(GatewayError::ChallengeTimeout(timeout.as_millis() as u64)),
        Ok(Err(_)) => {
            return Err(GatewayError::Transport(
                "link closed before the challenge arrived".to_string(),
            ))
        }
        Ok(Ok(challenge)) => challenge,
    };

    let params = inner.connect_params(&challenge.nonce)?;
    let hello = inner
        .send_request("connect", params, inner.config.request_timeout)
        .await?;
    inner.accept_hello(&hello)
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state.clone());
        if previous != state {
            debug!(from = ?previous, to = ?state, "Connection state changed");
        }
    }

    fn token_key(&self) -> String {
        format!("{}{}", TOKEN_PREFIX, self.config.role)
    }

    /// Device token when one was issued, else the configured shared token.
    fn auth_token(&self) -> GatewayResult<Option<String>> {
        if let Some(token) = self.store.get(&self.token_key())? {
            return Ok(Some(token));
        }
        Ok(self.config.shared_token.clone())
    }

    fn connect_params(&self, nonce: &str) -> GatewayResult<Value> {
        let config = &self.config;
        let token = self.auth_token()?;
        let signed_at = chrono::Utc::now().timestamp_millis();
        let payload = signing_payload(
            self.identity.device_id(),
            &config.client_id,
            &config.client_mode,
            &config.role,
            signed_at,
            token.as_deref(),
            nonce,
        );

        let mut params = json!({
            "minProtocol": PROTOCOL_VERSION,
            "maxProtocol": PROTOCOL_VERSION,
            "client": {
                "id": config.client_id,
                "displayName": config.display_name,
                "version": config.client_version,
                "platform": config.platform,
                "mode": config.client_mode,
            },
            "role": config.role,
            "locale": config.locale,
            "userAgent": format!("{}/{} ({})", config.client_id, config.client_version, config.platform),
            "device": {
                "id": self.identity.device_id(),
                "publicKey": self.identity.public_key_base64url(),
                "signature": self.identity.sign(&payload),
                "signedAt": signed_at,
                "nonce": nonce,
            },
        });
        if let Some(token) = token {
            params["auth"] = json!({ "token": token });
        }
        Ok(params)
    }

    fn accept_hello(&self, hello: &Value) -> GatewayResult<Option<String>> {
        if let Some(token) = hello.pointer("/auth/deviceToken").and_then(Value::as_str) {
            self.store.put(&self.token_key(), token)?;
            info!(role = %self.config.role, "Stored device token issued by gateway");
        }
        let session_key = hello
            .pointer("/snapshot/sessionDefaults/mainSessionKey")
            .and_then(Value::as_str)
            .map(str::to_string);
        *self
            .main_session_key
            .write()
            .unwrap_or_else(PoisonError::into_inner) = session_key.clone();
        Ok(session_key)
    }

    fn outbound_sender(&self) -> Option<mpsc::Sender<String>> {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn send_request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> GatewayResult<Value> {
        let outbound = self.outbound_sender().ok_or(GatewayError::NotConnected)?;
        let id = Uuid::new_v4().to_string();
        let text = Frame::request(id.clone(), method, params).encode()?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id.clone(),
            PendingRequest {
                method: method.to_string(),
                tx,
            },
        );
        if outbound.send(text).await.is_err() {
            self.pending.remove(&id);
            return Err(GatewayError::Disconnected);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::Disconnected),
            Err(_) => {
                self.pending.remove(&id);
                Err(GatewayError::Timeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    fn dispatch(&self, text: &str, challenge_tx: &mut Option<oneshot::Sender<ChallengePayload>>) {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable frame");
                return;
            }
        };
        match frame {
            Frame::Res(response) => match self.pending.remove(&response.id) {
                Some((_, pending)) => {
                    let _ = pending.tx.send(response.into_result());
                }
                None => debug!(id = %response.id, "Response for unknown or expired request"),
            },
            Frame::Event(event) if event.event == CHALLENGE_EVENT => {
                match serde_json::from_value::<ChallengePayload>(event.payload) {
                    Ok(challenge) => match challenge_tx.take() {
                        Some(tx) => {
                            let _ = tx.send(challenge);
                        }
                        None => debug!("Ignoring repeated connect challenge"),
                    },
                    Err(e) => warn!(error = %e, "Malformed connect challenge"),
                }
            }
            Frame::Event(event) => match GatewayEvent::from_frame(event) {
                Ok(event) => {
                    // No subscribers is fine.
                    let _ = self.events_tx.send(event);
                }
                Err(e) => warn!(error = %e, "Dropping undecodable event"),
            },
            Frame::Req(request) => {
                debug!(method = %request.method, "Ignoring server-initiated request")
            }
        }
    }

    /// Close the outbound queue and fail every pending request exactly once.
    fn teardown_link(&self) {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let ids: Vec<String> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                debug!(method = %pending.method, "Failing pending request");
                let _ = pending.tx.send(Err(GatewayError::Disconnected));
            }
        }
    }
}
