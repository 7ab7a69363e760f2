//! Duplex text transport to the gateway.
//!
//! `Connector` opens a `Connection` for an endpoint. The production connector speaks WebSocket,
//! over rustls with the pinned verifier when the endpoint is encrypted. Tests inject in-process
//! connectors built on channels.

use crate::endpoint::GatewayEndpoint;
use crate::error::{GatewayError, GatewayResult};
use crate::trust::{PinnedCertVerifier, TrustStore};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// One open duplex connection carrying JSON text frames.
#[async_trait]
pub trait Connection: Send {
    async fn send_text(&mut self, text: String) -> GatewayResult<()>;

    /// Next inbound text frame; `None` once the peer has closed. Must be cancel-safe.
    async fn next_text(&mut self) -> Option<GatewayResult<String>>;

    async fn close(&mut self);
}

/// Opens connections to gateway endpoints.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &GatewayEndpoint) -> GatewayResult<Box<dyn Connection>>;
}

/// WebSocket connector; `wss` endpoints are verified only by the TOFU pin.
pub struct WebSocketConnector {
    trust: Arc<TrustStore>,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(trust: Arc<TrustStore>) -> Self {
        Self {
            trust,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, endpoint: &GatewayEndpoint) -> GatewayResult<Box<dyn Connection>> {
        let url = endpoint.url();
        let verifier = if endpoint.use_encrypted_transport {
            Some(Arc::new(PinnedCertVerifier::new(
                endpoint.host.clone(),
                Arc::clone(&self.trust),
            )))
        } else {
            None
        };
        let tls = match verifier {
            Some(ref v) => Some(tokio_tungstenite::Connector::Rustls(v.client_config()?)),
            None => None,
        };

        debug!(url = %url, "Opening gateway socket");
        let attempt = tokio::time::timeout(
            self.connect_timeout,
            connect_async_tls_with_config(url.as_str(), None, true, tls),
        )
        .await;

        match attempt {
            Err(_) => Err(GatewayError::Transport(format!(
                "connect to {} timed out after {} ms",
                url,
                self.connect_timeout.as_millis()
            ))),
            Ok(Err(e)) => {
                if let Some(failure) = verifier.as_ref().and_then(|v| v.take_failure()) {
                    return Err(failure);
                }
                Err(e.into())
            }
            Ok(Ok((stream, _response))) => {
                info!(url = %url, "Gateway socket open");
                Ok(Box::new(WebSocketConnection { stream }))
            }
        }
    }
}

struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn send_text(&mut self, text: String) -> GatewayResult<()> {
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn next_text(&mut self) -> Option<GatewayResult<String>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => debug!("Ignoring non-UTF-8 binary frame"),
                },
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "Gateway closed the socket");
                    return None;
                }
                // Pings are answered by tungstenite on the next read/write.
                Ok(_) => {}
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "Socket close failed");
        }
    }
}
