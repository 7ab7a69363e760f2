//! Error types for the gateway session layer

use thiserror::Error;

/// Result type alias for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors raised by the gateway session, its transport and its persistent state.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    /// Connection refused, socket closed, TLS failure other than a pin mismatch.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Method-level failure returned by the gateway in a `res` frame.
    #[error("Gateway error {code}: {message}")]
    Protocol { code: String, message: String },

    /// The gateway knows this device but has not approved it yet.
    #[error("Device pairing required: {0}")]
    PairingRequired(String),

    /// The server certificate does not match the fingerprint pinned on first use.
    #[error("TLS fingerprint mismatch for {host}: pinned {expected}, presented {actual}")]
    FingerprintMismatch {
        host: String,
        expected: String,
        actual: String,
    },

    #[error("No connect.challenge received within {0} ms")]
    ChallengeTimeout(u64),

    #[error("Request {method} timed out after {timeout_ms} ms")]
    Timeout { method: String, timeout_ms: u64 },

    /// The session was disconnected while the request was outstanding.
    #[error("Session disconnected")]
    Disconnected,

    #[error("Not connected to a gateway")]
    NotConnected,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Identity error: {0}")]
    Identity(String),
}

impl GatewayError {
    /// Trust failures are never retried by the reconnect loop.
    pub fn is_trust_failure(&self) -> bool {
        matches!(self, GatewayError::FingerprintMismatch { .. })
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Codec(err.to_string())
    }
}

impl From<sled::Error> for GatewayError {
    fn from(err: sled::Error) -> Self {
        GatewayError::Storage(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        GatewayError::Transport(err.to_string())
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Transport(err.to_string())
    }
}
