//! # PAGI Session - Gateway Client
//!
//! Persistent, authenticated session with a PAGI gateway over a duplex JSON connection.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                     GatewaySession                          │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐      │
//! │  │DeviceIdentity│→ │  Handshake   │→ │ Pending table│      │
//! │  │  (Ed25519)   │  │ (challenge)  │  │  (DashMap)   │      │
//! │  └──────────────┘  └──────────────┘  └──────────────┘      │
//! │         ↑                 ↑                  ↓              │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐      │
//! │  │ KeyValueStore│  │  Connector   │  │ Event stream │→ Chat│
//! │  │    (sled)    │  │ (WS + TOFU)  │  │ (broadcast)  │      │
//! │  └──────────────┘  └──────────────┘  └──────────────┘      │
//! └────────────────────────────────────────────────────────────┘
//! ```

pub mod chat;
pub mod endpoint;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod session;
pub mod store;
pub mod transport;
pub mod trust;

pub use chat::{ChatActivity, GatewayChat, HistoryMessage};
pub use endpoint::{EndpointSource, GatewayEndpoint, DEFAULT_GATEWAY_PORT};
pub use error::{GatewayError, GatewayResult};
pub use identity::DeviceIdentity;
pub use protocol::{AgentEvent, AgentStream, ChatEvent, ChatState, Frame, GatewayEvent};
pub use session::{reconnect_delay, ConnectionState, GatewaySession, SessionConfig};
pub use store::{KeyValueStore, MemoryStore, SledStore};
pub use transport::{Connection, Connector, WebSocketConnector};
pub use trust::{certificate_fingerprint, PinOutcome, PinnedCertVerifier, TrustStore};
