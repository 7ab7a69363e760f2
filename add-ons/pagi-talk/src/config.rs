//! Talk client configuration. Precedence: env `PAGI_TALK__*` > `PAGI_TALK_CONFIG` file
//! (default `config/talk.toml`) > defaults.

use pagi_session::{GatewayEndpoint, SessionConfig, DEFAULT_GATEWAY_PORT};
use pagi_voice::{OrchestratorConfig, RecognizerConfig};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySettings {
    pub host: String,
    pub port: u16,
    /// Use `wss://` with certificate pinning.
    pub tls: bool,
    /// Shared token, used until the gateway issues a device token.
    #[serde(default)]
    pub token: Option<String>,
    pub locale: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoiceSettings {
    pub end_silence_ms: u64,
    pub min_barge_in_chars: usize,
    /// Prefer the network voice (TTS_API_* env) when credentials are present.
    pub network_voice: bool,
    /// Local engine command line; falls back to `LOCAL_TTS_COMMAND`, then espeak-ng.
    #[serde(default)]
    pub local_command: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TalkConfig {
    /// Sled database for identity, pins and tokens.
    pub storage_path: String,
    pub gateway: GatewaySettings,
    pub voice: VoiceSettings,
}

impl TalkConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("PAGI_TALK_CONFIG").unwrap_or_else(|_| "config/talk.toml".to_string());
        let builder = config::Config::builder()
            .set_default("storage_path", "./data/pagi_talk")?
            .set_default("gateway.host", "127.0.0.1")?
            .set_default("gateway.port", DEFAULT_GATEWAY_PORT as i64)?
            .set_default("gateway.tls", false)?
            .set_default("gateway.locale", "en-US")?
            .set_default("voice.end_silence_ms", 700_i64)?
            .set_default("voice.min_barge_in_chars", 3_i64)?
            .set_default("voice.network_voice", true)?;

        let path = Path::new(&config_path);
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        builder
            .add_source(config::Environment::with_prefix("PAGI_TALK").separator("__"))
            .build()?
            .try_deserialize()
    }

    pub fn endpoint(&self) -> GatewayEndpoint {
        GatewayEndpoint::manual(&self.gateway.host, self.gateway.port, self.gateway.tls)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            shared_token: self.gateway.token.clone().filter(|t| !t.trim().is_empty()),
            locale: self.gateway.locale.clone(),
            ..Default::default()
        }
    }

    pub fn recognizer_config(&self) -> RecognizerConfig {
        RecognizerConfig {
            end_silence: Duration::from_millis(self.voice.end_silence_ms),
            ..Default::default()
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            min_barge_in_chars: self.voice.min_barge_in_chars,
            ..Default::default()
        }
    }
}
