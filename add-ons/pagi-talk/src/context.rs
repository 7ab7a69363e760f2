//! Owns every long-lived component of the client and wires them together.

use crate::config::TalkConfig;
use async_trait::async_trait;
use pagi_session::{ChatActivity, GatewayChat, GatewayEndpoint, GatewaySession, KeyValueStore, SledStore};
use pagi_voice::{
    create_best_stt, ChatLayer, ChatSnapshot, CommandSynthesizer, EarCapture, EarConfig,
    EchoGuard, ExclusiveAudioFocus, NetworkVoice, RodioSink, SpeechRecognitionEngine,
    SpeechSynthesizer, TextToSpeechEngine, TtsConfig, VoiceError, VoiceOrchestrator, VoiceResult,
};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

fn snapshot(activity: &ChatActivity) -> ChatSnapshot {
    ChatSnapshot {
        streaming_text: activity.streaming_text.clone(),
        processing: activity.processing,
        error: activity.error.clone(),
    }
}

/// Exposes the gateway chat to the orchestrator.
pub struct GatewayChatLayer {
    chat: Arc<GatewayChat>,
    snapshots: watch::Sender<ChatSnapshot>,
    cancel: CancellationToken,
}

impl GatewayChatLayer {
    pub fn new(chat: Arc<GatewayChat>) -> Self {
        let mut activity = chat.activity();
        let (snapshots, _) = watch::channel(snapshot(&activity.borrow_and_update()));
        let cancel = CancellationToken::new();

        let tx = snapshots.clone();
        let stop = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    changed = activity.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let next = snapshot(&activity.borrow_and_update());
                        tx.send_replace(next);
                    }
                }
            }
        });

        Self {
            chat,
            snapshots,
            cancel,
        }
    }
}

impl Drop for GatewayChatLayer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl ChatLayer for GatewayChatLayer {
    async fn send_message(&self, text: &str) -> VoiceResult<String> {
        self.chat
            .send_message(text)
            .await
            .map_err(|e| VoiceError::Chat(e.to_string()))
    }

    fn activity(&self) -> watch::Receiver<ChatSnapshot> {
        self.snapshots.subscribe()
    }

    fn is_processing(&self) -> bool {
        self.chat.is_processing()
    }

    async fn abort(&self) -> VoiceResult<()> {
        self.chat
            .abort()
            .await
            .map_err(|e| VoiceError::Chat(e.to_string()))
    }
}

/// Everything the client runs, built once at startup.
pub struct TalkContext {
    pub config: TalkConfig,
    pub endpoint: GatewayEndpoint,
    pub session: GatewaySession,
    pub chat: Arc<GatewayChat>,
    pub orchestrator: VoiceOrchestrator,
}

impl TalkContext {
    /// Must be called inside a tokio runtime.
    pub fn build(config: TalkConfig) -> anyhow::Result<Self> {
        let store: Arc<dyn KeyValueStore> = Arc::new(SledStore::open_path(&config.storage_path)?);
        let session = GatewaySession::with_websocket(config.session_config(), store)?;
        info!(device_id = %session.device_id(), "🔑 Device identity ready");
        let chat = Arc::new(GatewayChat::new(session.clone()));

        let echo = Arc::new(EchoGuard::new());
        let capture = Arc::new(EarCapture::new(EarConfig::default(), Arc::from(create_best_stt())));
        let recognizer = Arc::new(SpeechRecognitionEngine::new(
            capture,
            echo.clone(),
            config.recognizer_config(),
        ));

        let network: Option<Arc<dyn SpeechSynthesizer>> = if config.voice.network_voice {
            match NetworkVoice::from_env() {
                Ok(voice) => Some(Arc::new(voice)),
                Err(e) => {
                    warn!("Network voice disabled: {}", e);
                    None
                }
            }
        } else {
            None
        };
        let local = match config.voice.local_command.as_deref().map(str::trim) {
            Some(command) if !command.is_empty() => {
                let mut parts = command.split_whitespace();
                let program = parts.next().unwrap_or("espeak-ng");
                CommandSynthesizer::new(program, parts)
            }
            _ => CommandSynthesizer::from_env(),
        };
        let tts = Arc::new(TextToSpeechEngine::new(
            network,
            Arc::new(local),
            Arc::new(RodioSink::new()?),
            echo,
            TtsConfig::default(),
        ));

        let orchestrator = VoiceOrchestrator::new(
            recognizer,
            tts,
            Arc::new(GatewayChatLayer::new(chat.clone())),
            Arc::new(ExclusiveAudioFocus::new()),
            config.orchestrator_config(),
        );

        Ok(Self {
            endpoint: config.endpoint(),
            config,
            session,
            chat,
            orchestrator,
        })
    }
}
