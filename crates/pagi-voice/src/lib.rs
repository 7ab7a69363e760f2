//! # PAGI Voice - Hands-free Voice Conversation
//!
//! Continuous speech recognition with echo suppression, streaming text-to-speech with a local
//! fallback voice, and the orchestrator that turns both into a spoken conversation with
//! barge-in and pause/resume. Audio runs on bare metal (CPAL in, rodio out).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       Voice Orchestrator                          │
//! │  ┌──────────────┐   final    ┌──────────────┐  streamed text      │
//! │  │  Recognizer  │──────────► │  ChatLayer   │──────────┐          │
//! │  │ (echo guard) │            └──────────────┘          ▼          │
//! │  └──────▲───────┘                              ┌──────────────┐   │
//! │         │ partial ─── barge-in ──────────────► │  TTS Engine  │   │
//! │  ┌──────┴───────┐                              │ (net → local)│   │
//! │  │  Ear (cpal,  │                              └──────┬───────┘   │
//! │  │  VAD, STT)   │                                     ▼           │
//! │  └──────────────┘                              ┌──────────────┐   │
//! │                                                │ Sink (rodio) │   │
//! │                                                └──────────────┘   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod ear;
pub mod echo;
pub mod error;
pub mod focus;
pub mod orchestrator;
pub mod recognizer;
pub mod sentence;
pub mod stt;
pub mod tts;
pub mod turn;
pub mod vad;
pub mod voice_output;

pub use audio::{AudioConfig, Microphone};
pub use ear::{EarCapture, EarConfig};
pub use echo::EchoGuard;
pub use error::{VoiceError, VoiceResult};
pub use focus::{AudioFocus, ExclusiveAudioFocus};
pub use orchestrator::{
    is_barge_in, ChatLayer, ChatSnapshot, ConversationEntry, OrchestratorConfig, Role,
    VoiceOrchestrator, VoiceState,
};
pub use recognizer::{
    CaptureError, CaptureEvent, CaptureOptions, RecognitionResult, RecognitionState,
    RecognizerConfig, SpeechCapture, SpeechRecognitionEngine,
};
pub use sentence::{split_sentences, SentenceSplitter};
pub use stt::{create_best_stt, pcm_to_wav, HttpStt, PlaceholderStt, SttBackend};
pub use tts::{TextToSpeechEngine, TtsConfig, TtsEvent, TtsState};
pub use turn::{EndpointConfig, EndpointEvent, Endpointer};
pub use vad::{VadConfig, VadDetector};
pub use voice_output::{AudioSink, CommandSynthesizer, NetworkVoice, RodioSink, SpeechSynthesizer};
