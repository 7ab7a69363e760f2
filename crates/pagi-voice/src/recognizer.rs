//! Continuous speech recognition on top of a `SpeechCapture` backend.
//!
//! One worker task runs capture sessions back to back while listening is armed. Each session
//! yields zero or more partials and exactly one terminal outcome. Recoverable outcomes restart
//! quietly; other failures back off linearly and give up after a run of consecutive errors.

use crate::echo::EchoGuard;
use crate::error::VoiceResult;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why a capture session ended without a transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// Nobody spoke.
    NoSpeech,
    /// The utterance ran too long.
    SpeechTimeout,
    Audio(String),
    Network(String),
    /// The capture device is held by someone else.
    Busy,
    Other(String),
}

impl CaptureError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CaptureError::NoSpeech | CaptureError::SpeechTimeout)
    }

    pub fn code(&self) -> &'static str {
        match self {
            CaptureError::NoSpeech => "no_speech",
            CaptureError::SpeechTimeout => "speech_timeout",
            CaptureError::Audio(_) => "audio",
            CaptureError::Network(_) => "network",
            CaptureError::Busy => "busy",
            CaptureError::Other(_) => "other",
        }
    }

    pub fn message(&self) -> String {
        match self {
            CaptureError::NoSpeech => "No speech detected".to_string(),
            CaptureError::SpeechTimeout => "Speech input timed out".to_string(),
            CaptureError::Audio(m) => format!("Audio capture failed: {}", m),
            CaptureError::Network(m) => format!("Recognition service unreachable: {}", m),
            CaptureError::Busy => "Recognizer busy".to_string(),
            CaptureError::Other(m) => m.clone(),
        }
    }
}

/// Events a capture session streams back.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    /// Device open, waiting for speech.
    Ready,
    Partial(String),
    Final(String),
    Error(CaptureError),
}

#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Trailing silence that ends the utterance.
    pub end_silence: Duration,
    pub partial_results: bool,
}

/// A source of transcribed speech, one session per `open`.
#[async_trait]
pub trait SpeechCapture: Send + Sync {
    /// Start a session. It must stop emitting once `cancel` fires.
    async fn open(
        &self,
        options: CaptureOptions,
        cancel: CancellationToken,
    ) -> VoiceResult<mpsc::Receiver<CaptureEvent>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognitionState {
    Idle,
    Listening,
    Processing,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionResult {
    Partial(String),
    Final(String),
    Error { code: String, message: String },
}

#[derive(Debug, Clone)]
pub struct RecognizerConfig {
    /// Trailing silence passed to every capture session (default: 700ms)
    pub end_silence: Duration,
    /// Pause before restarting after a recoverable outcome (default: 50ms)
    pub restart_delay: Duration,
    /// Retry delay grows by this per consecutive error (default: 300ms)
    pub retry_step: Duration,
    /// Upper bound for the retry delay (default: 3s)
    pub max_retry_delay: Duration,
    /// Consecutive errors before giving up (default: 5)
    pub max_consecutive_errors: u32,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            end_silence: Duration::from_millis(700),
            restart_delay: Duration::from_millis(50),
            retry_step: Duration::from_millis(300),
            max_retry_delay: Duration::from_millis(3000),
            max_consecutive_errors: 5,
        }
    }
}

impl RecognizerConfig {
    /// Delay before the next session after `consecutive` errors in a row.
    pub fn retry_delay(&self, consecutive: u32) -> Duration {
        (self.retry_step * consecutive).min(self.max_retry_delay)
    }
}

enum Outcome {
    Final(String),
    Suppressed,
    Failed(CaptureError),
    Cancelled,
}

struct Shared {
    capture: Arc<dyn SpeechCapture>,
    echo: Arc<EchoGuard>,
    config: RecognizerConfig,
    state: watch::Sender<RecognitionState>,
    results: broadcast::Sender<RecognitionResult>,
}

impl Shared {
    fn set_state(&self, cancel: &CancellationToken, state: RecognitionState) {
        if !cancel.is_cancelled() {
            self.state.send_replace(state);
        }
    }

    fn emit(&self, cancel: &CancellationToken, result: RecognitionResult) {
        if !cancel.is_cancelled() {
            let _ = self.results.send(result);
        }
    }
}

pub struct SpeechRecognitionEngine {
    shared: Arc<Shared>,
    run: Mutex<Option<CancellationToken>>,
}

impl SpeechRecognitionEngine {
    pub fn new(
        capture: Arc<dyn SpeechCapture>,
        echo: Arc<EchoGuard>,
        config: RecognizerConfig,
    ) -> Self {
        let (state, _) = watch::channel(RecognitionState::Idle);
        let (results, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                capture,
                echo,
                config,
                state,
                results,
            }),
            run: Mutex::new(None),
        }
    }

    /// Arm continuous capture. No-op while already armed.
    pub fn start_listening(&self) {
        let mut run = self.run.lock().unwrap_or_else(PoisonError::into_inner);
        if run.as_ref().is_some_and(|t| !t.is_cancelled()) {
            return;
        }
        let cancel = CancellationToken::new();
        *run = Some(cancel.clone());
        info!("👂 Listening armed");
        tokio::spawn(recognition_loop(self.shared.clone(), cancel));
    }

    /// Disarm and cancel any in-flight session.
    pub fn stop_listening(&self) {
        let token = self
            .run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(token) = token {
            token.cancel();
            debug!("👂 Listening disarmed");
        }
        self.shared.state.send_replace(RecognitionState::Idle);
    }

    pub fn is_listening(&self) -> bool {
        self.run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.is_cancelled())
    }

    pub fn state(&self) -> RecognitionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<RecognitionState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecognitionResult> {
        self.shared.results.subscribe()
    }
}

impl Drop for SpeechRecognitionEngine {
    fn drop(&mut self) {
        if let Some(token) = self
            .run
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }
    }
}

async fn recognition_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut consecutive_errors = 0u32;

    loop {
        shared.set_state(&cancel, RecognitionState::Listening);

        let delay = match run_session(&shared, &cancel).await {
            Outcome::Cancelled => break,
            Outcome::Final(text) => {
                consecutive_errors = 0;
                shared.emit(&cancel, RecognitionResult::Final(text));
                shared.set_state(&cancel, RecognitionState::Idle);
                shared.config.restart_delay
            }
            Outcome::Suppressed => {
                shared.set_state(&cancel, RecognitionState::Idle);
                shared.config.restart_delay
            }
            Outcome::Failed(err) if err.is_recoverable() => {
                debug!("Recognition ended quietly ({}), restarting", err.code());
                shared.config.restart_delay
            }
            Outcome::Failed(err) => {
                consecutive_errors += 1;
                warn!(
                    code = err.code(),
                    consecutive = consecutive_errors,
                    "Recognition failed: {}",
                    err.message()
                );
                if consecutive_errors >= shared.config.max_consecutive_errors {
                    shared.emit(
                        &cancel,
                        RecognitionResult::Error {
                            code: err.code().to_string(),
                            message: err.message(),
                        },
                    );
                    shared.set_state(&cancel, RecognitionState::Error);
                    break;
                }
                shared.config.retry_delay(consecutive_errors)
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    // Leaves the engine re-armable after giving up.
    cancel.cancel();
}

async fn run_session(shared: &Shared, cancel: &CancellationToken) -> Outcome {
    let options = CaptureOptions {
        end_silence: shared.config.end_silence,
        partial_results: true,
    };
    let session = cancel.child_token();
    let _guard = session.clone().drop_guard();

    let mut events = tokio::select! {
        _ = cancel.cancelled() => return Outcome::Cancelled,
        opened = shared.capture.open(options, session.clone()) => match opened {
            Ok(events) => events,
            Err(e) => return Outcome::Failed(CaptureError::Other(e.to_string())),
        },
    };

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return Outcome::Cancelled,
            event = events.recv() => event,
        };
        match event {
            Some(CaptureEvent::Ready) => debug!("🎤 Capture ready"),
            Some(CaptureEvent::Partial(text)) => {
                let text = text.trim();
                if text.is_empty() || shared.echo.is_echo(text) {
                    continue;
                }
                shared.emit(cancel, RecognitionResult::Partial(text.to_string()));
            }
            Some(CaptureEvent::Final(text)) => {
                shared.set_state(cancel, RecognitionState::Processing);
                let text = text.trim();
                if text.is_empty() {
                    return Outcome::Suppressed;
                }
                if shared.echo.is_echo(text) {
                    debug!("🔇 Dropped likely echo: {:?}", text);
                    return Outcome::Suppressed;
                }
                info!("🗣️ Heard: {:?}", text);
                return Outcome::Final(text.to_string());
            }
            Some(CaptureEvent::Error(err)) => return Outcome::Failed(err),
            None => {
                return Outcome::Failed(CaptureError::Other(
                    "capture session ended without a result".to_string(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_grows_linearly_then_caps() {
        let config = RecognizerConfig::default();
        assert_eq!(config.retry_delay(1), Duration::from_millis(300));
        assert_eq!(config.retry_delay(4), Duration::from_millis(1200));
        assert_eq!(config.retry_delay(20), Duration::from_millis(3000));
    }

    #[test]
    fn only_silence_outcomes_are_recoverable() {
        assert!(CaptureError::NoSpeech.is_recoverable());
        assert!(CaptureError::SpeechTimeout.is_recoverable());
        assert!(!CaptureError::Network("down".into()).is_recoverable());
        assert!(!CaptureError::Busy.is_recoverable());
        assert_eq!(CaptureError::Audio("x".into()).code(), "audio");
    }
}
