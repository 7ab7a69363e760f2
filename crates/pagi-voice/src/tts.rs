//! Text-to-speech engine: an ordered sentence queue drained by one worker task.
//!
//! Each sentence is registered with the echo guard, synthesized (network voice first, local
//! engine as fallback for that sentence) and played to completion before the next one starts.

use crate::echo::EchoGuard;
use crate::error::{VoiceError, VoiceResult};
use crate::sentence::split_sentences;
use crate::voice_output::{AudioSink, SpeechSynthesizer};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtsState {
    Idle,
    Speaking,
    Paused,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TtsEvent {
    SentenceStarted { sequence: u64, text: String },
    /// The queue drained naturally. `last_sequence` is the last sentence spoken.
    Completed { last_sequence: u64 },
    /// Speech was cut off and the queue discarded.
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct TtsConfig {
    /// Budget for the network voice before falling back (default: 15s)
    pub network_timeout: Duration,
    /// Budget for the local engine (default: 30s)
    pub local_timeout: Duration,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            network_timeout: Duration::from_secs(15),
            local_timeout: Duration::from_secs(30),
        }
    }
}

enum Command {
    Enqueue { sequence: u64, text: String },
    Interrupt(oneshot::Sender<()>),
    Pause,
    Resume,
}

pub struct TextToSpeechEngine {
    commands: mpsc::Sender<Command>,
    next_sequence: AtomicU64,
    state: watch::Receiver<TtsState>,
    events: broadcast::Sender<TtsEvent>,
    cancel: CancellationToken,
}

impl TextToSpeechEngine {
    /// `network` is the preferred voice; `local` is always available as fallback.
    pub fn new(
        network: Option<Arc<dyn SpeechSynthesizer>>,
        local: Arc<dyn SpeechSynthesizer>,
        sink: Arc<dyn AudioSink>,
        echo: Arc<EchoGuard>,
        config: TtsConfig,
    ) -> Self {
        let (commands, rx) = mpsc::channel(64);
        let (state_tx, state) = watch::channel(TtsState::Idle);
        let (events, _) = broadcast::channel(64);
        let cancel = CancellationToken::new();

        let worker = Worker {
            network,
            local,
            sink,
            echo,
            config,
            state: state_tx,
            events: events.clone(),
            queue: VecDeque::new(),
            paused: false,
            active: false,
            last_sequence: 0,
        };
        tokio::spawn(worker.run(rx, cancel.clone()));

        Self {
            commands,
            next_sequence: AtomicU64::new(0),
            state,
            events,
            cancel,
        }
    }

    /// Split a block of text into sentences and queue them all.
    /// Returns the sequence number of the last sentence, if any.
    pub async fn speak(&self, text: &str) -> VoiceResult<Option<u64>> {
        let mut last = None;
        for sentence in split_sentences(text) {
            last = Some(self.speak_chunk(&sentence).await?);
        }
        Ok(last)
    }

    /// Queue one pre-segmented sentence. Returns its sequence number.
    pub async fn speak_chunk(&self, text: &str) -> VoiceResult<u64> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.send(Command::Enqueue {
            sequence,
            text: text.trim().to_string(),
        })
        .await?;
        Ok(sequence)
    }

    /// Stop playback and discard the queue. Resolves once the engine is idle.
    pub async fn interrupt(&self) -> VoiceResult<()> {
        let (ack, done) = oneshot::channel();
        self.send(Command::Interrupt(ack)).await?;
        done.await.map_err(|_| VoiceError::Cancelled)
    }

    pub async fn pause(&self) -> VoiceResult<()> {
        self.send(Command::Pause).await
    }

    pub async fn resume(&self) -> VoiceResult<()> {
        self.send(Command::Resume).await
    }

    pub fn state(&self) -> TtsState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<TtsState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TtsEvent> {
        self.events.subscribe()
    }

    async fn send(&self, cmd: Command) -> VoiceResult<()> {
        self.commands
            .send(cmd)
            .await
            .map_err(|e| VoiceError::ChannelSend(format!("TTS worker stopped: {}", e)))
    }
}

impl Drop for TextToSpeechEngine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Worker {
    network: Option<Arc<dyn SpeechSynthesizer>>,
    local: Arc<dyn SpeechSynthesizer>,
    sink: Arc<dyn AudioSink>,
    echo: Arc<EchoGuard>,
    config: TtsConfig,
    state: watch::Sender<TtsState>,
    events: broadcast::Sender<TtsEvent>,
    queue: VecDeque<(u64, String)>,
    paused: bool,
    /// Something was spoken or paused since the engine was last idle.
    active: bool,
    last_sequence: u64,
}

impl Worker {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, cancel: CancellationToken) {
        loop {
            if self.paused || self.queue.is_empty() {
                let cmd = tokio::select! {
                    _ = cancel.cancelled() => break,
                    cmd = commands.recv() => cmd,
                };
                match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                }
                continue;
            }

            let Some((sequence, text)) = self.queue.pop_front() else {
                continue;
            };
            self.active = true;
            self.state.send_replace(TtsState::Speaking);
            self.echo.register_output(&text);
            let _ = self.events.send(TtsEvent::SentenceStarted {
                sequence,
                text: text.clone(),
            });
            debug!(sequence, "🗣️ Speaking: {:?}", text);

            let mut interrupted = None;
            {
                let speaking = speak_sentence(
                    self.network.clone(),
                    self.local.clone(),
                    self.sink.clone(),
                    self.config.clone(),
                    text,
                );
                tokio::pin!(speaking);

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            self.sink.stop();
                            return;
                        }
                        result = &mut speaking => {
                            if let Err(e) = result {
                                warn!(sequence, "Sentence skipped: {}", e);
                            }
                            break;
                        }
                        cmd = commands.recv() => match cmd {
                            Some(Command::Interrupt(ack)) => {
                                interrupted = Some(ack);
                                break;
                            }
                            Some(cmd) => self.handle(cmd),
                            None => {
                                self.sink.stop();
                                return;
                            }
                        },
                    }
                }
            }

            if let Some(ack) = interrupted {
                self.interrupt();
                let _ = ack.send(());
                continue;
            }

            self.last_sequence = sequence;
            if self.queue.is_empty() {
                self.active = false;
                self.paused = false;
                self.state.send_replace(TtsState::Idle);
                info!("✅ Finished speaking");
                let _ = self.events.send(TtsEvent::Completed {
                    last_sequence: sequence,
                });
            }
        }
        self.sink.stop();
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Enqueue { sequence, text } => {
                if !text.is_empty() {
                    self.queue.push_back((sequence, text));
                }
            }
            Command::Interrupt(ack) => {
                self.interrupt();
                let _ = ack.send(());
            }
            Command::Pause => {
                if self.active && !self.paused {
                    self.paused = true;
                    self.sink.pause();
                    self.state.send_replace(TtsState::Paused);
                    info!("⏸️ Speech paused");
                }
            }
            Command::Resume => {
                if self.paused {
                    self.paused = false;
                    self.sink.resume();
                    self.state.send_replace(TtsState::Speaking);
                    info!("▶️ Speech resumed");
                }
            }
        }
    }

    fn interrupt(&mut self) {
        let had_work = self.active || !self.queue.is_empty();
        self.sink.stop();
        self.queue.clear();
        self.paused = false;
        self.active = false;
        self.state.send_replace(TtsState::Idle);
        if had_work {
            info!("🛑 Speech interrupted");
            let _ = self.events.send(TtsEvent::Interrupted);
        }
    }
}

async fn speak_sentence(
    network: Option<Arc<dyn SpeechSynthesizer>>,
    local: Arc<dyn SpeechSynthesizer>,
    sink: Arc<dyn AudioSink>,
    config: TtsConfig,
    text: String,
) -> VoiceResult<()> {
    let audio = synthesize(network, local, &config, &text).await?;
    if audio.is_empty() {
        return Ok(());
    }
    sink.play(audio).await
}

async fn synthesize(
    network: Option<Arc<dyn SpeechSynthesizer>>,
    local: Arc<dyn SpeechSynthesizer>,
    config: &TtsConfig,
    text: &str,
) -> VoiceResult<Vec<u8>> {
    if let Some(voice) = network {
        match tokio::time::timeout(config.network_timeout, voice.synthesize(text)).await {
            Ok(Ok(audio)) => return Ok(audio),
            Ok(Err(e)) => warn!("Network voice failed, using {}: {}", local.name(), e),
            Err(_) => warn!("Network voice timed out, using {}", local.name()),
        }
    }
    tokio::time::timeout(config.local_timeout, local.synthesize(text))
        .await
        .map_err(|_| VoiceError::Tts(format!("{} timed out", local.name())))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Fixed(&'static str, bool);

    #[async_trait]
    impl SpeechSynthesizer for Fixed {
        fn name(&self) -> &str {
            self.0
        }

        async fn synthesize(&self, text: &str) -> VoiceResult<Vec<u8>> {
            if self.1 {
                Ok(format!("{}:{}", self.0, text).into_bytes())
            } else {
                Err(VoiceError::Tts("offline".to_string()))
            }
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    #[async_trait]
    impl AudioSink for Recorder {
        async fn play(&self, audio: Vec<u8>) -> VoiceResult<()> {
            self.0
                .lock()
                .unwrap()
                .push(String::from_utf8(audio).unwrap());
            Ok(())
        }
        fn pause(&self) {}
        fn resume(&self) {}
        fn stop(&self) {}
    }

    #[tokio::test]
    async fn network_failure_falls_back_per_sentence() {
        let sink = Arc::new(Recorder::default());
        let engine = TextToSpeechEngine::new(
            Some(Arc::new(Fixed("net", false))),
            Arc::new(Fixed("local", true)),
            sink.clone(),
            Arc::new(EchoGuard::new()),
            TtsConfig::default(),
        );
        let mut events = engine.subscribe();

        assert_eq!(engine.speak("One. Two.").await.unwrap(), Some(2));
        // The first sentence may drain the queue before the second arrives.
        loop {
            if let TtsEvent::Completed { last_sequence: 2 } = events.recv().await.unwrap() {
                break;
            }
        }
        assert_eq!(*sink.0.lock().unwrap(), vec!["local:One.", "local:Two."]);
        assert_eq!(engine.state(), TtsState::Idle);
    }

    #[tokio::test]
    async fn interrupt_when_idle_emits_nothing() {
        let engine = TextToSpeechEngine::new(
            None,
            Arc::new(Fixed("local", true)),
            Arc::new(Recorder::default()),
            Arc::new(EchoGuard::new()),
            TtsConfig::default(),
        );
        let mut events = engine.subscribe();
        engine.interrupt().await.unwrap();
        engine.interrupt().await.unwrap();
        assert!(events.try_recv().is_err());
    }
}
