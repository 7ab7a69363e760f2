//! **VoiceOutput**: synthesizers and the audio sink the TTS engine plays through.
//!
//! Two synthesizers ship with the crate: `NetworkVoice` (OpenAI-compatible `/audio/speech`) and
//! `CommandSynthesizer` (a local engine process reading text on stdin). `RodioSink` owns the
//! output device on a dedicated thread because rodio streams are not `Send`.

use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use rodio::{OutputStream, Sink, Source};
use std::io::Cursor;
use std::process::Stdio;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Turns text into encoded audio (WAV/MP3).
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Synthesize one sentence. An empty result means there is nothing to play.
    async fn synthesize(&self, text: &str) -> VoiceResult<Vec<u8>>;
}

/// Audio output device.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Play encoded audio. Resolves when playback finished or was stopped.
    async fn play(&self, audio: Vec<u8>) -> VoiceResult<()>;

    /// Halt output, keeping the position. Audio started while paused stays paused.
    fn pause(&self);

    fn resume(&self);

    /// Drop whatever is playing. A pending `play` resolves.
    fn stop(&self);
}

/// Network voice: OpenAI-compatible speech API.
/// Uses `TTS_API_URL` (default https://api.openai.com/v1), `TTS_API_KEY`, `TTS_MODEL` (default
/// tts-1) and `TTS_VOICE` (default alloy).
#[derive(Debug, Clone)]
pub struct NetworkVoice {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub voice: String,
    client: reqwest::Client,
}

impl NetworkVoice {
    /// Build from environment: TTS_API_URL, TTS_API_KEY (or OPENAI_API_KEY), TTS_MODEL, TTS_VOICE.
    pub fn from_env() -> VoiceResult<Self> {
        let base_url = std::env::var("TTS_API_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let api_key = std::env::var("TTS_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .map_err(|_| {
                VoiceError::Config("TTS requires TTS_API_KEY or OPENAI_API_KEY".to_string())
            })?;
        let model = std::env::var("TTS_MODEL").unwrap_or_else(|_| "tts-1".to_string());
        let mut voice = Self::new(base_url, api_key, model)?;
        if let Ok(v) = std::env::var("TTS_VOICE") {
            voice = voice.with_voice(v);
        }
        Ok(voice)
    }

    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            voice: "alloy".to_string(),
            client,
        })
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = voice.into();
        self
    }
}

#[async_trait]
impl SpeechSynthesizer for NetworkVoice {
    fn name(&self) -> &str {
        "network"
    }

    async fn synthesize(&self, text: &str) -> VoiceResult<Vec<u8>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/audio/speech", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": self.voice,
        });
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Tts(format!("TTS API error {}: {}", status, body)));
        }
        let bytes = res.bytes().await.map_err(|e| VoiceError::Tts(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Local engine process: text on stdin, WAV on stdout.
#[derive(Debug, Clone)]
pub struct CommandSynthesizer {
    program: String,
    args: Vec<String>,
}

impl Default for CommandSynthesizer {
    fn default() -> Self {
        Self::new("espeak-ng", ["--stdout"])
    }
}

impl CommandSynthesizer {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// `LOCAL_TTS_COMMAND` (e.g. `piper --model en.onnx --output_file -`), else espeak-ng.
    pub fn from_env() -> Self {
        let command = std::env::var("LOCAL_TTS_COMMAND").unwrap_or_default();
        let mut parts = command.split_whitespace();
        match parts.next() {
            Some(program) => Self::new(program, parts),
            None => Self::default(),
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for CommandSynthesizer {
    fn name(&self) -> &str {
        &self.program
    }

    async fn synthesize(&self, text: &str) -> VoiceResult<Vec<u8>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VoiceError::Tts(format!("Failed to start {}: {}", self.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(text.as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VoiceError::Tts(format!("{} failed: {}", self.program, stderr.trim())));
        }
        Ok(output.stdout)
    }
}

enum SinkCommand {
    Play {
        audio: Vec<u8>,
        done: oneshot::Sender<VoiceResult<()>>,
    },
    Pause,
    Resume,
    Stop,
}

const SINK_POLL: Duration = Duration::from_millis(20);

/// Default output device via rodio.
pub struct RodioSink {
    commands: mpsc::Sender<SinkCommand>,
}

impl RodioSink {
    pub fn new() -> VoiceResult<Self> {
        let (commands, rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        thread::Builder::new()
            .name("pagi-voice-output".to_string())
            .spawn(move || playback_thread(rx, ready_tx))?;
        ready_rx
            .recv()
            .map_err(|_| VoiceError::Playback("output thread exited".to_string()))??;
        info!("🔊 Audio output ready");
        Ok(Self { commands })
    }

    fn send(&self, cmd: SinkCommand) {
        if self.commands.send(cmd).is_err() {
            warn!("Audio output thread is gone");
        }
    }
}

#[async_trait]
impl AudioSink for RodioSink {
    async fn play(&self, audio: Vec<u8>) -> VoiceResult<()> {
        if audio.is_empty() {
            return Ok(());
        }
        let (done, rx) = oneshot::channel();
        self.commands
            .send(SinkCommand::Play { audio, done })
            .map_err(|e| VoiceError::ChannelSend(e.to_string()))?;
        rx.await
            .map_err(|_| VoiceError::Playback("output thread exited".to_string()))?
    }

    fn pause(&self) {
        self.send(SinkCommand::Pause);
    }

    fn resume(&self) {
        self.send(SinkCommand::Resume);
    }

    fn stop(&self) {
        self.send(SinkCommand::Stop);
    }
}

fn playback_thread(rx: mpsc::Receiver<SinkCommand>, ready: mpsc::Sender<VoiceResult<()>>) {
    let (_stream, handle) = match OutputStream::try_default() {
        Ok(pair) => pair,
        Err(e) => {
            let _ = ready.send(Err(VoiceError::Playback(e.to_string())));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    let mut current: Option<(Sink, oneshot::Sender<VoiceResult<()>>)> = None;
    let mut paused = false;

    loop {
        match rx.recv_timeout(SINK_POLL) {
            Ok(SinkCommand::Play { audio, done }) => {
                if let Some((sink, previous)) = current.take() {
                    sink.stop();
                    let _ = previous.send(Ok(()));
                }
                let started = Sink::try_new(&handle)
                    .map_err(|e| VoiceError::Playback(e.to_string()))
                    .and_then(|sink| {
                        let source = rodio::Decoder::new(Cursor::new(audio))
                            .map_err(|e| VoiceError::Playback(format!("Decode failed: {}", e)))?;
                        if paused {
                            sink.pause();
                        }
                        sink.append(source.convert_samples::<f32>());
                        Ok(sink)
                    });
                match started {
                    Ok(sink) => current = Some((sink, done)),
                    Err(e) => {
                        let _ = done.send(Err(e));
                    }
                }
            }
            Ok(SinkCommand::Pause) => {
                paused = true;
                if let Some((sink, _)) = &current {
                    sink.pause();
                }
            }
            Ok(SinkCommand::Resume) => {
                paused = false;
                if let Some((sink, _)) = &current {
                    sink.play();
                }
            }
            Ok(SinkCommand::Stop) => {
                paused = false;
                if let Some((sink, done)) = current.take() {
                    sink.stop();
                    let _ = done.send(Ok(()));
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if let Some((sink, done)) = current.take() {
            if sink.empty() {
                let _ = done.send(Ok(()));
            } else {
                current = Some((sink, done));
            }
        }
    }
    debug!("Audio output thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_synthesizer_defaults_to_espeak() {
        let synth = CommandSynthesizer::default();
        assert_eq!(synth.name(), "espeak-ng");
        assert_eq!(synth.args, vec!["--stdout".to_string()]);
    }

    #[tokio::test]
    async fn command_synthesizer_pipes_text_through() {
        // `cat` echoes stdin back, standing in for an engine that writes audio to stdout.
        let synth = CommandSynthesizer::new("cat", Vec::<String>::new());
        let audio = synth.synthesize("  hello there ").await.unwrap();
        assert_eq!(audio, b"hello there");
        assert!(synth.synthesize("   ").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_engine_is_a_tts_error() {
        let synth = CommandSynthesizer::new("pagi-no-such-tts-engine", ["--stdout"]);
        assert!(matches!(
            synth.synthesize("hi").await,
            Err(VoiceError::Tts(_))
        ));
    }

    #[test]
    #[ignore] // Requires an audio output device
    fn rodio_sink_opens_default_device() {
        RodioSink::new().unwrap();
    }
}
