//! **The Ear**: microphone capture backend for the speech recognizer.
//!
//! Captures the microphone via CPAL, classifies 30ms frames with WebRTC VAD, endpoints the
//! utterance on trailing silence, and transcribes it with an `SttBackend`. Device, VAD and
//! endpointer live on a dedicated thread (CPAL streams are `!Send` on some platforms); STT runs
//! on the async side.

use crate::audio::{AudioConfig, Microphone};
use crate::error::VoiceResult;
use crate::recognizer::{CaptureError, CaptureEvent, CaptureOptions, SpeechCapture};
use crate::stt::SttBackend;
use crate::turn::{EndpointConfig, EndpointEvent, Endpointer};
use crate::vad::{frame_len, VadConfig, VadDetector};
use async_trait::async_trait;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const FRAME_WAIT: Duration = Duration::from_millis(100);

/// Configuration for the Ear.
#[derive(Debug, Clone)]
pub struct EarConfig {
    /// Sample rate (default 16000). Must be one WebRTC VAD supports.
    pub sample_rate: u32,
    /// VAD aggressiveness 0-3 (default 2).
    pub vad_mode: u8,
    /// Minimum voiced audio for an utterance (default 200ms).
    pub min_speech: Duration,
    /// Session ends with `NoSpeech` after this much silence (default 6s).
    pub no_speech_timeout: Duration,
    /// Session ends with `SpeechTimeout` past this (default 30s).
    pub max_utterance: Duration,
    /// Interval for interim transcripts (default 1s).
    pub partial_interval: Duration,
}

impl Default for EarConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            vad_mode: 2,
            min_speech: Duration::from_millis(200),
            no_speech_timeout: Duration::from_secs(6),
            max_utterance: Duration::from_secs(30),
            partial_interval: Duration::from_secs(1),
        }
    }
}

impl EarConfig {
    fn endpoint_config(&self, options: &CaptureOptions) -> EndpointConfig {
        EndpointConfig {
            sample_rate: self.sample_rate,
            end_silence: options.end_silence,
            min_speech: self.min_speech,
            no_speech_timeout: self.no_speech_timeout,
            max_utterance: self.max_utterance,
            partial_interval: self.partial_interval,
        }
    }
}

/// Microphone + VAD + STT capture backend.
pub struct EarCapture {
    config: EarConfig,
    stt: Arc<dyn SttBackend>,
}

impl EarCapture {
    pub fn new(config: EarConfig, stt: Arc<dyn SttBackend>) -> Self {
        Self { config, stt }
    }
}

#[async_trait]
impl SpeechCapture for EarCapture {
    async fn open(
        &self,
        options: CaptureOptions,
        cancel: CancellationToken,
    ) -> VoiceResult<mpsc::Receiver<CaptureEvent>> {
        let (events_tx, events_rx) = mpsc::channel(16);
        let (endpoint_tx, endpoint_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let config = self.config.clone();
        let endpoint = config.endpoint_config(&options);
        let thread_cancel = cancel.clone();
        thread::Builder::new()
            .name("pagi-voice-ear".to_string())
            .spawn(move || capture_thread(config, endpoint, thread_cancel, endpoint_tx, ready_tx))?;

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("Ear: capture failed to start: {}", e);
                let _ = events_tx
                    .send(CaptureEvent::Error(CaptureError::Audio(e.to_string())))
                    .await;
                return Ok(events_rx);
            }
            Err(_) => {
                let _ = events_tx
                    .send(CaptureEvent::Error(CaptureError::Audio(
                        "capture thread exited".to_string(),
                    )))
                    .await;
                return Ok(events_rx);
            }
        }

        tokio::spawn(transcribe_session(
            self.stt.clone(),
            self.config.sample_rate,
            options.partial_results,
            endpoint_rx,
            events_tx,
            cancel,
        ));
        Ok(events_rx)
    }
}

fn capture_thread(
    config: EarConfig,
    endpoint: EndpointConfig,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<EndpointEvent>,
    ready: oneshot::Sender<VoiceResult<()>>,
) {
    let started = (|| -> VoiceResult<_> {
        let vad = VadDetector::new(&VadConfig {
            sample_rate: config.sample_rate,
            mode: config.vad_mode,
        })?;
        let mic = Microphone::open_default(&AudioConfig {
            sample_rate: config.sample_rate,
            frame_len: frame_len(config.sample_rate),
        })?;
        let (frame_tx, frame_rx) = std::sync::mpsc::channel();
        let stream = mic.start(frame_tx)?;
        Ok((vad, stream, frame_rx))
    })();

    let (mut vad, _stream, frames) = match started {
        Ok(parts) => {
            let _ = ready.send(Ok(()));
            parts
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    info!(
        "👂 Ear: listening ({}ms trailing silence)",
        endpoint.end_silence.as_millis()
    );
    let mut endpointer = Endpointer::new(endpoint);

    while !cancel.is_cancelled() {
        let frame = match frames.recv_timeout(FRAME_WAIT) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let is_speech = match vad.is_speech(&frame) {
            Ok(speech) => speech,
            Err(e) => {
                debug!("Ear: skipping frame: {}", e);
                continue;
            }
        };
        if let Some(event) = endpointer.process(&frame, is_speech) {
            if events.send(event).is_err() {
                break;
            }
        }
        if endpointer.is_done() {
            break;
        }
    }
    debug!("Ear: capture thread finished");
}

async fn transcribe_session(
    stt: Arc<dyn SttBackend>,
    sample_rate: u32,
    partial_results: bool,
    mut endpoints: mpsc::UnboundedReceiver<EndpointEvent>,
    events: mpsc::Sender<CaptureEvent>,
    cancel: CancellationToken,
) {
    if events.send(CaptureEvent::Ready).await.is_err() {
        return;
    }

    loop {
        let endpoint = tokio::select! {
            _ = cancel.cancelled() => return,
            endpoint = endpoints.recv() => endpoint,
        };
        let event = match endpoint {
            Some(EndpointEvent::SpeechStarted) => continue,
            Some(EndpointEvent::Interim(audio)) => {
                if !partial_results {
                    continue;
                }
                let text = tokio::select! {
                    _ = cancel.cancelled() => return,
                    text = stt.transcribe(&audio, sample_rate) => text,
                };
                match text {
                    Ok(text) if !text.is_empty() => CaptureEvent::Partial(text),
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("Ear: interim transcription failed: {}", e);
                        continue;
                    }
                }
            }
            Some(EndpointEvent::Utterance(audio)) => {
                let text = tokio::select! {
                    _ = cancel.cancelled() => return,
                    text = stt.transcribe(&audio, sample_rate) => text,
                };
                match text {
                    Ok(text) => CaptureEvent::Final(text),
                    Err(e) => {
                        warn!("Ear: transcription failed: {}", e);
                        CaptureEvent::Error(CaptureError::Network(e.to_string()))
                    }
                }
            }
            Some(EndpointEvent::NoSpeech) => CaptureEvent::Error(CaptureError::NoSpeech),
            Some(EndpointEvent::TooLong) => CaptureEvent::Error(CaptureError::SpeechTimeout),
            None => return,
        };

        let terminal = !matches!(event, CaptureEvent::Partial(_));
        if events.send(event).await.is_err() || terminal {
            return;
        }
    }
}
