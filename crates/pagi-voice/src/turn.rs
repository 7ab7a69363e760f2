//! Utterance endpointing for one capture session.
//!
//! Consumes VAD-classified frames and decides when the user started talking, when an interim
//! transcript is due, and when trailing silence ends the utterance. Time is measured in samples,
//! so the endpointer is deterministic and independent of wall-clock jitter.

use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub sample_rate: u32,
    /// Trailing silence that ends an utterance (default: 700ms)
    pub end_silence: Duration,
    /// Voiced audio shorter than this is dropped as noise (default: 200ms)
    pub min_speech: Duration,
    /// Give up when nobody speaks for this long (default: 6s)
    pub no_speech_timeout: Duration,
    /// Hard cap on a single utterance (default: 30s)
    pub max_utterance: Duration,
    /// Interval between interim snapshots while speech continues (default: 1s)
    pub partial_interval: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            end_silence: Duration::from_millis(700),
            min_speech: Duration::from_millis(200),
            no_speech_timeout: Duration::from_secs(6),
            max_utterance: Duration::from_secs(30),
            partial_interval: Duration::from_secs(1),
        }
    }
}

/// What the endpointer decided after a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum EndpointEvent {
    SpeechStarted,
    /// Audio of the utterance so far, for an interim transcript.
    Interim(Vec<f32>),
    /// Complete utterance, ended by trailing silence.
    Utterance(Vec<f32>),
    NoSpeech,
    /// The utterance ran past `max_utterance`.
    TooLong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Waiting,
    Speaking,
    Trailing,
    Done,
}

pub struct Endpointer {
    config: EndpointConfig,
    phase: Phase,
    buffer: Vec<f32>,
    waited: usize,
    silence: usize,
    since_interim: usize,
}

impl Endpointer {
    pub fn new(config: EndpointConfig) -> Self {
        Self {
            config,
            phase: Phase::Waiting,
            buffer: Vec::new(),
            waited: 0,
            silence: 0,
            since_interim: 0,
        }
    }

    fn samples(&self, duration: Duration) -> usize {
        (duration.as_millis() as u64 * self.config.sample_rate as u64 / 1000) as usize
    }

    /// True once the session produced its terminal event.
    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Feed one frame and its VAD verdict.
    pub fn process(&mut self, frame: &[f32], is_speech: bool) -> Option<EndpointEvent> {
        match self.phase {
            Phase::Done => None,
            Phase::Waiting => {
                if is_speech {
                    debug!("🎤 Speech started");
                    self.phase = Phase::Speaking;
                    self.buffer.clear();
                    self.buffer.extend_from_slice(frame);
                    self.silence = 0;
                    self.since_interim = frame.len();
                    return Some(EndpointEvent::SpeechStarted);
                }
                self.waited += frame.len();
                if self.waited >= self.samples(self.config.no_speech_timeout) {
                    self.phase = Phase::Done;
                    return Some(EndpointEvent::NoSpeech);
                }
                None
            }
            Phase::Speaking | Phase::Trailing => {
                self.buffer.extend_from_slice(frame);
                if is_speech {
                    self.silence = 0;
                    self.phase = Phase::Speaking;
                } else {
                    self.silence += frame.len();
                    self.phase = Phase::Trailing;
                }

                if self.silence >= self.samples(self.config.end_silence) {
                    let voiced = self.buffer.len().saturating_sub(self.silence);
                    if voiced < self.samples(self.config.min_speech) {
                        debug!("⏭️ Speech too short ({} samples), ignoring", voiced);
                        self.phase = Phase::Waiting;
                        self.waited += self.buffer.len();
                        self.buffer.clear();
                        return None;
                    }
                    info!(
                        "✅ Utterance complete ({} ms of audio)",
                        self.buffer.len() as u64 * 1000 / self.config.sample_rate as u64
                    );
                    self.phase = Phase::Done;
                    return Some(EndpointEvent::Utterance(std::mem::take(&mut self.buffer)));
                }

                if self.buffer.len() >= self.samples(self.config.max_utterance) {
                    info!("⏱️ Max utterance duration reached");
                    self.phase = Phase::Done;
                    self.buffer.clear();
                    return Some(EndpointEvent::TooLong);
                }

                self.since_interim += frame.len();
                if is_speech && self.since_interim >= self.samples(self.config.partial_interval) {
                    self.since_interim = 0;
                    return Some(EndpointEvent::Interim(self.buffer.clone()));
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: usize = 480; // 30ms at 16kHz

    fn feed(endpointer: &mut Endpointer, speech: bool, frames: usize) -> Vec<EndpointEvent> {
        let frame = vec![if speech { 0.4 } else { 0.0 }; FRAME];
        (0..frames)
            .filter_map(|_| endpointer.process(&frame, speech))
            .collect()
    }

    #[test]
    fn trailing_silence_ends_utterance() {
        let mut endpointer = Endpointer::new(EndpointConfig::default());
        let started = feed(&mut endpointer, true, 20); // 600ms
        assert_eq!(started[0], EndpointEvent::SpeechStarted);

        // 690ms of silence is not enough, the 24th frame (720ms) is.
        assert!(feed(&mut endpointer, false, 23).is_empty());
        let ended = feed(&mut endpointer, false, 1);
        match &ended[..] {
            [EndpointEvent::Utterance(audio)] => assert_eq!(audio.len(), 44 * FRAME),
            other => panic!("unexpected {:?}", other),
        }
        assert!(endpointer.is_done());
        assert!(feed(&mut endpointer, true, 5).is_empty());
    }

    #[test]
    fn interim_snapshots_while_speaking() {
        let mut endpointer = Endpointer::new(EndpointConfig::default());
        let events = feed(&mut endpointer, true, 70); // 2.1s
        let interims = events
            .iter()
            .filter(|e| matches!(e, EndpointEvent::Interim(_)))
            .count();
        assert_eq!(interims, 2);
    }

    #[test]
    fn silence_only_times_out() {
        let config = EndpointConfig {
            no_speech_timeout: Duration::from_millis(300),
            ..Default::default()
        };
        let mut endpointer = Endpointer::new(config);
        assert_eq!(feed(&mut endpointer, false, 10), vec![EndpointEvent::NoSpeech]);
    }

    #[test]
    fn short_blip_is_dropped() {
        let mut endpointer = Endpointer::new(EndpointConfig::default());
        feed(&mut endpointer, true, 2); // 60ms
        assert!(feed(&mut endpointer, false, 30).is_empty());
        assert!(!endpointer.is_done());
    }
}
