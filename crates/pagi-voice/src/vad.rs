//! Voice Activity Detection using WebRTC VAD
//!
//! Classifies fixed 30 ms frames as speech or silence for the microphone endpointer.

use crate::error::{VoiceError, VoiceResult};
use tracing::info;
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Frame length WebRTC VAD is fed with.
pub const FRAME_MS: u32 = 30;

/// Configuration for VAD detection
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Sample rate (must be 8000, 16000, 32000, or 48000 Hz for WebRTC VAD)
    pub sample_rate: u32,

    /// Detection aggressiveness (0-3, where 3 rejects the most non-speech)
    pub mode: u8,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            mode: 2,
        }
    }
}

fn vad_mode(mode: u8) -> VoiceResult<VadMode> {
    match mode {
        0 => Ok(VadMode::Quality),
        1 => Ok(VadMode::LowBitrate),
        2 => Ok(VadMode::Aggressive),
        3 => Ok(VadMode::VeryAggressive),
        other => Err(VoiceError::Config(format!("VAD mode must be 0-3, got {}", other))),
    }
}

fn vad_rate(sample_rate: u32) -> VoiceResult<SampleRate> {
    match sample_rate {
        8000 => Ok(SampleRate::Rate8kHz),
        16000 => Ok(SampleRate::Rate16kHz),
        32000 => Ok(SampleRate::Rate32kHz),
        48000 => Ok(SampleRate::Rate48kHz),
        other => Err(VoiceError::Config(format!(
            "WebRTC VAD only supports 8000, 16000, 32000, or 48000 Hz, got {}",
            other
        ))),
    }
}

/// Samples per VAD frame at `sample_rate`.
pub fn frame_len(sample_rate: u32) -> usize {
    (sample_rate * FRAME_MS / 1000) as usize
}

/// Voice Activity Detector using WebRTC VAD. Not `Send`: keep it on the capture thread.
pub struct VadDetector {
    vad: Vad,
    frame_len: usize,
}

impl VadDetector {
    pub fn new(config: &VadConfig) -> VoiceResult<Self> {
        let mode = vad_mode(config.mode)?;
        let rate = vad_rate(config.sample_rate)?;
        let frame_len = frame_len(config.sample_rate);

        let mut vad = Vad::new();
        vad.set_mode(mode);
        vad.set_sample_rate(rate);

        info!(
            "🎙️ VAD ready ({}Hz, mode {}, {} samples/frame)",
            config.sample_rate, config.mode, frame_len
        );
        Ok(Self { vad, frame_len })
    }

    /// Whether one frame of f32 PCM contains speech.
    pub fn is_speech(&mut self, frame: &[f32]) -> VoiceResult<bool> {
        if frame.len() != self.frame_len {
            return Err(VoiceError::VadProcessing(format!(
                "Expected {} samples, got {}",
                self.frame_len,
                frame.len()
            )));
        }
        let pcm: Vec<i16> = frame
            .iter()
            .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
            .collect();
        self.vad
            .is_voice_segment(&pcm)
            .map_err(|_| VoiceError::VadProcessing("invalid frame length".to_string()))
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_is_thirty_ms() {
        let detector = VadDetector::new(&VadConfig::default()).unwrap();
        assert_eq!(detector.frame_len(), 480);
        assert_eq!(frame_len(48000), 1440);
    }

    #[test]
    fn rejects_unsupported_settings() {
        let rate = VadConfig {
            sample_rate: 44100,
            ..Default::default()
        };
        assert!(VadDetector::new(&rate).is_err());

        let mode = VadConfig {
            mode: 7,
            ..Default::default()
        };
        assert!(VadDetector::new(&mode).is_err());
    }

    #[test]
    fn silence_is_not_speech() {
        let mut detector = VadDetector::new(&VadConfig::default()).unwrap();
        assert!(!detector.is_speech(&[0.0f32; 480]).unwrap());
        assert!(detector.is_speech(&[0.0f32; 100]).is_err());
    }
}
