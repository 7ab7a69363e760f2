//! Microphone capture using CPAL
//!
//! Delivers fixed-size mono f32 frames to a channel. The CPAL stream is `!Send` on some
//! platforms, so it lives on the thread that started it.

use crate::error::{VoiceError, VoiceResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use std::sync::mpsc::Sender;
use tracing::{info, warn};

/// Audio configuration
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Sample rate in Hz (default: 16000)
    pub sample_rate: u32,

    /// Samples per delivered frame (default: 480, 30ms at 16kHz)
    pub frame_len: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            frame_len: 480,
        }
    }
}

/// Default input device, configured for mono capture.
pub struct Microphone {
    device: Device,
    stream_config: StreamConfig,
    frame_len: usize,
}

impl Microphone {
    pub fn open_default(config: &AudioConfig) -> VoiceResult<Self> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| VoiceError::AudioDevice("No input device available".to_string()))?;

        info!(
            "🎤 Using input device: {} ({}Hz mono)",
            device.name().unwrap_or_else(|_| "Unknown".to_string()),
            config.sample_rate
        );

        let stream_config = StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(config.frame_len as u32),
        };

        Ok(Self {
            device,
            stream_config,
            frame_len: config.frame_len,
        })
    }

    /// Start capturing. Frames go to `frames` until the returned stream is dropped.
    pub fn start(self, frames: Sender<Vec<f32>>) -> VoiceResult<Stream> {
        let frame_len = self.frame_len;
        let mut pending = Vec::with_capacity(frame_len);

        let stream = self.device.build_input_stream(
            &self.stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                for &sample in data {
                    pending.push(sample);
                    if pending.len() == frame_len {
                        let frame = std::mem::replace(&mut pending, Vec::with_capacity(frame_len));
                        // Receiver gone means the session ended; the stream is about to drop.
                        let _ = frames.send(frame);
                    }
                }
            },
            move |err| {
                warn!("Audio stream error: {}", err);
            },
            None,
        )?;

        stream.play()?;
        info!("▶️ Microphone capture started");
        Ok(stream)
    }

    /// Names of all input devices on the default host.
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let devices = cpal::default_host().input_devices()?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_config_defaults() {
        let config = AudioConfig::default();
        assert_eq!(config.sample_rate, 16000);
        assert_eq!(config.frame_len, 480);
    }

    #[test]
    #[ignore] // Requires an audio host
    fn test_list_devices() {
        let devices = Microphone::list_input_devices().unwrap();
        println!("Available input devices: {:?}", devices);
    }
}
