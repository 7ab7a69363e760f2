//! **Speech-to-Text (STT)**: convert captured PCM into text for the recognizer.
//!
//! Implement `SttBackend` for any transcription service. `create_best_stt` picks the HTTP
//! backend when credentials are configured and falls back to the placeholder otherwise.

use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use std::io::Cursor;
use std::time::Duration;
use tracing::debug;

/// Backend for converting PCM to text.
#[async_trait]
pub trait SttBackend: Send + Sync {
    /// Transcribe mono f32 PCM. Returns an empty string if nothing was recognized.
    async fn transcribe(&self, samples: &[f32], sample_rate: u32) -> VoiceResult<String>;
}

/// Encode f32 PCM (mono) as 16-bit WAV bytes for upload.
pub fn pcm_to_wav(samples: &[f32], sample_rate: u32) -> VoiceResult<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &s in samples {
            writer.write_sample((s.clamp(-1.0, 1.0) * 32767.0).round() as i16)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Placeholder STT: returns a fixed string. Use for exercising the voice loop without an API.
#[derive(Debug, Default)]
pub struct PlaceholderStt {
    /// If set, return this instead of the default message.
    pub response: Option<String>,
}

impl PlaceholderStt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(s: impl Into<String>) -> Self {
        Self {
            response: Some(s.into()),
        }
    }
}

#[async_trait]
impl SttBackend for PlaceholderStt {
    async fn transcribe(&self, samples: &[f32], sample_rate: u32) -> VoiceResult<String> {
        if let Some(ref r) = self.response {
            return Ok(r.clone());
        }
        let secs = samples.len() as f32 / sample_rate.max(1) as f32;
        Ok(format!(
            "[STT placeholder: {} samples, {:.1}s]",
            samples.len(),
            secs
        ))
    }
}

/// OpenAI-compatible transcription API (`POST {base}/audio/transcriptions`).
/// Uses `STT_API_URL` (default https://api.openai.com/v1), `STT_API_KEY`, and `STT_MODEL`
/// (default whisper-1).
#[derive(Debug, Clone)]
pub struct HttpStt {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    client: reqwest::Client,
}

impl HttpStt {
    /// Build from environment: STT_API_URL, STT_API_KEY (or OPENAI_API_KEY), STT_MODEL.
    pub fn from_env() -> VoiceResult<Self> {
        let base_url = std::env::var("STT_API_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let api_key = std::env::var("STT_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .map_err(|_| {
                VoiceError::Config("STT requires STT_API_KEY or OPENAI_API_KEY".to_string())
            })?;
        let model = std::env::var("STT_MODEL").unwrap_or_else(|_| "whisper-1".to_string());
        Self::new(base_url, api_key, model)
    }

    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        })
    }
}

#[async_trait]
impl SttBackend for HttpStt {
    async fn transcribe(&self, samples: &[f32], sample_rate: u32) -> VoiceResult<String> {
        if samples.is_empty() {
            return Ok(String::new());
        }
        let wav = pcm_to_wav(samples, sample_rate)?;
        let url = format!("{}/audio/transcriptions", self.base_url.trim_end_matches('/'));
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone());

        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Stt(format!("STT API error {}: {}", status, body)));
        }
        let json: serde_json::Value = res.json().await.map_err(|e| VoiceError::Stt(e.to_string()))?;
        let text = json
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        debug!("📝 Transcribed {} samples: {:?}", samples.len(), text);
        Ok(text)
    }
}

/// Create the best available STT backend from environment.
pub fn create_best_stt() -> Box<dyn SttBackend> {
    match HttpStt::from_env() {
        Ok(http) => Box::new(http),
        Err(_) => Box::new(PlaceholderStt::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn placeholder_reports_duration() {
        let stt = PlaceholderStt::new();
        let s = stt.transcribe(&vec![0.0; 8000], 16000).await.unwrap();
        assert!(s.contains("STT placeholder"));
        assert!(s.contains("8000"));
        assert!(s.contains("0.5s"));
    }

    #[tokio::test]
    async fn placeholder_with_response() {
        let stt = PlaceholderStt::with_response("hello world");
        assert_eq!(stt.transcribe(&[], 16000).await.unwrap(), "hello world");
    }

    #[test]
    fn wav_header_and_length() {
        let wav = pcm_to_wav(&[0.0, 0.5, -0.5, 1.5], 16000).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(wav.len(), 44 + 4 * 2);

        let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().sample_rate, 16000);
        let samples: Vec<i16> = reader.into_samples().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![0, 16384, -16384, 32767]);
    }
}
