//! Self-echo suppression: ignore transcripts that are likely our own TTS leaking into the mic.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// How long a spoken sentence stays relevant for echo checks.
pub const ECHO_WINDOW: Duration = Duration::from_secs(3);

/// Transcripts shorter than this are treated as echo inside the window.
pub const MIN_GENUINE_CHARS: usize = 4;

#[derive(Debug)]
struct SpokenText {
    text: String,
    at: Instant,
}

/// Remembers the most recent TTS output. Shared by the TTS engine (writer) and the
/// recognizer (reader).
#[derive(Debug, Default)]
pub struct EchoGuard {
    last: Mutex<Option<SpokenText>>,
}

impl EchoGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `text` is about to be spoken.
    pub fn register_output(&self, text: &str) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(SpokenText {
            text: text.trim().to_lowercase(),
            at: Instant::now(),
        });
    }

    /// Within the window, a transcript is echo when the spoken text contains it or it is too
    /// short to be a genuine utterance.
    pub fn is_echo(&self, transcript: &str) -> bool {
        let guard = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(spoken) = guard.as_ref() else {
            return false;
        };
        if spoken.at.elapsed() > ECHO_WINDOW {
            return false;
        }
        let heard = transcript.trim().to_lowercase();
        spoken.text.contains(&heard) || heard.chars().count() < MIN_GENUINE_CHARS
    }

    pub fn clear(&self) {
        self.last.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn echo_within_window_is_suppressed() {
        let guard = EchoGuard::new();
        guard.register_output("It's sunny today.");
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(guard.is_echo("it's sunny today."));
        assert!(guard.is_echo("  SUNNY "));
        assert!(guard.is_echo("ok"));
        assert!(!guard.is_echo("what about tomorrow"));
    }

    #[tokio::test(start_paused = true)]
    async fn echo_expires_after_window() {
        let guard = EchoGuard::new();
        guard.register_output("It's sunny today.");
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(!guard.is_echo("It's sunny today."));
        assert!(!guard.is_echo("ok"));
    }

    #[test]
    fn nothing_spoken_means_no_echo() {
        let guard = EchoGuard::new();
        assert!(!guard.is_echo("hi"));
    }
}
