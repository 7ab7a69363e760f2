//! Audio focus: exclusive use of microphone and speaker for the duration of a conversation.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

pub trait AudioFocus: Send + Sync {
    /// Request focus. False when another owner holds it.
    fn acquire(&self) -> bool;

    fn release(&self);
}

/// In-process focus grant: one holder at a time.
#[derive(Debug, Default)]
pub struct ExclusiveAudioFocus {
    held: AtomicBool,
}

impl ExclusiveAudioFocus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

impl AudioFocus for ExclusiveAudioFocus {
    fn acquire(&self) -> bool {
        let granted = self
            .held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        debug!(granted, "Audio focus requested");
        granted
    }

    fn release(&self) {
        self.held.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn focus_is_exclusive_until_released() {
        let focus = ExclusiveAudioFocus::new();
        assert!(focus.acquire());
        assert!(!focus.acquire());
        focus.release();
        assert!(!focus.is_held());
        assert!(focus.acquire());
    }
}
