//! Audio session preservation around display changes
//!
//! Deactivating a display can tear down an audio session routed through it.
//! Holding a session reference while displays are toggled keeps the session
//! alive until the configuration is reverted.

use std::any::Any;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::constants;

/// Opaque reference that keeps an audio session alive while held
pub type AudioSessionRef = Box<dyn Any + Send>;

/// Source of audio session references
pub trait AudioSessionProvider: Send {
    /// `None` when no session is available to hold on to
    fn acquire(&self) -> Option<AudioSessionRef>;
}

/// Capture/release capability used around display changes
pub trait AudioContext: Send {
    /// Idempotent: capturing while already captured succeeds without acquiring again
    fn capture(&mut self) -> bool;
    fn is_captured(&self) -> bool;
    /// Drop the held reference; never fails
    fn release(&mut self);
}

/// Reference-counted audio session handle shared with the audio pipeline.
/// The session stays alive while any clone or acquired reference exists.
#[derive(Debug, Clone, Default)]
pub struct SharedAudioSession {
    session: Arc<()>,
}

impl SharedAudioSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of references currently extending the session, this handle included
    #[cfg(test)]
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.session)
    }
}

impl AudioSessionProvider for SharedAudioSession {
    fn acquire(&self) -> Option<AudioSessionRef> {
        Some(Box::new(Arc::clone(&self.session)))
    }
}

impl<P: AudioSessionProvider + Sync + ?Sized> AudioSessionProvider for Arc<P> {
    fn acquire(&self) -> Option<AudioSessionRef> {
        (**self).acquire()
    }
}

pub struct SessionAudioContext<P: AudioSessionProvider> {
    provider: P,
    captured: Option<AudioSessionRef>,
    settle_delay: Duration,
}

impl<P: AudioSessionProvider> SessionAudioContext<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            captured: None,
            settle_delay: constants::audio::RELEASE_SETTLE_DELAY,
        }
    }

    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }
}

impl<P: AudioSessionProvider> AudioContext for SessionAudioContext<P> {
    fn capture(&mut self) -> bool {
        if self.captured.is_some() {
            debug!("Audio session already captured");
            return true;
        }

        match self.provider.acquire() {
            Some(session) => {
                info!("Captured audio session");
                self.captured = Some(session);
                true
            }
            None => {
                warn!("No audio session available to capture");
                false
            }
        }
    }

    fn is_captured(&self) -> bool {
        self.captured.is_some()
    }

    fn release(&mut self) {
        if self.captured.is_none() {
            return;
        }

        // Give the audio device a moment to come back before letting go
        thread::sleep(self.settle_delay);
        self.captured = None;
        info!("Released audio session");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoSession;

    impl AudioSessionProvider for NoSession {
        fn acquire(&self) -> Option<AudioSessionRef> {
            None
        }
    }

    #[test]
    fn test_capture_holds_session_reference() {
        let session = SharedAudioSession::new();
        let mut context = SessionAudioContext::new(session.clone()).with_settle_delay(Duration::ZERO);
        // The context's provider counts as a holder too
        let baseline = session.holders();

        assert!(!context.is_captured());
        assert!(context.capture());
        assert!(context.is_captured());
        assert_eq!(session.holders(), baseline + 1);

        context.release();
        assert!(!context.is_captured());
        assert_eq!(session.holders(), baseline);
    }

    #[test]
    fn test_capture_is_idempotent() {
        let session = SharedAudioSession::new();
        let mut context = SessionAudioContext::new(session.clone()).with_settle_delay(Duration::ZERO);
        let baseline = session.holders();

        assert!(context.capture());
        assert!(context.capture());
        assert_eq!(session.holders(), baseline + 1);
    }

    #[test]
    fn test_capture_without_session_fails() {
        let mut context = SessionAudioContext::new(NoSession);
        assert!(!context.capture());
        assert!(!context.is_captured());
    }

    #[test]
    fn test_release_without_capture_is_noop() {
        let mut context = SessionAudioContext::new(NoSession).with_settle_delay(Duration::from_secs(60));
        // Would block for a minute if the settle delay applied
        context.release();
        assert!(!context.is_captured());
    }
}
