//! **CaptureSession**: speech-to-text capture with a single-session guard.
//!
//! Platform recognizers implement [`SpeechRecognizer`] and push transcript events
//! through a [`CaptureSink`]. Every native session gets a fresh generation number;
//! events from a generation that is no longer active are dropped by the controller,
//! so a late `ended` from a stopped session can never trigger a second restart.

use crate::error::CaptureError;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Why a native capture session finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// `stop()` was called on our side.
    StoppedByCaller,
    /// The engine closed the session after its own silence/duration limit.
    NaturalTimeout,
    /// Network or engine failure (e.g. recognizer service unreachable).
    TransportError,
}

/// Events a recognizer produces while a session is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// Interim hypothesis; display only.
    Partial(String),
    /// Finalized phrase.
    Final(String),
    /// Session is over. Fires on natural completion and on transport error.
    Ended(EndReason),
}

/// A capture event stamped with the session generation that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedCapture {
    pub generation: u64,
    pub event: CaptureEvent,
}

/// Where a recognizer sends its events. Cheap to clone; each clone is bound to
/// the generation of the session it was handed out for.
#[derive(Debug, Clone)]
pub struct CaptureSink {
    generation: u64,
    tx: mpsc::UnboundedSender<TaggedCapture>,
}

impl CaptureSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<TaggedCapture>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the owning controller is gone.
    pub fn partial(&self, text: impl Into<String>) -> bool {
        self.emit(CaptureEvent::Partial(text.into()))
    }

    pub fn finalize(&self, text: impl Into<String>) -> bool {
        self.emit(CaptureEvent::Final(text.into()))
    }

    pub fn ended(&self, reason: EndReason) -> bool {
        self.emit(CaptureEvent::Ended(reason))
    }

    fn emit(&self, event: CaptureEvent) -> bool {
        self.tx
            .send(TaggedCapture {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// Platform speech recognition capability (browser engine bridge, local Whisper, ...).
pub trait SpeechRecognizer: Send {
    /// Open one native session in `locale` (e.g. "vi-VN"). Events go to `sink`.
    fn begin(&mut self, locale: &str, sink: CaptureSink) -> Result<(), CaptureError>;

    /// Close the native session and release the microphone. Must tolerate being
    /// called when no session is open.
    fn end(&mut self);
}

/// Owns the recognizer and guarantees at most one native session at a time.
pub struct CaptureSession {
    recognizer: Box<dyn SpeechRecognizer>,
    events: mpsc::UnboundedSender<TaggedCapture>,
    generation: u64,
    active: bool,
    locale: String,
}

impl CaptureSession {
    pub fn new(
        recognizer: Box<dyn SpeechRecognizer>,
        events: mpsc::UnboundedSender<TaggedCapture>,
    ) -> Self {
        Self {
            recognizer,
            events,
            generation: 0,
            active: false,
            locale: "vi-VN".to_string(),
        }
    }

    /// Locale for the next `start()`; an open session keeps its locale.
    pub fn set_locale(&mut self, locale: &str) {
        self.locale = locale.to_string();
    }

    pub fn locale(&self) -> &str {
        &self.locale
    }

    /// Open a native session. Returns `Ok(false)` without touching the recognizer
    /// when one is already active.
    pub fn start(&mut self) -> Result<bool, CaptureError> {
        if self.active {
            debug!("capture: start ignored, session {} already active", self.generation);
            return Ok(false);
        }

        self.generation += 1;
        let sink = CaptureSink::new(self.generation, self.events.clone());
        self.recognizer.begin(&self.locale, sink)?;
        self.active = true;

        info!("🎤 capture: session {} started ({})", self.generation, self.locale);
        Ok(true)
    }

    /// Close the active session. Idempotent.
    pub fn stop(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.recognizer.end();
        debug!("capture: session {} stopped", self.generation);
    }

    /// Whether an event stamped with `generation` belongs to the open session.
    pub fn accepts(&self, generation: u64) -> bool {
        self.active && generation == self.generation
    }

    /// The recognizer reported `ended` for the open session: release it.
    /// Returns false when the event was stale.
    pub fn mark_ended(&mut self, generation: u64) -> bool {
        if !self.accepts(generation) {
            return false;
        }
        self.active = false;
        self.recognizer.end();
        true
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug)]
struct FeedState {
    sink: Option<CaptureSink>,
    locale: Option<String>,
    permission_denied: bool,
}

/// Producer side of a [`ChannelRecognizer`]: whatever actually hears the user
/// (a UI bridge, a terminal) pushes transcripts here.
#[derive(Debug, Clone)]
pub struct TranscriptFeed {
    state: Arc<Mutex<FeedState>>,
    sessions: Arc<watch::Sender<u64>>,
}

impl TranscriptFeed {
    fn lock(&self) -> std::sync::MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Interim text for the open session. False when nobody is listening.
    pub fn partial(&self, text: impl Into<String>) -> bool {
        match self.lock().sink.as_ref() {
            Some(sink) => sink.partial(text),
            None => false,
        }
    }

    /// Final text for the open session. False when nobody is listening
    /// (e.g. the assistant is answering and the mic is closed).
    pub fn finalize(&self, text: impl Into<String>) -> bool {
        match self.lock().sink.as_ref() {
            Some(sink) => sink.finalize(text),
            None => false,
        }
    }

    /// Simulate the engine dropping the session on its own.
    pub fn interrupt(&self, reason: EndReason) -> bool {
        match self.lock().sink.take() {
            Some(sink) => sink.ended(reason),
            None => false,
        }
    }

    /// Make subsequent sessions fail with `PermissionDenied`.
    pub fn deny_permission(&self, denied: bool) {
        self.lock().permission_denied = denied;
    }

    pub fn is_listening(&self) -> bool {
        self.lock().sink.is_some()
    }

    /// Locale of the most recent session.
    pub fn locale(&self) -> Option<String> {
        self.lock().locale.clone()
    }

    /// Count of sessions opened so far; changes every time a session opens.
    pub fn sessions(&self) -> watch::Receiver<u64> {
        self.sessions.subscribe()
    }
}

/// Recognizer driven by a [`TranscriptFeed`] instead of a native engine.
#[derive(Debug)]
pub struct ChannelRecognizer {
    feed: TranscriptFeed,
}

impl ChannelRecognizer {
    pub fn new() -> (Self, TranscriptFeed) {
        let (sessions, _) = watch::channel(0u64);
        let feed = TranscriptFeed {
            state: Arc::new(Mutex::new(FeedState {
                sink: None,
                locale: None,
                permission_denied: false,
            })),
            sessions: Arc::new(sessions),
        };
        (Self { feed: feed.clone() }, feed)
    }
}

impl SpeechRecognizer for ChannelRecognizer {
    fn begin(&mut self, locale: &str, sink: CaptureSink) -> Result<(), CaptureError> {
        {
            let mut state = self.feed.lock();
            if state.permission_denied {
                warn!("capture: microphone permission denied");
                return Err(CaptureError::PermissionDenied(
                    "microphone access is not available".to_string(),
                ));
            }
            if state.sink.is_some() {
                return Err(CaptureError::Unavailable(
                    "a recognition session is already open".to_string(),
                ));
            }
            state.sink = Some(sink);
            state.locale = Some(locale.to_string());
        }
        self.feed.sessions.send_modify(|n| *n += 1);
        Ok(())
    }

    fn end(&mut self) {
        if let Some(sink) = self.feed.lock().sink.take() {
            sink.ended(EndReason::StoppedByCaller);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> (
        CaptureSession,
        TranscriptFeed,
        mpsc::UnboundedReceiver<TaggedCapture>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (recognizer, feed) = ChannelRecognizer::new();
        (CaptureSession::new(Box::new(recognizer), tx), feed, rx)
    }

    #[test]
    fn start_twice_opens_one_native_session() {
        let (mut capture, feed, _rx) = session();
        assert!(capture.start().unwrap());
        assert!(!capture.start().unwrap());
        assert_eq!(*feed.sessions().borrow(), 1);
        assert_eq!(capture.generation(), 1);
    }

    #[test]
    fn stop_is_idempotent_and_stale_events_are_rejected() {
        let (mut capture, feed, mut rx) = session();
        capture.start().unwrap();
        capture.stop();
        capture.stop();
        assert!(!feed.is_listening());

        // the recognizer reports its own ending after stop
        let ended = rx.try_recv().unwrap();
        assert_eq!(ended.event, CaptureEvent::Ended(EndReason::StoppedByCaller));
        assert!(!capture.accepts(ended.generation));
    }

    #[test]
    fn permission_denied_leaves_session_inactive() {
        let (mut capture, feed, _rx) = session();
        feed.deny_permission(true);
        let err = capture.start().unwrap_err();
        assert!(matches!(err, CaptureError::PermissionDenied(_)));
        assert!(!capture.is_active());
    }

    #[test]
    fn events_carry_generation_and_locale_is_applied() {
        let (mut capture, feed, mut rx) = session();
        capture.set_locale("en-US");
        capture.start().unwrap();
        assert_eq!(feed.locale().as_deref(), Some("en-US"));

        assert!(feed.partial("xin"));
        assert!(feed.finalize("xin chào"));
        let first = rx.try_recv().unwrap();
        assert_eq!(first.generation, 1);
        assert_eq!(first.event, CaptureEvent::Partial("xin".into()));
        assert!(capture.accepts(first.generation));
    }

    #[test]
    fn mark_ended_releases_only_current_generation() {
        let (mut capture, feed, _rx) = session();
        capture.start().unwrap();
        assert!(!capture.mark_ended(7));
        assert!(feed.interrupt(EndReason::NaturalTimeout));
        assert!(capture.mark_ended(1));
        assert!(!capture.is_active());
        assert!(!capture.mark_ended(1));
    }

    #[test]
    fn feed_without_session_drops_text() {
        let (_capture, feed, _rx) = session();
        assert!(!feed.finalize("hello"));
        assert!(!feed.interrupt(EndReason::TransportError));
    }
}
