//! **ConversationController**: the hands-free turn-taking loop.
//!
//! ```text
//!   Idle ──start──▶ Listening ──final──▶ Processing ──reply+audio──▶ Speaking
//!                    ▲  │  ▲                 │                          │
//!                    │  │  └──reply w/o audio, failure after retries ───┤
//!                    │  │                                               │
//!                    │  └──ended──▶ (restart, backoff on errors)        │
//!                    └──────────────── playback end / error ────────────┘
//!   Listening ◀──resume── Paused ◀──pause── Listening
//!   any ──close──▶ Closed
//! ```
//!
//! The controller runs as a single task. Intents, capture events, dialogue and
//! playback completions, the restart deadline and the clock tick are handled one at
//! a time, each to completion. Async work carries the turn id (dialogue) or the
//! capture/playback generation it was started for; anything that arrives for an
//! older turn or generation is dropped without touching state.

use crate::capture::{CaptureEvent, CaptureSession, EndReason, SpeechRecognizer, TaggedCapture};
use crate::config::TalkbackConfig;
use crate::dialogue::{DialogueClient, DialogueResult, Utterance};
use crate::error::{CaptureError, DialogueFailure, VoiceError, VoiceResult};
use crate::language::{is_exit_phrase, locale_for, normalize_language};
use crate::playback::{AudioOutput, PlaybackOutcome, PlaybackSession};
use crate::policy::{should_retry, RestartBackoff};
use crate::presentation::{SessionTimer, Snapshot};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

/// Where the conversation is. Exactly one holds at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    /// Panel open, not started.
    Idle,
    /// Capture active (or about to restart), waiting for speech.
    Listening,
    /// Utterance sent, waiting for the assistant.
    Processing,
    /// Reply audio playing.
    Speaking,
    /// User paused; no device held.
    Paused,
    /// Terminal; everything released.
    Closed,
}

/// What the UI may ask for. The UI never sets state directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Start,
    Pause,
    Resume,
    Close,
}

/// Transient, user-visible notifications. None of them end the session on their own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Capture could not be opened (permission denied or engine unavailable).
    Capture(CaptureError),
    /// Capture keeps dropping out; surfaced once per failure streak.
    CaptureUnstable { failures: u32 },
    /// The assistant could not answer this turn.
    Dialogue(DialogueFailure),
    /// The reply could not be played; the text was still delivered.
    Playback(String),
    /// The user said an exit phrase.
    Farewell,
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::Capture(err) => write!(f, "{}", err),
            Notice::CaptureUnstable { failures } => write!(
                f,
                "Speech recognition keeps disconnecting ({} times in a row), still trying",
                failures
            ),
            Notice::Dialogue(failure) => write!(f, "The assistant did not answer: {}", failure),
            Notice::Playback(reason) => write!(f, "Could not play the spoken reply: {}", reason),
            Notice::Farewell => write!(f, "Goodbye"),
        }
    }
}

/// Everything the controller reports besides snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    StateChanged {
        from: ConversationState,
        to: ConversationState,
    },
    Reply {
        turn_id: u64,
        text: String,
        language: String,
    },
    Notice(Notice),
}

#[derive(Debug)]
struct DialogueCompletion {
    turn_id: u64,
    result: Result<DialogueResult, DialogueFailure>,
}

struct InFlight {
    utterance: Utterance,
    retries_used: u32,
    task: JoinHandle<()>,
}

/// UI-side handle: issue intents and mirror snapshots.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    intents: mpsc::UnboundedSender<Intent>,
    snapshots: watch::Receiver<Snapshot>,
}

impl ControllerHandle {
    /// Send an intent. False once the controller has shut down.
    pub fn send(&self, intent: Intent) -> bool {
        self.intents.send(intent).is_ok()
    }

    pub fn start(&self) -> bool {
        self.send(Intent::Start)
    }

    pub fn pause(&self) -> bool {
        self.send(Intent::Pause)
    }

    pub fn resume(&self) -> bool {
        self.send(Intent::Resume)
    }

    pub fn close(&self) -> bool {
        self.send(Intent::Close)
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.clone()
    }

    pub fn snapshot_stream(&self) -> WatchStream<Snapshot> {
        WatchStream::new(self.snapshots.clone())
    }
}

/// One live conversation panel. Create with [`ConversationController::new`], then
/// drive it with [`ConversationController::run`] (or [`ConversationController::spawn`]).
pub struct ConversationController {
    config: TalkbackConfig,
    state: ConversationState,
    transcript: String,
    detected_language: String,
    turn_id: u64,
    cancelled: bool,

    capture: CaptureSession,
    playback: PlaybackSession,
    dialogue: Arc<dyn DialogueClient>,
    in_flight: Option<InFlight>,

    backoff: RestartBackoff,
    restart_at: Option<Instant>,
    timer: SessionTimer,

    intents: mpsc::UnboundedReceiver<Intent>,
    capture_rx: mpsc::UnboundedReceiver<TaggedCapture>,
    dialogue_tx: mpsc::UnboundedSender<DialogueCompletion>,
    dialogue_rx: mpsc::UnboundedReceiver<DialogueCompletion>,
    playback_rx: mpsc::UnboundedReceiver<PlaybackOutcome>,

    snapshot_tx: watch::Sender<Snapshot>,
    events_tx: mpsc::UnboundedSender<ControllerEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<ControllerEvent>>,
}

impl ConversationController {
    pub fn new(
        config: TalkbackConfig,
        recognizer: Box<dyn SpeechRecognizer>,
        dialogue: Arc<dyn DialogueClient>,
        output: Arc<dyn AudioOutput>,
    ) -> VoiceResult<(Self, ControllerHandle)> {
        config.validate()?;

        let (intent_tx, intents) = mpsc::unbounded_channel();
        let (capture_tx, capture_rx) = mpsc::unbounded_channel();
        let (dialogue_tx, dialogue_rx) = mpsc::unbounded_channel();
        let (playback_tx, playback_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let detected_language = normalize_language(&config.fallback_language)
            .ok_or_else(|| VoiceError::Config("fallback_language must not be empty".to_string()))?;
        let (snapshot_tx, snapshots) = watch::channel(Snapshot::initial(&detected_language));

        let controller = Self {
            backoff: RestartBackoff::new(&config.controller),
            config,
            state: ConversationState::Idle,
            transcript: String::new(),
            detected_language,
            turn_id: 0,
            cancelled: false,
            capture: CaptureSession::new(recognizer, capture_tx),
            playback: PlaybackSession::new(output, playback_tx),
            dialogue,
            in_flight: None,
            restart_at: None,
            timer: SessionTimer::new(),
            intents,
            capture_rx,
            dialogue_tx,
            dialogue_rx,
            playback_rx,
            snapshot_tx,
            events_tx,
            events_rx: Some(events_rx),
        };

        let handle = ControllerHandle {
            intents: intent_tx,
            snapshots,
        };

        Ok((controller, handle))
    }

    /// Receiver for replies, notices and state changes. Available once, and only
    /// before the loop starts; events nobody took are not kept.
    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<ControllerEvent>> {
        self.events_rx.take()
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn turn_id(&self) -> u64 {
        self.turn_id
    }

    /// Run on the current runtime until the session closes.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Event loop. Returns once the session is `Closed`; dropping the controller
    /// afterwards releases whatever the platform still holds.
    pub async fn run(mut self) {
        self.release_unclaimed_events();
        let mut ticker = tokio::time::interval(self.config.controller.timer_tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("🎭 conversation panel open");

        while self.state != ConversationState::Closed {
            let restart_at = self.restart_at;
            let clock_running = self.timer.is_running();

            tokio::select! {
                intent = self.intents.recv() => match intent {
                    Some(intent) => self.handle_intent(intent),
                    None => {
                        debug!("all controller handles dropped");
                        self.close();
                    }
                },
                Some(tagged) = self.capture_rx.recv() => self.on_capture(tagged),
                Some(done) = self.dialogue_rx.recv() => self.on_dialogue(done),
                Some(outcome) = self.playback_rx.recv() => self.on_playback(outcome),
                _ = sleep_until(restart_at.unwrap_or_else(Instant::now)), if restart_at.is_some() => {
                    self.on_restart_due();
                }
                _ = ticker.tick(), if clock_running => self.publish(),
            }
        }

        info!("👋 conversation panel closed after {} turns", self.turn_id);
    }

    fn handle_intent(&mut self, intent: Intent) {
        debug!("intent {:?} in {:?}", intent, self.state);
        match intent {
            Intent::Start => self.on_start(),
            Intent::Pause => self.on_pause(),
            Intent::Resume => self.on_resume(),
            Intent::Close => self.close(),
        }
    }

    fn on_start(&mut self) {
        if self.state != ConversationState::Idle {
            return;
        }

        self.capture.set_locale(locale_for(&self.detected_language));
        match self.capture.start() {
            Ok(_) => {
                self.transcript.clear();
                self.timer.reset();
                self.timer.start(Instant::now());
                self.transition(ConversationState::Listening);
            }
            Err(err) => {
                // session stays Idle; the user can try again
                warn!("capture could not start: {}", err);
                self.notify(Notice::Capture(err));
                self.publish();
            }
        }
    }

    fn on_pause(&mut self) {
        if self.state != ConversationState::Listening {
            return;
        }
        self.capture.stop();
        self.restart_at = None;
        self.transcript.clear();
        self.timer.pause(Instant::now());
        self.transition(ConversationState::Paused);
    }

    fn on_resume(&mut self) {
        if self.state != ConversationState::Paused {
            return;
        }
        self.enter_listening();
    }

    /// Release everything and go terminal. Safe from any state, any number of times.
    fn close(&mut self) {
        if self.state == ConversationState::Closed {
            return;
        }
        self.cancelled = true;
        self.capture.stop();
        self.playback.stop();
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.task.abort();
        }
        self.restart_at = None;
        self.timer.pause(Instant::now());
        self.transition(ConversationState::Closed);
    }

    fn on_capture(&mut self, tagged: TaggedCapture) {
        if self.cancelled || !self.capture.accepts(tagged.generation) {
            debug!(
                "dropping capture event from session {} (current {})",
                tagged.generation,
                self.capture.generation()
            );
            return;
        }

        match tagged.event {
            CaptureEvent::Partial(text) => {
                self.backoff.on_transcript();
                self.transcript = text;
                self.publish();
            }
            CaptureEvent::Final(text) => {
                self.backoff.on_transcript();
                self.on_final(text);
            }
            CaptureEvent::Ended(reason) => {
                self.capture.mark_ended(tagged.generation);
                if self.state == ConversationState::Listening {
                    debug!("capture session {} ended: {:?}", tagged.generation, reason);
                    self.schedule_restart(reason);
                }
            }
        }
    }

    fn on_final(&mut self, text: String) {
        let text = text.trim().to_string();

        if is_exit_phrase(&text, &self.config.exit_phrases) {
            info!("exit phrase heard, closing");
            self.notify(Notice::Farewell);
            self.close();
            return;
        }

        if text.chars().count() < self.config.controller.min_utterance_chars {
            debug!("discarding short utterance {:?}", text);
            self.transcript.clear();
            self.publish();
            return;
        }

        // mic goes first; never hold it across the round trip
        self.capture.stop();
        self.restart_at = None;
        self.turn_id += 1;
        self.transcript = text.clone();

        let utterance = Utterance::new(text, self.turn_id);
        info!("🎯 turn {} committed ({} chars)", self.turn_id, utterance.text.chars().count());
        self.transition(ConversationState::Processing);
        self.dispatch(utterance, 0);
    }

    fn dispatch(&mut self, utterance: Utterance, retries_used: u32) {
        let client = Arc::clone(&self.dialogue);
        let tx = self.dialogue_tx.clone();
        let hint = self.detected_language.clone();
        let request = utterance.clone();

        let task = tokio::spawn(async move {
            let result = client.send(&request, Some(hint.as_str())).await;
            let _ = tx.send(DialogueCompletion {
                turn_id: request.turn_id,
                result,
            });
        });

        self.in_flight = Some(InFlight {
            utterance,
            retries_used,
            task,
        });
    }

    fn on_dialogue(&mut self, done: DialogueCompletion) {
        if self.cancelled
            || done.turn_id != self.turn_id
            || self.state != ConversationState::Processing
        {
            debug!("dropping dialogue result for turn {} (current {})", done.turn_id, self.turn_id);
            return;
        }
        let Some(in_flight) = self.in_flight.take() else {
            return;
        };

        let result = match done.result {
            Ok(result) if result.turn_id != done.turn_id => {
                warn!(
                    "dialogue client answered turn {} with a result for turn {}",
                    done.turn_id, result.turn_id
                );
                Err(DialogueFailure::Server {
                    status: 0,
                    message: "reply did not match the request".to_string(),
                })
            }
            other => other,
        };

        match result {
            Ok(reply) => self.on_reply(reply),
            Err(failure) => {
                let limit = self.config.controller.dialogue_retry_limit;
                if should_retry(&failure, in_flight.retries_used, limit) {
                    warn!("turn {}: {}, retrying", self.turn_id, failure);
                    self.dispatch(in_flight.utterance, in_flight.retries_used + 1);
                    return;
                }
                warn!("turn {}: giving up: {}", self.turn_id, failure);
                self.notify(Notice::Dialogue(failure));
                self.enter_listening();
            }
        }
    }

    fn on_reply(&mut self, reply: DialogueResult) {
        if let Some(language) = normalize_language(&reply.language) {
            self.detected_language = language;
        }
        let _ = self.events_tx.send(ControllerEvent::Reply {
            turn_id: reply.turn_id,
            text: reply.reply_text,
            language: self.detected_language.clone(),
        });

        match reply.audio_payload {
            Some(payload) => match self.playback.play(&payload) {
                Ok(_) => self.transition(ConversationState::Speaking),
                Err(err) => {
                    warn!("turn {}: reply audio unusable: {}", self.turn_id, err);
                    self.notify(Notice::Playback(err.to_string()));
                    self.enter_listening();
                }
            },
            None => self.enter_listening(),
        }
    }

    fn on_playback(&mut self, outcome: PlaybackOutcome) {
        if self.cancelled
            || self.state != ConversationState::Speaking
            || !self.playback.finish(outcome.generation)
        {
            debug!("dropping playback completion for clip {}", outcome.generation);
            return;
        }
        if let Err(err) = outcome.result {
            warn!("playback failed: {}", err);
            self.notify(Notice::Playback(err.to_string()));
        }
        self.enter_listening();
    }

    fn on_restart_due(&mut self) {
        self.restart_at = None;
        if self.state == ConversationState::Listening && !self.capture.is_active() {
            self.open_capture();
            self.publish();
        }
    }

    /// Start the next turn: fresh transcript, capture open, clock running.
    fn enter_listening(&mut self) {
        self.transcript.clear();
        if self.open_capture() {
            self.timer.start(Instant::now());
            self.transition(ConversationState::Listening);
        }
    }

    /// Open capture for Listening. False when the microphone is gone and the
    /// session was paused instead.
    fn open_capture(&mut self) -> bool {
        self.restart_at = None;
        self.capture.set_locale(locale_for(&self.detected_language));
        match self.capture.start() {
            Ok(_) => true,
            Err(CaptureError::PermissionDenied(reason)) => {
                warn!("microphone lost mid-session: {}", reason);
                self.timer.pause(Instant::now());
                self.notify(Notice::Capture(CaptureError::PermissionDenied(reason)));
                self.transition(ConversationState::Paused);
                false
            }
            Err(err) => {
                // engine refused to open; always go through the timer so a
                // refusing engine cannot spin us
                warn!("capture restart failed: {}", err);
                let delay = self
                    .restart_delay(EndReason::TransportError)
                    .max(self.config.controller.backoff_step());
                self.restart_at = Some(Instant::now() + delay);
                true
            }
        }
    }

    fn schedule_restart(&mut self, reason: EndReason) {
        let delay = self.restart_delay(reason);
        if delay.is_zero() {
            self.open_capture();
        } else {
            debug!("restarting capture in {:?}", delay);
            self.restart_at = Some(Instant::now() + delay);
        }
    }

    fn restart_delay(&mut self, reason: EndReason) -> Duration {
        let decision = self.backoff.on_ended(reason, Instant::now());
        if decision.notify {
            self.notify(Notice::CaptureUnstable {
                failures: self.backoff.streak(),
            });
        }
        decision.delay
    }

    fn transition(&mut self, to: ConversationState) {
        let from = self.state;
        if from == to {
            self.publish();
            return;
        }
        self.state = to;
        info!("state {:?} -> {:?}", from, to);
        let _ = self.events_tx.send(ControllerEvent::StateChanged { from, to });
        self.publish();
    }

    fn release_unclaimed_events(&mut self) {
        if self.events_rx.take().is_some() {
            debug!("event receiver never taken, events will be dropped");
        }
    }

    fn notify(&self, notice: Notice) {
        info!("notice: {}", notice);
        let _ = self.events_tx.send(ControllerEvent::Notice(notice));
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(Snapshot {
            state: self.state,
            transcript_preview: self.transcript.clone(),
            detected_language: self.detected_language.clone(),
            elapsed_seconds: self.timer.elapsed_seconds(Instant::now()),
        });
    }
}
