//! Scripted collaborators for driving the controller in tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use talkback_voice::{
    AudioClip, AudioOutput, CaptureError, CaptureSink, ChannelRecognizer, ControllerEvent,
    ControllerHandle, ConversationController, ConversationState, DialogueClient, DialogueFailure,
    DialogueResult, Notice, SpeechRecognizer, TalkbackConfig, TranscriptFeed, Utterance,
    VoiceError, VoiceResult,
};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// "ID3" as base64; decodes to a few bytes, enough for outputs that don't parse audio.
pub const AUDIO: &str = "SUQz";

#[derive(Debug, Clone)]
pub enum Step {
    Reply {
        text: &'static str,
        language: &'static str,
        audio: Option<&'static str>,
    },
    Fail(DialogueFailure),
    /// Answer stamped with some other turn's id.
    Misrouted,
}

pub fn reply(text: &'static str, language: &'static str, audio: Option<&'static str>) -> Step {
    Step::Reply {
        text,
        language,
        audio,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub turn_id: u64,
    pub text: String,
    pub hint: Option<String>,
}

/// Dialogue client that answers from a script. When gated, each answer waits for
/// [`ScriptedDialogue::release`].
pub struct ScriptedDialogue {
    steps: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<Call>>,
    gate: Semaphore,
}

impl ScriptedDialogue {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            calls: Mutex::new(Vec::new()),
            gate: Semaphore::new(Semaphore::MAX_PERMITS),
        })
    }

    pub fn gated(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            calls: Mutex::new(Vec::new()),
            gate: Semaphore::new(0),
        })
    }

    pub fn release(&self) {
        self.gate.add_permits(1);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl DialogueClient for ScriptedDialogue {
    async fn send(
        &self,
        utterance: &Utterance,
        language_hint: Option<&str>,
    ) -> Result<DialogueResult, DialogueFailure> {
        self.calls.lock().unwrap().push(Call {
            turn_id: utterance.turn_id,
            text: utterance.text.clone(),
            hint: language_hint.map(str::to_string),
        });

        if let Ok(permit) = self.gate.acquire().await {
            permit.forget();
        }

        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| reply("ok", "", None));
        match step {
            Step::Reply {
                text,
                language,
                audio,
            } => Ok(DialogueResult {
                reply_text: text.to_string(),
                language: language.to_string(),
                audio_payload: audio.map(str::to_string),
                turn_id: utterance.turn_id,
            }),
            Step::Fail(failure) => Err(failure),
            Step::Misrouted => Ok(DialogueResult {
                reply_text: "meant for someone else".to_string(),
                language: "en".to_string(),
                audio_payload: None,
                turn_id: utterance.turn_id + 100,
            }),
        }
    }
}

/// Output whose clips end only when released (or immediately when ungated).
pub struct FakeOutput {
    gate: Semaphore,
    failure: Option<String>,
    pub renders: AtomicUsize,
    pub halts: AtomicUsize,
}

impl FakeOutput {
    pub fn instant() -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(Semaphore::MAX_PERMITS),
            failure: None,
            renders: AtomicUsize::new(0),
            halts: AtomicUsize::new(0),
        })
    }

    pub fn gated() -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
            failure: None,
            renders: AtomicUsize::new(0),
            halts: AtomicUsize::new(0),
        })
    }

    pub fn failing(reason: &str) -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(Semaphore::MAX_PERMITS),
            failure: Some(reason.to_string()),
            renders: AtomicUsize::new(0),
            halts: AtomicUsize::new(0),
        })
    }

    pub fn release(&self) {
        self.gate.add_permits(1);
    }

    pub fn renders(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }

    pub fn halts(&self) -> usize {
        self.halts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioOutput for FakeOutput {
    async fn render(&self, _clip: AudioClip) -> VoiceResult<()> {
        self.renders.fetch_add(1, Ordering::SeqCst);
        if let Ok(permit) = self.gate.acquire().await {
            permit.forget();
        }
        match &self.failure {
            Some(reason) => Err(VoiceError::Playback(reason.clone())),
            None => Ok(()),
        }
    }

    fn halt(&self) {
        self.halts.fetch_add(1, Ordering::SeqCst);
    }
}

/// Recognizer whose engine refuses to open while `refusals` is above zero; every
/// refusal uses one up. Each `begin` call is timestamped.
pub struct FlakyRecognizer {
    inner: ChannelRecognizer,
    pub refusals: Arc<AtomicUsize>,
    pub attempts: Arc<Mutex<Vec<Instant>>>,
}

impl FlakyRecognizer {
    pub fn new() -> (Self, TranscriptFeed) {
        let (inner, feed) = ChannelRecognizer::new();
        let flaky = Self {
            inner,
            refusals: Arc::new(AtomicUsize::new(0)),
            attempts: Arc::new(Mutex::new(Vec::new())),
        };
        (flaky, feed)
    }
}

impl SpeechRecognizer for FlakyRecognizer {
    fn begin(&mut self, locale: &str, sink: CaptureSink) -> Result<(), CaptureError> {
        self.attempts.lock().unwrap().push(Instant::now());
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(CaptureError::Unavailable(
                "recognition service busy".to_string(),
            ));
        }
        self.inner.begin(locale, sink)
    }

    fn end(&mut self) {
        self.inner.end();
    }
}

pub struct Harness {
    pub handle: ControllerHandle,
    pub feed: TranscriptFeed,
    pub events: mpsc::UnboundedReceiver<ControllerEvent>,
    pub task: JoinHandle<()>,
    pub dialogue: Arc<ScriptedDialogue>,
    pub output: Arc<FakeOutput>,
}

pub fn harness(
    config: TalkbackConfig,
    dialogue: Arc<ScriptedDialogue>,
    output: Arc<FakeOutput>,
) -> Harness {
    let (recognizer, feed) = ChannelRecognizer::new();
    harness_with(config, Box::new(recognizer), feed, dialogue, output)
}

/// Like [`harness`], with a caller-supplied recognizer driven by `feed`.
pub fn harness_with(
    config: TalkbackConfig,
    recognizer: Box<dyn SpeechRecognizer>,
    feed: TranscriptFeed,
    dialogue: Arc<ScriptedDialogue>,
    output: Arc<FakeOutput>,
) -> Harness {
    let (mut controller, handle) = ConversationController::new(
        config,
        recognizer,
        dialogue.clone(),
        output.clone(),
    )
    .expect("valid config");
    let events = controller.take_event_receiver().expect("event receiver");
    let task = controller.spawn();
    Harness {
        handle,
        feed,
        events,
        task,
        dialogue,
        output,
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

const WAIT: Duration = Duration::from_secs(30);

impl Harness {
    /// Wait until the published snapshot reaches `state`.
    pub async fn wait_state(&self, state: ConversationState) {
        let mut rx = self.handle.subscribe();
        tokio::time::timeout(WAIT, rx.wait_for(|s| s.state == state))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {:?}", state))
            .expect("controller dropped");
    }

    /// Wait until at least `n` capture sessions have been opened.
    pub async fn wait_sessions(&self, n: u64) {
        let mut rx = self.feed.sessions();
        tokio::time::timeout(WAIT, rx.wait_for(|count| *count >= n))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for capture session {}", n))
            .expect("recognizer dropped");
    }

    pub fn sessions(&self) -> u64 {
        *self.feed.sessions().borrow()
    }

    /// Start the session and wait for the microphone to open.
    pub async fn start_listening(&self) {
        assert!(self.handle.start());
        self.wait_state(ConversationState::Listening).await;
        self.wait_sessions(1).await;
    }

    /// Next notice, skipping other events.
    pub async fn next_notice(&mut self) -> Notice {
        loop {
            let event = tokio::time::timeout(WAIT, self.events.recv())
                .await
                .expect("timed out waiting for a notice")
                .expect("event channel closed");
            if let ControllerEvent::Notice(notice) = event {
                return notice;
            }
        }
    }

    /// Everything emitted so far.
    pub fn drain(&mut self) -> Vec<ControllerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    /// Close, wait for the loop to exit, and return what it emitted.
    pub async fn shutdown(mut self) -> Vec<ControllerEvent> {
        self.handle.close();
        tokio::time::timeout(WAIT, &mut self.task)
            .await
            .expect("controller did not stop")
            .expect("controller panicked");
        self.drain()
    }
}

/// Target states of every `StateChanged`, in order.
pub fn transitions(events: &[ControllerEvent]) -> Vec<ConversationState> {
    events
        .iter()
        .filter_map(|e| match e {
            ControllerEvent::StateChanged { to, .. } => Some(*to),
            _ => None,
        })
        .collect()
}

pub fn notices(events: &[ControllerEvent]) -> Vec<Notice> {
    events
        .iter()
        .filter_map(|e| match e {
            ControllerEvent::Notice(n) => Some(n.clone()),
            _ => None,
        })
        .collect()
}

pub fn replies(events: &[ControllerEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            ControllerEvent::Reply { text, .. } => Some(text.clone()),
            _ => None,
        })
        .collect()
}
