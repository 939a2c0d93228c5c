//! # Talkback Voice - hands-free spoken dialogue
//!
//! Turns push-to-talk speech capture into a continuous, turn-taking conversation
//! with a remote assistant. Three unreliable asynchronous sources (speech capture,
//! the dialogue round trip, reply playback) are folded into one state machine that
//! recovers on its own when any of them fails.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                  ConversationController                       │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐        │
//! │  │CaptureSession│→ │DialogueClient│→ │PlaybackSession│       │
//! │  │ (recognizer) │  │ (HTTP / any) │  │ (rodio / any) │       │
//! │  └──────────────┘  └──────────────┘  └──────────────┘        │
//! │         ↑              restart / backoff         │            │
//! │         └────────────────────────────────────────┘            │
//! │            Snapshot (watch) + ControllerEvent (mpsc) → UI     │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod capture;
pub mod config;
pub mod controller;
pub mod dialogue;
pub mod error;
pub mod language;
pub mod playback;
pub mod policy;
pub mod presentation;

pub use capture::{
    CaptureEvent, CaptureSession, CaptureSink, ChannelRecognizer, EndReason, SpeechRecognizer,
    TaggedCapture, TranscriptFeed,
};
pub use config::{ControllerPolicy, DialogueConfig, TalkbackConfig};
pub use controller::{
    ControllerEvent, ControllerHandle, ConversationController, ConversationState, Intent, Notice,
};
pub use dialogue::{DialogueClient, DialogueResult, HttpDialogueClient, Utterance};
pub use error::{CaptureError, DialogueFailure, VoiceError, VoiceResult};
pub use language::{is_exit_phrase, locale_for};
pub use playback::{AudioClip, AudioOutput, PlaybackOutcome, PlaybackSession, SilentOutput};
#[cfg(feature = "rodio")]
pub use playback::RodioOutput;
pub use policy::{RestartBackoff, RestartDecision};
pub use presentation::{format_elapsed, status_label, SessionTimer, Snapshot};
