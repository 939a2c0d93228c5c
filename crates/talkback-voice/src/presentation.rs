//! Read-only view of a conversation for the UI: snapshot, recording clock, status text.

use crate::controller::ConversationState;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// What the UI renders. Published on every state change and every clock tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub state: ConversationState,
    /// Partial transcript of the current turn.
    pub transcript_preview: String,
    pub detected_language: String,
    pub elapsed_seconds: u64,
}

impl Snapshot {
    pub fn initial(fallback_language: &str) -> Self {
        Self {
            state: ConversationState::Idle,
            transcript_preview: String::new(),
            detected_language: fallback_language.to_string(),
            elapsed_seconds: 0,
        }
    }

    pub fn status_label(&self) -> &'static str {
        status_label(self.state, &self.detected_language)
    }

    pub fn elapsed_label(&self) -> String {
        format_elapsed(self.elapsed_seconds)
    }
}

/// Recording-duration clock. Runs while the session is live, holds while paused.
#[derive(Debug, Clone, Default)]
pub struct SessionTimer {
    accumulated: Duration,
    running_since: Option<Instant>,
}

impl SessionTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, now: Instant) {
        if self.running_since.is_none() {
            self.running_since = Some(now);
        }
    }

    pub fn pause(&mut self, now: Instant) {
        if let Some(since) = self.running_since.take() {
            self.accumulated += now.saturating_duration_since(since);
        }
    }

    pub fn reset(&mut self) {
        self.accumulated = Duration::ZERO;
        self.running_since = None;
    }

    pub fn is_running(&self) -> bool {
        self.running_since.is_some()
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        let running = self
            .running_since
            .map(|since| now.saturating_duration_since(since))
            .unwrap_or_default();
        self.accumulated + running
    }

    pub fn elapsed_seconds(&self, now: Instant) -> u64 {
        self.elapsed(now).as_secs()
    }
}

/// `mm:ss`, minutes unbounded.
pub fn format_elapsed(seconds: u64) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

/// Status line for a state, in Vietnamese or English. Unknown languages get Vietnamese.
pub fn status_label(state: ConversationState, language: &str) -> &'static str {
    let english = language.trim().to_ascii_lowercase().starts_with("en");
    match (state, english) {
        (ConversationState::Idle, false) => "Nhấn để nói",
        (ConversationState::Idle, true) => "Tap to speak",
        (ConversationState::Listening, false) => "Đang ghi âm",
        (ConversationState::Listening, true) => "Recording",
        (ConversationState::Processing, false) => "Đang xử lý",
        (ConversationState::Processing, true) => "Thinking",
        (ConversationState::Speaking, false) => "Đang trả lời",
        (ConversationState::Speaking, true) => "Speaking",
        (ConversationState::Paused, false) => "Đã tạm dừng",
        (ConversationState::Paused, true) => "Paused",
        (ConversationState::Closed, false) => "Đã đóng",
        (ConversationState::Closed, true) => "Closed",
    }
}
