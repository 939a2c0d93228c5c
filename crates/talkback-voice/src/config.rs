//! Talkback configuration: controller policy constants and dialogue endpoint settings.
//!
//! Loaded in layers: built-in defaults, an optional file named by `TALKBACK_CONFIG`
//! (default `config/talkback`), then `TALKBACK__*` environment variables.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | TALKBACK__DIALOGUE__BASE_URL | http://localhost:5000 | Assistant API root. |
//! | TALKBACK__DIALOGUE__AUTH_TOKEN | unset | Bearer token; switches to the authenticated endpoint. |
//! | TALKBACK__DIALOGUE__TIMEOUT_SECS | 30 | Per-request timeout. |
//! | TALKBACK__CONTROLLER__MIN_UTTERANCE_CHARS | 2 | Shorter finals are treated as noise. |
//! | TALKBACK__CONTROLLER__RESTART_BACKOFF_STEP_MS | 500 | Backoff growth per consecutive capture error. |
//! | TALKBACK__FALLBACK_LANGUAGE | vi | Language used until the server detects one. |

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

fn default_fallback_language() -> String {
    "vi".to_string()
}

fn default_exit_phrases() -> Vec<String> {
    ["bye", "goodbye", "tạm biệt", "chào tạm biệt", "kết thúc"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Top-level configuration for one voice conversation panel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TalkbackConfig {
    pub controller: ControllerPolicy,
    pub dialogue: DialogueConfig,
    /// Language assumed before the assistant reports one ("vi" or "en").
    pub fallback_language: String,
    /// Utterances equal to one of these (after normalization) close the session.
    pub exit_phrases: Vec<String>,
}

impl Default for TalkbackConfig {
    fn default() -> Self {
        Self {
            controller: ControllerPolicy::default(),
            dialogue: DialogueConfig::default(),
            fallback_language: default_fallback_language(),
            exit_phrases: default_exit_phrases(),
        }
    }
}

impl TalkbackConfig {
    /// Load defaults, then the optional config file, then `TALKBACK__*` env overrides.
    pub fn load() -> VoiceResult<Self> {
        let config_path =
            std::env::var("TALKBACK_CONFIG").unwrap_or_else(|_| "config/talkback".to_string());
        Self::load_from(&config_path)
    }

    /// Same as [`TalkbackConfig::load`] with an explicit file path (extension optional).
    pub fn load_from(config_path: &str) -> VoiceResult<Self> {
        let builder = config::Config::builder();

        let path = Path::new(config_path);
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder.add_source(config::File::with_name(config_path).required(false))
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix("TALKBACK")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: Self = built.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the controller cannot run with.
    pub fn validate(&self) -> VoiceResult<()> {
        if self.dialogue.base_url.trim().is_empty() {
            return Err(VoiceError::Config("dialogue.base_url must not be empty".to_string()));
        }
        if self.dialogue.timeout_secs == 0 {
            return Err(VoiceError::Config("dialogue.timeout_secs must be > 0".to_string()));
        }
        if self.controller.min_utterance_chars == 0 {
            return Err(VoiceError::Config(
                "controller.min_utterance_chars must be > 0".to_string(),
            ));
        }
        if self.controller.timer_tick_ms == 0 {
            return Err(VoiceError::Config("controller.timer_tick_ms must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Tunable turn-taking policy. None of these are wire contracts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerPolicy {
    /// Final transcripts shorter than this (in chars, after trim) are discarded.
    pub min_utterance_chars: usize,
    /// Delay added per consecutive transport error before restarting capture.
    pub restart_backoff_step_ms: u64,
    /// Upper bound for the restart delay.
    pub restart_backoff_max_ms: u64,
    /// A transport error farther than this from the previous one starts a new streak.
    pub restart_error_window_ms: u64,
    /// Consecutive capture failures before the user is told about them (once).
    pub capture_failure_notice_threshold: u32,
    /// Automatic re-sends for retryable dialogue failures.
    pub dialogue_retry_limit: u32,
    /// Period of the recording-duration clock.
    pub timer_tick_ms: u64,
}

impl Default for ControllerPolicy {
    fn default() -> Self {
        Self {
            min_utterance_chars: 2,
            restart_backoff_step_ms: 500,
            restart_backoff_max_ms: 4000,
            restart_error_window_ms: 5000,
            capture_failure_notice_threshold: 3,
            dialogue_retry_limit: 1,
            timer_tick_ms: 1000,
        }
    }
}

impl ControllerPolicy {
    pub fn backoff_step(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_step_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_max_ms)
    }

    pub fn error_window(&self) -> Duration {
        Duration::from_millis(self.restart_error_window_ms)
    }

    pub fn timer_tick(&self) -> Duration {
        Duration::from_millis(self.timer_tick_ms)
    }
}

/// Remote assistant endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogueConfig {
    /// Base URL without trailing slash (e.g. http://localhost:5000).
    pub base_url: String,
    pub timeout_secs: u64,
    /// When set, requests go to the authenticated endpoint and carry the conversation id.
    pub auth_token: Option<String>,
    /// Conversation to append to (authenticated endpoint only).
    pub conversation_id: Option<String>,
    /// Longest utterance the server accepts.
    pub max_text_chars: usize,
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            timeout_secs: 30,
            auth_token: None,
            conversation_id: None,
            max_text_chars: 5000,
        }
    }
}

impl DialogueConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
