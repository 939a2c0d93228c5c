//! Error types for the talkback voice loop

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur in the voice conversation system
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Audio payload decode error: {0}")]
    Decode(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}

impl From<base64::DecodeError> for VoiceError {
    fn from(err: base64::DecodeError) -> Self {
        VoiceError::Decode(err.to_string())
    }
}

/// Why a speech capture session could not be started.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// Microphone access is unavailable or was revoked.
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    /// The recognizer exists but could not open a native session.
    #[error("Speech recognizer unavailable: {0}")]
    Unavailable(String),
}

/// Typed failure of one dialogue round trip.
///
/// The client never retries on its own; the controller decides based on
/// [`DialogueFailure::is_retryable`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DialogueFailure {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Dialogue request timed out")]
    Timeout,

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Session expired, please log in again")]
    Unauthorized,

    #[error("Invalid dialogue request: {0}")]
    InvalidRequest(String),
}

impl DialogueFailure {
    /// Network errors and timeouts may succeed on a second attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DialogueFailure::Network(_) | DialogueFailure::Timeout)
    }
}

impl From<reqwest::Error> for DialogueFailure {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DialogueFailure::Timeout
        } else if err.is_decode() {
            DialogueFailure::Server {
                status: err.status().map(|s| s.as_u16()).unwrap_or(200),
                message: format!("malformed response: {}", err),
            }
        } else if let Some(status) = err.status() {
            DialogueFailure::Server {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            DialogueFailure::Network(err.to_string())
        }
    }
}
