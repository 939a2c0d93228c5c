//! **DialogueClient**: one finalized utterance in, one assistant reply out.
//!
//! Implement [`DialogueClient`] for any assistant backend. [`HttpDialogueClient`] talks
//! to the chat server's `/voice-chat` endpoints. No retries happen here; the
//! controller owns that policy.

use crate::config::DialogueConfig;
use crate::error::{DialogueFailure, VoiceError, VoiceResult};
use crate::language::normalize_language;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

/// A finalized chunk of user speech, consumed once by the dialogue client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    pub text: String,
    /// Turn this utterance opened; echoed back in the result.
    pub turn_id: u64,
    pub timestamp: DateTime<Utc>,
}

impl Utterance {
    pub fn new(text: impl Into<String>, turn_id: u64) -> Self {
        Self {
            text: text.into(),
            turn_id,
            timestamp: Utc::now(),
        }
    }
}

/// The assistant's answer to one utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogueResult {
    pub reply_text: String,
    /// Language detected by the server ("vi", "en"); empty when unknown.
    pub language: String,
    /// Base64-encoded synthesized speech, if any.
    pub audio_payload: Option<String>,
    pub turn_id: u64,
}

/// Backend that answers an utterance.
#[async_trait]
pub trait DialogueClient: Send + Sync {
    /// Send one utterance. `language_hint` is the last language the session saw.
    async fn send(
        &self,
        utterance: &Utterance,
        language_hint: Option<&str>,
    ) -> Result<DialogueResult, DialogueFailure>;
}

#[derive(Debug, Serialize)]
struct VoiceChatRequest<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    language: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<String>,
    turn_id: u64,
}

#[derive(Debug, Deserialize)]
struct VoiceChatResponse {
    status: String,
    #[serde(default)]
    response: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    audio: Option<String>,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

/// Production client for the chat server's voice endpoints.
///
/// With an auth token, requests go to `/voice-chat-authenticated` and carry the
/// conversation id so the exchange lands in the user's history; otherwise the
/// public `/voice-chat` endpoint is used. A token the server rejects (401) is
/// dropped along with the conversation id, so later turns go out anonymously.
#[derive(Debug)]
pub struct HttpDialogueClient {
    /// Base URL without trailing slash (e.g. http://localhost:5000).
    base_url: String,
    auth_token: Mutex<Option<String>>,
    max_text_chars: usize,
    conversation_id: Mutex<Option<String>>,
    client: reqwest::Client,
}

impl HttpDialogueClient {
    pub fn new(config: &DialogueConfig) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| VoiceError::Config(e.to_string()))?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_token: Mutex::new(
                config
                    .auth_token
                    .as_ref()
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty()),
            ),
            max_text_chars: config.max_text_chars,
            conversation_id: Mutex::new(config.conversation_id.clone()),
            client,
        })
    }

    /// Conversation the next authenticated request will append to.
    pub fn conversation_id(&self) -> Option<String> {
        self.conversation_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn auth_token(&self) -> Option<String> {
        self.auth_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether requests still go to the authenticated endpoint.
    pub fn is_authenticated(&self) -> bool {
        self.auth_token().is_some()
    }

    /// Forget the token and the conversation it belonged to.
    fn sign_out(&self) {
        self.auth_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.conversation_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn endpoint_for(&self, authenticated: bool) -> String {
        if authenticated {
            format!("{}/voice-chat-authenticated", self.base_url)
        } else {
            format!("{}/voice-chat", self.base_url)
        }
    }

    fn validate(&self, text: &str) -> Result<(), DialogueFailure> {
        if text.is_empty() {
            return Err(DialogueFailure::InvalidRequest("text is required".to_string()));
        }
        let len = text.chars().count();
        if len > self.max_text_chars {
            return Err(DialogueFailure::InvalidRequest(format!(
                "text too long ({} chars, max {})",
                len, self.max_text_chars
            )));
        }
        Ok(())
    }

    /// `GET /health`; true when the server answers with a 2xx.
    pub async fn health(&self) -> bool {
        match self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
        {
            Ok(res) => res.status().is_success(),
            Err(e) => {
                debug!("dialogue: health check failed: {}", e);
                false
            }
        }
    }
}

#[async_trait]
impl DialogueClient for HttpDialogueClient {
    async fn send(
        &self,
        utterance: &Utterance,
        language_hint: Option<&str>,
    ) -> Result<DialogueResult, DialogueFailure> {
        let text = utterance.text.trim();
        self.validate(text)?;

        let token = self.auth_token();
        let conversation_id = if token.is_some() {
            self.conversation_id()
        } else {
            None
        };
        let body = VoiceChatRequest {
            text,
            language: language_hint.filter(|l| !l.trim().is_empty()),
            conversation_id,
            turn_id: utterance.turn_id,
        };

        let url = self.endpoint_for(token.is_some());
        let mut req = self
            .client
            .post(&url)
            .header("X-Turn-Id", utterance.turn_id.to_string())
            .json(&body);
        if let Some(ref token) = token {
            req = req.bearer_auth(token);
        }

        debug!("dialogue: turn {} -> {}", utterance.turn_id, url);
        let res = req.send().await?;

        let status = res.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            if token.is_some() {
                warn!("dialogue: token rejected (401), continuing on the public endpoint");
                self.sign_out();
            } else {
                warn!("dialogue: public endpoint rejected the request (401)");
            }
            return Err(DialogueFailure::Unauthorized);
        }
        if !status.is_success() {
            let raw = res.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&raw)
                .ok()
                .and_then(|b| b.message)
                .unwrap_or(raw);
            return Err(DialogueFailure::Server {
                status: status.as_u16(),
                message,
            });
        }

        let payload: VoiceChatResponse = res.json().await?;
        if payload.status != "success" {
            return Err(DialogueFailure::Server {
                status: status.as_u16(),
                message: payload
                    .message
                    .unwrap_or_else(|| "voice chat failed".to_string()),
            });
        }

        if let Some(id) = payload.conversation_id.filter(|id| !id.is_empty()) {
            *self
                .conversation_id
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(id);
        }

        Ok(DialogueResult {
            reply_text: payload.response,
            language: payload
                .language
                .as_deref()
                .and_then(normalize_language)
                .unwrap_or_default(),
            audio_payload: payload.audio.filter(|a| !a.trim().is_empty()),
            turn_id: utterance.turn_id,
        })
    }
}
