//! Example: Offline echo conversation
//!
//! Runs the full turn-taking loop without a server or audio devices: a scripted
//! "user" speaks three phrases, an in-process assistant echoes them back, and the
//! silent output "plays" each reply.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use talkback_voice::{
    ChannelRecognizer, ControllerEvent, ConversationController, DialogueClient, DialogueFailure,
    DialogueResult, EndReason, SilentOutput, TalkbackConfig, Utterance,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

struct EchoAssistant;

#[async_trait]
impl DialogueClient for EchoAssistant {
    async fn send(
        &self,
        utterance: &Utterance,
        language_hint: Option<&str>,
    ) -> Result<DialogueResult, DialogueFailure> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(DialogueResult {
            reply_text: format!("You said: {}", utterance.text),
            language: language_hint.unwrap_or("en").to_string(),
            // "ID3" as base64, enough for the silent output
            audio_payload: Some("SUQz".to_string()),
            turn_id: utterance.turn_id,
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = TalkbackConfig::default();
    config.fallback_language = "en".to_string();

    let (recognizer, feed) = ChannelRecognizer::new();
    let (mut controller, handle) = ConversationController::new(
        config,
        Box::new(recognizer),
        Arc::new(EchoAssistant),
        Arc::new(SilentOutput),
    )?;
    let mut events = controller
        .take_event_receiver()
        .ok_or("event receiver already taken")?;
    let session = controller.spawn();

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ControllerEvent::StateChanged { from, to } => info!("{:?} → {:?}", from, to),
                ControllerEvent::Reply { text, .. } => info!("🤖 {}", text),
                ControllerEvent::Notice(notice) => info!("⚠️ {}", notice),
            }
        }
    });

    handle.start();
    let mut sessions = feed.sessions();
    let mut expected = 0u64;

    for (i, phrase) in ["hello there", "what is the weather in Hue", "bye"]
        .iter()
        .enumerate()
    {
        // wait until the microphone is open for this turn
        expected += 1;
        sessions.wait_for(|n| *n >= expected).await?;
        if i == 1 {
            // the engine drops the session once before the user speaks
            feed.interrupt(EndReason::NaturalTimeout);
            expected += 1;
            sessions.wait_for(|n| *n >= expected).await?;
        }
        feed.partial(&phrase[..phrase.len().min(4)]);
        feed.finalize(*phrase);
    }

    session.await?;
    drop(handle);
    printer.await?;
    info!("👋 Goodbye!");
    Ok(())
}
