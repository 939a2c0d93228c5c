//! Talkback CLI: a voice conversation driven from the terminal.
//!
//! Usage:
//!   cargo run -p talkback-voice [--features rodio] -- [--lang en]
//!
//! Every line typed while the session is listening is taken as a finalized
//! transcript. `/pause`, `/resume` and `/quit` are sent as intents. Replies are
//! printed and, with the `rodio` feature, spoken on the default output device.

use anyhow::Context;
use std::io::BufRead;
use std::sync::Arc;
use talkback_voice::{
    AudioOutput, ChannelRecognizer, ControllerEvent, ControllerHandle, ConversationController,
    HttpDialogueClient, TalkbackConfig, TranscriptFeed,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn audio_output() -> Arc<dyn AudioOutput> {
    #[cfg(feature = "rodio")]
    {
        info!("Using RodioOutput (default output device).");
        Arc::new(talkback_voice::RodioOutput::new())
    }
    #[cfg(not(feature = "rodio"))]
    {
        info!("Using SilentOutput (build with --features rodio to hear replies).");
        Arc::new(talkback_voice::SilentOutput)
    }
}

/// Read stdin on its own thread; a blocked read must not keep the runtime alive
/// once the conversation has ended.
fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Forward typed lines to the conversation until stdin ends, `/quit` is typed, or
/// the conversation stops by itself. Returns true when `session` was already joined.
async fn run_commands(
    lines: &mut mpsc::UnboundedReceiver<String>,
    handle: &ControllerHandle,
    feed: &TranscriptFeed,
    session: &mut JoinHandle<()>,
) -> anyhow::Result<bool> {
    loop {
        let line = tokio::select! {
            line = lines.recv() => match line {
                Some(line) => line,
                None => return Ok(false),
            },
            joined = &mut *session => {
                // closed from inside, e.g. by a spoken exit phrase
                joined.context("conversation task panicked")?;
                return Ok(true);
            }
        };
        match line.trim() {
            "" => continue,
            "/pause" => {
                handle.pause();
            }
            "/resume" => {
                handle.resume();
            }
            "/quit" => {
                handle.close();
                return Ok(false);
            }
            text => {
                if !feed.finalize(text) {
                    println!("(microphone closed, wait for the assistant or /resume)");
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = TalkbackConfig::load().context("loading talkback config")?;

    let mut args = std::env::args().skip(1);
    while let Some(a) = args.next() {
        match a.as_str() {
            "--lang" => {
                if let Some(lang) = args.next() {
                    config.fallback_language = lang;
                }
            }
            "--help" | "-h" => {
                eprintln!("Talkback: hands-free voice chat from the terminal");
                eprintln!("  --lang vi|en     Language before the assistant detects one (default vi)");
                eprintln!();
                eprintln!("Type a sentence and press Enter to \"say\" it.");
                eprintln!("Commands: /pause  /resume  /quit");
                eprintln!("Server: TALKBACK__DIALOGUE__BASE_URL (default http://localhost:5000)");
                return Ok(());
            }
            _ => {}
        }
    }

    let client = Arc::new(HttpDialogueClient::new(&config.dialogue)?);
    if !client.health().await {
        warn!(
            "assistant at {} is not answering /health; turns will fail until it does",
            config.dialogue.base_url
        );
    }

    let (recognizer, feed) = ChannelRecognizer::new();
    let (mut controller, handle) =
        ConversationController::new(config, Box::new(recognizer), client, audio_output())?;
    let mut events = controller
        .take_event_receiver()
        .context("controller event receiver already taken")?;
    let mut session = controller.spawn();

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ControllerEvent::Reply { text, language, .. } => {
                    println!("🤖 [{}] {}", language, text);
                }
                ControllerEvent::Notice(notice) => println!("⚠️  {}", notice),
                ControllerEvent::StateChanged { .. } => {}
            }
        }
    });

    let mut snapshots = handle.subscribe();
    let status = tokio::spawn(async move {
        let mut last = None;
        while snapshots.changed().await.is_ok() {
            let snap = snapshots.borrow_and_update().clone();
            if last != Some(snap.state) {
                println!("[{}] {}", snap.elapsed_label(), snap.status_label());
                last = Some(snap.state);
            }
        }
    });

    handle.start();

    let mut lines = stdin_lines();
    let finished = run_commands(&mut lines, &handle, &feed, &mut session).await?;

    handle.close();
    if !finished {
        session.await.context("conversation task panicked")?;
    }
    drop(handle);
    let _ = printer.await;
    let _ = status.await;
    Ok(())
}
