//! **PlaybackSession**: render the assistant's synthesized reply, one clip at a time.
//!
//! The session spawns the render on the runtime and reports completion on a channel,
//! stamped with a playback generation. `stop()` halts the device and aborts the
//! render task; a completion that still slips through carries a stale generation.

use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Decoded audio bytes (MP3 from the chat server).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    pub bytes: Vec<u8>,
}

impl AudioClip {
    /// Decode a base64 payload. Accepts a bare payload or a `data:audio/...;base64,` URL.
    pub fn from_base64(payload: &str) -> VoiceResult<Self> {
        let payload = payload.trim();
        let encoded = match payload.split_once(";base64,") {
            Some((prefix, rest)) if prefix.starts_with("data:") => rest,
            _ => payload,
        };
        let bytes = BASE64.decode(encoded)?;
        if bytes.is_empty() {
            return Err(VoiceError::Decode("empty audio payload".to_string()));
        }
        Ok(Self { bytes })
    }
}

/// Audio output device capability.
#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Play `clip`; resolve when it ends naturally, fail on decode/device errors.
    async fn render(&self, clip: AudioClip) -> VoiceResult<()>;

    /// Cut the current clip short. Safe to call when nothing is playing.
    fn halt(&self);
}

/// Completion of one playback.
#[derive(Debug)]
pub struct PlaybackOutcome {
    pub generation: u64,
    pub result: VoiceResult<()>,
}

/// Owns the output device for the session; at most one clip is active.
pub struct PlaybackSession {
    output: Arc<dyn AudioOutput>,
    events: mpsc::UnboundedSender<PlaybackOutcome>,
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl PlaybackSession {
    pub fn new(output: Arc<dyn AudioOutput>, events: mpsc::UnboundedSender<PlaybackOutcome>) -> Self {
        Self {
            output,
            events,
            generation: 0,
            task: None,
        }
    }

    /// Start playing a base64 payload, stopping any clip still playing.
    /// Returns the generation the completion will carry.
    pub fn play(&mut self, payload: &str) -> VoiceResult<u64> {
        self.stop();

        let clip = AudioClip::from_base64(payload)?;
        self.generation += 1;
        let generation = self.generation;
        let output = Arc::clone(&self.output);
        let events = self.events.clone();

        info!("🔊 playback: clip {} started ({} bytes)", generation, clip.bytes.len());
        self.task = Some(tokio::spawn(async move {
            let result = output.render(clip).await;
            let _ = events.send(PlaybackOutcome { generation, result });
        }));

        Ok(generation)
    }

    /// Force-stop the active clip. Idempotent.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            self.output.halt();
            task.abort();
            debug!("playback: clip {} stopped", self.generation);
        }
    }

    pub fn accepts(&self, generation: u64) -> bool {
        self.task.is_some() && generation == self.generation
    }

    /// Release the handle after the active clip reported completion.
    /// False when the completion was stale.
    pub fn finish(&mut self, generation: u64) -> bool {
        if !self.accepts(generation) {
            return false;
        }
        self.task = None;
        true
    }

    pub fn is_active(&self) -> bool {
        self.task.is_some()
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Output that plays nothing; every clip "ends" as soon as it arrives.
#[derive(Debug, Default)]
pub struct SilentOutput;

#[async_trait]
impl AudioOutput for SilentOutput {
    async fn render(&self, clip: AudioClip) -> VoiceResult<()> {
        debug!("playback: silent output dropped {} bytes", clip.bytes.len());
        Ok(())
    }

    fn halt(&self) {}
}

/// Halt bookkeeping for outputs that open the device on a blocking thread.
///
/// `halt()` may land while the device is still being opened; the clip is marked
/// halted and refuses to start once its sink is ready. Starting and halting take
/// the same lock, so a clip is never started after it was halted.
#[cfg_attr(not(feature = "rodio"), allow(dead_code))]
mod clip_slot {
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

    pub(crate) trait Stop {
        fn stop(&self);
    }

    #[derive(Debug)]
    struct ClipState<S> {
        halted: bool,
        sink: Option<Arc<S>>,
    }

    /// One clip's device handle, once it has one.
    #[derive(Debug)]
    pub(crate) struct Clip<S> {
        state: Mutex<ClipState<S>>,
    }

    impl<S: Stop> Clip<S> {
        fn lock(&self) -> MutexGuard<'_, ClipState<S>> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Attach `sink` and run `begin` on it. False (and `begin` skipped) when
        /// the clip was halted first.
        pub(crate) fn start(&self, sink: Arc<S>, begin: impl FnOnce(&S)) -> bool {
            let mut state = self.lock();
            if state.halted {
                return false;
            }
            begin(&sink);
            state.sink = Some(sink);
            true
        }

        fn halt(&self) {
            let mut state = self.lock();
            state.halted = true;
            if let Some(sink) = state.sink.take() {
                sink.stop();
            }
        }

        #[cfg(test)]
        pub(crate) fn is_halted(&self) -> bool {
            self.lock().halted
        }
    }

    /// The output's current clip.
    #[derive(Debug)]
    pub(crate) struct ClipSlot<S> {
        current: Mutex<Option<Arc<Clip<S>>>>,
    }

    impl<S> Default for ClipSlot<S> {
        fn default() -> Self {
            Self {
                current: Mutex::new(None),
            }
        }
    }

    impl<S: Stop> ClipSlot<S> {
        fn lock(&self) -> MutexGuard<'_, Option<Arc<Clip<S>>>> {
            self.current.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Register a new clip before any device work starts.
        pub(crate) fn begin(&self) -> Arc<Clip<S>> {
            let clip = Arc::new(Clip {
                state: Mutex::new(ClipState {
                    halted: false,
                    sink: None,
                }),
            });
            *self.lock() = Some(Arc::clone(&clip));
            clip
        }

        /// Halt the current clip, whether or not its device is open yet.
        pub(crate) fn halt(&self) -> bool {
            match self.lock().take() {
                Some(clip) => {
                    clip.halt();
                    true
                }
                None => false,
            }
        }

        /// Clear the slot if `clip` still owns it.
        pub(crate) fn finish(&self, clip: &Arc<Clip<S>>) {
            let mut current = self.lock();
            if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, clip)) {
                *current = None;
            }
        }
    }
}

#[cfg(feature = "rodio")]
mod rodio_output {
    use super::clip_slot::{Clip, ClipSlot, Stop};
    use super::*;
    use rodio::{OutputStream, Sink, Source};
    use std::io::Cursor;

    impl Stop for Sink {
        fn stop(&self) {
            Sink::stop(self);
        }
    }

    /// Default output device via rodio. The stream lives on a blocking thread for the
    /// length of each clip (`OutputStream` is not `Send`).
    #[derive(Default)]
    pub struct RodioOutput {
        slot: Arc<ClipSlot<Sink>>,
    }

    impl RodioOutput {
        pub fn new() -> Self {
            Self::default()
        }
    }

    fn play_blocking(clip: &Clip<Sink>, bytes: Vec<u8>) -> VoiceResult<()> {
        let (_stream, handle) =
            OutputStream::try_default().map_err(|e| VoiceError::Playback(e.to_string()))?;
        let sink = Arc::new(Sink::try_new(&handle).map_err(|e| VoiceError::Playback(e.to_string()))?);
        let source = rodio::Decoder::new(Cursor::new(bytes))
            .map_err(|e| VoiceError::Playback(format!("Decode failed: {}", e)))?;

        if !clip.start(Arc::clone(&sink), |s| s.append(source.convert_samples::<f32>())) {
            debug!("playback: clip halted before the device opened");
            return Ok(());
        }
        sink.sleep_until_end();
        Ok(())
    }

    #[async_trait]
    impl AudioOutput for RodioOutput {
        async fn render(&self, clip: AudioClip) -> VoiceResult<()> {
            let playing = self.slot.begin();
            let on_thread = Arc::clone(&playing);
            let result = tokio::task::spawn_blocking(move || play_blocking(&on_thread, clip.bytes))
                .await
                .map_err(|e| VoiceError::Playback(e.to_string()))?;
            self.slot.finish(&playing);
            result
        }

        fn halt(&self) {
            if self.slot.halt() {
                info!("playback: rodio sink stopped");
            }
        }
    }
}

#[cfg(feature = "rodio")]
pub use rodio_output::RodioOutput;
