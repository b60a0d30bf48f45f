//! Audio output for synthesized agent speech.
//!
//! `AudioOutput::play` returns immediately with a `Playback`: a stoppable
//! handle plus a oneshot that resolves when playback ends or fails. The
//! engine parks in Speaking until that oneshot fires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::error::Result;
use crate::lifecycle::Releasable;

/// Encoded speech from the synthesizer, consumed once by playback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesizedAudio {
    pub bytes: Vec<u8>,
    /// Container tag reported by the synthesizer, e.g. `"mp3"`.
    pub format: String,
}

/// Stop switch for one playback. Stopping counts as a normal end.
#[derive(Debug, Clone, Default)]
pub struct PlaybackHandle {
    stop: Arc<AtomicBool>,
}

impl PlaybackHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

impl Releasable for PlaybackHandle {
    fn release(&mut self) {
        self.stop();
    }
}

/// A started playback.
pub struct Playback {
    pub handle: PlaybackHandle,
    /// Resolves with `Ok(())` when audio finished or was stopped, `Err` on a
    /// decoder or device failure. A dropped sender is treated as a failure.
    pub finished: oneshot::Receiver<Result<()>>,
}

pub trait AudioOutput: Send + Sync {
    /// Start playing `audio`.
    ///
    /// # Errors
    /// `Playback` if output cannot even be started.
    fn play(&self, audio: SynthesizedAudio) -> Result<Playback>;
}

#[cfg(feature = "playback-rodio")]
pub use rodio_output::RodioOutput;

#[cfg(feature = "playback-rodio")]
mod rodio_output {
    use std::io::Cursor;
    use std::time::Duration;

    use rodio::{Decoder, OutputStream, Sink};
    use tokio::sync::oneshot;
    use tracing::{debug, warn};

    use super::{AudioOutput, Playback, PlaybackHandle, SynthesizedAudio};
    use crate::error::{ParleyError, Result};

    /// Default output device via rodio.
    ///
    /// `OutputStream` is `!Send`, so each playback opens the device on its
    /// own thread and drops it there.
    #[derive(Debug, Default, Clone)]
    pub struct RodioOutput {
        volume: Option<f32>,
    }

    impl RodioOutput {
        pub fn new() -> Self {
            Self::default()
        }

        /// Playback volume, 0.0 (silent) to 1.0 (full).
        pub fn with_volume(volume: f32) -> Self {
            Self {
                volume: Some(volume.clamp(0.0, 1.0)),
            }
        }
    }

    impl AudioOutput for RodioOutput {
        fn play(&self, audio: SynthesizedAudio) -> Result<Playback> {
            let handle = PlaybackHandle::new();
            let (done_tx, done_rx) = oneshot::channel();
            let thread_handle = handle.clone();
            let volume = self.volume;

            std::thread::Builder::new()
                .name("parley-playback".into())
                .spawn(move || {
                    let outcome = play_blocking(audio, &thread_handle, volume);
                    if let Err(e) = &outcome {
                        warn!("playback failed: {e}");
                    }
                    let _ = done_tx.send(outcome);
                })
                .map_err(|e| ParleyError::Playback(e.to_string()))?;

            Ok(Playback {
                handle,
                finished: done_rx,
            })
        }
    }

    fn play_blocking(
        audio: SynthesizedAudio,
        handle: &PlaybackHandle,
        volume: Option<f32>,
    ) -> Result<()> {
        let (_stream, stream_handle) = OutputStream::try_default()
            .map_err(|e| ParleyError::Playback(format!("failed to open audio output: {e}")))?;
        let sink = Sink::try_new(&stream_handle)
            .map_err(|e| ParleyError::Playback(format!("failed to create audio sink: {e}")))?;
        if let Some(volume) = volume {
            sink.set_volume(volume);
        }

        let format = audio.format.clone();
        let source = Decoder::new(Cursor::new(audio.bytes))
            .map_err(|e| ParleyError::Playback(format!("cannot decode {format} audio: {e}")))?;
        sink.append(source);
        debug!(format = %format, "playback started");

        while !sink.empty() {
            if handle.is_stopped() {
                sink.stop();
                debug!("playback stopped");
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        debug!("playback ended");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn releasing_the_handle_stops_every_clone() {
        let mut handle = PlaybackHandle::new();
        let observer = handle.clone();
        assert!(!observer.is_stopped());
        handle.release();
        handle.release();
        assert!(observer.is_stopped());
    }
}
