//! cpal-backed `MicrophoneSource`.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). Each opened input therefore gets a dedicated thread that builds the
//! stream, parks until told to stop, and drops the stream on that same thread.
//! A sync oneshot propagates open errors back to the caller.
//!
//! The input callback runs at real-time priority and must not allocate, lock
//! or block: it downmixes into a buffer sized on first use and writes into
//! the SPSC producer, whose `push_slice` is wait-free.
//!
//! A device that disappears mid-call latches a fault on the stream handle.
//! The capture session reports it as `DeviceAccess` on its next tick.

#[cfg(feature = "audio-cpal")]
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    SampleFormat, StreamConfig,
};
#[cfg(feature = "audio-cpal")]
use parking_lot::Mutex;
#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

#[cfg(feature = "audio-cpal")]
use super::device::pick_speech_input;
#[cfg(feature = "audio-cpal")]
use super::{CaptureConstraints, InputStream, MicrophoneSource};
#[cfg(feature = "audio-cpal")]
use crate::{
    buffering::{AudioProducer, Producer},
    error::{ParleyError, Result},
};

/// Default system microphone via cpal.
#[cfg(feature = "audio-cpal")]
#[derive(Debug, Default, Clone)]
pub struct CpalMicrophone;

#[cfg(feature = "audio-cpal")]
impl CpalMicrophone {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(feature = "audio-cpal")]
impl MicrophoneSource for CpalMicrophone {
    fn open(
        &self,
        constraints: &CaptureConstraints,
        producer: AudioProducer,
    ) -> Result<Box<dyn InputStream>> {
        if constraints.echo_cancellation
            || constraints.noise_suppression
            || constraints.auto_gain_control
        {
            // cpal exposes raw device input only; OS-level voice processing,
            // when configured, still applies upstream of us.
            info!(
                echo_cancellation = constraints.echo_cancellation,
                noise_suppression = constraints.noise_suppression,
                auto_gain_control = constraints.auto_gain_control,
                "voice processing requested; relying on the OS input chain"
            );
        }

        let running = Arc::new(AtomicBool::new(true));
        let (open_tx, open_rx) = mpsc::channel::<Result<u32>>();
        let preferred = constraints.preferred_input_device.clone();
        let running_for_thread = Arc::clone(&running);
        let fault = Arc::new(Mutex::new(None));
        let fault_for_thread = Arc::clone(&fault);

        let thread = std::thread::Builder::new()
            .name("parley-mic".into())
            .spawn(move || {
                let stream = match build_stream(
                    producer,
                    &running_for_thread,
                    &fault_for_thread,
                    preferred.as_deref(),
                ) {
                    Ok((stream, rate)) => {
                        let _ = open_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };
                while running_for_thread.load(Ordering::Acquire) {
                    std::thread::sleep(Duration::from_millis(20));
                }
                // Stream drops here, releasing the device on its creation thread.
                drop(stream);
                info!("microphone closed");
            })
            .map_err(ParleyError::Io)?;

        match open_rx.recv() {
            Ok(Ok(sample_rate)) => Ok(Box::new(CpalInputStream {
                running,
                thread: Some(thread),
                sample_rate,
                fault,
            })),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(ParleyError::DeviceAccess(
                    "microphone thread exited before opening the device".into(),
                ))
            }
        }
    }
}

#[cfg(feature = "audio-cpal")]
struct CpalInputStream {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    sample_rate: u32,
    /// Set by the stream error callback when the device goes away.
    fault: Arc<Mutex<Option<String>>>,
}

#[cfg(feature = "audio-cpal")]
impl InputStream for CpalInputStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("microphone thread panicked");
            }
        }
    }

    fn fault(&self) -> Option<String> {
        self.fault.lock().clone()
    }
}

#[cfg(feature = "audio-cpal")]
impl Drop for CpalInputStream {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(feature = "audio-cpal")]
fn select_device(host: &cpal::Host, preferred: Option<&str>) -> Result<cpal::Device> {
    let devices: Vec<cpal::Device> = host
        .input_devices()
        .map_err(|e| ParleyError::DeviceAccess(e.to_string()))?
        .collect();

    if let Some(preferred) = preferred {
        if let Some(device) = devices
            .iter()
            .find(|d| d.name().map(|n| n == preferred).unwrap_or(false))
        {
            return Ok(device.clone());
        }
        warn!(preferred, "preferred input device not found, falling back");
    }

    let default_name = host.default_input_device().and_then(|d| d.name().ok());
    let candidates: Vec<(String, bool)> = devices
        .iter()
        .map(|d| {
            let name = d.name().unwrap_or_default();
            let is_default = default_name.as_deref() == Some(name.as_str());
            (name, is_default)
        })
        .collect();

    match pick_speech_input(&candidates) {
        Some(idx) => Ok(devices[idx].clone()),
        None => host
            .default_input_device()
            .ok_or(ParleyError::NoInputDevice),
    }
}

#[cfg(feature = "audio-cpal")]
fn build_stream(
    mut producer: AudioProducer,
    running: &Arc<AtomicBool>,
    fault: &Arc<Mutex<Option<String>>>,
    preferred: Option<&str>,
) -> Result<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    let device = select_device(&host, preferred)?;

    info!(
        device = device.name().unwrap_or_default().as_str(),
        "opening microphone"
    );

    let supported = device
        .default_input_config()
        .map_err(|e| ParleyError::DeviceAccess(e.to_string()))?;
    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels() as usize;
    let config: StreamConfig = supported.config();

    info!(sample_rate, channels, "microphone config selected");

    let running = Arc::clone(running);
    let fault = Arc::clone(fault);
    // Only DeviceNotAvailable latches a fault; backend-specific errors are logged.
    let on_error = move |err: cpal::StreamError| match err {
        cpal::StreamError::DeviceNotAvailable => {
            error!("microphone stream error: {err}");
            fault.lock().get_or_insert_with(|| err.to_string());
        }
        other => warn!("microphone stream error: {other}"),
    };

    let stream = match supported.sample_format() {
        SampleFormat::F32 => {
            let mut mono: Vec<f32> = Vec::new();
            device.build_input_stream(
                &config,
                move |data: &[f32], _| {
                    if !running.load(Ordering::Relaxed) {
                        return;
                    }
                    downmix(data, channels, &mut mono, |s| s);
                    push_or_warn(&mut producer, &mono);
                },
                on_error,
                None,
            )
        }
        SampleFormat::I16 => {
            let mut mono: Vec<f32> = Vec::new();
            device.build_input_stream(
                &config,
                move |data: &[i16], _| {
                    if !running.load(Ordering::Relaxed) {
                        return;
                    }
                    downmix(data, channels, &mut mono, |s| s as f32 / 32768.0);
                    push_or_warn(&mut producer, &mono);
                },
                on_error,
                None,
            )
        }
        SampleFormat::U8 => {
            let mut mono: Vec<f32> = Vec::new();
            device.build_input_stream(
                &config,
                move |data: &[u8], _| {
                    if !running.load(Ordering::Relaxed) {
                        return;
                    }
                    downmix(data, channels, &mut mono, |s| (s as f32 - 128.0) / 128.0);
                    push_or_warn(&mut producer, &mono);
                },
                on_error,
                None,
            )
        }
        fmt => {
            return Err(ParleyError::DeviceAccess(format!(
                "unsupported sample format: {fmt:?}"
            )))
        }
    }
    .map_err(|e| ParleyError::DeviceAccess(e.to_string()))?;

    stream
        .play()
        .map_err(|e| ParleyError::DeviceAccess(e.to_string()))?;

    Ok((stream, sample_rate))
}

/// Average interleaved frames down to mono into `out`.
#[cfg(feature = "audio-cpal")]
fn downmix<T: Copy>(data: &[T], channels: usize, out: &mut Vec<f32>, to_f32: impl Fn(T) -> f32) {
    let ch = channels.max(1);
    let frames = data.len() / ch;
    out.resize(frames, 0.0);
    for (f, slot) in out.iter_mut().enumerate() {
        let base = f * ch;
        let sum: f32 = data[base..base + ch].iter().map(|&s| to_f32(s)).sum();
        *slot = sum / ch as f32;
    }
}

#[cfg(feature = "audio-cpal")]
fn push_or_warn(producer: &mut AudioProducer, samples: &[f32]) {
    let written = producer.push_slice(samples);
    if written < samples.len() {
        warn!(dropped = samples.len() - written, "ring buffer full");
    }
}
