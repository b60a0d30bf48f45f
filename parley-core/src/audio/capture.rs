//! `AudioCaptureSession`: the microphone, analyser and recorder of one call.
//!
//! The session owns three resource slots. The microphone and analyser live
//! for the whole call; a recorder exists only between `start()` and
//! `stop()`. Each `start()` builds a new recorder with an empty chunk list,
//! so audio from one turn can never leak into the next recording.

use std::sync::Arc;

use tracing::{debug, info};

use super::{
    analyser::{Analyser, AnalyserConfig},
    encoding::{ChunkEncoder, EncoderRegistry, NegotiatedEncoding},
    CaptureConstraints, MicrophoneSource, MicrophoneStream,
};
use crate::{
    buffering::{create_audio_ring, drain_into, frame::AudioFrame},
    engine::turn::TurnState,
    error::{ParleyError, Result},
    lifecycle::{Releasable, ResourceKind, ResourceLedger, Slot},
};

/// A finalised recording, consumed once by speech recognition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recording {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl Recording {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

struct Recorder {
    encoder: Box<dyn ChunkEncoder>,
    chunks: Vec<Vec<u8>>,
}

impl Recorder {
    fn push(&mut self, samples: &[f32]) -> Result<()> {
        let chunk = self.encoder.encode_chunk(samples)?;
        if !chunk.is_empty() {
            self.chunks.push(chunk);
        }
        Ok(())
    }
}

impl Releasable for Recorder {
    fn release(&mut self) {
        self.chunks.clear();
    }
}

pub struct AudioCaptureSession {
    microphone: Slot<MicrophoneStream>,
    analyser: Slot<Analyser>,
    recorder: Slot<Recorder>,
    encoding: NegotiatedEncoding,
    sample_rate: u32,
    scratch: Vec<f32>,
}

impl AudioCaptureSession {
    /// Negotiate an encoding, open the microphone and attach an analyser.
    ///
    /// Negotiation runs first so an unsupported runtime fails before the
    /// device is touched.
    ///
    /// # Errors
    /// - `EncodingNegotiation` if no candidate in `priority` is registered.
    /// - `DeviceAccess` / `NoInputDevice` from the microphone source.
    pub fn open(
        source: &dyn MicrophoneSource,
        constraints: &CaptureConstraints,
        registry: &EncoderRegistry,
        priority: &[String],
        analyser: AnalyserConfig,
        ledger: Arc<ResourceLedger>,
    ) -> Result<Self> {
        let encoding = registry.negotiate(priority)?;

        let (producer, consumer) = create_audio_ring();
        let input = source.open(constraints, producer)?;
        let sample_rate = input.sample_rate();

        let mut session = Self {
            microphone: Slot::new(ResourceKind::Microphone, Arc::clone(&ledger)),
            analyser: Slot::new(ResourceKind::Analyser, Arc::clone(&ledger)),
            recorder: Slot::new(ResourceKind::Recorder, ledger),
            encoding,
            sample_rate,
            scratch: Vec::with_capacity(4096),
        };
        session
            .microphone
            .acquire(MicrophoneStream::new(input, consumer))?;
        session.analyser.acquire(Analyser::new(analyser))?;

        info!(
            sample_rate,
            mime_type = %session.encoding.mime_type,
            "capture session open"
        );
        Ok(session)
    }

    /// Begin a new recording.
    ///
    /// # Errors
    /// - `CaptureRejected` unless `state` is Listening.
    /// - `AlreadyRecording` if a recording is active.
    /// - `SessionEnded` after `close()`.
    pub fn start(&mut self, state: TurnState) -> Result<()> {
        if state != TurnState::Listening {
            return Err(ParleyError::CaptureRejected(state));
        }
        if self.recorder.is_held() {
            return Err(ParleyError::AlreadyRecording);
        }
        if !self.microphone.is_held() {
            return Err(ParleyError::SessionEnded);
        }
        self.recorder.acquire(Recorder {
            encoder: self.encoding.new_encoder(self.sample_rate),
            chunks: Vec::new(),
        })?;
        debug!("recording started");
        Ok(())
    }

    /// Stop the active recording and assemble it.
    ///
    /// The recorder leaves its slot before anything can fail, so a failed
    /// stop still leaves the session ready for a clean `start()`.
    ///
    /// # Errors
    /// - `NotRecording` if no recording is active.
    /// - `Encoding` if the final chunk or assembly fails.
    /// - `DeviceAccess` if the microphone failed.
    pub fn stop(&mut self) -> Result<Recording> {
        let mut recorder = self.recorder.take().ok_or(ParleyError::NotRecording)?;
        let assembled = self.assemble(&mut recorder);
        recorder.release();
        assembled
    }

    fn assemble(&mut self, recorder: &mut Recorder) -> Result<Recording> {
        // Flush whatever the callback delivered since the last tick.
        if self.collect()? && !self.scratch.is_empty() {
            recorder.push(&self.scratch)?;
        }
        let chunks = std::mem::take(&mut recorder.chunks);
        let chunk_count = chunks.len();
        let data = recorder.encoder.finish(chunks)?;
        debug!(chunk_count, bytes = data.len(), "recording stopped");

        Ok(Recording {
            mime_type: self.encoding.mime_type.clone(),
            data,
        })
    }

    /// Drain captured samples into the recorder and analyser and return the
    /// current spectrum. `None` once the session is closed.
    ///
    /// # Errors
    /// - `Encoding` if the active recorder rejects a chunk.
    /// - `DeviceAccess` once the microphone has failed.
    pub fn pump(&mut self) -> Result<Option<AudioFrame>> {
        if !self.collect()? {
            return Ok(None);
        }
        if !self.scratch.is_empty() {
            if let Some(recorder) = self.recorder.get_mut() {
                recorder.push(&self.scratch)?;
            }
        }
        Ok(self.analyser.get_mut().map(Analyser::frame))
    }

    /// Move buffered samples into `scratch` and the analyser. `false` once
    /// the microphone is released.
    fn collect(&mut self) -> Result<bool> {
        let Some(mic) = self.microphone.get_mut() else {
            return Ok(false);
        };
        if let Some(reason) = mic.fault() {
            return Err(ParleyError::DeviceAccess(reason));
        }
        self.scratch.clear();
        drain_into(mic.consumer_mut(), &mut self.scratch);
        if !self.scratch.is_empty() {
            if let Some(analyser) = self.analyser.get_mut() {
                analyser.push_samples(&self.scratch);
            }
        }
        Ok(true)
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_held()
    }

    pub fn is_open(&self) -> bool {
        self.microphone.is_held()
    }

    pub fn mime_type(&self) -> &str {
        &self.encoding.mime_type
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Release recorder, analyser and microphone. Idempotent.
    pub fn close(&mut self) {
        let released = [
            self.recorder.release(),
            self.analyser.release(),
            self.microphone.release(),
        ];
        if released.iter().any(|&r| r) {
            info!("capture session closed");
        }
    }
}

impl std::fmt::Debug for AudioCaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioCaptureSession")
            .field("mime_type", &self.encoding.mime_type)
            .field("sample_rate", &self.sample_rate)
            .field("open", &self.is_open())
            .field("recording", &self.is_recording())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::audio::InputStream;
    use crate::buffering::{AudioProducer, Producer};

    const RAW: &str = "audio/x-raw-f32";

    struct RawEncoder;

    impl ChunkEncoder for RawEncoder {
        fn encode_chunk(&mut self, samples: &[f32]) -> Result<Vec<u8>> {
            Ok(samples.iter().flat_map(|s| s.to_le_bytes()).collect())
        }
    }

    /// Fails the next chunk once `fail_next` is set, then recovers.
    struct FlakyEncoder(Arc<AtomicBool>);

    impl ChunkEncoder for FlakyEncoder {
        fn encode_chunk(&mut self, samples: &[f32]) -> Result<Vec<u8>> {
            if self.0.swap(false, Ordering::SeqCst) {
                return Err(ParleyError::Encoding("transient".into()));
            }
            Ok(samples.iter().map(|s| (s * 10.0).round() as u8).collect())
        }
    }

    #[derive(Default, Clone)]
    struct ScriptedMic {
        producer: Arc<Mutex<Option<AudioProducer>>>,
        stopped: Arc<AtomicBool>,
        fault: Arc<Mutex<Option<String>>>,
    }

    impl ScriptedMic {
        fn feed(&self, samples: &[f32]) {
            if let Some(p) = self.producer.lock().as_mut() {
                p.push_slice(samples);
            }
        }
    }

    struct ScriptedInput {
        stopped: Arc<AtomicBool>,
        fault: Arc<Mutex<Option<String>>>,
    }

    impl InputStream for ScriptedInput {
        fn sample_rate(&self) -> u32 {
            16_000
        }
        fn stop(&mut self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
        fn fault(&self) -> Option<String> {
            self.fault.lock().clone()
        }
    }

    impl MicrophoneSource for ScriptedMic {
        fn open(
            &self,
            _constraints: &CaptureConstraints,
            producer: AudioProducer,
        ) -> Result<Box<dyn InputStream>> {
            *self.producer.lock() = Some(producer);
            Ok(Box::new(ScriptedInput {
                stopped: Arc::clone(&self.stopped),
                fault: Arc::clone(&self.fault),
            }))
        }
    }

    fn registry() -> EncoderRegistry {
        let mut registry = EncoderRegistry::empty();
        registry.register(RAW, Arc::new(|_| Box::new(RawEncoder)));
        registry
    }

    fn open(mic: &ScriptedMic, ledger: &Arc<ResourceLedger>) -> AudioCaptureSession {
        AudioCaptureSession::open(
            mic,
            &CaptureConstraints::default(),
            &registry(),
            &[RAW.to_string()],
            AnalyserConfig::default(),
            Arc::clone(ledger),
        )
        .unwrap()
    }

    #[test]
    fn negotiation_failure_leaves_device_untouched() {
        let mic = ScriptedMic::default();
        let ledger = ResourceLedger::new();
        let err = AudioCaptureSession::open(
            &mic,
            &CaptureConstraints::default(),
            &EncoderRegistry::empty(),
            &["audio/webm;codecs=opus".to_string()],
            AnalyserConfig::default(),
            Arc::clone(&ledger),
        )
        .unwrap_err();
        assert!(matches!(err, ParleyError::EncodingNegotiation { .. }));
        assert!(mic.producer.lock().is_none());
        assert_eq!(ledger.entry(ResourceKind::Microphone).acquired, 0);
    }

    #[test]
    fn start_is_rejected_outside_listening() {
        let mic = ScriptedMic::default();
        let ledger = ResourceLedger::new();
        let mut session = open(&mic, &ledger);

        for state in [TurnState::Thinking, TurnState::Speaking, TurnState::Ended] {
            assert!(matches!(
                session.start(state),
                Err(ParleyError::CaptureRejected(s)) if s == state
            ));
        }
        assert!(!session.is_recording());
    }

    #[test]
    fn second_start_is_rejected() {
        let mic = ScriptedMic::default();
        let ledger = ResourceLedger::new();
        let mut session = open(&mic, &ledger);

        session.start(TurnState::Listening).unwrap();
        assert!(matches!(
            session.start(TurnState::Listening),
            Err(ParleyError::AlreadyRecording)
        ));
        assert_eq!(ledger.entry(ResourceKind::Recorder).acquired, 1);
    }

    #[test]
    fn stop_without_start_fails() {
        let mic = ScriptedMic::default();
        let ledger = ResourceLedger::new();
        let mut session = open(&mic, &ledger);
        assert!(matches!(session.stop(), Err(ParleyError::NotRecording)));
    }

    #[test]
    fn recordings_do_not_share_residue() {
        let mic = ScriptedMic::default();
        let ledger = ResourceLedger::new();
        let mut session = open(&mic, &ledger);

        mic.feed(&[0.9; 100]);
        session.pump().unwrap();

        session.start(TurnState::Listening).unwrap();
        mic.feed(&[0.1; 10]);
        session.pump().unwrap();
        mic.feed(&[0.2; 5]);
        let first = session.stop().unwrap();
        assert_eq!(first.mime_type, RAW);
        assert_eq!(first.len(), 15 * 4);

        mic.feed(&[0.3; 50]);
        session.pump().unwrap();

        session.start(TurnState::Listening).unwrap();
        mic.feed(&[0.4; 3]);
        let second = session.stop().unwrap();
        assert_eq!(second.len(), 3 * 4);
        assert_eq!(&second.data[..4], &0.4f32.to_le_bytes());
    }

    #[test]
    fn pump_yields_frames_until_closed() {
        let mic = ScriptedMic::default();
        let ledger = ResourceLedger::new();
        let mut session = open(&mic, &ledger);

        mic.feed(&[0.0; 512]);
        let frame = session.pump().unwrap().unwrap();
        assert_eq!(frame.bins.len(), 1024);

        session.close();
        assert!(session.pump().unwrap().is_none());
    }

    #[test]
    fn close_releases_everything_once() {
        let mic = ScriptedMic::default();
        let ledger = ResourceLedger::new();
        let mut session = open(&mic, &ledger);
        session.start(TurnState::Listening).unwrap();

        session.close();
        session.close();
        drop(session);

        assert!(mic.stopped.load(Ordering::SeqCst));
        assert_eq!(ledger.outstanding(), 0);
        for kind in [
            ResourceKind::Microphone,
            ResourceKind::Analyser,
            ResourceKind::Recorder,
        ] {
            let entry = ledger.entry(kind);
            assert_eq!(entry.acquired, 1, "{kind}");
            assert_eq!(entry.released, 1, "{kind}");
        }
    }

    #[test]
    fn failed_stop_leaves_no_residue_for_the_next_recording() {
        let mic = ScriptedMic::default();
        let ledger = ResourceLedger::new();
        let fail_next = Arc::new(AtomicBool::new(false));
        let mut registry = EncoderRegistry::empty();
        let flag = Arc::clone(&fail_next);
        registry.register(
            RAW,
            Arc::new(move |_| Box::new(FlakyEncoder(Arc::clone(&flag)))),
        );
        let mut session = AudioCaptureSession::open(
            &mic,
            &CaptureConstraints::default(),
            &registry,
            &[RAW.to_string()],
            AnalyserConfig::default(),
            Arc::clone(&ledger),
        )
        .unwrap();

        session.start(TurnState::Listening).unwrap();
        mic.feed(&[0.7]);
        fail_next.store(true, Ordering::SeqCst);
        assert!(matches!(session.stop(), Err(ParleyError::Encoding(_))));
        assert!(!session.is_recording());
        let recorder = ledger.entry(ResourceKind::Recorder);
        assert_eq!((recorder.acquired, recorder.released), (1, 1));

        session.start(TurnState::Listening).unwrap();
        mic.feed(&[0.5]);
        let next = session.stop().unwrap();
        assert_eq!(next.data, vec![5]);
    }

    #[test]
    fn microphone_fault_is_reported_on_every_tick() {
        let mic = ScriptedMic::default();
        let ledger = ResourceLedger::new();
        let mut session = open(&mic, &ledger);
        session.start(TurnState::Listening).unwrap();
        mic.feed(&[0.1; 64]);
        assert!(session.pump().unwrap().is_some());

        *mic.fault.lock() = Some("device unplugged".into());
        match session.pump() {
            Err(ParleyError::DeviceAccess(reason)) => assert_eq!(reason, "device unplugged"),
            other => panic!("expected DeviceAccess, got {other:?}"),
        }
        assert!(session.pump().unwrap_err().is_fatal());

        assert!(matches!(session.stop(), Err(ParleyError::DeviceAccess(_))));
        assert!(!session.is_recording());
    }

    #[test]
    fn start_after_close_reports_session_ended() {
        let mic = ScriptedMic::default();
        let ledger = ResourceLedger::new();
        let mut session = open(&mic, &ledger);
        session.close();
        assert!(matches!(
            session.start(TurnState::Listening),
            Err(ParleyError::SessionEnded)
        ));
    }
}
