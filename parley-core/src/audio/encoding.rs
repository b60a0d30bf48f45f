//! Recording encoders and encoding negotiation.
//!
//! A `ChunkEncoder` turns PCM into encoded chunks while a recording is
//! active and assembles the final byte buffer on stop. The
//! `EncoderRegistry` is the set of encodings this runtime can produce;
//! negotiation walks the configured priority list and picks the first
//! registered one.
//!
//! Only WAV ships in-tree. Opus container types stay in the default
//! priority list so a host that registers an Opus encoder gets it first.

use std::io::Cursor;
use std::sync::Arc;

use tracing::info;

use crate::error::{ParleyError, Result};

pub const MIME_WEBM_OPUS: &str = "audio/webm;codecs=opus";
pub const MIME_OGG_OPUS: &str = "audio/ogg;codecs=opus";
pub const MIME_WAV: &str = "audio/wav";

/// Encoding preference used when the config does not override it.
pub fn default_priority() -> Vec<String> {
    vec![
        MIME_WEBM_OPUS.to_string(),
        MIME_OGG_OPUS.to_string(),
        MIME_WAV.to_string(),
    ]
}

pub trait ChunkEncoder: Send {
    /// Encode one slice of mono f32 PCM into a chunk.
    fn encode_chunk(&mut self, samples: &[f32]) -> Result<Vec<u8>>;

    /// Assemble the recording from every chunk produced since start.
    ///
    /// The default concatenates, which is correct for self-delimiting
    /// container streams.
    fn finish(&mut self, chunks: Vec<Vec<u8>>) -> Result<Vec<u8>> {
        Ok(chunks.concat())
    }
}

/// Builds a fresh encoder for a capture sample rate.
pub type EncoderFactory = Arc<dyn Fn(u32) -> Box<dyn ChunkEncoder> + Send + Sync>;

/// The encoding chosen for a call.
#[derive(Clone)]
pub struct NegotiatedEncoding {
    pub mime_type: String,
    factory: EncoderFactory,
}

impl NegotiatedEncoding {
    pub fn new_encoder(&self, sample_rate: u32) -> Box<dyn ChunkEncoder> {
        (self.factory)(sample_rate)
    }
}

impl std::fmt::Debug for NegotiatedEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiatedEncoding")
            .field("mime_type", &self.mime_type)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Default)]
pub struct EncoderRegistry {
    entries: Vec<(String, EncoderFactory)>,
}

impl EncoderRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with the in-tree encoders (WAV).
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(MIME_WAV, Arc::new(|rate| Box::new(WavEncoder::new(rate))));
        registry
    }

    pub fn register(&mut self, mime_type: &str, factory: EncoderFactory) {
        let key = normalize_mime(mime_type);
        self.entries.retain(|(m, _)| *m != key);
        self.entries.push((key, factory));
    }

    pub fn is_type_supported(&self, mime_type: &str) -> bool {
        let key = normalize_mime(mime_type);
        self.entries.iter().any(|(m, _)| *m == key)
    }

    /// Pick the first entry of `priority` this registry supports.
    ///
    /// # Errors
    /// `EncodingNegotiation` when none of the candidates are registered.
    pub fn negotiate(&self, priority: &[String]) -> Result<NegotiatedEncoding> {
        for candidate in priority {
            let key = normalize_mime(candidate);
            if let Some((_, factory)) = self.entries.iter().find(|(m, _)| *m == key) {
                info!(mime_type = %candidate, "recording encoding negotiated");
                return Ok(NegotiatedEncoding {
                    mime_type: candidate.trim().to_string(),
                    factory: Arc::clone(factory),
                });
            }
        }
        Err(ParleyError::EncodingNegotiation {
            tried: priority.to_vec(),
        })
    }
}

fn normalize_mime(raw: &str) -> String {
    raw.split(';')
        .map(|part| part.trim().to_ascii_lowercase())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(";")
}

/// 16-bit mono PCM in a RIFF/WAVE container.
///
/// Chunks are raw little-endian PCM; the header is written on `finish`
/// once the total length is known.
pub struct WavEncoder {
    sample_rate: u32,
}

impl WavEncoder {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

impl ChunkEncoder for WavEncoder {
    fn encode_chunk(&mut self, samples: &[f32]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(samples.len() * 2);
        for &s in samples {
            let pcm = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            out.extend_from_slice(&pcm.to_le_bytes());
        }
        Ok(out)
    }

    fn finish(&mut self, chunks: Vec<Vec<u8>>) -> Result<Vec<u8>> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec)
                .map_err(|e| ParleyError::Encoding(e.to_string()))?;
            for chunk in &chunks {
                for pair in chunk.chunks_exact(2) {
                    writer
                        .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
                        .map_err(|e| ParleyError::Encoding(e.to_string()))?;
                }
            }
            writer
                .finalize()
                .map_err(|e| ParleyError::Encoding(e.to_string()))?;
        }
        Ok(cursor.into_inner())
    }
}
