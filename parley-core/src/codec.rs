//! Base64 transport encoding for audio payloads.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::error::{ParleyError, Result};

pub fn encode_audio_payload(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode a base64 audio payload. Surrounding whitespace is ignored.
///
/// # Errors
/// `Payload` if the text is not valid standard base64.
pub fn decode_audio_payload(payload: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(payload.trim())
        .map_err(|e| ParleyError::Payload(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_then_encode_is_identity() {
        let payload = "SUQzBAAAAAAAI1RTU0UAAAAPAAADTGF2ZjU4Ljc2LjEwMAAAAAAAAAAAAAAA//tQxAAD";
        let bytes = decode_audio_payload(payload).unwrap();
        assert_eq!(encode_audio_payload(&bytes), payload);
    }

    #[test]
    fn binary_bytes_survive() {
        let bytes: Vec<u8> = (0..=255).collect();
        let decoded = decode_audio_payload(&encode_audio_payload(&bytes)).unwrap();
        assert_eq!(decoded, bytes);
    }

    #[test]
    fn invalid_payload_is_rejected() {
        assert!(matches!(
            decode_audio_payload("not base64!!"),
            Err(ParleyError::Payload(_))
        ));
        assert_eq!(decode_audio_payload("\n").unwrap(), Vec::<u8>::new());
    }
}
