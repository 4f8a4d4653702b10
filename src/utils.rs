use crate::error::AppError;

use base64::{engine, Engine};
use tracing::warn;

pub fn b64_encode(bytes: &[u8]) -> String {
    engine::general_purpose::STANDARD.encode(bytes)
}

pub fn b64_decode(enc: &str) -> Result<Vec<u8>, AppError> {
    engine::general_purpose::STANDARD.decode(enc).map_err(|e| {
        warn!(error=%e, "failed to decode base64 payload");
        AppError("invalid base64 payload")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mulaw_frames_survive_encoding() {
        let frame = vec![0xffu8, 0x7f, 0x00, 0x80];
        assert_eq!(b64_decode(&b64_encode(&frame)).unwrap(), frame);
        assert!(b64_decode("not base64!").is_err());
    }
}
