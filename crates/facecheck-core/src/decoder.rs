//! Base64 image payload decoding.

use base64::{engine::general_purpose, Engine as _};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("unreadable image: {0}")]
    Image(#[from] image::ImageError),
}

/// Strip a `data:<mime>;base64,` header, keeping everything after the last comma.
pub fn strip_data_uri(payload: &str) -> &str {
    match payload.rfind(',') {
        Some(idx) => &payload[idx + 1..],
        None => payload,
    }
}

/// Decode a payload into a 3-channel image. Alpha is dropped and grayscale
/// sources are expanded.
pub fn try_decode(payload: &str) -> Result<RgbImage, DecodeError> {
    let body: String = strip_data_uri(payload)
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    let bytes = general_purpose::STANDARD.decode(body)?;
    let image = image::load_from_memory(&bytes)?;
    Ok(image.to_rgb8())
}

/// Decode a payload, collapsing every failure into `None`.
pub fn decode_payload(payload: &str) -> Option<RgbImage> {
    match try_decode(payload) {
        Ok(image) => {
            tracing::debug!(width = image.width(), height = image.height(), "payload decoded");
            Some(image)
        }
        Err(e) => {
            tracing::debug!(error = %e, "payload rejected");
            None
        }
    }
}
