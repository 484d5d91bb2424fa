use serde::{Deserialize, Serialize};

pub const MSG_DECODE_FAILED: &str = "Could not decode images.";
pub const MSG_NO_FACE_IN_CAPTURE: &str = "No face detected in capture! Please look at the camera.";
pub const MSG_NO_FACE_IN_REFERENCE: &str = "No face detected in reference image.";

/// Axis-aligned face rectangle in source image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl FaceRegion {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    pub fn right(&self) -> i32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.height
    }

    pub fn area(&self) -> i64 {
        self.width as i64 * self.height as i64
    }
}

/// Outcome of one reference/selfie comparison, as emitted on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    #[serde(rename = "match")]
    pub matched: bool,
    /// Histogram correlation in [-1, 1]; 0 on every short-circuit path.
    pub similarity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl VerificationResult {
    pub fn decode_failed() -> Self {
        Self::rejected(MSG_DECODE_FAILED)
    }

    pub fn no_face_in_capture() -> Self {
        Self::rejected(MSG_NO_FACE_IN_CAPTURE)
    }

    pub fn no_face_in_reference() -> Self {
        Self::rejected(MSG_NO_FACE_IN_REFERENCE)
    }

    /// Threshold decision over a computed similarity. `match` holds only
    /// when the score strictly exceeds the threshold.
    pub fn scored(similarity: f64, threshold: f64) -> Self {
        let matched = similarity > threshold;
        let message = if matched {
            format!("Face verified (Sim: {similarity:.2})")
        } else {
            format!("Face mismatch! Is that you? (Sim: {similarity:.2})")
        };
        Self {
            matched,
            similarity,
            message: Some(message),
            error: None,
        }
    }

    /// Internal fault absorbed at the pipeline boundary.
    pub fn fault(description: impl Into<String>) -> Self {
        Self {
            matched: false,
            similarity: 0.0,
            message: None,
            error: Some(description.into()),
        }
    }

    fn rejected(message: &str) -> Self {
        Self {
            matched: false,
            similarity: 0.0,
            message: Some(message.to_string()),
            error: None,
        }
    }
}
