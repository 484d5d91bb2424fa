//! facecheck-core — Selfie verification against a reference photo.
//!
//! Decodes base64 image payloads, gates on a Haar cascade face detection
//! in the selfie and scores the pair by color histogram correlation.

pub mod cascade;
pub mod config;
pub mod decoder;
pub mod detector;
pub mod histogram;
pub mod pipeline;
pub mod types;

pub use config::VerifyConfig;
pub use detector::{CascadeDetector, FaceDetector};
pub use pipeline::{Stage, Verifier};
pub use types::{FaceRegion, VerificationResult};
