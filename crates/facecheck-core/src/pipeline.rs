//! Decode → detect → score, with every short-circuit as an explicit stage.

use crate::config::{ConfigError, VerifyConfig};
use crate::decoder::decode_payload;
use crate::detector::{CascadeDetector, DetectorError, FaceDetector};
use crate::histogram;
use crate::types::VerificationResult;
use image::RgbImage;

/// The two decoded inputs of one verification.
#[derive(Debug, Clone)]
pub struct ImagePair {
    pub reference: RgbImage,
    pub selfie: RgbImage,
}

/// Which input lacked a face.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject {
    Reference,
    Selfie,
}

/// Pipeline position of one verification.
///
/// `DecodeFailed`, `NoFaceDetected` and `Scored` are terminal.
#[derive(Debug, Clone)]
pub enum Stage {
    Decoded(ImagePair),
    DecodeFailed,
    FacePresent(ImagePair),
    NoFaceDetected(Subject),
    Scored { similarity: f64, threshold: f64 },
}

impl Stage {
    pub fn decode(reference: &str, selfie: &str) -> Stage {
        let reference = decode_payload(reference);
        let selfie = decode_payload(selfie);
        match (reference, selfie) {
            (Some(reference), Some(selfie)) => Stage::Decoded(ImagePair { reference, selfie }),
            _ => Stage::DecodeFailed,
        }
    }

    /// Gate on the selfie containing a face, and on the reference as well
    /// when `gate_on_reference` is set. Other stages pass through.
    pub fn detect(self, detector: &dyn FaceDetector, gate_on_reference: bool) -> Result<Stage, DetectorError> {
        let Stage::Decoded(pair) = self else {
            return Ok(self);
        };

        let selfie_faces = detector.detect(&pair.selfie)?;
        tracing::debug!(faces = selfie_faces.len(), "selfie scanned");
        if selfie_faces.is_empty() {
            return Ok(Stage::NoFaceDetected(Subject::Selfie));
        }

        if gate_on_reference {
            let reference_faces = detector.detect(&pair.reference)?;
            tracing::debug!(faces = reference_faces.len(), "reference scanned");
            if reference_faces.is_empty() {
                return Ok(Stage::NoFaceDetected(Subject::Reference));
            }
        }

        Ok(Stage::FacePresent(pair))
    }

    pub fn score(self, threshold: f64) -> Stage {
        match self {
            Stage::FacePresent(pair) => Stage::Scored {
                similarity: histogram::similarity(&pair.reference, &pair.selfie),
                threshold,
            },
            other => other,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Stage::DecodeFailed | Stage::NoFaceDetected(_) | Stage::Scored { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Decoded(_) => "decoded",
            Stage::DecodeFailed => "decode_failed",
            Stage::FacePresent(_) => "face_present",
            Stage::NoFaceDetected(_) => "no_face_detected",
            Stage::Scored { .. } => "scored",
        }
    }

    pub fn into_result(self) -> VerificationResult {
        match self {
            Stage::DecodeFailed => VerificationResult::decode_failed(),
            Stage::NoFaceDetected(Subject::Selfie) => VerificationResult::no_face_in_capture(),
            Stage::NoFaceDetected(Subject::Reference) => VerificationResult::no_face_in_reference(),
            Stage::Scored {
                similarity,
                threshold,
            } => VerificationResult::scored(similarity, threshold),
            Stage::Decoded(_) | Stage::FacePresent(_) => {
                VerificationResult::fault("verification stopped before scoring")
            }
        }
    }
}

/// Stateless reference/selfie comparator.
pub struct Verifier {
    config: VerifyConfig,
    detector: Box<dyn FaceDetector>,
}

impl Verifier {
    /// Verifier over the process-wide cascade named by `config.cascade_path`.
    pub fn new(config: VerifyConfig) -> Result<Self, ConfigError> {
        let detector = CascadeDetector::shared(config.cascade_path.clone(), config.detector_params());
        Self::with_detector(config, Box::new(detector))
    }

    pub fn with_detector(config: VerifyConfig, detector: Box<dyn FaceDetector>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config, detector })
    }

    /// Drive the stages to a terminal one.
    pub fn run(&self, reference: &str, selfie: &str) -> Result<Stage, DetectorError> {
        let stage = Stage::decode(reference, selfie);
        tracing::debug!(stage = stage.name(), "decode finished");

        let stage = stage.detect(self.detector.as_ref(), self.config.gate_on_reference_face)?;
        tracing::debug!(stage = stage.name(), "detection finished");

        let stage = stage.score(self.config.match_threshold);
        if let Stage::Scored { similarity, .. } = &stage {
            tracing::debug!(similarity, "histograms compared");
        }
        Ok(stage)
    }

    /// Compare two payloads. Internal faults are folded into the result's
    /// `error` field and never escape.
    pub fn verify(&self, reference: &str, selfie: &str) -> VerificationResult {
        match self.run(reference, selfie) {
            Ok(stage) => {
                let result = stage.into_result();
                tracing::info!(matched = result.matched, similarity = result.similarity, "verification complete");
                result
            }
            Err(e) => {
                tracing::warn!(error = %e, "verification fault");
                VerificationResult::fault(e.to_string())
            }
        }
    }
}
