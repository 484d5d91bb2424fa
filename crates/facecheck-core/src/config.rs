//! Verification tunables: detector pyramid/grouping, match threshold, cascade location.
//!
//! Defaults reproduce the permissive development setup. Values can come from
//! a TOML file and be overridden by `FACECHECK_*` environment variables.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_SCALE_FACTOR: f64 = 1.05;
pub const DEFAULT_MIN_NEIGHBORS: u32 = 3;
pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.1;

const CASCADE_FILE_NAME: &str = "haarcascade_frontalface_default.xml";

/// Directories where OpenCV distributions install their cascade data.
const CASCADE_SEARCH_DIRS: [&str; 4] = [
    "/usr/share/opencv4/haarcascades",
    "/usr/share/opencv/haarcascades",
    "/usr/local/share/opencv4/haarcascades",
    "/usr/local/share/opencv/haarcascades",
];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("scale_factor must be a finite value greater than 1.0, got {0}")]
    ScaleFactor(f64),
    #[error("match_threshold must be finite, got {0}")]
    MatchThreshold(f64),
}

/// Parameters for the multi-scale cascade scan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorParams {
    /// Pyramid step between consecutive scales.
    pub scale_factor: f64,
    /// A grouped region survives only with strictly more raw hits than this.
    pub min_neighbors: u32,
    /// Smallest window side in source pixels; 0 disables the limit.
    pub min_face_size: u32,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            scale_factor: DEFAULT_SCALE_FACTOR,
            min_neighbors: DEFAULT_MIN_NEIGHBORS,
            min_face_size: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VerifyConfig {
    pub scale_factor: f64,
    pub min_neighbors: u32,
    pub min_face_size: u32,
    pub match_threshold: f64,
    /// Also require a face in the reference image.
    pub gate_on_reference_face: bool,
    pub cascade_path: PathBuf,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            scale_factor: DEFAULT_SCALE_FACTOR,
            min_neighbors: DEFAULT_MIN_NEIGHBORS,
            min_face_size: 0,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            gate_on_reference_face: false,
            cascade_path: default_cascade_path(),
        }
    }
}

impl VerifyConfig {
    pub fn from_toml_str(src: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(src)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let src = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&src)
    }

    /// Override fields from `FACECHECK_*` environment variables.
    pub fn apply_env(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = parsed(&lookup, "FACECHECK_SCALE_FACTOR") {
            self.scale_factor = v;
        }
        if let Some(v) = parsed(&lookup, "FACECHECK_MIN_NEIGHBORS") {
            self.min_neighbors = v;
        }
        if let Some(v) = parsed(&lookup, "FACECHECK_MIN_FACE_SIZE") {
            self.min_face_size = v;
        }
        if let Some(v) = parsed(&lookup, "FACECHECK_MATCH_THRESHOLD") {
            self.match_threshold = v;
        }
        if let Some(v) = lookup("FACECHECK_GATE_ON_REFERENCE_FACE") {
            self.gate_on_reference_face = v != "0";
        }
        if let Some(v) = lookup("FACECHECK_CASCADE_PATH") {
            self.cascade_path = PathBuf::from(v);
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.scale_factor.is_finite() || self.scale_factor <= 1.0 {
            return Err(ConfigError::ScaleFactor(self.scale_factor));
        }
        if !self.match_threshold.is_finite() {
            return Err(ConfigError::MatchThreshold(self.match_threshold));
        }
        Ok(())
    }

    pub fn detector_params(&self) -> DetectorParams {
        DetectorParams {
            scale_factor: self.scale_factor,
            min_neighbors: self.min_neighbors,
            min_face_size: self.min_face_size,
        }
    }
}

/// First installed OpenCV frontal-face cascade, else `models/` under the
/// working directory.
pub fn default_cascade_path() -> PathBuf {
    CASCADE_SEARCH_DIRS
        .iter()
        .map(|dir| Path::new(dir).join(CASCADE_FILE_NAME))
        .find(|p| p.exists())
        .unwrap_or_else(|| PathBuf::from("models").join(CASCADE_FILE_NAME))
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}
