//! Vision/OCR layer
//!
//! Reads the stamped text overlay out of image regions. The concrete engine is
//! PaddleOCR via ONNX Runtime; it sits behind the [`TextReader`] trait so the
//! extraction ladder (and its tests) never depend on a loaded model.

pub mod engine;
pub mod models;
pub mod preprocess;

use anyhow::Result;
use image::RgbaImage;
use serde::{Deserialize, Serialize};

pub use engine::OcrEngine;
pub use models::OcrModels;

/// Detected text region from OCR
#[derive(Debug, Clone)]
pub struct TextRegion {
    /// Detected text content
    pub text: String,
    /// Bounding box (x, y, width, height) in the coordinates of the input
    pub bounds: (u32, u32, u32, u32),
    /// Recognition confidence (0.0 - 1.0)
    pub confidence: f32,
}

/// Detection sensitivity for a single extraction attempt.
///
/// Strict settings reject marginal pixels quickly on clean frames; loose
/// settings pull faint overlay strokes out of dark or washed-out frames at the
/// cost of more spurious boxes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionSensitivity {
    /// Probability-map binarization threshold for text detection (0.0 - 1.0)
    pub binarize_threshold: f32,
    /// Minimum mean probability inside a candidate box (0.0 - 1.0)
    pub box_threshold: f32,
}

impl Default for DetectionSensitivity {
    fn default() -> Self {
        Self {
            binarize_threshold: 0.5,
            box_threshold: 0.6,
        }
    }
}

/// Text-recognition capability consumed by the extraction ladder.
///
/// Implementations are long-lived: construction is expensive (model load), so
/// one instance is created per batch run and passed by reference into every
/// per-image call.
pub trait TextReader {
    /// Detect and recognize text in an already-cropped, already-enhanced image.
    fn read_text(
        &mut self,
        image: &RgbaImage,
        sensitivity: DetectionSensitivity,
    ) -> Result<Vec<TextRegion>>;
}
