//! Temperature extraction from overlay text
//!
//! A single fixed crop does not survive field conditions: lighting, device
//! generation and overlay rendering vary enough that OCR confidence swings
//! wildly. The ladder tries cheap, strict configurations first and widens the
//! capture region while easing detection thresholds on each retry, stopping at
//! the first confident read.

pub mod runner;

use anyhow::{Context, Result};
use image::RgbaImage;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::vision::{preprocess, DetectionSensitivity, TextReader, TextRegion};

/// Region of interest as fractions of the full image dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegionSpec {
    /// Horizontal span, fractions of width (left, right)
    pub x_span: (f32, f32),
    /// Vertical span, fractions of height (top, bottom)
    pub y_span: (f32, f32),
}

impl RegionSpec {
    /// Resolve to a pixel rectangle (x, y, width, height) for an image size.
    pub fn to_pixels(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let x0 = (width as f32 * self.x_span.0) as u32;
        let x1 = (width as f32 * self.x_span.1) as u32;
        let y0 = (height as f32 * self.y_span.0) as u32;
        let y1 = (height as f32 * self.y_span.1) as u32;
        (x0, y0, x1.saturating_sub(x0).max(1), y1.saturating_sub(y0).max(1))
    }
}

/// One tier of the extraction ladder: where to look, how hard to enhance, and
/// how permissive detection is allowed to be.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExtractionStrategy {
    pub region: RegionSpec,
    /// Contrast enhancement factor (1.0 = untouched)
    pub contrast: f32,
    /// Brightness enhancement factor (1.0 = untouched)
    pub brightness: f32,
    pub sensitivity: DetectionSensitivity,
}

impl ExtractionStrategy {
    /// The standard four-tier ladder: strict and narrow first, loose and wide
    /// last. Overlay stamps sit in the bottom-left corner on every supported
    /// device generation.
    pub fn default_ladder() -> Vec<ExtractionStrategy> {
        vec![
            ExtractionStrategy {
                region: RegionSpec {
                    x_span: (0.0, 0.40),
                    y_span: (0.90, 1.0),
                },
                contrast: 1.5,
                brightness: 1.2,
                sensitivity: DetectionSensitivity {
                    binarize_threshold: 0.6,
                    box_threshold: 0.7,
                },
            },
            ExtractionStrategy {
                region: RegionSpec {
                    x_span: (0.0, 0.50),
                    y_span: (0.88, 1.0),
                },
                contrast: 2.0,
                brightness: 1.4,
                sensitivity: DetectionSensitivity {
                    binarize_threshold: 0.5,
                    box_threshold: 0.6,
                },
            },
            ExtractionStrategy {
                region: RegionSpec {
                    x_span: (0.0, 0.60),
                    y_span: (0.85, 1.0),
                },
                contrast: 1.8,
                brightness: 1.1,
                sensitivity: DetectionSensitivity {
                    binarize_threshold: 0.4,
                    box_threshold: 0.5,
                },
            },
            ExtractionStrategy {
                region: RegionSpec {
                    x_span: (0.0, 1.0),
                    y_span: (0.92, 1.0),
                },
                contrast: 1.2,
                brightness: 1.1,
                sensitivity: DetectionSensitivity {
                    binarize_threshold: 0.3,
                    box_threshold: 0.4,
                },
            },
        ]
    }
}

/// Outcome of running the ladder on one image.
///
/// "No match" is a data-level outcome, not an error: the ladder's termination
/// is a plain value check.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractionOutcome {
    /// A numeric pattern matched OCR output
    Found {
        /// The matched digit group, as read
        digits: String,
        /// OCR confidence of the matched detection
        confidence: f32,
    },
    /// No strategy produced a matching detection
    NotFound,
}

/// Ordered numeric patterns for the temperature readout, most specific first.
///
/// The overlay's degree glyph is tiny and frequently corrupted by OCR, so the
/// Celsius patterns accept `°`, an apostrophe, or a middle dot in its place.
struct OverlayPatterns {
    patterns: Vec<Regex>,
}

impl OverlayPatterns {
    fn new() -> Result<Self> {
        let sources = [
            // Digits immediately before a Celsius unit marker: "12 °C", "12'C", "12C"
            r"(?i)(\d+)\s*[°'·]?\s*C",
            // Labeled readout prefix: "T 12 °C / 53 °F"
            r"(?i)T\s+(\d+)\s*[°'·]?\s*C",
            // Dual Celsius/Fahrenheit readout, Celsius component only
            r"(?i)(\d+)\s*[°'·]?\s*C\s*/\s*\d+\s*[°'·]?\s*F",
            // Heavily corrupted unit glyph: digits near any symbol near a C
            r"(?i)(\d+)\s*[^\w\s]*\s*C(?:\s|/|\s*\d)",
        ];

        let patterns = sources
            .iter()
            .map(|s| Regex::new(s))
            .collect::<Result<Vec<_>, _>>()
            .context("invalid overlay temperature pattern")?;
        Ok(Self { patterns })
    }

    /// First pattern match, in list order, across all detections.
    fn find(&self, regions: &[TextRegion]) -> Option<(String, f32)> {
        for pattern in &self.patterns {
            for region in regions {
                if let Some(captures) = pattern.captures(&region.text) {
                    let digits = captures.get(1)?.as_str().to_string();
                    return Some((digits, region.confidence));
                }
            }
        }
        None
    }
}

/// The extraction ladder.
pub struct Extractor {
    strategies: Vec<ExtractionStrategy>,
    patterns: OverlayPatterns,
}

impl Extractor {
    /// Build an extractor over the standard four-tier ladder.
    pub fn new() -> Result<Self> {
        Self::with_strategies(ExtractionStrategy::default_ladder())
    }

    /// Build an extractor over a custom ladder, consulted top-to-bottom.
    pub fn with_strategies(strategies: Vec<ExtractionStrategy>) -> Result<Self> {
        anyhow::ensure!(!strategies.is_empty(), "extraction ladder is empty");
        Ok(Self {
            strategies,
            patterns: OverlayPatterns::new()?,
        })
    }

    /// Run the ladder against one decoded image.
    ///
    /// Returns on the first strategy whose OCR output matches a temperature
    /// pattern; later strategies are never attempted.
    pub fn extract(
        &self,
        image: &RgbaImage,
        reader: &mut dyn TextReader,
    ) -> Result<ExtractionOutcome> {
        let (width, height) = image.dimensions();

        for (tier, strategy) in self.strategies.iter().enumerate() {
            let (x, y, w, h) = strategy.region.to_pixels(width, height);
            let mut patch = preprocess::crop(image, x, y, w, h);
            preprocess::enhance(&mut patch, strategy.contrast, strategy.brightness);

            let regions = reader.read_text(&patch, strategy.sensitivity)?;
            if regions.is_empty() {
                continue;
            }

            if let Some((digits, confidence)) = self.patterns.find(&regions) {
                debug!(tier, digits, confidence, "overlay temperature matched");
                return Ok(ExtractionOutcome::Found { digits, confidence });
            }
        }

        Ok(ExtractionOutcome::NotFound)
    }
}
