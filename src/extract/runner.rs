//! Batch extraction runner
//!
//! Drives the extraction ladder across a file list. The OCR engine is
//! constructed once per run and shared by reference across every image:
//! engine construction dominates per-image cost, so re-initializing per file
//! would make corpus-sized batches infeasible.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{ExtractionOutcome, Extractor};
use crate::filename;
use crate::table::{ExtractionStatus, ImageRecord};
use crate::vision::TextReader;

/// Runner settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Lowest plausible overlay reading, inclusive (°C)
    pub min_temperature: i32,
    /// Highest plausible overlay reading, inclusive (°C)
    pub max_temperature: i32,
    /// Log progress every this many files
    pub progress_interval: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            min_temperature: 0,
            max_temperature: 100,
            progress_interval: 100,
        }
    }
}

/// Aggregate counts for one extraction run.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunSummary {
    /// Files handed to the runner
    pub total: usize,
    /// Records with a validated temperature
    pub success: usize,
    /// Records with no valid reading
    pub failed: usize,
    /// Extracted values rejected by the plausibility bound
    pub validation_failures: usize,
    /// Filenames that did not follow the naming convention (no record emitted)
    pub parse_errors: usize,
    /// Mean OCR confidence over successful records
    pub mean_confidence: f64,
}

/// Batch extraction runner.
pub struct BatchRunner {
    extractor: Extractor,
    config: RunnerConfig,
}

impl BatchRunner {
    pub fn new(extractor: Extractor, config: RunnerConfig) -> Self {
        Self { extractor, config }
    }

    /// Process every file in order, emitting one record per decodable name.
    ///
    /// A failed ladder result is terminal for that image in this pass;
    /// re-extraction is a separate, later run. An unreadable image aborts the
    /// run: that is an I/O failure, not a data-quality outcome.
    pub fn run(
        &self,
        files: &[PathBuf],
        reader: &mut dyn TextReader,
    ) -> Result<(Vec<ImageRecord>, RunSummary)> {
        let mut records = Vec::with_capacity(files.len());
        let mut summary = RunSummary {
            total: files.len(),
            ..RunSummary::default()
        };
        let mut confidence_sum = 0.0;

        info!("Processing {} images", files.len());

        for (index, path) in files.iter().enumerate() {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .with_context(|| format!("non-UTF8 image path {path:?}"))?;

            let parsed = match filename::parse(name) {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!("{err}; excluding from time-ordered analysis");
                    summary.parse_errors += 1;
                    continue;
                }
            };

            let image = image::open(path)
                .with_context(|| format!("failed to read image {path:?}"))?
                .to_rgba8();

            let record = match self.extractor.extract(&image, reader)? {
                ExtractionOutcome::Found { digits, confidence } => {
                    match self.validate(&digits) {
                        Some(temperature) => {
                            summary.success += 1;
                            confidence_sum += confidence as f64;
                            ImageRecord {
                                filename: name.to_string(),
                                deployment_id: parsed.deployment_id,
                                timestamp: parsed.timestamp,
                                temperature: Some(temperature),
                                confidence: confidence as f64,
                                extraction_status: ExtractionStatus::Success,
                            }
                        }
                        None => {
                            warn!("implausible reading {digits:?} in {name}; downgrading to failed");
                            summary.failed += 1;
                            summary.validation_failures += 1;
                            ImageRecord {
                                filename: name.to_string(),
                                deployment_id: parsed.deployment_id,
                                timestamp: parsed.timestamp,
                                temperature: None,
                                confidence: confidence as f64,
                                extraction_status: ExtractionStatus::Failed,
                            }
                        }
                    }
                }
                ExtractionOutcome::NotFound => {
                    summary.failed += 1;
                    ImageRecord {
                        filename: name.to_string(),
                        deployment_id: parsed.deployment_id,
                        timestamp: parsed.timestamp,
                        temperature: None,
                        confidence: 0.0,
                        extraction_status: ExtractionStatus::Failed,
                    }
                }
            };
            records.push(record);

            let processed = index + 1;
            if processed % self.config.progress_interval == 0 {
                info!("Processed {}/{} images", processed, files.len());
            }
        }

        summary.mean_confidence = if summary.success > 0 {
            confidence_sum / summary.success as f64
        } else {
            0.0
        };

        info!(
            "Extraction complete: {} total, {} success, {} failed ({} rejected by validation), {} unparseable names, success rate {:.1}%, mean confidence {:.2}",
            summary.total,
            summary.success,
            summary.failed,
            summary.validation_failures,
            summary.parse_errors,
            if summary.total > 0 {
                summary.success as f64 / summary.total as f64 * 100.0
            } else {
                0.0
            },
            summary.mean_confidence,
        );

        Ok((records, summary))
    }

    /// Plausibility bound for an overlay reading: an integer in
    /// `min_temperature..=max_temperature`.
    fn validate(&self, digits: &str) -> Option<i32> {
        let value: i32 = digits.parse().ok()?;
        (self.config.min_temperature..=self.config.max_temperature)
            .contains(&value)
            .then_some(value)
    }
}
