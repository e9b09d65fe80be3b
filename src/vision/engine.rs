//! OCR engine
//!
//! PaddleOCR text detection (DBNet) and recognition (CRNN + CTC) executed
//! through ONNX Runtime. One engine instance is constructed per batch run;
//! model loading dominates per-image inference cost.

use anyhow::{Context, Result};
use image::{GrayImage, Luma, RgbaImage};
use imageproc::region_labelling::{connected_components, Connectivity};
use ndarray::{Array4, ArrayView2, ArrayView3};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

use super::models::{ModelFile, OcrModels};
use super::{DetectionSensitivity, TextReader, TextRegion};

/// Detection input is capped and padded to a stride-aligned size
const DET_MAX_SIDE: u32 = 960;
const DET_STRIDE: u32 = 32;
/// ImageNet normalization used by the detection model
const DET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const DET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Recognition input geometry (PP-OCRv3)
const REC_HEIGHT: u32 = 48;
const REC_MAX_WIDTH: u32 = 320;

/// Minimum connected-component extent (in probability-map pixels) kept as a
/// text candidate
const MIN_BOX_SIDE: u32 = 3;
/// Unclip ratio applied when growing tight text kernels back to full boxes
const UNCLIP_RATIO: f32 = 1.5;

/// OCR engine using PaddleOCR via ONNX Runtime
pub struct OcrEngine {
    det: Session,
    rec: Session,
    charset: Vec<String>,
}

impl OcrEngine {
    /// Initialize the engine, resolving (and if needed fetching) model files.
    pub fn new(models: &OcrModels) -> Result<Self> {
        let det_path = models.ensure(ModelFile::Detection)?;
        let rec_path = models.ensure(ModelFile::Recognition)?;
        let dict_path = models.ensure(ModelFile::Dictionary)?;
        Self::from_paths(&det_path, &rec_path, &dict_path)
    }

    /// Initialize the engine from explicit model paths.
    pub fn from_paths(det_path: &Path, rec_path: &Path, dict_path: &Path) -> Result<Self> {
        info!("Loading OCR models from {:?}", det_path.parent());

        let det = load_session(det_path)?;
        let rec = load_session(rec_path)?;

        let dict = std::fs::read_to_string(dict_path)
            .with_context(|| format!("failed to read character dictionary {dict_path:?}"))?;
        let charset: Vec<String> = dict.lines().map(|l| l.to_string()).collect();
        if charset.is_empty() {
            anyhow::bail!("character dictionary {dict_path:?} is empty");
        }

        info!("OCR engine initialized ({} recognition classes)", charset.len());
        Ok(Self { det, rec, charset })
    }

    /// Run text detection, returning candidate boxes in input coordinates.
    fn detect(
        &mut self,
        image: &RgbaImage,
        sensitivity: DetectionSensitivity,
    ) -> Result<Vec<(u32, u32, u32, u32)>> {
        let (width, height) = image.dimensions();
        if width < 8 || height < 8 {
            return Ok(vec![]);
        }

        let scale = (DET_MAX_SIDE as f32 / width.max(height) as f32).min(1.0);
        let target_w = align_to_stride((width as f32 * scale).round() as u32);
        let target_h = align_to_stride((height as f32 * scale).round() as u32);

        let resized = image::imageops::resize(
            image,
            target_w,
            target_h,
            image::imageops::FilterType::Triangle,
        );

        let mut input = Array4::<f32>::zeros((1, 3, target_h as usize, target_w as usize));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                input[[0, c, y as usize, x as usize]] =
                    (pixel.0[c] as f32 / 255.0 - DET_MEAN[c]) / DET_STD[c];
            }
        }

        let (raw, _) = input.into_raw_vec_and_offset();
        let tensor = Tensor::from_array((
            [1usize, 3, target_h as usize, target_w as usize],
            raw,
        ))?;
        let outputs = self.det.run(ort::inputs![tensor])?;
        let (shape, probs) = outputs[0].try_extract_tensor::<f32>()?;

        let map_h = shape[shape.len() - 2] as usize;
        let map_w = shape[shape.len() - 1] as usize;

        let boxes = probability_map_boxes(probs, map_w, map_h, sensitivity);
        debug!(
            "Detection: {} candidate boxes on a {}x{} map",
            boxes.len(),
            map_w,
            map_h
        );

        // Map from probability-map coordinates back onto the input image
        let scale_x = width as f32 / map_w as f32;
        let scale_y = height as f32 / map_h as f32;
        Ok(boxes
            .into_iter()
            .map(|(bx, by, bw, bh)| {
                let x = ((bx as f32 * scale_x) as u32).min(width - 1);
                let y = ((by as f32 * scale_y) as u32).min(height - 1);
                let w = ((bw as f32 * scale_x).ceil() as u32).clamp(1, width - x);
                let h = ((bh as f32 * scale_y).ceil() as u32).clamp(1, height - y);
                (x, y, w, h)
            })
            .collect())
    }

    /// Run text recognition on one detected box.
    fn recognize(
        &mut self,
        image: &RgbaImage,
        bounds: (u32, u32, u32, u32),
    ) -> Result<(String, f32)> {
        let (x, y, w, h) = bounds;
        let patch = super::preprocess::crop(image, x, y, w, h);
        let (pw, ph) = patch.dimensions();

        let scaled_w = ((pw as f32 * REC_HEIGHT as f32 / ph as f32).ceil() as u32)
            .clamp(1, REC_MAX_WIDTH);
        let resized = image::imageops::resize(
            &patch,
            scaled_w,
            REC_HEIGHT,
            image::imageops::FilterType::Triangle,
        );

        // Normalized to [-1, 1], zero-padded out to the fixed input width
        let mut input =
            Array4::<f32>::zeros((1, 3, REC_HEIGHT as usize, REC_MAX_WIDTH as usize));
        for (px, py, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                input[[0, c, py as usize, px as usize]] =
                    (pixel.0[c] as f32 / 255.0 - 0.5) / 0.5;
            }
        }

        let (raw, _) = input.into_raw_vec_and_offset();
        let tensor = Tensor::from_array((
            [1usize, 3, REC_HEIGHT as usize, REC_MAX_WIDTH as usize],
            raw,
        ))?;
        let outputs = self.rec.run(ort::inputs![tensor])?;
        let (shape, logits) = outputs[0].try_extract_tensor::<f32>()?;

        let steps = shape[1] as usize;
        let classes = shape[2] as usize;
        let view = ArrayView3::from_shape((1, steps, classes), logits)
            .context("unexpected recognition output shape")?;

        Ok(ctc_greedy_decode(view.index_axis_move(ndarray::Axis(0), 0), &self.charset))
    }
}

impl TextReader for OcrEngine {
    fn read_text(
        &mut self,
        image: &RgbaImage,
        sensitivity: DetectionSensitivity,
    ) -> Result<Vec<TextRegion>> {
        let boxes = self.detect(image, sensitivity)?;

        let mut regions = Vec::with_capacity(boxes.len());
        for bounds in boxes {
            let (text, confidence) = self.recognize(image, bounds)?;
            if !text.is_empty() {
                regions.push(TextRegion {
                    text,
                    bounds,
                    confidence,
                });
            }
        }
        Ok(regions)
    }
}

/// Build an ONNX session with the standard optimization settings.
fn load_session(path: &Path) -> Result<Session> {
    Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(4)?
        .commit_from_file(path)
        .with_context(|| format!("failed to load ONNX model {path:?}"))
}

/// Round a dimension up to the detection stride (minimum one stride).
fn align_to_stride(dim: u32) -> u32 {
    let dim = dim.max(DET_STRIDE);
    dim.div_ceil(DET_STRIDE) * DET_STRIDE
}

/// Extract scored, unclipped candidate boxes from a detection probability map.
fn probability_map_boxes(
    probs: &[f32],
    map_w: usize,
    map_h: usize,
    sensitivity: DetectionSensitivity,
) -> Vec<(u32, u32, u32, u32)> {
    let mut mask = GrayImage::new(map_w as u32, map_h as u32);
    for y in 0..map_h {
        for x in 0..map_w {
            if probs[y * map_w + x] > sensitivity.binarize_threshold {
                mask.put_pixel(x as u32, y as u32, Luma([255u8]));
            }
        }
    }

    let labels = connected_components(&mask, Connectivity::Eight, Luma([0u8]));

    struct Component {
        min_x: u32,
        min_y: u32,
        max_x: u32,
        max_y: u32,
        score_sum: f64,
        pixels: u32,
    }

    let mut components: HashMap<u32, Component> = HashMap::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let id = label.0[0];
        if id == 0 {
            continue;
        }
        let prob = probs[y as usize * map_w + x as usize] as f64;
        let entry = components.entry(id).or_insert(Component {
            min_x: x,
            min_y: y,
            max_x: x,
            max_y: y,
            score_sum: 0.0,
            pixels: 0,
        });
        entry.min_x = entry.min_x.min(x);
        entry.min_y = entry.min_y.min(y);
        entry.max_x = entry.max_x.max(x);
        entry.max_y = entry.max_y.max(y);
        entry.score_sum += prob;
        entry.pixels += 1;
    }

    let mut boxes: Vec<(u32, u32, u32, u32)> = components
        .values()
        .filter_map(|c| {
            let w = c.max_x - c.min_x + 1;
            let h = c.max_y - c.min_y + 1;
            if w < MIN_BOX_SIDE || h < MIN_BOX_SIDE {
                return None;
            }
            let score = c.score_sum / c.pixels as f64;
            if score < sensitivity.box_threshold as f64 {
                return None;
            }
            Some(unclip_box(
                c.min_x,
                c.min_y,
                w,
                h,
                map_w as u32,
                map_h as u32,
            ))
        })
        .collect();

    // Reading order: top-to-bottom, then left-to-right
    boxes.sort_by_key(|&(x, y, _, _)| (y, x));
    boxes
}

/// Grow a tight detection kernel back to the full text extent.
///
/// The detection model shrinks text regions during training; the standard
/// inverse offset for a rectangle is `area * ratio / perimeter`.
fn unclip_box(
    x: u32,
    y: u32,
    w: u32,
    h: u32,
    map_w: u32,
    map_h: u32,
) -> (u32, u32, u32, u32) {
    let offset =
        ((w as f32 * h as f32 * UNCLIP_RATIO) / (2.0 * (w as f32 + h as f32))).round() as u32;
    let new_x = x.saturating_sub(offset);
    let new_y = y.saturating_sub(offset);
    let new_w = (w + 2 * offset).min(map_w - new_x);
    let new_h = (h + 2 * offset).min(map_h - new_y);
    (new_x, new_y, new_w, new_h)
}

/// Greedy CTC decode of a (timesteps x classes) probability matrix.
///
/// Class 0 is the CTC blank; class `charset.len() + 1` is the appended space
/// class. Confidence is the mean probability of the emitted characters.
fn ctc_greedy_decode(logits: ArrayView2<f32>, charset: &[String]) -> (String, f32) {
    let mut text = String::new();
    let mut emitted_probs = Vec::new();
    let mut previous = 0usize;

    for step in logits.rows() {
        let (best_class, best_prob) = step
            .iter()
            .enumerate()
            .fold((0usize, f32::MIN), |(bi, bp), (i, &p)| {
                if p > bp {
                    (i, p)
                } else {
                    (bi, bp)
                }
            });

        if best_class != 0 && best_class != previous {
            let char_index = best_class - 1;
            if char_index < charset.len() {
                text.push_str(&charset[char_index]);
            } else {
                text.push(' ');
            }
            emitted_probs.push(best_prob);
        }
        previous = best_class;
    }

    let confidence = if emitted_probs.is_empty() {
        0.0
    } else {
        emitted_probs.iter().sum::<f32>() / emitted_probs.len() as f32
    };
    (text, confidence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn charset() -> Vec<String> {
        "0123456789C".chars().map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_align_to_stride() {
        assert_eq!(align_to_stride(0), 32);
        assert_eq!(align_to_stride(32), 32);
        assert_eq!(align_to_stride(33), 64);
        assert_eq!(align_to_stride(960), 960);
    }

    #[test]
    fn test_ctc_collapses_repeats_and_blanks() {
        // Timesteps emit: '1' '1' blank '2' '2' -> "12"
        let mut logits = Array2::<f32>::zeros((5, 12));
        logits[[0, 2]] = 0.9; // '1'
        logits[[1, 2]] = 0.8; // '1' repeated
        logits[[2, 0]] = 0.9; // blank
        logits[[3, 3]] = 0.7; // '2'
        logits[[4, 3]] = 0.6; // '2' repeated
        let (text, confidence) = ctc_greedy_decode(logits.view(), &charset());
        assert_eq!(text, "12");
        assert!((confidence - 0.8).abs() < 1e-6); // mean of 0.9 and 0.7
    }

    #[test]
    fn test_ctc_blank_separated_repeat_survives() {
        // '8' blank '8' -> "88"
        let mut logits = Array2::<f32>::zeros((3, 12));
        logits[[0, 9]] = 0.9;
        logits[[1, 0]] = 0.9;
        logits[[2, 9]] = 0.9;
        let (text, _) = ctc_greedy_decode(logits.view(), &charset());
        assert_eq!(text, "88");
    }

    #[test]
    fn test_ctc_all_blank_is_empty() {
        let mut logits = Array2::<f32>::zeros((4, 12));
        for t in 0..4 {
            logits[[t, 0]] = 1.0;
        }
        let (text, confidence) = ctc_greedy_decode(logits.view(), &charset());
        assert!(text.is_empty());
        assert_eq!(confidence, 0.0);
    }

    #[test]
    fn test_probability_map_box_extraction() {
        // A confident 4x4 blob in a 16x16 map
        let mut probs = vec![0.0f32; 16 * 16];
        for y in 4..8 {
            for x in 4..8 {
                probs[y * 16 + x] = 0.95;
            }
        }
        let sensitivity = DetectionSensitivity {
            binarize_threshold: 0.5,
            box_threshold: 0.6,
        };
        let boxes = probability_map_boxes(&probs, 16, 16, sensitivity);
        assert_eq!(boxes.len(), 1);
        let (x, y, w, h) = boxes[0];
        // Unclipped box must still contain the original blob
        assert!(x <= 4 && y <= 4);
        assert!(x + w >= 8 && y + h >= 8);
    }

    #[test]
    fn test_probability_map_low_score_rejected() {
        let mut probs = vec![0.0f32; 16 * 16];
        for y in 4..8 {
            for x in 4..8 {
                probs[y * 16 + x] = 0.55;
            }
        }
        let sensitivity = DetectionSensitivity {
            binarize_threshold: 0.5,
            box_threshold: 0.9,
        };
        assert!(probability_map_boxes(&probs, 16, 16, sensitivity).is_empty());
    }

    #[test]
    fn test_unclip_box_grows_and_clamps() {
        let (x, y, w, h) = unclip_box(2, 2, 8, 4, 16, 16);
        assert!(x < 2 && y < 2);
        assert!(w > 8 && h > 4);
        assert!(x + w <= 16 && y + h <= 16);
    }
}
