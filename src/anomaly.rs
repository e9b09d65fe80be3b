//! Sliding-window anomaly detection
//!
//! Overlay temperature follows a smooth diurnal cycle, so a global threshold
//! cannot tell a hot afternoon from a Fahrenheit mis-read. Instead, a local
//! cubic curve is fit around every point with an outlier-robust loss, and the
//! point's residual against that curve is scored with deployment-wide robust
//! statistics (median / MAD). Bad readings then stand out regardless of
//! season or time of day, and cannot drag the curve toward themselves.

use chrono::NaiveDateTime;
use nalgebra::{DMatrix, DVector};
use serde::Serialize;
use statrs::statistics::{Data, Median};
use thiserror::Error;
use tracing::{debug, info};

use crate::table::{group_by_deployment, ImageRecord};

/// Guards the z-score division when every residual is identical
const MAD_EPSILON: f64 = 1e-8;
/// Consistency factor putting the MAD on the standard-deviation scale
const MAD_TO_SIGMA: f64 = 1.4826;

/// Window and regression settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowConfig {
    /// Nominal window size in samples; shrunk to `len/3` for short series
    pub window_samples: usize,
    /// Windows smaller than this leave the centre point unscored
    pub min_window_points: usize,
    /// Polynomial degree of the local fit
    pub poly_degree: usize,
    /// Huber loss transition point, in robust-scale units
    pub huber_epsilon: f64,
    /// Iteration cap for the reweighted fit
    pub max_iterations: usize,
    /// Deployments with fewer valid readings are skipped entirely
    pub min_deployment_points: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            window_samples: 48,
            min_window_points: 10,
            poly_degree: 3,
            huber_epsilon: 1.35,
            max_iterations: 100,
            min_deployment_points: 20,
        }
    }
}

/// One scored reading.
#[derive(Debug, Clone, Serialize)]
pub struct ResidualPoint {
    pub filename: String,
    pub deployment_id: String,
    pub timestamp: String,
    pub temperature: f64,
    pub predicted: f64,
    pub residual: f64,
    pub z_score: f64,
}

/// Scored residuals for one deployment.
#[derive(Debug, Clone)]
pub struct DeploymentScores {
    pub deployment_id: String,
    pub points: Vec<ResidualPoint>,
    pub median_residual: f64,
    pub mad_residual: f64,
    /// Windows whose robust fit failed; those points carry no score
    pub fit_failures: usize,
    /// Points skipped because the available window was too small
    pub skipped_windows: usize,
}

/// Outcome of analyzing one deployment.
#[derive(Debug, Clone)]
pub enum DeploymentAnalysis {
    /// Too few valid readings for windowed regression
    Skipped {
        deployment_id: String,
        valid_points: usize,
    },
    Scored(DeploymentScores),
}

/// Aggregate outcome across every deployment in a table.
#[derive(Debug, Clone, Default)]
pub struct AnalysisReport {
    pub deployments: Vec<DeploymentScores>,
    /// Under-populated deployments, with their valid-reading counts
    pub skipped: Vec<(String, usize)>,
    pub fit_failures: usize,
}

/// Robust regression failure for a single window. The affected point is left
/// unscored; the run continues.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FitError {
    #[error("window has {got} points, need at least {needed}")]
    TooFewPoints { needed: usize, got: usize },
    #[error("degenerate window: all sample times coincide")]
    DegenerateWindow,
    #[error("linear solve failed: {0}")]
    NumericalFailure(String),
}

/// Analyze every deployment in a merged table.
pub fn analyze_all(records: &[ImageRecord], config: &WindowConfig) -> AnalysisReport {
    let mut report = AnalysisReport::default();

    for (deployment_id, group) in group_by_deployment(records) {
        match analyze_deployment(&deployment_id, &group, config) {
            DeploymentAnalysis::Skipped {
                deployment_id,
                valid_points,
            } => {
                debug!(
                    "Skipping {deployment_id}: {valid_points} valid readings < {}",
                    config.min_deployment_points
                );
                report.skipped.push((deployment_id, valid_points));
            }
            DeploymentAnalysis::Scored(scores) => {
                report.fit_failures += scores.fit_failures;
                report.deployments.push(scores);
            }
        }
    }

    info!(
        "Anomaly analysis: {} deployments scored, {} skipped as under-populated, {} window fits failed",
        report.deployments.len(),
        report.skipped.len(),
        report.fit_failures
    );
    report
}

/// Analyze one deployment's chronologically sorted records.
pub fn analyze_deployment(
    deployment_id: &str,
    records: &[&ImageRecord],
    config: &WindowConfig,
) -> DeploymentAnalysis {
    // Valid series: readings that exist and whose timestamps decode
    let mut valid: Vec<(&ImageRecord, NaiveDateTime, f64)> = Vec::new();
    for record in records {
        let Some(temperature) = record.temperature else {
            continue;
        };
        match NaiveDateTime::parse_from_str(&record.timestamp, "%Y%m%d%H%M%S") {
            Ok(datetime) => valid.push((record, datetime, temperature as f64)),
            Err(_) => {
                debug!(
                    "timestamp {:?} in {:?} is not a calendar time; excluded",
                    record.timestamp, record.filename
                );
            }
        }
    }

    if valid.len() < config.min_deployment_points {
        return DeploymentAnalysis::Skipped {
            deployment_id: deployment_id.to_string(),
            valid_points: valid.len(),
        };
    }

    let start = valid[0].1;
    let hours: Vec<f64> = valid
        .iter()
        .map(|(_, dt, _)| (*dt - start).num_seconds() as f64 / 3600.0)
        .collect();
    let temps: Vec<f64> = valid.iter().map(|(_, _, t)| *t).collect();

    let n = valid.len();
    let window_size = config.window_samples.min(n / 3);

    let mut scored: Vec<(usize, f64, f64)> = Vec::new();
    let mut fit_failures = 0;
    let mut skipped_windows = 0;

    for i in 0..n {
        let window_start = i.saturating_sub(window_size / 2);
        let window_end = (i + window_size / 2 + 1).min(n);
        if window_end - window_start < config.min_window_points {
            skipped_windows += 1;
            continue;
        }

        let xs = &hours[window_start..window_end];
        let ys = &temps[window_start..window_end];

        match fit_polynomial_huber(
            xs,
            ys,
            config.poly_degree,
            config.huber_epsilon,
            config.max_iterations,
        ) {
            Ok(fit) => {
                let predicted = fit.predict(hours[i]);
                scored.push((i, predicted, temps[i] - predicted));
            }
            Err(err) => {
                debug!("window fit failed at {}: {err}", valid[i].0.filename);
                fit_failures += 1;
            }
        }
    }

    if scored.is_empty() {
        return DeploymentAnalysis::Scored(DeploymentScores {
            deployment_id: deployment_id.to_string(),
            points: Vec::new(),
            median_residual: 0.0,
            mad_residual: 0.0,
            fit_failures,
            skipped_windows,
        });
    }

    let residuals: Vec<f64> = scored.iter().map(|(_, _, r)| *r).collect();
    let median_residual = median(&residuals);
    let deviations: Vec<f64> = residuals.iter().map(|r| (r - median_residual).abs()).collect();
    let mad_residual = median(&deviations);

    let points = scored
        .into_iter()
        .map(|(i, predicted, residual)| {
            let record = valid[i].0;
            ResidualPoint {
                filename: record.filename.clone(),
                deployment_id: record.deployment_id.clone(),
                timestamp: record.timestamp.clone(),
                temperature: temps[i],
                predicted,
                residual,
                z_score: (residual - median_residual).abs() / (mad_residual + MAD_EPSILON),
            }
        })
        .collect();

    DeploymentAnalysis::Scored(DeploymentScores {
        deployment_id: deployment_id.to_string(),
        points,
        median_residual,
        mad_residual,
        fit_failures,
        skipped_windows,
    })
}

/// Points whose robust z-score exceeds the threshold.
///
/// The threshold is caller-supplied on purpose: extreme detection (default
/// 10.0) and sensitive review listings (default 2.5) run over the same scores.
pub fn flag_anomalies<'a>(scores: &'a DeploymentScores, threshold: f64) -> Vec<&'a ResidualPoint> {
    scores
        .points
        .iter()
        .filter(|p| p.z_score > threshold)
        .collect()
}

/// A fitted polynomial in a normalized abscissa.
#[derive(Debug, Clone)]
pub struct PolyFit {
    coeffs: DVector<f64>,
    offset: f64,
    scale: f64,
}

impl PolyFit {
    /// Evaluate the fitted curve at `x` (original coordinates).
    pub fn predict(&self, x: f64) -> f64 {
        let t = (x - self.offset) * self.scale;
        // Horner evaluation, highest degree first
        self.coeffs
            .iter()
            .rev()
            .fold(0.0, |acc, &c| acc * t + c)
    }
}

/// Fit a polynomial with a Huber loss via iteratively reweighted least squares.
///
/// The abscissa is centred and scaled before building the design matrix; raw
/// hours-from-start values raised to the cube are ill-conditioned for long
/// series. The robust scale is re-estimated each iteration from the MAD of
/// the residuals.
pub fn fit_polynomial_huber(
    x: &[f64],
    y: &[f64],
    degree: usize,
    epsilon: f64,
    max_iterations: usize,
) -> Result<PolyFit, FitError> {
    let n = x.len();
    let terms = degree + 1;
    if n < terms + 1 {
        return Err(FitError::TooFewPoints {
            needed: terms + 1,
            got: n,
        });
    }

    let offset = x.iter().sum::<f64>() / n as f64;
    let spread = x
        .iter()
        .map(|v| (v - offset).abs())
        .fold(0.0f64, f64::max);
    if spread < 1e-9 {
        return Err(FitError::DegenerateWindow);
    }
    let scale = 1.0 / spread;

    let design = DMatrix::from_fn(n, terms, |row, col| {
        ((x[row] - offset) * scale).powi(col as i32)
    });
    let observations = DVector::from_column_slice(y);

    let mut weights = vec![1.0f64; n];
    let mut coeffs: Option<DVector<f64>> = None;

    for _ in 0..max_iterations {
        // Weighted solve: scale each equation by sqrt(w)
        let mut weighted_design = design.clone();
        let mut weighted_obs = observations.clone();
        for row in 0..n {
            let w = weights[row].sqrt();
            for col in 0..terms {
                weighted_design[(row, col)] *= w;
            }
            weighted_obs[row] *= w;
        }

        let solution = weighted_design
            .svd(true, true)
            .solve(&weighted_obs, 1e-12)
            .map_err(|e| FitError::NumericalFailure(e.to_string()))?;
        if solution.iter().any(|c| !c.is_finite()) {
            return Err(FitError::NumericalFailure(
                "non-finite coefficients".to_string(),
            ));
        }

        let residuals: Vec<f64> = (0..n)
            .map(|row| y[row] - design.row(row).transpose().dot(&solution))
            .collect();

        let converged = coeffs
            .as_ref()
            .map(|prev| (&solution - prev).norm() < 1e-8 * (1.0 + prev.norm()))
            .unwrap_or(false);
        coeffs = Some(solution);
        if converged {
            break;
        }

        let abs_dev: Vec<f64> = {
            let med = median(&residuals);
            residuals.iter().map(|r| (r - med).abs()).collect()
        };
        let robust_scale = MAD_TO_SIGMA * median(&abs_dev);
        if robust_scale < 1e-9 {
            // Residuals have collapsed; the fit is as good as it gets
            break;
        }

        for (row, residual) in residuals.iter().enumerate() {
            let u = residual.abs() / robust_scale;
            weights[row] = if u <= epsilon { 1.0 } else { epsilon / u };
        }
    }

    match coeffs {
        Some(coeffs) => Ok(PolyFit {
            coeffs,
            offset,
            scale,
        }),
        None => Err(FitError::NumericalFailure("no iterations ran".to_string())),
    }
}

fn median(values: &[f64]) -> f64 {
    Data::new(values.to_vec()).median()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::ExtractionStatus;

    fn record(deployment: &str, timestamp: &str, temperature: Option<i32>) -> ImageRecord {
        ImageRecord {
            filename: format!("{deployment}_{timestamp}.JPG"),
            deployment_id: deployment.to_string(),
            timestamp: timestamp.to_string(),
            temperature,
            confidence: 0.9,
            extraction_status: ExtractionStatus::Success,
        }
    }

    /// Hourly timestamps starting 2023-06-01 00:00:00.
    fn hourly_timestamp(hour_index: usize) -> String {
        let day = 1 + hour_index / 24;
        let hour = hour_index % 24;
        format!("202306{day:02}{hour:02}0000")
    }

    fn diurnal_deployment(name: &str, hours: usize, spike_at: Option<(usize, i32)>) -> Vec<ImageRecord> {
        (0..hours)
            .map(|h| {
                let base = 20.0 + 5.0 * (2.0 * std::f64::consts::PI * h as f64 / 24.0).sin();
                let temp = match spike_at {
                    Some((at, value)) if at == h => value,
                    _ => base.round() as i32,
                };
                record(name, &hourly_timestamp(h), Some(temp))
            })
            .collect()
    }

    #[test]
    fn test_fit_recovers_exact_cubic() {
        let x: Vec<f64> = (0..20).map(|i| i as f64).collect();
        let y: Vec<f64> = x.iter().map(|v| 1.0 + 2.0 * v - 0.3 * v * v + 0.01 * v * v * v).collect();
        let fit = fit_polynomial_huber(&x, &y, 3, 1.35, 100).unwrap();
        for &v in &[0.0, 7.5, 19.0] {
            let expected = 1.0 + 2.0 * v - 0.3 * v * v + 0.01 * v * v * v;
            assert!((fit.predict(v) - expected).abs() < 1e-6, "at {v}");
        }
    }

    #[test]
    fn test_fit_shrugs_off_planted_outliers() {
        let x: Vec<f64> = (0..30).map(|i| i as f64).collect();
        let mut y: Vec<f64> = x.iter().map(|v| 10.0 + 0.5 * v).collect();
        y[10] = 90.0;
        y[20] = -40.0;
        let fit = fit_polynomial_huber(&x, &y, 3, 1.35, 100).unwrap();
        // Predictions at the corrupted abscissae stay near the clean line
        assert!((fit.predict(10.0) - 15.0).abs() < 1.0);
        assert!((fit.predict(20.0) - 20.0).abs() < 1.0);
    }

    #[test]
    fn test_fit_rejects_degenerate_window() {
        let x = vec![5.0; 12];
        let y = vec![1.0; 12];
        assert_eq!(
            fit_polynomial_huber(&x, &y, 3, 1.35, 100).unwrap_err(),
            FitError::DegenerateWindow
        );
    }

    #[test]
    fn test_fit_rejects_too_few_points() {
        let x = vec![1.0, 2.0, 3.0];
        let y = vec![1.0, 2.0, 3.0];
        assert!(matches!(
            fit_polynomial_huber(&x, &y, 3, 1.35, 100),
            Err(FitError::TooFewPoints { .. })
        ));
    }

    #[test]
    fn test_underpopulated_deployment_skipped() {
        let records = diurnal_deployment("TINY", 12, None);
        let refs: Vec<&ImageRecord> = records.iter().collect();
        let analysis = analyze_deployment("TINY", &refs, &WindowConfig::default());
        assert!(matches!(
            analysis,
            DeploymentAnalysis::Skipped { valid_points: 12, .. }
        ));
    }

    #[test]
    fn test_missing_readings_do_not_count_as_valid() {
        let mut records = diurnal_deployment("GAPPY", 25, None);
        for record in records.iter_mut().take(10) {
            record.temperature = None;
        }
        let refs: Vec<&ImageRecord> = records.iter().collect();
        let analysis = analyze_deployment("GAPPY", &refs, &WindowConfig::default());
        assert!(matches!(
            analysis,
            DeploymentAnalysis::Skipped { valid_points: 15, .. }
        ));
    }

    #[test]
    fn test_single_spike_is_the_only_extreme_flag() {
        // 30 daily-cycle readings oscillating 15-25 °C plus one 85 °C reading
        let records = diurnal_deployment("X1", 31, Some((15, 85)));
        let refs: Vec<&ImageRecord> = records.iter().collect();
        let DeploymentAnalysis::Scored(scores) =
            analyze_deployment("X1", &refs, &WindowConfig::default())
        else {
            panic!("deployment should be scored");
        };

        let flagged = flag_anomalies(&scores, 10.0);
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].filename, records[15].filename);
        assert!(flagged[0].temperature >= 84.0);
        assert!(flagged[0].residual > 50.0);
    }

    #[test]
    fn test_raising_threshold_never_flags_more() {
        let records = diurnal_deployment("X1", 40, Some((20, 70)));
        let refs: Vec<&ImageRecord> = records.iter().collect();
        let DeploymentAnalysis::Scored(scores) =
            analyze_deployment("X1", &refs, &WindowConfig::default())
        else {
            panic!("deployment should be scored");
        };

        let mut previous = usize::MAX;
        for threshold in [1.0, 2.5, 5.0, 10.0, 50.0] {
            let count = flag_anomalies(&scores, threshold).len();
            assert!(count <= previous, "threshold {threshold} flagged more");
            previous = count;
        }
    }

    #[test]
    fn test_analyze_all_reports_skips() {
        let mut records = diurnal_deployment("BIG", 31, None);
        records.extend(diurnal_deployment("SMALL", 5, None));
        let report = analyze_all(&records, &WindowConfig::default());
        assert_eq!(report.deployments.len(), 1);
        assert_eq!(report.skipped, vec![("SMALL".to_string(), 5)]);
    }

    #[test]
    fn test_z_scores_are_nonnegative() {
        let records = diurnal_deployment("X1", 31, Some((15, 85)));
        let refs: Vec<&ImageRecord> = records.iter().collect();
        let DeploymentAnalysis::Scored(scores) =
            analyze_deployment("X1", &refs, &WindowConfig::default())
        else {
            panic!("deployment should be scored");
        };
        assert!(scores.points.iter().all(|p| p.z_score >= 0.0));
    }
}
