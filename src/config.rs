//! Application configuration
//!
//! Pipeline settings stored in TOML format. Every section mirrors a stage of
//! the pipeline and carries defaults tuned on the field corpus.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::anomaly::WindowConfig;
use crate::extract::runner::RunnerConfig;
use crate::issues::IssueThresholds;

/// Pipeline settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Extraction and validation settings
    pub extraction: RunnerConfig,
    /// Sliding-window anomaly model settings
    pub anomaly: AnomalySettings,
    /// Issue classification thresholds
    pub issues: IssueThresholds,
    /// OCR model resolution settings
    pub models: ModelSettings,
}

/// Anomaly model settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalySettings {
    /// Nominal window size in samples
    pub window_samples: usize,
    /// Windows smaller than this leave the centre point unscored
    pub min_window_points: usize,
    /// Polynomial degree of the local fit
    pub poly_degree: usize,
    /// Huber loss transition point
    pub huber_epsilon: f64,
    /// Iteration cap for the reweighted fit
    pub max_iterations: usize,
    /// Deployments with fewer valid readings are skipped
    pub min_deployment_points: usize,
    /// z-score threshold for the issue report
    pub extreme_threshold: f64,
    /// z-score threshold for fine-grained review listings
    pub sensitive_threshold: f64,
}

impl Default for AnomalySettings {
    fn default() -> Self {
        let window = WindowConfig::default();
        Self {
            window_samples: window.window_samples,
            min_window_points: window.min_window_points,
            poly_degree: window.poly_degree,
            huber_epsilon: window.huber_epsilon,
            max_iterations: window.max_iterations,
            min_deployment_points: window.min_deployment_points,
            extreme_threshold: 10.0,
            sensitive_threshold: 2.5,
        }
    }
}

impl AnomalySettings {
    /// The window/regression subset consumed by the anomaly model.
    pub fn window_config(&self) -> WindowConfig {
        WindowConfig {
            window_samples: self.window_samples,
            min_window_points: self.min_window_points,
            poly_degree: self.poly_degree,
            huber_epsilon: self.huber_epsilon,
            max_iterations: self.max_iterations,
            min_deployment_points: self.min_deployment_points,
        }
    }
}

/// OCR model resolution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Directory holding det.onnx / rec.onnx / dict.txt; per-user data
    /// directory when unset
    pub model_dir: Option<PathBuf>,
    /// Fetch missing models from the model repository
    pub allow_download: bool,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_dir: None,
            allow_download: true,
        }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}
