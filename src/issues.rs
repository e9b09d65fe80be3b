//! Issue classification and triage ordering
//!
//! Folds failed extractions and flagged anomalies into one ranked worklist.
//! Classification is a pure reporting transform over the merged table and the
//! residual stream; nothing here writes back to source data.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, Median, Statistics};
use tracing::info;

use crate::anomaly::ResidualPoint;
use crate::table::{group_by_deployment, ImageRecord};

/// Readings at or above this are assumed to be Fahrenheit values that were
/// never converted (a 40 °C+ reading under a forest canopy is not weather)
const FAHRENHEIT_SUSPECT_MIN: f64 = 40.0;
/// Readings at or below this are assumed to be partial reads of the overlay
const LOW_READ_MAX: f64 = 2.0;
/// Valid neighbors consulted on each side when estimating a missing reading
const ESTIMATE_CONTEXT: usize = 3;

/// Fixed issue taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    FailedExtraction,
    FahrenheitConversion,
    ExtractionErrorLow,
    ExtremeOutlier,
}

/// Triage priority; `High` sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

/// One row of the triage worklist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub filename: String,
    pub deployment_id: String,
    pub timestamp: String,
    pub temperature: Option<f64>,
    pub residual: Option<f64>,
    pub z_score: Option<f64>,
    pub issue_type: IssueType,
    pub priority: Priority,
    pub action: String,
    /// Advisory placeholder for failed extractions; never written back
    pub estimated_temperature: Option<f64>,
    /// Spread of the neighboring readings behind the estimate
    pub context_std: Option<f64>,
}

/// Classification thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IssueThresholds {
    /// Inclusive lower bound for the Fahrenheit-conversion class (°C)
    pub fahrenheit_min: f64,
    /// Inclusive upper bound for the low-read class (°C)
    pub low_max: f64,
}

impl Default for IssueThresholds {
    fn default() -> Self {
        Self {
            fahrenheit_min: FAHRENHEIT_SUSPECT_MIN,
            low_max: LOW_READ_MAX,
        }
    }
}

/// Build the ranked issue list from both issue sources.
pub fn classify(
    records: &[ImageRecord],
    anomalous: &[&ResidualPoint],
    thresholds: &IssueThresholds,
) -> Vec<Issue> {
    let mut issues = failed_extraction_issues(records);
    issues.extend(anomalous.iter().map(|p| classify_anomaly(p, thresholds)));
    rank(&mut issues);

    info!(
        "Classified {} issues ({} failed extractions, {} anomalies)",
        issues.len(),
        issues
            .iter()
            .filter(|i| i.issue_type == IssueType::FailedExtraction)
            .count(),
        anomalous.len()
    );
    issues
}

/// Every record with a missing temperature becomes a high-priority issue with
/// an advisory estimate from its neighbors.
pub fn failed_extraction_issues(records: &[ImageRecord]) -> Vec<Issue> {
    let mut issues = Vec::new();

    for (_, group) in group_by_deployment(records) {
        for (index, record) in group.iter().enumerate() {
            if record.temperature.is_some() {
                continue;
            }

            let (estimate, spread) = estimate_from_neighbors(&group, index);
            issues.push(Issue {
                filename: record.filename.clone(),
                deployment_id: record.deployment_id.clone(),
                timestamp: record.timestamp.clone(),
                temperature: None,
                residual: None,
                z_score: None,
                issue_type: IssueType::FailedExtraction,
                priority: Priority::High,
                action: "manual_review_or_reprocess".to_string(),
                estimated_temperature: estimate,
                context_std: spread,
            });
        }
    }

    issues
}

/// Classify one flagged residual point by its observed value.
pub fn classify_anomaly(point: &ResidualPoint, thresholds: &IssueThresholds) -> Issue {
    let (issue_type, priority, action) = if point.temperature >= thresholds.fahrenheit_min {
        let celsius = (point.temperature - 32.0) * 5.0 / 9.0;
        (
            IssueType::FahrenheitConversion,
            Priority::High,
            format!("convert_to_celsius: {celsius:.1}°C"),
        )
    } else if point.temperature <= thresholds.low_max {
        (
            IssueType::ExtractionErrorLow,
            Priority::High,
            "manual_review_or_interpolate".to_string(),
        )
    } else {
        (
            IssueType::ExtremeOutlier,
            Priority::Medium,
            "manual_review".to_string(),
        )
    };

    Issue {
        filename: point.filename.clone(),
        deployment_id: point.deployment_id.clone(),
        timestamp: point.timestamp.clone(),
        temperature: Some(point.temperature),
        residual: Some(point.residual),
        z_score: Some(point.z_score),
        issue_type,
        priority,
        action,
        estimated_temperature: None,
        context_std: None,
    }
}

/// Median of up to three valid readings on each side of a missing one.
///
/// A robust local median is cheaper than the windowed regression and adequate
/// for a placeholder; the regression never sees missing readings anyway.
fn estimate_from_neighbors(
    group: &[&ImageRecord],
    index: usize,
) -> (Option<f64>, Option<f64>) {
    let start = index.saturating_sub(ESTIMATE_CONTEXT);
    let end = (index + ESTIMATE_CONTEXT + 1).min(group.len());

    let context: Vec<f64> = group[start..end]
        .iter()
        .filter_map(|r| r.temperature.map(f64::from))
        .collect();

    if context.is_empty() {
        return (None, None);
    }

    let estimate = Data::new(context.clone()).median();
    let spread = if context.len() > 1 {
        context.iter().population_std_dev()
    } else {
        0.0
    };
    (Some(estimate), Some(spread))
}

/// Order for human triage: priority first, then the most egregious z-scores;
/// unscored issues (failed extractions) after scored ones of equal priority.
fn rank(issues: &mut [Issue]) {
    issues.sort_by(|a, b| {
        a.priority.cmp(&b.priority).then_with(|| match (a.z_score, b.z_score) {
            (Some(za), Some(zb)) => zb.partial_cmp(&za).unwrap_or(std::cmp::Ordering::Equal),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        })
    });
}

/// Write the issues table to CSV.
pub fn write_issues(path: &std::path::Path, issues: &[Issue]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create issues table {path:?}"))?;
    for issue in issues {
        writer.serialize(issue)?;
    }
    writer.flush()?;
    info!("Wrote {} issues to {:?}", issues.len(), path);
    Ok(())
}
