//! Record tables and the correction merge layer
//!
//! Every stage exchanges the same row shape: one record per image file, keyed
//! by filename. Extraction writes the base table; manual review tools produce
//! correction tables in the identical schema, merged in here by confidence.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// How a record's temperature came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    /// OCR read and validated
    Success,
    /// No valid reading; temperature is empty
    Failed,
    /// Entered by a human reviewer
    ManualEntry,
}

/// One image's extraction result.
///
/// Records are immutable once written; corrections supersede them through the
/// merge rather than editing in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub filename: String,
    pub deployment_id: String,
    /// Acquisition time as the raw 14-digit `YYYYMMDDHHMMSS` string. Fixed
    /// width, so lexicographic order is chronological order.
    pub timestamp: String,
    pub temperature: Option<i32>,
    pub confidence: f64,
    pub extraction_status: ExtractionStatus,
}

/// Load a record table from CSV.
pub fn load_table(path: &Path) -> Result<Vec<ImageRecord>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open record table {path:?}"))?;
    let mut records = Vec::new();
    for row in reader.deserialize() {
        let record: ImageRecord =
            row.with_context(|| format!("malformed row in record table {path:?}"))?;
        records.push(record);
    }
    Ok(records)
}

/// Write a record table to CSV.
pub fn write_table(path: &Path, records: &[ImageRecord]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create record table {path:?}"))?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    info!("Wrote {} records to {:?}", records.len(), path);
    Ok(())
}

/// Counts reported by a correction merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Override rows whose filename existed in the base table
    pub applied: usize,
    /// Override rows referencing a filename absent from the base table
    pub unmatched: usize,
}

/// Merge correction tables into a base table.
///
/// All rows are pooled, then exactly one record per filename is kept: the one
/// with the highest confidence, with ties resolved to the latest-applied
/// table. Manual entries carry confidence 1.0 by convention, so "manual wins
/// over OCR" needs no provenance flag. Output preserves base row order;
/// override-only filenames append in first-seen order.
pub fn merge_corrections(
    base: Vec<ImageRecord>,
    overrides: &[Vec<ImageRecord>],
) -> (Vec<ImageRecord>, MergeReport) {
    let base_filenames: HashSet<String> = base.iter().map(|r| r.filename.clone()).collect();

    let mut report = MergeReport::default();
    for table in overrides {
        for record in table {
            if base_filenames.contains(&record.filename) {
                report.applied += 1;
            } else {
                warn!(
                    "correction for {:?} does not match any base record",
                    record.filename
                );
                report.unmatched += 1;
            }
        }
    }

    // Pool base rows then overrides in application order, and stable-sort by
    // confidence ascending: the last record per filename is the keeper.
    let mut pooled: Vec<ImageRecord> = base;
    for table in overrides {
        pooled.extend(table.iter().cloned());
    }

    let mut order: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for record in &pooled {
        if seen.insert(record.filename.clone()) {
            order.push(record.filename.clone());
        }
    }

    let mut ranked = pooled;
    ranked.sort_by(|a, b| {
        a.confidence
            .partial_cmp(&b.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut winners: HashMap<String, ImageRecord> = HashMap::new();
    for record in ranked {
        winners.insert(record.filename.clone(), record);
    }

    let merged: Vec<ImageRecord> = order
        .into_iter()
        .filter_map(|filename| winners.remove(&filename))
        .collect();

    (merged, report)
}

/// Group records per deployment, each group sorted by timestamp ascending.
pub fn group_by_deployment(records: &[ImageRecord]) -> BTreeMap<String, Vec<&ImageRecord>> {
    let mut groups: BTreeMap<String, Vec<&ImageRecord>> = BTreeMap::new();
    for record in records {
        groups
            .entry(record.deployment_id.clone())
            .or_default()
            .push(record);
    }
    for group in groups.values_mut() {
        group.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(
        filename: &str,
        deployment_id: &str,
        timestamp: &str,
        temperature: Option<i32>,
        confidence: f64,
        status: ExtractionStatus,
    ) -> ImageRecord {
        ImageRecord {
            filename: filename.to_string(),
            deployment_id: deployment_id.to_string(),
            timestamp: timestamp.to_string(),
            temperature,
            confidence,
            extraction_status: status,
        }
    }

    #[test]
    fn test_manual_entry_beats_ocr() {
        let base = vec![record(
            "A_20230101000000.JPG",
            "A",
            "20230101000000",
            Some(55),
            0.4,
            ExtractionStatus::Success,
        )];
        let correction = vec![record(
            "A_20230101000000.JPG",
            "A",
            "20230101000000",
            Some(13),
            1.0,
            ExtractionStatus::ManualEntry,
        )];

        let (merged, report) = merge_corrections(base, &[correction]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].temperature, Some(13));
        assert_eq!(merged[0].confidence, 1.0);
        assert_eq!(merged[0].extraction_status, ExtractionStatus::ManualEntry);
        assert_eq!(report.applied, 1);
        assert_eq!(report.unmatched, 0);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let base = vec![
            record("A_20230101000000.JPG", "A", "20230101000000", Some(10), 0.8, ExtractionStatus::Success),
            record("A_20230101010000.JPG", "A", "20230101010000", None, 0.0, ExtractionStatus::Failed),
        ];
        let correction = vec![record(
            "A_20230101010000.JPG",
            "A",
            "20230101010000",
            Some(11),
            1.0,
            ExtractionStatus::ManualEntry,
        )];

        let (once, _) = merge_corrections(base.clone(), &[correction.clone()]);
        let (twice, _) = merge_corrections(base, &[correction.clone(), correction]);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_confidence_tie_latest_applied_wins() {
        let base = vec![record(
            "A_20230101000000.JPG",
            "A",
            "20230101000000",
            Some(20),
            1.0,
            ExtractionStatus::ManualEntry,
        )];
        let first = vec![record(
            "A_20230101000000.JPG",
            "A",
            "20230101000000",
            Some(21),
            1.0,
            ExtractionStatus::ManualEntry,
        )];
        let second = vec![record(
            "A_20230101000000.JPG",
            "A",
            "20230101000000",
            Some(22),
            1.0,
            ExtractionStatus::ManualEntry,
        )];

        let (merged, _) = merge_corrections(base, &[first, second]);
        assert_eq!(merged[0].temperature, Some(22));
    }

    #[test]
    fn test_unmatched_correction_warns_but_continues() {
        let base = vec![record(
            "A_20230101000000.JPG",
            "A",
            "20230101000000",
            Some(10),
            0.9,
            ExtractionStatus::Success,
        )];
        let correction = vec![record(
            "B_20230101000000.JPG",
            "B",
            "20230101000000",
            Some(5),
            1.0,
            ExtractionStatus::ManualEntry,
        )];

        let (merged, report) = merge_corrections(base, &[correction]);
        assert_eq!(report.unmatched, 1);
        assert_eq!(merged.len(), 2); // the orphan correction still lands in the pool
        assert_eq!(merged[0].filename, "A_20230101000000.JPG");
    }

    #[test]
    fn test_merge_preserves_base_order() {
        let base = vec![
            record("C_20230101000000.JPG", "C", "20230101000000", Some(1), 0.9, ExtractionStatus::Success),
            record("A_20230101000000.JPG", "A", "20230101000000", Some(2), 0.9, ExtractionStatus::Success),
            record("B_20230101000000.JPG", "B", "20230101000000", Some(3), 0.9, ExtractionStatus::Success),
        ];
        let (merged, _) = merge_corrections(base, &[]);
        let names: Vec<_> = merged.iter().map(|r| r.filename.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "C_20230101000000.JPG",
                "A_20230101000000.JPG",
                "B_20230101000000.JPG"
            ]
        );
    }

    #[test]
    fn test_group_by_deployment_sorts_by_timestamp() {
        let records = vec![
            record("X_20230102000000.JPG", "X", "20230102000000", Some(4), 0.9, ExtractionStatus::Success),
            record("X_20230101000000.JPG", "X", "20230101000000", Some(3), 0.9, ExtractionStatus::Success),
            record("Y_20230101000000.JPG", "Y", "20230101000000", Some(8), 0.9, ExtractionStatus::Success),
        ];
        let groups = group_by_deployment(&records);
        assert_eq!(groups.len(), 2);
        let x = &groups["X"];
        assert_eq!(x[0].timestamp, "20230101000000");
        assert_eq!(x[1].timestamp, "20230102000000");
    }

    #[test]
    fn test_csv_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.csv");
        let records = vec![
            record("A_20230101000000.JPG", "A", "20230101000000", Some(12), 0.93, ExtractionStatus::Success),
            record("A_20230101010000.JPG", "A", "20230101010000", None, 0.0, ExtractionStatus::Failed),
        ];

        write_table(&path, &records).unwrap();
        let loaded = load_table(&path).unwrap();
        assert_eq!(loaded, records);
        // Leading zeros in the fixed-width timestamp survive the round trip
        assert_eq!(loaded[0].timestamp, "20230101000000");
    }
}
