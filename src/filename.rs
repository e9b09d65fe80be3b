//! Filename codec for trail camera imagery
//!
//! Field cameras stamp each file as `<deployment_id>_<14-digit timestamp>.<ext>`,
//! e.g. `SC4_20231203223001.JPG`. Deployment identifiers may themselves contain
//! underscores (`SLC6_1_20240105142001.JPG`), so the timestamp token is located
//! by shape, not position.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use thiserror::Error;
use walkdir::WalkDir;

/// Failure to decode a filename into deployment id and timestamp.
///
/// This is data-quality input, not a crash: callers log the offending name and
/// exclude the record from time-ordered analysis.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// No token of exactly 14 ASCII digits was found
    #[error("no 14-digit timestamp token in filename {0:?}")]
    NoTimestamp(String),
}

/// Deployment id and acquisition timestamp decoded from a filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    /// Camera installation identifier, e.g. "SC4" or "SLC6_1"
    pub deployment_id: String,
    /// Acquisition time as the raw 14-digit `YYYYMMDDHHMMSS` string
    pub timestamp: String,
}

/// Decode `<deployment_id>_<14-digit timestamp>.<ext>`.
///
/// The extension is stripped, the stem split on `_`, and the first token that
/// is exactly 14 digits taken as the timestamp; everything before it rejoins
/// into the deployment id.
pub fn parse(filename: &str) -> Result<ParsedName, ParseError> {
    let stem = match filename.rsplit_once('.') {
        Some((stem, _ext)) => stem,
        None => filename,
    };

    let parts: Vec<&str> = stem.split('_').collect();
    for (i, part) in parts.iter().enumerate() {
        if is_timestamp_token(part) {
            return Ok(ParsedName {
                deployment_id: parts[..i].join("_"),
                timestamp: (*part).to_string(),
            });
        }
    }

    Err(ParseError::NoTimestamp(filename.to_string()))
}

fn is_timestamp_token(token: &str) -> bool {
    token.len() == 14 && token.bytes().all(|b| b.is_ascii_digit())
}

/// Recursively collect image files matching the stamped naming convention.
///
/// Accepts `jpg`/`jpeg` case-insensitively and returns paths sorted by name so
/// batch runs are deterministic.
pub fn scan_corpus(dir: &Path) -> Result<Vec<PathBuf>> {
    let pattern = Regex::new(r"(?i)^[A-Z0-9_]+_\d{14}\.(jpg|jpeg)$")
        .context("invalid corpus filename pattern")?;

    let mut files = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry.with_context(|| format!("failed to scan corpus directory {dir:?}"))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if pattern.is_match(name) {
                files.push(entry.into_path());
            }
        }
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    #[test]
    fn test_parse_simple_name() {
        let parsed = parse("SC4_20231203223001.JPG").unwrap();
        assert_eq!(parsed.deployment_id, "SC4");
        assert_eq!(parsed.timestamp, "20231203223001");
    }

    #[test]
    fn test_parse_deployment_with_underscores() {
        let parsed = parse("SLC6_1_20240105142001.JPG").unwrap();
        assert_eq!(parsed.deployment_id, "SLC6_1");
        assert_eq!(parsed.timestamp, "20240105142001");
    }

    #[test]
    fn test_parse_roundtrip_various_underscore_counts() {
        for deployment_id in ["A", "UDMH3", "SLC6_1", "X_Y_Z_4"] {
            let filename = format!("{deployment_id}_20230101000000.JPG");
            let parsed = parse(&filename).unwrap();
            assert_eq!(parsed.deployment_id, deployment_id);
            assert_eq!(parsed.timestamp, "20230101000000");
        }
    }

    #[test]
    fn test_parse_lowercase_extension() {
        let parsed = parse("SC2_20230615120000.jpg").unwrap();
        assert_eq!(parsed.deployment_id, "SC2");
    }

    #[test]
    fn test_parse_rejects_missing_timestamp() {
        let err = parse("IMG_1234.JPG").unwrap_err();
        assert_eq!(err, ParseError::NoTimestamp("IMG_1234.JPG".to_string()));
    }

    #[test]
    fn test_parse_rejects_15_digit_token() {
        assert!(parse("SC4_202312032230011.JPG").is_err());
    }

    #[test]
    fn test_timestamp_token_shape() {
        assert!(is_timestamp_token("20231203223001"));
        assert!(!is_timestamp_token("2023120322300"));
        assert!(!is_timestamp_token("2023120322300a"));
    }

    #[test]
    fn test_scan_corpus_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("week2");
        std::fs::create_dir(&nested).unwrap();

        File::create(dir.path().join("SC4_20231203223001.JPG")).unwrap();
        File::create(nested.join("SC4_20231204223001.jpeg")).unwrap();
        File::create(dir.path().join("notes.txt")).unwrap();
        File::create(dir.path().join("IMG_1234.JPG")).unwrap();

        let files = scan_corpus(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["SC4_20231203223001.JPG", "SC4_20231204223001.jpeg"]);
    }
}
