//! OCR model management
//!
//! Handles resolving, caching, and fetching of the PaddleOCR ONNX models the
//! engine runs. Models live in a per-user data directory and are downloaded
//! once; batch runs only ever pay the load cost.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::runtime::Runtime;
use tracing::{debug, info};

/// Model identifier for PaddleOCR components
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFile {
    /// Text detection model (DBNet)
    Detection,
    /// Text recognition model (CRNN)
    Recognition,
    /// Character dictionary for recognition
    Dictionary,
}

impl ModelFile {
    /// All files required by the engine
    pub const REQUIRED: [ModelFile; 3] = [
        ModelFile::Detection,
        ModelFile::Recognition,
        ModelFile::Dictionary,
    ];

    /// Get the filename for this model file
    pub fn filename(&self) -> &'static str {
        match self {
            ModelFile::Detection => "det.onnx",
            ModelFile::Recognition => "rec.onnx",
            ModelFile::Dictionary => "dict.txt",
        }
    }

    /// Download URL (PaddleOCR models from Hugging Face, monkt/paddleocr-onnx)
    pub fn download_url(&self) -> &'static str {
        match self {
            ModelFile::Detection => {
                "https://huggingface.co/monkt/paddleocr-onnx/resolve/main/detection/v3/det.onnx"
            }
            ModelFile::Recognition => {
                "https://huggingface.co/monkt/paddleocr-onnx/resolve/main/languages/english/rec.onnx"
            }
            ModelFile::Dictionary => {
                "https://huggingface.co/monkt/paddleocr-onnx/resolve/main/languages/english/dict.txt"
            }
        }
    }

    /// Expected file size for integrity check (approximate, in bytes)
    pub fn expected_size_range(&self) -> (u64, u64) {
        match self {
            ModelFile::Detection => (2_000_000, 5_000_000), // ~2.43 MB
            ModelFile::Recognition => (7_000_000, 10_000_000), // ~7.83 MB
            ModelFile::Dictionary => (500, 10_000),         // ~1.42 KB
        }
    }

    /// Display name for progress reporting
    pub fn display_name(&self) -> &'static str {
        match self {
            ModelFile::Detection => "Text Detection",
            ModelFile::Recognition => "Text Recognition",
            ModelFile::Dictionary => "Character Dictionary",
        }
    }
}

/// Manifest tracking downloaded model files
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ModelManifest {
    pub models: Vec<ModelInfo>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelInfo {
    pub filename: String,
    pub size_bytes: u64,
    pub sha256: String,
}

/// Resolves and caches the OCR model files
pub struct OcrModels {
    models_dir: PathBuf,
    allow_download: bool,
}

impl OcrModels {
    /// Create a model store in the per-user data directory
    pub fn new() -> Result<Self> {
        let dirs = directories::ProjectDirs::from("", "", "trailtemp")
            .context("could not determine a per-user data directory")?;
        let models_dir = dirs.data_dir().join("models");
        Self::with_dir(models_dir)
    }

    /// Create a model store with a custom directory
    pub fn with_dir(models_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&models_dir)
            .with_context(|| format!("failed to create models directory {models_dir:?}"))?;
        Ok(Self {
            models_dir,
            allow_download: true,
        })
    }

    /// Disable network fetches; missing models become hard errors
    pub fn offline(mut self) -> Self {
        self.allow_download = false;
        self
    }

    /// Get the models directory path
    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Get the path to a specific model file
    pub fn model_path(&self, file: ModelFile) -> PathBuf {
        self.models_dir.join(file.filename())
    }

    /// Check if a model file is present and plausibly sized
    pub fn is_available(&self, file: ModelFile) -> bool {
        let path = self.model_path(file);
        match std::fs::metadata(&path) {
            Ok(metadata) => {
                let (min, max) = file.expected_size_range();
                metadata.len() >= min && metadata.len() <= max
            }
            Err(_) => false,
        }
    }

    /// Check if every required model file is available
    pub fn all_available(&self) -> bool {
        ModelFile::REQUIRED.iter().all(|&f| self.is_available(f))
    }

    /// Resolve a model file, downloading it when missing and permitted.
    pub fn ensure(&self, file: ModelFile) -> Result<PathBuf> {
        let path = self.model_path(file);

        if self.is_available(file) {
            debug!("Model {:?} already available at {:?}", file, path);
            return Ok(path);
        }

        if !self.allow_download {
            anyhow::bail!(
                "{} model missing at {:?} and downloads are disabled; fetch it manually from {}",
                file.display_name(),
                path,
                file.download_url()
            );
        }

        info!("Downloading {} model...", file.display_name());
        self.download(file)?;
        Ok(path)
    }

    /// Resolve all required model files
    pub fn ensure_all(&self) -> Result<()> {
        for file in ModelFile::REQUIRED {
            self.ensure(file)?;
        }
        Ok(())
    }

    /// Download a model file (blocking)
    fn download(&self, file: ModelFile) -> Result<()> {
        let url = file.download_url();
        let path = self.model_path(file);

        info!("Downloading {} from {}", file.display_name(), url);

        if std::env::var("TRAILTEMP_OFFLINE").is_ok() {
            anyhow::bail!(
                "offline mode: cannot download models; fetch {} manually and place at {:?}",
                url,
                path
            );
        }

        let rt = Runtime::new().context("failed to create tokio runtime")?;
        let sha256 = rt.block_on(self.download_file_async(url, &path))?;

        if !self.is_available(file) {
            anyhow::bail!(
                "download of {} completed but the file failed size verification",
                file.display_name()
            );
        }

        self.record_in_manifest(file, &sha256)?;
        info!("Successfully downloaded {} model", file.display_name());
        Ok(())
    }

    /// Async streaming download; returns the SHA256 of the fetched bytes.
    async fn download_file_async(&self, url: &str, path: &Path) -> Result<String> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .context("failed to create HTTP client")?;

        let response = client
            .get(url)
            .send()
            .await
            .context("failed to send download request")?;

        if !response.status().is_success() {
            anyhow::bail!("download failed with status {}: {}", response.status(), url);
        }

        debug!("Download size: {:?} bytes", response.content_length());

        // Download into a temp file, rename only once complete
        let temp_path = path.with_extension("tmp");
        let mut file = std::fs::File::create(&temp_path).context("failed to create temp file")?;

        let mut hasher = Sha256::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("error reading download stream")?;
            file.write_all(&chunk).context("failed to write to temp file")?;
            hasher.update(&chunk);
        }

        file.flush().context("failed to flush temp file")?;
        drop(file);

        std::fs::rename(&temp_path, path)
            .context("failed to move downloaded file to final location")?;

        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Record a downloaded file in the manifest
    fn record_in_manifest(&self, file: ModelFile, sha256: &str) -> Result<()> {
        let mut manifest = self.load_manifest().unwrap_or_default();
        let metadata = std::fs::metadata(self.model_path(file))?;

        let info = ModelInfo {
            filename: file.filename().to_string(),
            size_bytes: metadata.len(),
            sha256: sha256.to_string(),
        };

        if let Some(existing) = manifest
            .models
            .iter_mut()
            .find(|m| m.filename == info.filename)
        {
            *existing = info;
        } else {
            manifest.models.push(info);
        }

        self.save_manifest(&manifest)
    }

    /// Load the model manifest
    pub fn load_manifest(&self) -> Result<ModelManifest> {
        let manifest_path = self.models_dir.join("manifest.json");
        if manifest_path.exists() {
            let content = std::fs::read_to_string(&manifest_path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(ModelManifest::default())
        }
    }

    /// Save the model manifest
    pub fn save_manifest(&self, manifest: &ModelManifest) -> Result<()> {
        let manifest_path = self.models_dir.join("manifest.json");
        let content = serde_json::to_string_pretty(manifest)?;
        std::fs::write(manifest_path, content)?;
        Ok(())
    }

    /// Status of every required model file (for the CLI `models` command)
    pub fn status(&self) -> Vec<(ModelFile, bool, Option<u64>)> {
        ModelFile::REQUIRED
            .iter()
            .map(|&file| {
                let available = self.is_available(file);
                let size = std::fs::metadata(self.model_path(file)).ok().map(|m| m.len());
                (file, available, size)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_filenames() {
        assert_eq!(ModelFile::Detection.filename(), "det.onnx");
        assert_eq!(ModelFile::Recognition.filename(), "rec.onnx");
        assert_eq!(ModelFile::Dictionary.filename(), "dict.txt");
    }

    #[test]
    fn test_missing_model_not_available() {
        let dir = tempfile::tempdir().unwrap();
        let models = OcrModels::with_dir(dir.path().to_path_buf()).unwrap();
        assert!(!models.is_available(ModelFile::Detection));
        assert!(!models.all_available());
    }

    #[test]
    fn test_size_range_validation() {
        let dir = tempfile::tempdir().unwrap();
        let models = OcrModels::with_dir(dir.path().to_path_buf()).unwrap();

        // An implausibly small det.onnx must not count as available
        std::fs::write(models.model_path(ModelFile::Detection), b"stub").unwrap();
        assert!(!models.is_available(ModelFile::Detection));

        // A dictionary-sized file does
        std::fs::write(models.model_path(ModelFile::Dictionary), vec![b'a'; 1500]).unwrap();
        assert!(models.is_available(ModelFile::Dictionary));
    }

    #[test]
    fn test_offline_ensure_fails_with_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let models = OcrModels::with_dir(dir.path().to_path_buf())
            .unwrap()
            .offline();
        let err = models.ensure(ModelFile::Detection).unwrap_err();
        assert!(err.to_string().contains("det.onnx"));
    }

    #[test]
    fn test_manifest_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let models = OcrModels::with_dir(dir.path().to_path_buf()).unwrap();

        let manifest = ModelManifest {
            models: vec![ModelInfo {
                filename: "det.onnx".to_string(),
                size_bytes: 42,
                sha256: "abc".to_string(),
            }],
        };
        models.save_manifest(&manifest).unwrap();

        let loaded = models.load_manifest().unwrap();
        assert_eq!(loaded.models.len(), 1);
        assert_eq!(loaded.models[0].filename, "det.onnx");
    }
}
