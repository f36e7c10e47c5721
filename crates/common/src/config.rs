//! Configuration structures for SkinScan
//!
//! Settings are read once at startup from a JSON (or YAML) file and can be
//! overridden by environment variables. The tensor section carries one backend
//! variant, selected by its `type` field.

use crate::error::{Result, ServiceError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable holding the settings file path
pub const CONFIG_PATH_ENV: &str = "SKINSCAN_CONFIG";

/// Settings file used when `SKINSCAN_CONFIG` is not set
pub const DEFAULT_CONFIG_PATH: &str = "settings.json";

/// Top-level settings file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Client-facing service settings
    pub service: ServiceSettings,

    /// Inference engine settings
    pub tensor: EngineSettings,

    /// Image preprocessing settings
    pub image: ImageSettings,
}

/// Service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSettings {
    /// Address clients connect to, `tcp://host:port`
    pub url: String,

    /// Number of preprocessing threads (0 = CPU count)
    #[serde(default)]
    pub max_preprocessing_threads: usize,
}

/// Inference engine settings: common part plus one backend variant
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSettings {
    /// Maximum number of requests per inference call
    pub max_batches: usize,

    /// Output position holding the positive score
    pub positive_index: usize,

    /// Output position holding the negative score
    pub negative_index: usize,

    /// Repetitions of the synthetic inference workload at startup
    pub count_tests_for_estimate: usize,

    /// Backend-specific settings, selected by `type`
    #[serde(flatten)]
    pub backend: BackendSettings,
}

/// Backend variants known to the service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendSettings {
    /// Dense classifier over the flattened input, weights from a safetensors file
    Linear(LinearSettings),

    /// Model-free scorer for smoke tests and pipeline benchmarks
    Synthetic(SyntheticSettings),
}

/// Settings for the `linear` backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LinearSettings {
    pub width: usize,
    pub height: usize,
    pub channels: usize,

    /// Number of output classes
    pub output: usize,

    /// Safetensors file with `weight` [output, width*height*channels] and `bias` [output]
    pub weights_path: PathBuf,

    /// Apply softmax to the logits
    #[serde(default = "default_softmax")]
    pub softmax: bool,
}

/// Settings for the `synthetic` backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyntheticSettings {
    pub width: usize,
    pub height: usize,
    pub channels: usize,

    /// Number of output classes (at least 2)
    pub output: usize,

    /// Simulated device time per inference call
    #[serde(default)]
    pub infer_delay_ms: u64,
}

/// Image preprocessing settings
///
/// Width, height and channels are taken from the loaded engine, not from the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSettings {
    #[serde(default)]
    pub width: u32,

    #[serde(default)]
    pub height: u32,

    #[serde(default)]
    pub channels: usize,

    /// Centre-crop zoom factor, at least 1
    pub zoom: f32,

    /// Per-channel mean subtracted after scaling to [0, 1], in RGB order
    pub mean: Vec<f32>,

    /// Per-channel divisor applied after mean subtraction, in RGB order
    pub std: Vec<f32>,

    /// Repetitions of the synthetic preprocessing workload at startup
    pub count_tests_for_estimate: usize,
}

fn default_softmax() -> bool {
    true
}

impl Settings {
    /// Settings file path from `SKINSCAN_CONFIG`, or the default
    pub fn config_path() -> PathBuf {
        std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load settings from a JSON or YAML file (chosen by extension) and apply
    /// environment overrides
    ///
    /// Image geometry is not validated here because it is filled from the engine.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Reading settings from {}", path.display());

        let content = std::fs::read_to_string(path).map_err(|e| {
            ServiceError::config(format!("Failed to read settings file {}: {}", path.display(), e))
        })?;

        let is_yaml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("yaml") | Some("yml")
        );

        let mut settings = if is_yaml {
            Self::from_yaml_str(&content)?
        } else {
            Self::from_json_str(&content)?
        };

        settings.apply_env_overrides()?;
        settings.service.validate()?;
        settings.tensor.validate()?;

        Ok(settings)
    }

    /// Parse settings from JSON text
    pub fn from_json_str(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| ServiceError::config(format!("Failed to parse settings: {}", e)))
    }

    /// Parse settings from YAML text
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| ServiceError::config(format!("Failed to parse settings: {}", e)))
    }

    /// Apply `SKINSCAN_URL` and `SKINSCAN_MAX_PREPROCESSING_THREADS`
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("SKINSCAN_URL") {
            warn!("Service url overridden from environment: {}", url);
            self.service.url = url;
        }

        if let Ok(threads) = std::env::var("SKINSCAN_MAX_PREPROCESSING_THREADS") {
            self.service.max_preprocessing_threads = threads.parse().map_err(|_| {
                ServiceError::config(format!("Invalid SKINSCAN_MAX_PREPROCESSING_THREADS: {}", threads))
            })?;
        }

        Ok(())
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.service.validate()?;
        self.tensor.validate()?;
        self.image.validate()
    }
}

impl ServiceSettings {
    /// Validate service settings
    pub fn validate(&self) -> Result<()> {
        let address = self
            .url
            .strip_prefix("tcp://")
            .ok_or_else(|| ServiceError::config(format!("Service url must start with tcp://: {}", self.url)))?;

        if address.is_empty() {
            return Err(ServiceError::config("Service url has no address"));
        }

        Ok(())
    }

    /// Listen address without the scheme
    pub fn address(&self) -> &str {
        self.url.strip_prefix("tcp://").unwrap_or(&self.url)
    }

    /// Effective preprocessing thread count
    pub fn preprocessing_threads(&self) -> usize {
        if self.max_preprocessing_threads > 0 {
            return self.max_preprocessing_threads;
        }

        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

impl EngineSettings {
    /// Registry key of the configured backend
    pub fn kind(&self) -> &'static str {
        self.backend.kind()
    }

    /// Validate the common part and the backend variant
    pub fn validate(&self) -> Result<()> {
        if self.max_batches == 0 {
            return Err(ServiceError::config("tensor.maxBatches must be greater than 0"));
        }

        if self.count_tests_for_estimate == 0 {
            return Err(ServiceError::config(
                "tensor.countTestsForEstimate must be greater than 0",
            ));
        }

        if self.positive_index == self.negative_index {
            return Err(ServiceError::config(format!(
                "tensor.positiveIndex and tensor.negativeIndex must differ, both are {}",
                self.positive_index
            )));
        }

        self.backend.validate()
    }
}

impl BackendSettings {
    /// Registry key of this backend
    pub fn kind(&self) -> &'static str {
        match self {
            BackendSettings::Linear(_) => "linear",
            BackendSettings::Synthetic(_) => "synthetic",
        }
    }

    /// Validate backend fields
    pub fn validate(&self) -> Result<()> {
        match self {
            BackendSettings::Linear(linear) => {
                validate_geometry(linear.width, linear.height, linear.channels, linear.output)?;
                if linear.weights_path.as_os_str().is_empty() {
                    return Err(ServiceError::config("tensor.weightsPath is empty"));
                }
                Ok(())
            }
            BackendSettings::Synthetic(synthetic) => {
                validate_geometry(
                    synthetic.width,
                    synthetic.height,
                    synthetic.channels,
                    synthetic.output,
                )?;
                if synthetic.output < 2 {
                    return Err(ServiceError::config(
                        "tensor.output must be at least 2 for the synthetic backend",
                    ));
                }
                Ok(())
            }
        }
    }
}

fn validate_geometry(width: usize, height: usize, channels: usize, output: usize) -> Result<()> {
    if width == 0 || height == 0 || channels == 0 {
        return Err(ServiceError::config(format!(
            "Invalid input geometry {}x{}x{}",
            width, height, channels
        )));
    }

    if output == 0 {
        return Err(ServiceError::config("tensor.output must be greater than 0"));
    }

    Ok(())
}

impl ImageSettings {
    /// Fill the target geometry from the loaded engine
    pub fn set_geometry(&mut self, width: u32, height: u32, channels: usize) {
        self.width = width;
        self.height = height;
        self.channels = channels;
    }

    /// Validate image settings
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 || self.channels == 0 {
            return Err(ServiceError::config(format!(
                "Invalid image geometry {}x{}x{}",
                self.width, self.height, self.channels
            )));
        }

        if !(self.zoom >= 1.0) {
            return Err(ServiceError::config(format!(
                "image.zoom must be at least 1, got {}",
                self.zoom
            )));
        }

        if self.mean.len() != self.channels || self.std.len() != self.channels {
            return Err(ServiceError::config(format!(
                "image.mean and image.std must have {} values, got {} and {}",
                self.channels,
                self.mean.len(),
                self.std.len()
            )));
        }

        if self.std.iter().any(|&s| s == 0.0) {
            return Err(ServiceError::config("image.std values must be non-zero"));
        }

        if self.count_tests_for_estimate == 0 {
            return Err(ServiceError::config(
                "image.countTestsForEstimate must be greater than 0",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SETTINGS_JSON: &str = r#"{
        "service": { "url": "tcp://127.0.0.1:9310", "maxPreprocessingThreads": 2 },
        "tensor": {
            "type": "linear",
            "maxBatches": 4,
            "positiveIndex": 0,
            "negativeIndex": 1,
            "countTestsForEstimate": 3,
            "width": 224,
            "height": 224,
            "channels": 3,
            "output": 2,
            "weightsPath": "/models/classifier.safetensors"
        },
        "image": {
            "zoom": 1.2,
            "mean": [0.485, 0.456, 0.406],
            "std": [0.229, 0.224, 0.225],
            "countTestsForEstimate": 5
        }
    }"#;

    #[test]
    fn test_parse_linear_settings() {
        let settings = Settings::from_json_str(SETTINGS_JSON).unwrap();

        assert_eq!(settings.service.max_preprocessing_threads, 2);
        assert_eq!(settings.service.address(), "127.0.0.1:9310");
        assert_eq!(settings.tensor.max_batches, 4);
        assert_eq!(settings.tensor.kind(), "linear");
        match &settings.tensor.backend {
            BackendSettings::Linear(linear) => {
                assert_eq!(linear.output, 2);
                assert!(linear.softmax);
                assert_eq!(linear.weights_path, PathBuf::from("/models/classifier.safetensors"));
            }
            other => panic!("unexpected backend {:?}", other),
        }
        assert_eq!(settings.image.width, 0);
        assert!(settings.tensor.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml_synthetic_settings() {
        let yaml = r#"
service:
  url: tcp://0.0.0.0:9310
tensor:
  type: synthetic
  maxBatches: 8
  positiveIndex: 1
  negativeIndex: 0
  countTestsForEstimate: 1
  width: 32
  height: 32
  channels: 3
  output: 2
  inferDelayMs: 5
image:
  zoom: 1.0
  mean: [0.5, 0.5, 0.5]
  std: [0.5, 0.5, 0.5]
  countTestsForEstimate: 1
"#;
        let settings = Settings::from_yaml_str(yaml).unwrap();
        assert_eq!(settings.service.max_preprocessing_threads, 0);
        assert!(settings.service.preprocessing_threads() >= 1);
        assert_eq!(
            settings.tensor.backend,
            BackendSettings::Synthetic(SyntheticSettings {
                width: 32,
                height: 32,
                channels: 3,
                output: 2,
                infer_delay_ms: 5,
            })
        );
    }

    #[test]
    fn test_unknown_backend_type_rejected() {
        let json = SETTINGS_JSON.replace("\"linear\"", "\"tensorrt\"");
        assert!(matches!(
            Settings::from_json_str(&json),
            Err(ServiceError::Config(_))
        ));
    }

    #[test]
    fn test_equal_indexes_rejected() {
        let mut settings = Settings::from_json_str(SETTINGS_JSON).unwrap();
        settings.tensor.negative_index = settings.tensor.positive_index;
        assert!(settings.tensor.validate().is_err());
    }

    #[test]
    fn test_zero_batches_rejected() {
        let mut settings = Settings::from_json_str(SETTINGS_JSON).unwrap();
        settings.tensor.max_batches = 0;
        assert!(settings.tensor.validate().is_err());
    }

    #[test]
    fn test_image_validation() {
        let mut settings = Settings::from_json_str(SETTINGS_JSON).unwrap();
        assert!(settings.image.validate().is_err());

        settings.image.set_geometry(224, 224, 3);
        assert!(settings.validate().is_ok());

        settings.image.zoom = 0.5;
        assert!(settings.image.validate().is_err());

        settings.image.zoom = 1.0;
        settings.image.mean.pop();
        assert!(settings.image.validate().is_err());
    }

    #[test]
    fn test_service_url_validation() {
        let service = ServiceSettings {
            url: "http://localhost:80".to_string(),
            max_preprocessing_threads: 0,
        };
        assert!(service.validate().is_err());

        let service = ServiceSettings {
            url: "tcp://".to_string(),
            max_preprocessing_threads: 0,
        };
        assert!(service.validate().is_err());
    }

    #[test]
    fn test_from_file_json() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(SETTINGS_JSON.as_bytes()).unwrap();

        let settings = Settings::from_file(file.path()).unwrap();
        assert_eq!(settings.tensor.count_tests_for_estimate, 3);
    }

    #[test]
    fn test_from_file_missing() {
        let result = Settings::from_file("/definitely/not/here/settings.json");
        assert!(matches!(result, Err(ServiceError::Config(_))));
    }
}
