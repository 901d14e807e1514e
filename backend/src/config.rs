use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::orchestration::persistence::{Backoff, RetryPolicy};
use crate::storage::MAX_IMAGE_SIZE;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read analysis config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("Invalid analysis config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid value for {name}: {value}")]
    InvalidVar { name: &'static str, value: String },
}

/// Thresholds of the leaf/lesion pipeline, loadable from YAML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub enhancement: EnhancementConfig,
    pub segmentation: SegmentationConfig,
    pub damage: DamageConfig,
    pub superpixel: SuperpixelConfig,
    pub classifier: ClassifierConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnhancementConfig {
    pub clahe_clip_limit: f32,
    pub clahe_tiles: u32,
}

impl Default for EnhancementConfig {
    fn default() -> Self {
        Self {
            clahe_clip_limit: 3.0,
            clahe_tiles: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationConfig {
    /// Lower HSV bound of the green band (OpenCV 8-bit scale, H in 0..180).
    pub green_lower: [u8; 3],
    pub green_upper: [u8; 3],
    /// Below this many coarse-mask pixels the whole frame is treated as leaf.
    pub min_leaf_pixels: usize,
    /// Closes enclosed gaps of the green region (lesions) before refinement.
    pub fill_holes: bool,
    pub grabcut_iterations: usize,
    /// GrabCut runs on a copy whose longest side is at most this many pixels.
    pub refine_max_side: u32,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            green_lower: [25, 30, 30],
            green_upper: [95, 255, 255],
            min_leaf_pixels: 1000,
            fill_holes: true,
            grabcut_iterations: 3,
            refine_max_side: 640,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DamageConfig {
    /// The brown hue window is the frame's mean hue `± brown_hue_spread`,
    /// clamped to these bounds.
    pub brown_hue_limits: [u8; 2],
    pub brown_hue_spread: f64,
    pub brown_min_saturation: u8,
    pub brown_value: [u8; 2],
    /// Block size of the local Gaussian threshold of the dark channel (odd).
    pub adaptive_block_size: u32,
    /// Offset of the dark threshold is `leaf_mean / divisor + leaf_std * std_weight`.
    pub adaptive_offset_divisor: f32,
    pub adaptive_std_weight: f32,
    pub white_max_saturation: u8,
    pub white_min_value: u8,
    pub yellow_hue: [u8; 2],
    pub yellow_min_saturation: u8,
    pub yellow_min_value: u8,
    pub gray_max_saturation: u8,
    pub gray_value: [u8; 2],
    pub open_radius: u8,
    pub close_radius: u8,
    /// Components smaller than this fraction of leaf pixels are dropped.
    pub min_component_fraction: f64,
    pub min_component_pixels: usize,
}

impl Default for DamageConfig {
    fn default() -> Self {
        Self {
            brown_hue_limits: [5, 35],
            brown_hue_spread: 20.0,
            brown_min_saturation: 40,
            brown_value: [20, 200],
            adaptive_block_size: 51,
            adaptive_offset_divisor: 20.0,
            adaptive_std_weight: 0.25,
            white_max_saturation: 40,
            white_min_value: 200,
            yellow_hue: [18, 34],
            yellow_min_saturation: 90,
            yellow_min_value: 90,
            gray_max_saturation: 45,
            gray_value: [60, 170],
            open_radius: 1,
            close_radius: 2,
            min_component_fraction: 0.0005,
            min_component_pixels: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SuperpixelConfig {
    pub segments: usize,
    pub compactness: f32,
    pub sigma: f32,
    pub iterations: usize,
    pub coverage_threshold: f64,
}

impl Default for SuperpixelConfig {
    fn default() -> Self {
        Self {
            segments: 600,
            compactness: 6.0,
            sigma: 1.0,
            iterations: 10,
            coverage_threshold: 0.4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputNormalization {
    /// Raw 0..255 channel values; the model rescales internally.
    Identity,
    /// `x / 255`.
    UnitRange,
    /// ImageNet mean/std on `x / 255`.
    Imagenet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub normalization: InputNormalization,
    pub remap_confidence: bool,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            normalization: InputNormalization::Identity,
            remap_confidence: true,
        }
    }
}

impl AnalysisConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config_str = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(config_str: &str) -> Result<Self, ConfigError> {
        let config: AnalysisConfig = serde_yaml::from_str(config_str)?;
        Ok(config)
    }
}

/// Runtime settings of the service, read from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub aws_region: String,
    pub s3_endpoint: Option<String>,
    pub s3_access_key: Option<String>,
    pub s3_secret_key: Option<String>,
    pub analysis_bucket: String,
    pub source_buckets: Vec<String>,
    pub results_table: String,
    pub model_path: Option<String>,
    pub model_input_size: u32,
    pub model_output_logits: bool,
    pub presigned_url_ttl: Duration,
    pub retry_policy: RetryPolicy,
    pub submission_providers: Vec<String>,
    pub analysis_config_path: Option<String>,
    /// Overrides `classifier.remap_confidence` of the YAML file when set.
    pub confidence_remap: Option<bool>,
    pub publish_artifacts: bool,
    pub event_queue_capacity: usize,
    /// Largest accepted `/ai/predict` upload, in bytes.
    pub max_upload_bytes: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let analysis_bucket = var_or("ANALYSIS_BUCKET", "ai-service-bucket");
        let source_buckets = match env::var("SOURCE_BUCKETS") {
            Ok(list) => split_list(&list),
            Err(_) => vec!["documents".to_string(), analysis_bucket.clone()],
        };
        let backoff_ms: u64 = parse_var("PERSIST_BACKOFF_MS", 0)?;

        let config = Self {
            port: parse_var("PORT", 8081)?,
            aws_region: var_or("AWS_REGION", "us-east-1"),
            s3_endpoint: env::var("S3_ENDPOINT").ok(),
            s3_access_key: env::var("S3_ACCESS_KEY").ok(),
            s3_secret_key: env::var("S3_SECRET_KEY").ok(),
            analysis_bucket,
            source_buckets,
            results_table: var_or("DYNAMODB_RESULTS_TABLE", "ai_results"),
            model_path: env::var("MODEL_PATH").ok(),
            model_input_size: parse_var("MODEL_INPUT_SIZE", 224)?,
            model_output_logits: parse_var("MODEL_OUTPUT_LOGITS", false)?,
            presigned_url_ttl: Duration::from_secs(parse_var("PRESIGNED_URL_TTL_SECS", 3600)?),
            retry_policy: RetryPolicy {
                max_attempts: parse_var("PERSIST_MAX_ATTEMPTS", 2)?,
                backoff: if backoff_ms == 0 {
                    Backoff::None
                } else {
                    Backoff::Fixed(Duration::from_millis(backoff_ms))
                },
            },
            submission_providers: env::var("SUBMISSION_PROVIDERS")
                .map(|list| split_list(&list))
                .unwrap_or_default(),
            analysis_config_path: env::var("ANALYSIS_CONFIG").ok(),
            confidence_remap: match env::var("CONFIDENCE_REMAP") {
                Ok(value) => Some(
                    value
                        .trim()
                        .parse()
                        .map_err(|_| ConfigError::InvalidVar {
                            name: "CONFIDENCE_REMAP",
                            value,
                        })?,
                ),
                Err(_) => None,
            },
            publish_artifacts: parse_var("ANALYSIS_ARTIFACTS", true)?,
            event_queue_capacity: parse_var("EVENT_QUEUE_CAPACITY", 64)?,
            max_upload_bytes: parse_var("MAX_UPLOAD_BYTES", MAX_IMAGE_SIZE)?,
        };
        Ok(config)
    }

    /// Thresholds from `ANALYSIS_CONFIG` when set, defaults otherwise.
    pub fn analysis_config(&self) -> Result<AnalysisConfig, ConfigError> {
        let mut config = match &self.analysis_config_path {
            Some(path) => AnalysisConfig::load(path)?,
            None => AnalysisConfig::default(),
        };
        if let Some(remap) = self.confidence_remap {
            config.classifier.remap_confidence = remap;
        }
        Ok(config)
    }
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidVar { name, value }),
        Err(_) => Ok(default),
    }
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = AnalysisConfig::from_yaml(
            "segmentation:\n  min_leaf_pixels: 50\nsuperpixel:\n  coverage_threshold: 0.3\n",
        )
        .unwrap();
        assert_eq!(config.segmentation.min_leaf_pixels, 50);
        assert_eq!(config.segmentation.grabcut_iterations, 3);
        assert_eq!(config.superpixel.coverage_threshold, 0.3);
        assert_eq!(config.superpixel.segments, 600);
        assert!(config.classifier.remap_confidence);
    }

    #[test]
    fn test_classifier_section_parses_normalization() {
        let config = AnalysisConfig::from_yaml(
            "classifier:\n  normalization: imagenet\n  remap_confidence: false\n",
        )
        .unwrap();
        assert_eq!(config.classifier.normalization, InputNormalization::Imagenet);
        assert!(!config.classifier.remap_confidence);
    }

    #[test]
    fn test_split_list_trims_and_skips_empty() {
        assert_eq!(
            split_list(" documents, ai-service-bucket ,,"),
            vec!["documents".to_string(), "ai-service-bucket".to_string()]
        );
    }
}
