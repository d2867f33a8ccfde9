//! Run configuration: network hyperparameters and orchestrator options.
//!
//! Field names on disk follow the `network_*` keys used by existing config files;
//! the short names are accepted as aliases.

use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownsamplingMode {
    #[serde(alias = "maxpool")]
    Maxpooling,
    #[serde(alias = "strided_conv")]
    Convolution,
}

/// Opaque augmentation token handed to the dataset collaborator as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AugmentationPolicy(pub serde_json::Value);

impl AugmentationPolicy {
    /// The `{"type": "none"}` token used for validation passes.
    #[must_use]
    pub fn none() -> Self {
        Self(serde_json::json!({ "type": "none" }))
    }

    /// The `type` field of the token, if any.
    #[must_use]
    pub fn kind(&self) -> Option<&str> {
        self.0.get("type").and_then(serde_json::Value::as_str)
    }
}

impl Default for AugmentationPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// Hyperparameters of one training run. Immutable once the run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(rename = "network_learning_rate", alias = "learning_rate")]
    pub learning_rate: f32,
    #[serde(rename = "network_n_classes", alias = "n_classes")]
    pub n_classes: usize,
    /// Keep probability of dropout during training.
    #[serde(rename = "network_dropout", alias = "dropout")]
    pub dropout: f32,
    #[serde(rename = "network_depth", alias = "depth")]
    pub depth: usize,
    #[serde(rename = "network_convolution_per_layer", alias = "convolution_per_layer")]
    pub convolution_per_layer: Vec<usize>,
    #[serde(rename = "network_size_of_convolutions_per_layer", alias = "size_of_convolutions_per_layer")]
    pub size_of_convolutions_per_layer: Vec<Vec<usize>>,
    #[serde(rename = "network_features_per_convolution", alias = "features_per_convolution")]
    pub features_per_convolution: Vec<Vec<usize>>,
    #[serde(rename = "network_downsampling", alias = "downsampling")]
    pub downsampling: DownsamplingMode,
    #[serde(rename = "network_weighted_cost", alias = "weighted_cost")]
    pub weighted_cost: bool,
    #[serde(rename = "network_thresholds", alias = "thresholds")]
    pub thresholds: Vec<f32>,
    #[serde(rename = "network_batch_size", alias = "batch_size")]
    pub batch_size: usize,
    #[serde(rename = "network_data_augmentation", alias = "data_augmentation")]
    pub data_augmentation: AugmentationPolicy,
    #[serde(rename = "network_batch_norm", alias = "batch_norm")]
    pub batch_norm: bool,
    #[serde(rename = "network_batch_norm_decay", alias = "batch_norm_decay")]
    pub batch_norm_decay: f32,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        let depth = 6;
        Self {
            learning_rate: 0.0005,
            n_classes: 2,
            dropout: 0.75,
            depth,
            convolution_per_layer: vec![1; depth],
            size_of_convolutions_per_layer: vec![vec![3]; depth],
            features_per_convolution: vec![vec![64]; depth],
            downsampling: DownsamplingMode::Maxpooling,
            weighted_cost: false,
            thresholds: vec![0.0, 0.5],
            batch_size: 8,
            data_augmentation: AugmentationPolicy::none(),
            batch_norm: true,
            batch_norm_decay: 0.999,
        }
    }
}

impl TrainingConfig {
    /// Reads a config file. `.toml` files are parsed as TOML, anything else as JSON.
    /// Every key is required; a missing key is a `Config` error.
    pub fn from_file(path: &Path) -> TrainingResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            TrainingError::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;

        let config: Self = if path.extension().and_then(|e| e.to_str()) == Some("toml") {
            toml::from_str(&text).map_err(|e| {
                TrainingError::Config(format!("failed to parse {}: {e}", path.display()))
            })?
        } else {
            serde_json::from_str(&text).map_err(|e| {
                TrainingError::Config(format!("failed to parse {}: {e}", path.display()))
            })?
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> TrainingResult<()> {
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(config_err("network_learning_rate must be > 0"));
        }
        if self.n_classes < 2 {
            return Err(config_err("network_n_classes must be >= 2"));
        }
        if !(self.dropout > 0.0 && self.dropout <= 1.0) {
            return Err(config_err("network_dropout must be in (0, 1]"));
        }
        if self.depth == 0 {
            return Err(config_err("network_depth must be >= 1"));
        }
        if self.batch_size == 0 {
            return Err(config_err("network_batch_size must be >= 1"));
        }
        if !(self.batch_norm_decay > 0.0 && self.batch_norm_decay < 1.0) {
            return Err(config_err("network_batch_norm_decay must be in (0, 1)"));
        }

        self.validate_layers()?;
        self.validate_thresholds()
    }

    fn validate_layers(&self) -> TrainingResult<()> {
        check_len("network_convolution_per_layer", self.convolution_per_layer.len(), self.depth)?;
        check_len(
            "network_size_of_convolutions_per_layer",
            self.size_of_convolutions_per_layer.len(),
            self.depth,
        )?;
        check_len("network_features_per_convolution", self.features_per_convolution.len(), self.depth)?;

        for (layer, &convs) in self.convolution_per_layer.iter().enumerate() {
            if convs == 0 {
                return Err(config_err(format!("layer {layer} must have at least one convolution")));
            }

            let sizes = &self.size_of_convolutions_per_layer[layer];
            check_len(&format!("network_size_of_convolutions_per_layer[{layer}]"), sizes.len(), convs)?;
            if let Some(size) = sizes.iter().find(|&&s| s == 0 || s % 2 == 0) {
                return Err(config_err(format!(
                    "layer {layer} has convolution size {size}; sizes must be odd and >= 1"
                )));
            }

            let features = &self.features_per_convolution[layer];
            check_len(&format!("network_features_per_convolution[{layer}]"), features.len(), convs)?;
            if features.contains(&0) {
                return Err(config_err(format!("layer {layer} has a convolution with zero features")));
            }
        }
        Ok(())
    }

    fn validate_thresholds(&self) -> TrainingResult<()> {
        check_len("network_thresholds", self.thresholds.len(), self.n_classes)?;
        if self.thresholds.iter().any(|t| !(0.0..=1.0).contains(t)) {
            return Err(config_err("network_thresholds must lie in [0, 1]"));
        }
        if self.thresholds.windows(2).any(|w| w[0] >= w[1]) {
            return Err(config_err("network_thresholds must be strictly ascending"));
        }
        Ok(())
    }
}

fn config_err(message: impl Into<String>) -> TrainingError {
    TrainingError::Config(message.into())
}

fn check_len(name: &str, got: usize, expected: usize) -> TrainingResult<()> {
    if got == expected {
        Ok(())
    } else {
        Err(config_err(format!("{name} has {got} entries, expected {expected}")))
    }
}

/// Accelerator the network is placed on. Chosen once before the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Device {
    #[default]
    Cpu,
    Gpu(u8),
}

/// Number of accelerators a run may be pinned to.
pub const GPU_COUNT: u8 = 2;

impl FromStr for Device {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if s == "cpu" {
            return Ok(Self::Cpu);
        }
        s.strip_prefix("gpu:")
            .and_then(|index| index.parse::<u8>().ok())
            .filter(|&index| index < GPU_COUNT)
            .map(Self::Gpu)
            .ok_or_else(|| config_err(format!("unknown device '{s}', expected cpu, gpu:0 or gpu:1")))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Gpu(index) => write!(f, "gpu:{index}"),
        }
    }
}

impl From<Device> for String {
    fn from(device: Device) -> Self {
        device.to_string()
    }
}

impl TryFrom<String> for Device {
    type Error = TrainingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Orchestrator knobs that are not network hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    /// The loop runs while `epoch < max_epoch`.
    pub max_epoch: u32,
    /// Steps between persisting `latest`, the history and the report.
    pub save_step: u64,
    /// Steps between debug logs of the current minibatch.
    pub display_step: u64,
    /// Save only model parameters (true) or optimizer state as well (false).
    pub save_trainable: bool,
    pub device: Device,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_epoch: 2500,
            save_step: 600,
            display_step: 100,
            save_trainable: true,
            device: Device::Cpu,
        }
    }
}

impl RunOptions {
    pub fn validate(&self) -> TrainingResult<()> {
        if self.max_epoch == 0 {
            return Err(config_err("max_epoch must be >= 1"));
        }
        if self.save_step == 0 {
            return Err(config_err("save_step must be >= 1"));
        }
        if self.display_step == 0 {
            return Err(config_err("display_step must be >= 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn full_json() -> serde_json::Value {
        serde_json::to_value(TrainingConfig::default()).unwrap()
    }

    #[test]
    fn test_default_config_is_valid() {
        TrainingConfig::default().validate().unwrap();
    }

    #[test]
    fn test_config_serializes_with_network_keys() {
        let value = full_json();
        assert_eq!(value["network_n_classes"], 2);
        assert_eq!(value["network_downsampling"], "maxpooling");
        assert_eq!(value["network_data_augmentation"]["type"], "none");
    }

    #[test]
    fn test_config_accepts_short_aliases() {
        let json = r#"{
            "learning_rate": 0.001, "n_classes": 3, "dropout": 1.0, "depth": 1,
            "convolution_per_layer": [2], "size_of_convolutions_per_layer": [[3, 5]],
            "features_per_convolution": [[16, 32]], "downsampling": "convolution",
            "weighted_cost": true, "thresholds": [0.0, 0.2, 0.8], "batch_size": 4,
            "data_augmentation": {"type": "flip"}, "batch_norm": false, "batch_norm_decay": 0.9
        }"#;
        let config: TrainingConfig = serde_json::from_str(json).unwrap();
        config.validate().unwrap();
        assert_eq!(config.downsampling, DownsamplingMode::Convolution);
        assert_eq!(config.data_augmentation.kind(), Some("flip"));
    }

    #[test]
    fn test_from_file_rejects_missing_key() {
        let mut value = full_json();
        value.as_object_mut().unwrap().remove("network_batch_size");

        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{value}").unwrap();

        let err = TrainingConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, TrainingError::Config(_)));
        assert!(err.to_string().contains("network_batch_size"));
    }

    #[test]
    fn test_from_file_reads_toml() {
        let toml = r#"
network_learning_rate = 0.0005
network_n_classes = 2
network_dropout = 0.75
network_depth = 2
network_convolution_per_layer = [1, 1]
network_size_of_convolutions_per_layer = [[3], [3]]
network_features_per_convolution = [[8], [16]]
network_downsampling = "maxpooling"
network_weighted_cost = false
network_thresholds = [0.0, 0.5]
network_batch_size = 2
network_batch_norm = true
network_batch_norm_decay = 0.99

[network_data_augmentation]
type = "none"
"#;
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(toml.as_bytes()).unwrap();

        let config = TrainingConfig::from_file(file.path()).unwrap();
        assert_eq!(config.depth, 2);
        assert_eq!(config.features_per_convolution, vec![vec![8], vec![16]]);
    }

    #[test]
    fn test_validate_rejects_layer_arrays_disagreeing_with_depth() {
        let config = TrainingConfig { depth: 4, ..TrainingConfig::default() };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("network_convolution_per_layer"));

        let mut config = TrainingConfig::default();
        config.size_of_convolutions_per_layer[2] = vec![3, 3];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_scalars() {
        for config in [
            TrainingConfig { learning_rate: 0.0, ..TrainingConfig::default() },
            TrainingConfig { n_classes: 1, thresholds: vec![0.0], ..TrainingConfig::default() },
            TrainingConfig { dropout: 0.0, ..TrainingConfig::default() },
            TrainingConfig { batch_size: 0, ..TrainingConfig::default() },
            TrainingConfig { batch_norm_decay: 1.0, ..TrainingConfig::default() },
            TrainingConfig { thresholds: vec![0.5, 0.0], ..TrainingConfig::default() },
            TrainingConfig { thresholds: vec![0.0], ..TrainingConfig::default() },
        ] {
            assert!(matches!(config.validate(), Err(TrainingError::Config(_))), "{config:?}");
        }
    }

    #[test]
    fn test_device_parsing() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("gpu:1".parse::<Device>().unwrap(), Device::Gpu(1));
        assert!("gpu:2".parse::<Device>().is_err());
        assert!("tpu".parse::<Device>().is_err());
        assert_eq!(Device::Gpu(0).to_string(), "gpu:0");
    }

    #[test]
    fn test_run_options_validate() {
        RunOptions::default().validate().unwrap();
        assert!(RunOptions { save_step: 0, ..RunOptions::default() }.validate().is_err());
        assert!(RunOptions { max_epoch: 0, ..RunOptions::default() }.validate().is_err());
    }
}
