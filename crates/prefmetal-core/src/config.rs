//! Configuration types for prefmetal.

use crate::{PrefMetalError, Result};
use serde::{Deserialize, Serialize};

/// Model loading configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Policy model path (local directory with config.json, tokenizer.json
    /// and safetensors weights).
    pub model_path: String,

    /// Reference model path. Falls back to `model_path` when unset.
    #[serde(default)]
    pub ref_model_path: Option<String>,

    /// Trust remote code (for custom model implementations). Accepted for
    /// config compatibility; local safetensors loading never executes model
    /// code, so the flag has no effect here.
    #[serde(default)]
    pub trust_remote_code: bool,

    /// Padding side used when batching.
    #[serde(default)]
    pub padding_side: PaddingSide,

    /// DPO inverse-temperature beta.
    #[serde(default = "default_beta")]
    pub beta: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_path: String::new(),
            ref_model_path: None,
            trust_remote_code: false,
            padding_side: PaddingSide::default(),
            beta: default_beta(),
        }
    }
}

/// Which side of a sequence receives pad tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PaddingSide {
    /// Pad on the left.
    Left,
    /// Pad on the right.
    #[default]
    Right,
}

/// Bias handling mode for LoRA layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoraBias {
    /// Do not train any bias parameters (recommended default).
    #[default]
    None,
    /// Train all bias parameters.
    All,
    /// Train only bias parameters associated with LoRA layers.
    LoraOnly,
}

/// LoRA configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoraConfig {
    /// LoRA rank (r).
    #[serde(default = "default_lora_r")]
    pub r: usize,

    /// LoRA alpha (scaling factor).
    #[serde(default = "default_lora_alpha")]
    pub alpha: f32,

    /// Dropout probability.
    #[serde(default = "default_lora_dropout")]
    pub dropout: f32,

    /// Target modules whose adapters are trained and exported.
    #[serde(default = "default_target_modules")]
    pub target_modules: Vec<String>,

    /// Use rslora scaling.
    #[serde(default)]
    pub use_rslora: bool,

    /// Previously saved adapter weights to start from.
    #[serde(default)]
    pub weight_path: Option<String>,

    /// Bias handling mode.
    #[serde(default)]
    pub bias: LoraBias,

    /// Quantize the frozen base weights (QLoRA).
    #[serde(default)]
    pub q_lora: bool,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            r: default_lora_r(),
            alpha: default_lora_alpha(),
            dropout: default_lora_dropout(),
            target_modules: default_target_modules(),
            use_rslora: false,
            weight_path: None,
            bias: LoraBias::default(),
            q_lora: false,
        }
    }
}

impl LoraConfig {
    /// Compute the LoRA scaling factor.
    #[must_use]
    pub fn scaling(&self) -> f32 {
        if self.use_rslora {
            self.alpha / (self.r as f32).sqrt()
        } else {
            self.alpha / self.r as f32
        }
    }
}

/// Training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Learning rate.
    #[serde(default = "default_lr")]
    pub learning_rate: f64,

    /// Weight decay.
    #[serde(default)]
    pub weight_decay: f64,

    /// Batch size per device.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Number of training epochs.
    #[serde(default = "default_epochs")]
    pub num_epochs: usize,

    /// Truncation bound shared by prompt, chosen and rejected sequences.
    #[serde(default = "default_model_max_length")]
    pub model_max_length: usize,

    /// Maximum prompt length.
    #[serde(default = "default_model_max_length")]
    pub max_prompt_length: usize,

    /// Maximum completion length.
    #[serde(default = "default_max_target_length")]
    pub max_target_length: usize,

    /// Optimizer type.
    #[serde(default)]
    pub optimizer: OptimizerType,

    /// Random seed.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Logging steps.
    #[serde(default = "default_logging_steps")]
    pub logging_steps: usize,

    /// Save a checkpoint every N steps (None to save only at the end).
    #[serde(default)]
    pub save_steps: Option<usize>,

    /// Maximum number of checkpoints to keep.
    #[serde(default = "default_max_checkpoints")]
    pub max_checkpoints: usize,

    /// Cache directory for downloaded artifacts. Accepted for config
    /// compatibility; models and tokenizers are read from local paths, so
    /// nothing is cached here.
    #[serde(default)]
    pub cache_dir: Option<String>,

    /// Output directory.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_lr(),
            weight_decay: 0.0,
            batch_size: default_batch_size(),
            num_epochs: default_epochs(),
            model_max_length: default_model_max_length(),
            max_prompt_length: default_model_max_length(),
            max_target_length: default_max_target_length(),
            optimizer: OptimizerType::default(),
            seed: default_seed(),
            logging_steps: default_logging_steps(),
            save_steps: None,
            max_checkpoints: default_max_checkpoints(),
            cache_dir: None,
            output_dir: default_output_dir(),
        }
    }
}

impl TrainingConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.learning_rate <= 0.0 {
            return Err(PrefMetalError::Config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.batch_size == 0 {
            return Err(PrefMetalError::Config("batch_size must be nonzero".into()));
        }
        if self.num_epochs == 0 {
            return Err(PrefMetalError::Config("num_epochs must be nonzero".into()));
        }
        if self.model_max_length == 0 {
            return Err(PrefMetalError::Config(
                "model_max_length must be nonzero".into(),
            ));
        }
        if self.max_prompt_length == 0 || self.max_target_length == 0 {
            return Err(PrefMetalError::Config(
                "max_prompt_length and max_target_length must be nonzero".into(),
            ));
        }
        Ok(())
    }
}

/// Optimizer type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerType {
    /// AdamW optimizer.
    #[default]
    AdamW,
    /// SGD.
    Sgd,
}

/// Dataset configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Path to the JSON-lines training file.
    pub data_path: String,

    /// Optional evaluation split.
    #[serde(default)]
    pub eval_data_path: Option<String>,

    /// Maximum samples to use (None for all).
    #[serde(default)]
    pub max_samples: Option<usize>,

    /// Shuffle the dataset.
    #[serde(default = "default_true")]
    pub shuffle: bool,

    /// Random seed for shuffling.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_path: String::new(),
            eval_data_path: None,
            max_samples: None,
            shuffle: true,
            seed: default_seed(),
        }
    }
}

// Default value functions
fn default_beta() -> f32 {
    0.1
}
fn default_true() -> bool {
    true
}
fn default_lora_r() -> usize {
    8
}
fn default_lora_alpha() -> f32 {
    16.0
}
fn default_lora_dropout() -> f32 {
    0.05
}
fn default_target_modules() -> Vec<String> {
    vec!["q_proj".into(), "v_proj".into()]
}
fn default_lr() -> f64 {
    5e-5
}
fn default_batch_size() -> usize {
    4
}
fn default_epochs() -> usize {
    3
}
fn default_model_max_length() -> usize {
    512
}
fn default_max_target_length() -> usize {
    2048
}
fn default_seed() -> u64 {
    42
}
fn default_logging_steps() -> usize {
    10
}
fn default_max_checkpoints() -> usize {
    3
}
fn default_output_dir() -> String {
    "./output".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lora_scaling() {
        let config = LoraConfig::default();
        assert!((config.scaling() - 2.0).abs() < 1e-6);

        let rs = LoraConfig {
            use_rslora: true,
            ..Default::default()
        };
        assert!((rs.scaling() - 16.0 / (8.0_f32).sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_training_config_validate() {
        assert!(TrainingConfig::default().validate().is_ok());

        let bad = TrainingConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_lora_bias_snake_case() {
        let bias: LoraBias = serde_json::from_str("\"lora_only\"").unwrap();
        assert_eq!(bias, LoraBias::LoraOnly);
    }

    #[test]
    fn test_model_config_defaults() {
        let config: ModelConfig = serde_json::from_str("{\"model_path\": \"m\"}").unwrap();
        assert_eq!(config.padding_side, PaddingSide::Right);
        assert!((config.beta - 0.1).abs() < 1e-6);
        assert!(config.ref_model_path.is_none());
    }
}
