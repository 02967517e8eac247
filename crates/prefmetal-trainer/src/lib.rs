//! DPO training for prefmetal.
//!
//! Pieces: the sigmoid DPO loss over masked log probabilities ([`dpo`]),
//! checkpoint save/resume/rotation ([`checkpoint`]), multi-process topology
//! and save-time gathering ([`sharding`]), and the end-to-end driver
//! ([`driver`]).

#![warn(missing_docs)]

pub mod checkpoint;
pub mod dpo;
pub mod driver;
pub mod sharding;

pub use checkpoint::{CheckpointManager, CheckpointMetadata};
pub use dpo::{compute_log_probs, dpo_loss, DpoConfig, DpoMetrics};
pub use driver::{train, TrainOptions, TrainReport};
pub use sharding::{gather_adapter, ShardingMode, WorldInfo};

/// Error type for training operations.
#[derive(Debug, thiserror::Error)]
pub enum TrainerError {
    /// MLX error.
    #[error("MLX error: {0}")]
    Mlx(#[from] mlx_rs::error::Exception),
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Safetensors read/write error.
    #[error("Weights IO error: {0}")]
    Weights(#[from] mlx_rs::error::IoError),
    /// Model assembly error.
    #[error(transparent)]
    Lora(#[from] prefmetal_lora::LoraError),
    /// Data pipeline error.
    #[error(transparent)]
    Data(#[from] prefmetal_core::PrefMetalError),
    /// Metadata serialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Result type for training operations.
pub type Result<T> = std::result::Result<T, TrainerError>;
