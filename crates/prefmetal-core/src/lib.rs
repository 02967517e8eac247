//! Core types for prefmetal.
//!
//! This crate provides:
//! - The [`PrefMetalError`] error type and [`Result`] alias
//! - Configuration groups for models, LoRA adapters, training and data

#![warn(missing_docs)]

pub mod config;
pub mod error;

pub use config::{
    DataConfig, LoraBias, LoraConfig, ModelConfig, OptimizerType, PaddingSide, TrainingConfig,
};
pub use error::{PrefMetalError, Result};
