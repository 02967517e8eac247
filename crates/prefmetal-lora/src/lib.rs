//! LoRA/QLoRA model assembly on MLX.
//!
//! Provides the [`LoraLinear`] adapter layer, a Llama-family causal LM
//! wrapped with adapters on every projection, and adapter state dict
//! filtering for export.

#![warn(missing_docs)]

pub mod lora;
pub mod model;
pub mod state;

pub use lora::{LoraError, LoraLinear, QuantizedWeight};
pub use model::{
    create_causal_mask, ModelSpec, PrefLoraAttention, PrefLoraDecoderLayer, PrefLoraForCausalLM,
    PrefLoraMlp, PrefLoraModel,
};
pub use state::adapter_state_dict;
