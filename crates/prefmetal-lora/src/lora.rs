//! LoRA (Low-Rank Adaptation) linear layer.
//!
//! LoRA adds low-rank trainable matrices to frozen pretrained weights:
//! `y = x @ W.T + scale * (x @ A.T) @ B.T`
//!
//! Where:
//! - `W` is the frozen base weight matrix
//! - `A` is the LoRA down-projection matrix (rank x in_features)
//! - `B` is the LoRA up-projection matrix (out_features x rank)
//! - `scale = alpha / rank` (or `alpha / sqrt(rank)` for RSLoRA)
//!
//! With QLoRA the frozen base weight is group-quantized and the base matmul
//! runs through `quantized_matmul`; the adapter matrices stay full precision.

use mlx_rs::{error::Exception, Array};

use prefmetal_core::LoraConfig;

/// Error type for LoRA operations.
#[derive(Debug, thiserror::Error)]
pub enum LoraError {
    /// MLX error.
    #[error("MLX error: {0}")]
    Mlx(#[from] Exception),
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] mlx_rs::error::IoError),
    /// Shape mismatch error.
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),
    /// Invalid state error.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Group-quantized base weight for QLoRA.
#[derive(Debug, Clone)]
pub struct QuantizedWeight {
    /// Packed quantized weight.
    pub weight: Array,
    /// Per-group scales.
    pub scales: Array,
    /// Per-group biases.
    pub biases: Array,
    /// Quantization group size.
    pub group_size: i32,
    /// Bits per element.
    pub bits: i32,
}

/// Linear layer with a frozen base weight and trainable low-rank adapter.
///
/// Implements: `y = x @ W.T + scale * (x @ A.T) @ B.T`
#[derive(Debug)]
pub struct LoraLinear {
    /// Input features dimension.
    pub in_features: i32,
    /// Output features dimension.
    pub out_features: i32,
    /// LoRA rank.
    pub rank: i32,
    /// LoRA scaling factor (alpha / rank).
    pub scale: f32,
    /// Whether the layer is merged.
    pub merged: bool,
    /// Whether to use bias.
    pub use_bias: bool,
    /// Whether this adapter is trained and exported.
    pub trainable: bool,

    /// Frozen base weight matrix [out_features, in_features].
    pub weight: Array,
    /// Optional bias [out_features].
    pub bias: Option<Array>,
    /// LoRA A matrix (rank x in_features) - trainable.
    pub lora_a: Array,
    /// LoRA B matrix (out_features x rank) - trainable.
    pub lora_b: Array,
    /// Quantized base weight, replaces `weight` in the forward pass when set.
    pub quantized: Option<QuantizedWeight>,
}

impl LoraLinear {
    /// Create a new LoRA linear layer with given dimensions.
    pub fn new(
        in_features: i32,
        out_features: i32,
        rank: i32,
        alpha: f32,
        use_rslora: bool,
        use_bias: bool,
        trainable: bool,
    ) -> Result<Self, LoraError> {
        let scale = if use_rslora {
            alpha / (rank as f32).sqrt()
        } else {
            alpha / rank as f32
        };

        // Base weight gets overwritten by pretrained weights at load time.
        let bound = (3.0_f32 / in_features as f32).sqrt();
        let weight =
            mlx_rs::random::uniform::<_, f32>(-bound, bound, &[out_features, in_features], None)?;

        let bias = if use_bias {
            Some(mlx_rs::ops::zeros::<f32>(&[out_features])?)
        } else {
            None
        };

        // A Kaiming-uniform, B zeros: the adapter starts as a no-op.
        let lora_a = mlx_rs::random::uniform::<_, f32>(-bound, bound, &[rank, in_features], None)?;
        let lora_b = mlx_rs::ops::zeros::<f32>(&[out_features, rank])?;

        Ok(Self {
            in_features,
            out_features,
            rank,
            scale,
            merged: false,
            use_bias,
            trainable,
            weight,
            bias,
            lora_a,
            lora_b,
            quantized: None,
        })
    }

    /// Create from LoraConfig. The adapter trains only when `name` is listed
    /// in `target_modules`.
    pub fn from_config(
        in_features: i32,
        out_features: i32,
        config: &LoraConfig,
        use_bias: bool,
        name: &str,
    ) -> Result<Self, LoraError> {
        let trainable = config.target_modules.iter().any(|m| m == name);
        Self::new(
            in_features,
            out_features,
            config.r as i32,
            config.alpha,
            config.use_rslora,
            use_bias,
            trainable,
        )
    }

    /// Forward pass through the LoRA linear layer.
    pub fn forward(&mut self, x: &Array) -> Result<Array, LoraError> {
        let y_base = match &self.quantized {
            Some(q) => mlx_rs::ops::quantized_matmul(
                x,
                &q.weight,
                &q.scales,
                &q.biases,
                true,
                q.group_size,
                q.bits,
            )?,
            None => x.matmul(&self.weight.t())?,
        };

        let y = if self.merged {
            y_base
        } else {
            // y_lora = scale * (x @ A.T) @ B.T
            let xa = x.matmul(&self.lora_a.t())?;
            let xab = xa.matmul(&self.lora_b.t())?;
            let scale_arr = Array::from_f32(self.scale);
            let y_lora = xab.multiply(&scale_arr)?;
            y_base.add(&y_lora)?
        };

        if let Some(ref bias) = self.bias {
            Ok(y.add(bias)?)
        } else {
            Ok(y)
        }
    }

    /// Quantize the frozen base weight in place (QLoRA).
    pub fn quantize_base(&mut self, group_size: i32, bits: i32) -> Result<(), LoraError> {
        if self.quantized.is_some() {
            return Ok(());
        }
        if self.merged {
            return Err(LoraError::InvalidState(
                "cannot quantize a merged layer".into(),
            ));
        }
        let (weight, scales, biases) = mlx_rs::ops::quantize(&self.weight, group_size, bits)?;
        self.quantized = Some(QuantizedWeight {
            weight,
            scales,
            biases,
            group_size,
            bits,
        });
        Ok(())
    }

    /// Merge LoRA weights into base weights: `W_merged = W + scale * B @ A`.
    pub fn merge(&mut self) -> Result<(), LoraError> {
        if self.merged {
            return Ok(());
        }
        if self.quantized.is_some() {
            return Err(LoraError::InvalidState(
                "cannot merge into a quantized base weight".into(),
            ));
        }

        let ba = self.lora_b.matmul(&self.lora_a)?;
        let scale_arr = Array::from_f32(self.scale);
        let delta = ba.multiply(&scale_arr)?;
        self.weight = self.weight.add(&delta)?;
        self.merged = true;
        Ok(())
    }

    /// Unmerge LoRA weights from base weights.
    pub fn unmerge(&mut self) -> Result<(), LoraError> {
        if !self.merged {
            return Ok(());
        }

        let ba = self.lora_b.matmul(&self.lora_a)?;
        let scale_arr = Array::from_f32(self.scale);
        let delta = ba.multiply(&scale_arr)?;
        self.weight = self.weight.subtract(&delta)?;
        self.merged = false;
        Ok(())
    }

    /// Get the number of trainable parameters.
    pub fn num_trainable_params(&self) -> usize {
        if !self.trainable {
            return 0;
        }
        let lora_a_params = (self.rank * self.in_features) as usize;
        let lora_b_params = (self.out_features * self.rank) as usize;
        lora_a_params + lora_b_params
    }

    /// Get the number of frozen parameters.
    pub fn num_frozen_params(&self) -> usize {
        let weight_params = (self.out_features * self.in_features) as usize;
        let bias_params = if self.use_bias {
            self.out_features as usize
        } else {
            0
        };
        weight_params + bias_params
    }
}
