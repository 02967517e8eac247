//! LoRA-wrapped causal language model.
//!
//! A Llama-family decoder with LoRA adapters on every attention and MLP
//! projection. Base weights are frozen (and optionally quantized for QLoRA);
//! only adapters listed in `target_modules` are exposed to the optimizer.

use std::collections::HashMap;
use std::rc::Rc;

use mlx_rs::{
    builder::Builder,
    error::Exception,
    module::{ModuleParamMut, ModuleParamRef, ModuleParameters, Param},
    nested::NestedValue,
    nn, Array,
};
use serde::{Deserialize, Serialize};

use prefmetal_core::LoraConfig;

use crate::{LoraError, LoraLinear};

/// Architecture hyperparameters, deserialized from a HuggingFace
/// `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Vocabulary size.
    pub vocab_size: i32,
    /// Hidden dimension.
    pub hidden_size: i32,
    /// MLP intermediate dimension.
    pub intermediate_size: i32,
    /// Number of decoder layers.
    pub num_hidden_layers: i32,
    /// Number of attention heads.
    pub num_attention_heads: i32,
    /// Number of KV heads (GQA); defaults to `num_attention_heads`.
    #[serde(default)]
    pub num_key_value_heads: Option<i32>,
    /// Explicit head dimension override.
    #[serde(default)]
    pub head_dim: Option<i32>,
    /// RmsNorm epsilon.
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f32,
    /// RoPE base frequency.
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,
    /// Share the embedding matrix with the output head.
    #[serde(default)]
    pub tie_word_embeddings: bool,
}

fn default_rms_norm_eps() -> f32 {
    1e-5
}
fn default_rope_theta() -> f32 {
    10000.0
}

impl ModelSpec {
    /// Number of KV heads.
    pub fn num_kv_heads(&self) -> i32 {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    /// Per-head dimension.
    pub fn get_head_dim(&self) -> i32 {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads)
    }

    /// Read a `config.json` file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, LoraError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| LoraError::Mlx(Exception::custom(e.to_string())))?;
        serde_json::from_str(&content)
            .map_err(|e| LoraError::Mlx(Exception::custom(e.to_string())))
    }
}

/// Attention layer with LoRA on q/k/v/o projections.
#[derive(Debug)]
pub struct PrefLoraAttention {
    /// Number of attention heads.
    pub n_heads: i32,
    /// Number of KV heads.
    pub n_kv_heads: i32,
    /// Head dimension.
    pub head_dim: i32,
    /// Attention scale factor.
    pub scale: f32,

    /// Query projection with LoRA.
    pub q_proj: LoraLinear,
    /// Key projection with LoRA.
    pub k_proj: LoraLinear,
    /// Value projection with LoRA.
    pub v_proj: LoraLinear,
    /// Output projection with LoRA.
    pub o_proj: LoraLinear,
    /// RoPE layer.
    pub rope: nn::Rope,
}

impl PrefLoraAttention {
    /// Create a new LoRA attention layer.
    pub fn new(spec: &ModelSpec, lora_config: &LoraConfig) -> Result<Self, LoraError> {
        let n_heads = spec.num_attention_heads;
        let n_kv_heads = spec.num_kv_heads();
        let head_dim = spec.get_head_dim();
        let scale = (head_dim as f32).sqrt().recip();

        let q_proj = LoraLinear::from_config(
            spec.hidden_size,
            n_heads * head_dim,
            lora_config,
            false,
            "q_proj",
        )?;
        let k_proj = LoraLinear::from_config(
            spec.hidden_size,
            n_kv_heads * head_dim,
            lora_config,
            false,
            "k_proj",
        )?;
        let v_proj = LoraLinear::from_config(
            spec.hidden_size,
            n_kv_heads * head_dim,
            lora_config,
            false,
            "v_proj",
        )?;
        let o_proj = LoraLinear::from_config(
            n_heads * head_dim,
            spec.hidden_size,
            lora_config,
            false,
            "o_proj",
        )?;

        // Infallible builder
        let rope = nn::RopeBuilder::new(head_dim)
            .base(spec.rope_theta)
            .traditional(false)
            .build()
            .unwrap();

        Ok(Self {
            n_heads,
            n_kv_heads,
            head_dim,
            scale,
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            rope,
        })
    }

    /// Forward pass through attention.
    pub fn forward(&mut self, x: &Array, mask: Option<&Array>) -> Result<Array, LoraError> {
        let shape = x.shape();
        let batch = shape[0];
        let seq_len = shape[1];

        let queries = self.q_proj.forward(x)?;
        let keys = self.k_proj.forward(x)?;
        let values = self.v_proj.forward(x)?;

        // [B, L, heads, head_dim] -> [B, heads, L, head_dim]
        let queries = queries
            .reshape(&[batch, seq_len, self.n_heads, self.head_dim])?
            .transpose_axes(&[0, 2, 1, 3])?;
        let keys = keys
            .reshape(&[batch, seq_len, self.n_kv_heads, self.head_dim])?
            .transpose_axes(&[0, 2, 1, 3])?;
        let values = values
            .reshape(&[batch, seq_len, self.n_kv_heads, self.head_dim])?
            .transpose_axes(&[0, 2, 1, 3])?;

        let queries = mlx_rs::module::Module::forward(&mut self.rope, &queries)?;
        let keys = mlx_rs::module::Module::forward(&mut self.rope, &keys)?;

        // Expand KV heads for GQA if needed
        let (keys, values) = if self.n_kv_heads < self.n_heads {
            let repeats = self.n_heads / self.n_kv_heads;
            (
                expand_kv_heads(&keys, repeats)?,
                expand_kv_heads(&values, repeats)?,
            )
        } else {
            (keys, values)
        };

        let scores = queries.matmul(&keys.transpose_axes(&[0, 1, 3, 2])?)?;
        let scores = scores.multiply(Array::from_f32(self.scale))?;
        let scores = if let Some(m) = mask {
            scores.add(m)?
        } else {
            scores
        };

        let weights = mlx_rs::ops::softmax_axis(&scores, -1, None)?;
        let output = weights.matmul(&values)?;

        // [B, heads, L, head_dim] -> [B, L, hidden]
        let output = output
            .transpose_axes(&[0, 2, 1, 3])?
            .reshape(&[batch, seq_len, -1])?;

        self.o_proj.forward(&output)
    }
}

/// Expand KV heads for grouped query attention.
fn expand_kv_heads(x: &Array, repeats: i32) -> Result<Array, Exception> {
    let shape = x.shape();
    let batch = shape[0];
    let n_kv_heads = shape[1];
    let seq_len = shape[2];
    let head_dim = shape[3];

    let x = x.reshape(&[batch, n_kv_heads, 1, seq_len, head_dim])?;
    let x = mlx_rs::ops::broadcast_to(&x, &[batch, n_kv_heads, repeats, seq_len, head_dim])?;
    x.reshape(&[batch, n_kv_heads * repeats, seq_len, head_dim])
}

/// SwiGLU MLP with LoRA on gate/up/down projections.
#[derive(Debug)]
pub struct PrefLoraMlp {
    /// Gate projection with LoRA.
    pub gate_proj: LoraLinear,
    /// Up projection with LoRA.
    pub up_proj: LoraLinear,
    /// Down projection with LoRA.
    pub down_proj: LoraLinear,
}

impl PrefLoraMlp {
    /// Create a new LoRA MLP layer.
    pub fn new(spec: &ModelSpec, lora_config: &LoraConfig) -> Result<Self, LoraError> {
        let gate_proj = LoraLinear::from_config(
            spec.hidden_size,
            spec.intermediate_size,
            lora_config,
            false,
            "gate_proj",
        )?;
        let up_proj = LoraLinear::from_config(
            spec.hidden_size,
            spec.intermediate_size,
            lora_config,
            false,
            "up_proj",
        )?;
        let down_proj = LoraLinear::from_config(
            spec.intermediate_size,
            spec.hidden_size,
            lora_config,
            false,
            "down_proj",
        )?;

        Ok(Self {
            gate_proj,
            up_proj,
            down_proj,
        })
    }

    /// Forward pass (SwiGLU activation).
    pub fn forward(&mut self, x: &Array) -> Result<Array, LoraError> {
        let gate = self.gate_proj.forward(x)?;
        let gate = nn::silu(gate)?;
        let up = self.up_proj.forward(x)?;
        let hidden = gate.multiply(&up)?;
        self.down_proj.forward(&hidden)
    }
}

/// Decoder layer with pre-norm residual blocks.
#[derive(Debug)]
pub struct PrefLoraDecoderLayer {
    /// Self-attention layer with LoRA.
    pub self_attn: PrefLoraAttention,
    /// MLP layer with LoRA.
    pub mlp: PrefLoraMlp,
    /// Input layer norm.
    pub input_layernorm: nn::RmsNorm,
    /// Post-attention layer norm.
    pub post_attention_layernorm: nn::RmsNorm,
}

impl PrefLoraDecoderLayer {
    /// Create a new decoder layer with LoRA.
    pub fn new(spec: &ModelSpec, lora_config: &LoraConfig) -> Result<Self, LoraError> {
        let self_attn = PrefLoraAttention::new(spec, lora_config)?;
        let mlp = PrefLoraMlp::new(spec, lora_config)?;

        let input_layernorm = nn::RmsNormBuilder::new(spec.hidden_size)
            .eps(spec.rms_norm_eps)
            .build()
            .unwrap();
        let post_attention_layernorm = nn::RmsNormBuilder::new(spec.hidden_size)
            .eps(spec.rms_norm_eps)
            .build()
            .unwrap();

        Ok(Self {
            self_attn,
            mlp,
            input_layernorm,
            post_attention_layernorm,
        })
    }

    /// Forward pass.
    pub fn forward(&mut self, x: &Array, mask: Option<&Array>) -> Result<Array, LoraError> {
        let normed = mlx_rs::module::Module::forward(&mut self.input_layernorm, x)?;
        let attn_out = self.self_attn.forward(&normed, mask)?;
        let h = x.add(&attn_out)?;

        let normed = mlx_rs::module::Module::forward(&mut self.post_attention_layernorm, &h)?;
        let mlp_out = self.mlp.forward(&normed)?;
        Ok(h.add(&mlp_out)?)
    }

    /// All LoRA projections of this layer as (group, name, layer) triples.
    pub fn named_projections(&self) -> [(&'static str, &'static str, &LoraLinear); 7] {
        [
            ("self_attn", "q_proj", &self.self_attn.q_proj),
            ("self_attn", "k_proj", &self.self_attn.k_proj),
            ("self_attn", "v_proj", &self.self_attn.v_proj),
            ("self_attn", "o_proj", &self.self_attn.o_proj),
            ("mlp", "gate_proj", &self.mlp.gate_proj),
            ("mlp", "up_proj", &self.mlp.up_proj),
            ("mlp", "down_proj", &self.mlp.down_proj),
        ]
    }

    /// Mutable variant of [`Self::named_projections`].
    pub fn named_projections_mut(
        &mut self,
    ) -> [(&'static str, &'static str, &mut LoraLinear); 7] {
        [
            ("self_attn", "q_proj", &mut self.self_attn.q_proj),
            ("self_attn", "k_proj", &mut self.self_attn.k_proj),
            ("self_attn", "v_proj", &mut self.self_attn.v_proj),
            ("self_attn", "o_proj", &mut self.self_attn.o_proj),
            ("mlp", "gate_proj", &mut self.mlp.gate_proj),
            ("mlp", "up_proj", &mut self.mlp.up_proj),
            ("mlp", "down_proj", &mut self.mlp.down_proj),
        ]
    }
}

/// Decoder stack without the LM head.
#[derive(Debug)]
pub struct PrefLoraModel {
    /// Architecture spec.
    pub spec: ModelSpec,
    /// LoRA configuration.
    pub lora_config: LoraConfig,
    /// Token embeddings (frozen).
    pub embed_tokens: nn::Embedding,
    /// Transformer layers with LoRA.
    pub layers: Vec<PrefLoraDecoderLayer>,
    /// Final layer norm (frozen).
    pub norm: nn::RmsNorm,
}

impl PrefLoraModel {
    /// Create a new LoRA decoder stack.
    pub fn new(spec: ModelSpec, lora_config: LoraConfig) -> Result<Self, LoraError> {
        let embed_tokens = nn::Embedding::new(spec.vocab_size, spec.hidden_size)?;

        let layers = (0..spec.num_hidden_layers)
            .map(|_| PrefLoraDecoderLayer::new(&spec, &lora_config))
            .collect::<Result<Vec<_>, _>>()?;

        let norm = nn::RmsNormBuilder::new(spec.hidden_size)
            .eps(spec.rms_norm_eps)
            .build()
            .unwrap();

        Ok(Self {
            spec,
            lora_config,
            embed_tokens,
            layers,
            norm,
        })
    }

    /// Forward pass to final hidden states.
    pub fn forward(&mut self, input_ids: &Array, mask: Option<&Array>) -> Result<Array, LoraError> {
        let mut hidden_states =
            mlx_rs::module::Module::forward(&mut self.embed_tokens, input_ids)?;

        let mask = if mask.is_none() {
            let seq_len = input_ids.dim(1);
            Some(create_causal_mask(seq_len)?)
        } else {
            mask.cloned()
        };

        for layer in self.layers.iter_mut() {
            hidden_states = layer.forward(&hidden_states, mask.as_ref())?;
        }

        Ok(mlx_rs::module::Module::forward(
            &mut self.norm,
            &hidden_states,
        )?)
    }
}

/// LoRA-wrapped causal LM with optional tied output head.
#[derive(Debug)]
pub struct PrefLoraForCausalLM {
    /// Base model with LoRA.
    pub model: PrefLoraModel,
    /// LM head (frozen, None for tied weights).
    pub lm_head: Option<nn::Linear>,
}

impl PrefLoraForCausalLM {
    /// Create a new LoRA causal LM.
    pub fn new(spec: ModelSpec, lora_config: LoraConfig) -> Result<Self, LoraError> {
        let tie_weights = spec.tie_word_embeddings;
        let hidden_size = spec.hidden_size;
        let vocab_size = spec.vocab_size;
        let model = PrefLoraModel::new(spec, lora_config)?;

        let lm_head = if !tie_weights {
            let head = nn::LinearBuilder::new(hidden_size, vocab_size)
                .bias(false)
                .build()
                .unwrap();
            Some(head)
        } else {
            None
        };

        Ok(Self { model, lm_head })
    }

    /// Forward pass producing logits.
    pub fn forward(&mut self, input_ids: &Array, mask: Option<&Array>) -> Result<Array, LoraError> {
        let hidden_states = self.model.forward(input_ids, mask)?;

        if let Some(ref mut lm_head) = self.lm_head {
            Ok(mlx_rs::module::Module::forward(lm_head, &hidden_states)?)
        } else {
            // Tied weights: project through the embedding matrix.
            Ok(self.model.embed_tokens.as_linear(&hidden_states)?)
        }
    }

    /// Quantize all frozen base projection weights in place (QLoRA).
    pub fn quantize_base_weights(&mut self, group_size: i32, bits: i32) -> Result<(), LoraError> {
        for layer in self.model.layers.iter_mut() {
            for (_, _, proj) in layer.named_projections_mut() {
                proj.quantize_base(group_size, bits)?;
            }
        }
        tracing::info!(group_size, bits, "quantized base projection weights");
        Ok(())
    }

    /// Trainable LoRA parameters as a flat map keyed like
    /// `layers.0.self_attn.q_proj.lora_a`.
    ///
    /// Adapters outside `target_modules` are excluded.
    pub fn lora_parameters(&self) -> HashMap<Rc<str>, Array> {
        let mut params = HashMap::new();
        for (i, layer) in self.model.layers.iter().enumerate() {
            for (group, name, proj) in layer.named_projections() {
                if !proj.trainable {
                    continue;
                }
                params.insert(
                    Rc::from(format!("layers.{i}.{group}.{name}.lora_a")),
                    proj.lora_a.clone(),
                );
                params.insert(
                    Rc::from(format!("layers.{i}.{group}.{name}.lora_b")),
                    proj.lora_b.clone(),
                );
            }
        }
        params
    }

    /// Overwrite adapter matrices from a flat parameter map.
    pub fn set_lora_parameters(&mut self, params: &HashMap<Rc<str>, Array>) {
        for (i, layer) in self.model.layers.iter_mut().enumerate() {
            for (group, name, proj) in layer.named_projections_mut() {
                let a_key = format!("layers.{i}.{group}.{name}.lora_a");
                let b_key = format!("layers.{i}.{group}.{name}.lora_b");
                if let Some(value) = params.get(a_key.as_str()) {
                    proj.lora_a = value.clone();
                }
                if let Some(value) = params.get(b_key.as_str()) {
                    proj.lora_b = value.clone();
                }
            }
        }
    }

    /// Save trainable adapter weights to safetensors.
    pub fn save_lora_weights(&self, path: impl AsRef<std::path::Path>) -> Result<(), LoraError> {
        let params = self.lora_parameters();
        Array::save_safetensors(params, None, path)?;
        Ok(())
    }

    /// Load adapter weights from a safetensors file or a directory holding
    /// `adapter_model.safetensors`.
    pub fn load_lora_weights(
        &mut self,
        path: impl AsRef<std::path::Path>,
    ) -> Result<(), LoraError> {
        let path = path.as_ref();
        let file_path = if path.is_dir() {
            path.join("adapter_model.safetensors")
        } else {
            path.to_path_buf()
        };
        let loaded = Array::load_safetensors(&file_path)?;

        for (i, layer) in self.model.layers.iter_mut().enumerate() {
            for (group, name, proj) in layer.named_projections_mut() {
                let a_key = format!("layers.{i}.{group}.{name}.lora_a");
                let b_key = format!("layers.{i}.{group}.{name}.lora_b");
                if let Some(value) = loaded.get(a_key.as_str()) {
                    proj.lora_a = value.clone();
                }
                if let Some(value) = loaded.get(b_key.as_str()) {
                    proj.lora_b = value.clone();
                }
            }
        }

        Ok(())
    }

    /// Load frozen base weights from a HuggingFace-format weight map.
    pub fn load_base_weights(
        &mut self,
        weights: &HashMap<String, Array>,
    ) -> Result<(), LoraError> {
        if let Some(w) = weights.get("model.embed_tokens.weight") {
            self.model.embed_tokens.weight = Param::new(w.clone());
        }

        for (i, layer) in self.model.layers.iter_mut().enumerate() {
            let prefix = format!("model.layers.{}", i);

            for (group, name, proj) in layer.named_projections_mut() {
                if let Some(w) = weights.get(&format!("{prefix}.{group}.{name}.weight")) {
                    proj.weight = w.clone();
                }
            }

            if let Some(w) = weights.get(&format!("{}.input_layernorm.weight", prefix)) {
                layer.input_layernorm.weight = Param::new(w.clone());
            }
            if let Some(w) = weights.get(&format!("{}.post_attention_layernorm.weight", prefix)) {
                layer.post_attention_layernorm.weight = Param::new(w.clone());
            }
        }

        if let Some(w) = weights.get("model.norm.weight") {
            self.model.norm.weight = Param::new(w.clone());
        }

        if let Some(ref mut lm_head) = self.lm_head {
            if let Some(w) = weights.get("lm_head.weight") {
                lm_head.weight = Param::new(w.clone());
            }
        }

        Ok(())
    }

    /// Load base weights from a model directory, handling both single-file
    /// (`model.safetensors`) and index-sharded layouts.
    pub fn load_base_weights_from_dir(
        &mut self,
        model_dir: impl AsRef<std::path::Path>,
    ) -> Result<(), LoraError> {
        let model_dir = model_dir.as_ref();

        let single_file = model_dir.join("model.safetensors");
        if single_file.exists() {
            let weights = Array::load_safetensors(&single_file)?;
            return self.load_base_weights(&weights);
        }

        let index_path = model_dir.join("model.safetensors.index.json");
        if !index_path.exists() {
            return Err(LoraError::Mlx(Exception::custom(
                "No model.safetensors or model.safetensors.index.json found".to_string(),
            )));
        }

        let index_content = std::fs::read_to_string(&index_path)
            .map_err(|e| LoraError::Mlx(Exception::custom(e.to_string())))?;

        #[derive(Deserialize)]
        struct WeightIndex {
            weight_map: HashMap<String, String>,
        }

        let index: WeightIndex = serde_json::from_str(&index_content)
            .map_err(|e| LoraError::Mlx(Exception::custom(e.to_string())))?;

        let shard_files: std::collections::HashSet<&String> = index.weight_map.values().collect();

        let mut all_weights = HashMap::new();
        for shard_file in shard_files {
            let shard_path = model_dir.join(shard_file);
            let shard_weights = Array::load_safetensors(&shard_path)?;
            all_weights.extend(shard_weights);
        }

        self.load_base_weights(&all_weights)
    }

    /// Get number of trainable parameters.
    pub fn num_trainable_params(&self) -> usize {
        self.model
            .layers
            .iter()
            .flat_map(|l| l.named_projections())
            .map(|(_, _, p)| p.num_trainable_params())
            .sum()
    }

    /// Get the architecture spec.
    pub fn spec(&self) -> &ModelSpec {
        &self.model.spec
    }

    /// Get the LoRA configuration.
    pub fn lora_config(&self) -> &LoraConfig {
        &self.model.lora_config
    }
}

/// Only the trainable adapter matrices are exposed, so `nn::value_and_grad`
/// differentiates adapters and nothing else.
impl ModuleParameters for PrefLoraForCausalLM {
    fn parameters(&self) -> ModuleParamRef<'_> {
        let mut params = ModuleParamRef::new();

        for (i, layer) in self.model.layers.iter().enumerate() {
            let mut groups: HashMap<Rc<str>, NestedValue<Rc<str>, &Array>> = HashMap::new();
            for (group, name, proj) in layer.named_projections() {
                if !proj.trainable {
                    continue;
                }
                let mut p = HashMap::new();
                p.insert(Rc::from("lora_a"), NestedValue::Value(&proj.lora_a));
                p.insert(Rc::from("lora_b"), NestedValue::Value(&proj.lora_b));

                let entry = groups
                    .entry(Rc::from(group))
                    .or_insert_with(|| NestedValue::Map(HashMap::new()));
                if let NestedValue::Map(m) = entry {
                    m.insert(Rc::from(name), NestedValue::Map(p));
                }
            }
            params.insert(Rc::from(format!("layers.{}", i)), NestedValue::Map(groups));
        }

        params
    }

    fn parameters_mut(&mut self) -> ModuleParamMut<'_> {
        let mut params = ModuleParamMut::new();

        for (i, layer) in self.model.layers.iter_mut().enumerate() {
            let mut groups: HashMap<Rc<str>, NestedValue<Rc<str>, &mut Array>> = HashMap::new();
            for (group, name, proj) in layer.named_projections_mut() {
                if !proj.trainable {
                    continue;
                }
                let mut p = HashMap::new();
                p.insert(Rc::from("lora_a"), NestedValue::Value(&mut proj.lora_a));
                p.insert(Rc::from("lora_b"), NestedValue::Value(&mut proj.lora_b));

                let entry = groups
                    .entry(Rc::from(group))
                    .or_insert_with(|| NestedValue::Map(HashMap::new()));
                if let NestedValue::Map(m) = entry {
                    m.insert(Rc::from(name), NestedValue::Map(p));
                }
            }
            params.insert(Rc::from(format!("layers.{}", i)), NestedValue::Map(groups));
        }

        params
    }

    fn trainable_parameters(&self) -> ModuleParamRef<'_> {
        self.parameters()
    }

    fn freeze_parameters(&mut self, _recursive: bool) {
        // Base weights are always frozen, adapters always trainable.
    }

    fn unfreeze_parameters(&mut self, _recursive: bool) {}

    fn all_frozen(&self) -> Option<bool> {
        Some(false)
    }

    fn any_frozen(&self) -> Option<bool> {
        Some(false)
    }
}

/// Create a causal attention mask.
pub fn create_causal_mask(seq_len: i32) -> Result<Array, Exception> {
    let mask = mlx_rs::ops::tri::<f32>(seq_len, None, None)?;
    let neg_inf = Array::from_f32(f32::NEG_INFINITY);
    let zero = Array::from_f32(0.0);
    mlx_rs::ops::r#where(&mask.eq(&zero)?, &neg_inf, &zero)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_spec() -> ModelSpec {
        ModelSpec {
            vocab_size: 1000,
            hidden_size: 64,
            intermediate_size: 128,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            num_key_value_heads: Some(2),
            head_dim: None,
            rms_norm_eps: 1e-5,
            rope_theta: 10000.0,
            tie_word_embeddings: false,
        }
    }

    fn all_modules_lora() -> LoraConfig {
        LoraConfig {
            target_modules: vec![
                "q_proj".into(),
                "k_proj".into(),
                "v_proj".into(),
                "o_proj".into(),
                "gate_proj".into(),
                "up_proj".into(),
                "down_proj".into(),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_attention_shape() {
        let spec = small_spec();
        let mut attn = PrefLoraAttention::new(&spec, &all_modules_lora()).unwrap();

        let x = mlx_rs::random::normal::<f32>(&[1, 4, 64], None, None, None).unwrap();
        let output = attn.forward(&x, None).unwrap();

        assert_eq!(output.shape(), &[1, 4, 64]);
    }

    #[test]
    fn test_causal_lm_logits_shape() {
        let mut model = PrefLoraForCausalLM::new(small_spec(), all_modules_lora()).unwrap();

        let input_ids = Array::from_slice(&[1_i32, 2, 3, 4], &[1, 4]);
        let logits = model.forward(&input_ids, None).unwrap();

        assert_eq!(logits.shape(), &[1, 4, 1000]);
    }

    #[test]
    fn test_tied_embeddings_logits_shape() {
        let spec = ModelSpec {
            tie_word_embeddings: true,
            ..small_spec()
        };
        let mut model = PrefLoraForCausalLM::new(spec, all_modules_lora()).unwrap();
        assert!(model.lm_head.is_none());

        let input_ids = Array::from_slice(&[1_i32, 2, 3, 4], &[1, 4]);
        let logits = model.forward(&input_ids, None).unwrap();
        assert_eq!(logits.shape(), &[1, 4, 1000]);
    }

    #[test]
    fn test_lora_parameters_respect_target_modules() {
        // Default targets are q_proj and v_proj only.
        let model = PrefLoraForCausalLM::new(small_spec(), LoraConfig::default()).unwrap();
        let params = model.lora_parameters();

        // 2 layers x 2 modules x (lora_a, lora_b)
        assert_eq!(params.len(), 8);
        assert!(params.contains_key("layers.0.self_attn.q_proj.lora_a"));
        assert!(params.contains_key("layers.1.self_attn.v_proj.lora_b"));
        assert!(!params.contains_key("layers.0.self_attn.k_proj.lora_a"));
        assert!(!params.contains_key("layers.0.mlp.gate_proj.lora_a"));
    }

    #[test]
    fn test_save_load_adapter_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adapter_model.safetensors");

        let mut model = PrefLoraForCausalLM::new(small_spec(), LoraConfig::default()).unwrap();
        model.save_lora_weights(&path).unwrap();

        let mut other = PrefLoraForCausalLM::new(small_spec(), LoraConfig::default()).unwrap();
        other.load_lora_weights(&path).unwrap();

        let a = model.lora_parameters();
        let b = other.lora_parameters();
        assert_eq!(a.len(), b.len());
        for (key, value) in &a {
            let loaded = b.get(key).unwrap();
            let diff = value.subtract(loaded).unwrap().abs().unwrap().max(None).unwrap();
            diff.eval().unwrap();
            assert!(diff.item::<f32>() < 1e-6);
        }
    }

    #[test]
    fn test_set_lora_parameters_overwrites() {
        let mut model = PrefLoraForCausalLM::new(small_spec(), LoraConfig::default()).unwrap();
        let mut params = model.lora_parameters();

        let key: Rc<str> = Rc::from("layers.0.self_attn.q_proj.lora_b");
        let shape = params[&key].shape().to_vec();
        params.insert(key.clone(), Array::ones::<f32>(&shape).unwrap());
        model.set_lora_parameters(&params);

        let updated = model.lora_parameters();
        let total = updated[&key].sum(None).unwrap();
        total.eval().unwrap();
        assert!((total.item::<f32>() - shape.iter().product::<i32>() as f32).abs() < 1e-4);
    }

    #[test]
    fn test_model_spec_from_json() {
        let json = r#"{
            "vocab_size": 32000,
            "hidden_size": 4096,
            "intermediate_size": 11008,
            "num_hidden_layers": 32,
            "num_attention_heads": 32
        }"#;
        let spec: ModelSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.num_kv_heads(), 32);
        assert_eq!(spec.get_head_dim(), 128);
        assert!(!spec.tie_word_embeddings);
    }
}
