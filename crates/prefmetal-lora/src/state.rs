//! Adapter state dict assembly.
//!
//! Selects which entries of a flat parameter map belong in the exported
//! adapter, following the PEFT bias conventions.

use std::collections::HashMap;
use std::rc::Rc;

use mlx_rs::Array;

use prefmetal_core::LoraBias;

/// Filter a flat parameter map down to the adapter state dict.
///
/// Keys look like `layers.0.self_attn.q_proj.lora_a` or
/// `layers.0.self_attn.q_proj.bias`.
///
/// - [`LoraBias::None`] keeps only `lora_*` entries.
/// - [`LoraBias::All`] additionally keeps every bias.
/// - [`LoraBias::LoraOnly`] keeps biases belonging to modules that carry a
///   LoRA adapter.
pub fn adapter_state_dict(
    params: &HashMap<Rc<str>, Array>,
    bias: LoraBias,
) -> HashMap<Rc<str>, Array> {
    let mut out: HashMap<Rc<str>, Array> = params
        .iter()
        .filter(|(k, _)| k.contains("lora_"))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    match bias {
        LoraBias::None => {}
        LoraBias::All => {
            for (k, v) in params {
                if is_bias_key(k) {
                    out.insert(k.clone(), v.clone());
                }
            }
        }
        LoraBias::LoraOnly => {
            let lora_modules: std::collections::HashSet<&str> = params
                .keys()
                .filter_map(|k| k.rsplit_once('.').filter(|(_, leaf)| leaf.starts_with("lora_")))
                .map(|(module, _)| module)
                .collect();
            for (k, v) in params {
                if !is_bias_key(k) {
                    continue;
                }
                if let Some((module, _)) = k.rsplit_once('.') {
                    if lora_modules.contains(module) {
                        out.insert(k.clone(), v.clone());
                    }
                }
            }
        }
    }

    out
}

fn is_bias_key(key: &str) -> bool {
    key.rsplit_once('.')
        .map(|(_, leaf)| leaf == "bias")
        .unwrap_or(false)
}
