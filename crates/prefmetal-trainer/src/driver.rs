//! End-to-end DPO training driver.
//!
//! Loads the tokenizer and preference dataset, assembles policy and frozen
//! reference models, runs the epoch/batch loop with per-batch cached
//! reference log probabilities, and exports the adapter at the end.

use std::path::Path;

use indicatif::{ProgressBar, ProgressStyle};
use mlx_rs::error::Exception;
use mlx_rs::optimizers::{AdamW, AdamWBuilder, Optimizer, Sgd};
use mlx_rs::{builder::Builder, nn, Array};

use prefmetal_core::{DataConfig, LoraConfig, ModelConfig, OptimizerType, TrainingConfig};
use prefmetal_data::{
    ConvTemplate, PreferenceBatch, PreferenceCollator, PreferenceDataset, Tokenizer,
};
use prefmetal_lora::{adapter_state_dict, ModelSpec, PrefLoraForCausalLM};

use crate::checkpoint::{CheckpointManager, CheckpointMetadata};
use crate::dpo::{
    compute_log_probs, dpo_loss, precompute_reference_log_probs, DpoConfig, DpoMetrics,
};
use crate::sharding::{check_sharding_support, gather_adapter, ShardingMode, WorldInfo};
use crate::{Result, TrainerError};

const QLORA_GROUP_SIZE: i32 = 64;
const QLORA_BITS: i32 = 4;

/// Everything needed to run one training job.
#[derive(Debug, Clone, Default)]
pub struct TrainOptions {
    /// Model loading configuration.
    pub model: ModelConfig,
    /// LoRA configuration.
    pub lora: LoraConfig,
    /// Optimization configuration.
    pub training: TrainingConfig,
    /// Dataset configuration.
    pub data: DataConfig,
    /// Parameter sharding mode.
    pub sharding: ShardingMode,
    /// Resume from the latest checkpoint under the output directory.
    pub resume: bool,
}

/// Summary of a completed run.
#[derive(Debug, Clone)]
pub struct TrainReport {
    /// Total optimizer steps taken.
    pub steps: usize,
    /// Epochs completed.
    pub epochs: usize,
    /// Loss of the final step.
    pub final_loss: f32,
}

/// Turn a collated batch into the four arrays the loss needs.
///
/// Token ids become i32 arrays, labels stay i64 so the ignore sentinel
/// survives.
pub fn batch_arrays(batch: &PreferenceBatch) -> (Array, Array, Array, Array) {
    let to_ids = |rows: &[Vec<u32>], seq_len: usize| {
        let flat: Vec<i32> = rows.iter().flatten().map(|&v| v as i32).collect();
        Array::from_slice(&flat, &[batch.batch_size as i32, seq_len as i32])
    };
    let to_labels = |rows: &[Vec<i64>], seq_len: usize| {
        let flat: Vec<i64> = rows.iter().flatten().copied().collect();
        Array::from_slice(&flat, &[batch.batch_size as i32, seq_len as i32])
    };

    (
        to_ids(&batch.chosen_input_ids, batch.chosen_seq_len),
        to_labels(&batch.chosen_labels, batch.chosen_seq_len),
        to_ids(&batch.rejected_input_ids, batch.rejected_seq_len),
        to_labels(&batch.rejected_labels, batch.rejected_seq_len),
    )
}

enum TrainOptimizer {
    AdamW(AdamW),
    Sgd(Sgd),
}

impl TrainOptimizer {
    fn new(config: &TrainingConfig) -> Self {
        match config.optimizer {
            OptimizerType::AdamW => {
                // Infallible builder
                let adamw = AdamWBuilder::new(config.learning_rate as f32)
                    .weight_decay(config.weight_decay as f32)
                    .build()
                    .unwrap();
                Self::AdamW(adamw)
            }
            OptimizerType::Sgd => Self::Sgd(Sgd::new(config.learning_rate as f32)),
        }
    }

    fn update(
        &mut self,
        model: &mut PrefLoraForCausalLM,
        gradients: mlx_rs::module::FlattenedModuleParam,
    ) -> std::result::Result<(), Exception> {
        match self {
            Self::AdamW(opt) => opt.update(model, gradients),
            Self::Sgd(opt) => opt.update(model, gradients),
        }
    }
}

fn build_model(
    model_dir: &str,
    lora: &LoraConfig,
    q_lora: bool,
) -> Result<PrefLoraForCausalLM> {
    let spec = ModelSpec::from_file(Path::new(model_dir).join("config.json"))?;
    let mut model = PrefLoraForCausalLM::new(spec, lora.clone())?;
    model.load_base_weights_from_dir(model_dir)?;
    if q_lora {
        model.quantize_base_weights(QLORA_GROUP_SIZE, QLORA_BITS)?;
    }
    if let Some(ref weight_path) = lora.weight_path {
        model.load_lora_weights(weight_path)?;
        tracing::info!(path = %weight_path, "loaded initial adapter weights");
    }
    Ok(model)
}

fn per_pair_rewards(rewards: &Array) -> std::result::Result<Vec<f32>, Exception> {
    use mlx_rs::ops::indexing::IndexOp;
    rewards.eval()?;
    let n = rewards.dim(0);
    let mut out = Vec::with_capacity(n as usize);
    for i in 0..n {
        out.push(rewards.index(i).item::<f32>());
    }
    Ok(out)
}

/// Mean DPO loss over an evaluation split. No gradients are taken.
fn evaluate(
    policy: &mut PrefLoraForCausalLM,
    reference: &mut PrefLoraForCausalLM,
    dataset: &PreferenceDataset,
    collator: &PreferenceCollator,
    batch_size: usize,
    beta: f32,
) -> Result<f32> {
    let mut total = 0.0_f64;
    let mut batches = 0usize;

    for examples in dataset.batches(batch_size) {
        let batch = collator.collate(examples);
        let (chosen_ids, chosen_labels, rejected_ids, rejected_labels) = batch_arrays(&batch);

        let (ref_chosen, ref_rejected) = precompute_reference_log_probs(
            reference,
            &chosen_ids,
            &chosen_labels,
            &rejected_ids,
            &rejected_labels,
        )?;

        let chosen_logits = policy.forward(&chosen_ids, None)?;
        let rejected_logits = policy.forward(&rejected_ids, None)?;
        let policy_chosen = compute_log_probs(&chosen_logits, &chosen_labels)?;
        let policy_rejected = compute_log_probs(&rejected_logits, &rejected_labels)?;

        let (loss, _, _) = dpo_loss(
            &policy_chosen,
            &policy_rejected,
            &ref_chosen,
            &ref_rejected,
            beta,
        )?;
        loss.eval()?;
        total += loss.item::<f32>() as f64;
        batches += 1;
    }

    if batches == 0 {
        return Ok(0.0);
    }
    Ok((total / batches as f64) as f32)
}

/// Run a full DPO training job.
pub fn train(opts: &TrainOptions) -> Result<TrainReport> {
    opts.training.validate()?;
    let dpo = DpoConfig::new(opts.model.beta);
    dpo.validate()?;

    let world = WorldInfo::from_env();
    check_sharding_support(opts.sharding, opts.lora.q_lora);
    tracing::info!(
        rank = world.rank,
        world_size = world.world_size,
        "starting DPO training"
    );

    // Data pipeline.
    let template = ConvTemplate::for_model(&opts.model.model_path);
    tracing::info!(template = %template.name, "selected conversation template");

    let tokenizer = Tokenizer::from_model_dir(&opts.model.model_path)?;
    let dataset = PreferenceDataset::from_jsonl(
        &opts.data.data_path,
        &template,
        &tokenizer,
        opts.training.model_max_length,
        opts.data.max_samples,
        opts.data.shuffle,
        opts.data.seed,
    )?;
    if dataset.is_empty() {
        return Err(TrainerError::Config(format!(
            "no usable examples in {}",
            opts.data.data_path
        )));
    }

    let eval_dataset = match &opts.data.eval_data_path {
        Some(path) => Some(PreferenceDataset::from_jsonl(
            path,
            &template,
            &tokenizer,
            opts.training.model_max_length,
            None,
            false,
            opts.data.seed,
        )?),
        None => None,
    };

    let pad_token_id = tokenizer.pad_token_id().unwrap_or(0);
    let collator = PreferenceCollator::new(pad_token_id, opts.model.padding_side);

    // Policy and frozen reference. The reference gets the same starting
    // adapter so rewards are zero at step 0.
    let mut policy = build_model(&opts.model.model_path, &opts.lora, opts.lora.q_lora)?;
    let ref_dir = opts
        .model
        .ref_model_path
        .as_deref()
        .unwrap_or(&opts.model.model_path);
    let mut reference = build_model(ref_dir, &opts.lora, opts.lora.q_lora)?;

    tracing::info!(
        trainable_params = policy.num_trainable_params(),
        q_lora = opts.lora.q_lora,
        "assembled policy model"
    );

    let manager = CheckpointManager::new(&opts.training.output_dir, opts.training.max_checkpoints)?;

    let mut global_step = 0usize;
    let mut start_epoch = 0usize;
    if opts.resume {
        if let Some((params, metadata)) = manager.load_latest()? {
            policy.set_lora_parameters(&params);
            global_step = metadata.step;
            start_epoch = metadata.epoch;
            tracing::info!(step = global_step, epoch = start_epoch, "resumed from checkpoint");
        }
    }

    let mut optimizer = TrainOptimizer::new(&opts.training);

    let batches_per_epoch = dataset.len().div_ceil(opts.training.batch_size);
    let total_steps = batches_per_epoch * opts.training.num_epochs;
    let progress = if world.is_main() {
        let pb = ProgressBar::new(total_steps as u64);
        pb.set_style(ProgressStyle::default_bar());
        pb.set_position(global_step.min(total_steps) as u64);
        pb
    } else {
        ProgressBar::hidden()
    };

    let mut final_loss = 0.0_f32;

    for epoch in start_epoch..opts.training.num_epochs {
        for examples in dataset.batches(opts.training.batch_size) {
            let batch = collator.collate(examples);
            let (chosen_ids, chosen_labels, rejected_ids, rejected_labels) = batch_arrays(&batch);

            let (ref_chosen, ref_rejected) = precompute_reference_log_probs(
                &mut reference,
                &chosen_ids,
                &chosen_labels,
                &rejected_ids,
                &rejected_labels,
            )?;

            let beta = dpo.beta;
            let loss_fn = |model: &mut PrefLoraForCausalLM,
                           (chosen_ids, chosen_labels): (&Array, &Array)|
             -> std::result::Result<Array, Exception> {
                let to_exn = |e: TrainerError| Exception::custom(e.to_string());

                let chosen_logits = model
                    .forward(chosen_ids, None)
                    .map_err(|e| Exception::custom(e.to_string()))?;
                let rejected_logits = model
                    .forward(&rejected_ids, None)
                    .map_err(|e| Exception::custom(e.to_string()))?;

                let policy_chosen =
                    compute_log_probs(&chosen_logits, chosen_labels).map_err(to_exn)?;
                let policy_rejected =
                    compute_log_probs(&rejected_logits, &rejected_labels).map_err(to_exn)?;

                let (loss, _, _) = dpo_loss(
                    &policy_chosen,
                    &policy_rejected,
                    &ref_chosen,
                    &ref_rejected,
                    beta,
                )
                .map_err(to_exn)?;
                Ok(loss)
            };

            let mut loss_and_grad_fn = nn::value_and_grad(loss_fn);
            let (loss, gradients) = loss_and_grad_fn(&mut policy, (&chosen_ids, &chosen_labels))?;
            loss.eval()?;
            final_loss = loss.item::<f32>();

            optimizer.update(&mut policy, gradients)?;

            global_step += 1;
            progress.inc(1);

            if world.is_main() && global_step % opts.training.logging_steps == 0 {
                // Re-run the forward passes without gradients for reward
                // metrics.
                let chosen_logits = policy.forward(&chosen_ids, None)?;
                let rejected_logits = policy.forward(&rejected_ids, None)?;
                let policy_chosen = compute_log_probs(&chosen_logits, &chosen_labels)?;
                let policy_rejected = compute_log_probs(&rejected_logits, &rejected_labels)?;
                let (_, chosen_rewards, rejected_rewards) = dpo_loss(
                    &policy_chosen,
                    &policy_rejected,
                    &ref_chosen,
                    &ref_rejected,
                    beta,
                )?;
                let metrics = DpoMetrics::compute(
                    final_loss,
                    &per_pair_rewards(&chosen_rewards)?,
                    &per_pair_rewards(&rejected_rewards)?,
                );
                tracing::info!(
                    step = global_step,
                    epoch,
                    loss = metrics.loss,
                    chosen_reward = metrics.chosen_reward,
                    rejected_reward = metrics.rejected_reward,
                    reward_margin = metrics.reward_margin,
                    accuracy = metrics.accuracy,
                    "train"
                );
            }

            if let Some(save_steps) = opts.training.save_steps {
                if global_step % save_steps == 0 && world.is_main() {
                    let gathered = gather_adapter(&policy.lora_parameters())?;
                    let metadata = CheckpointMetadata::new(
                        global_step,
                        epoch,
                        final_loss,
                        opts.training.learning_rate,
                        opts.training.seed,
                    );
                    manager.save(&gathered, &metadata)?;
                }
            }
        }

        if let Some(ref eval) = eval_dataset {
            let eval_loss = evaluate(
                &mut policy,
                &mut reference,
                eval,
                &collator,
                opts.training.batch_size,
                dpo.beta,
            )?;
            if world.is_main() {
                tracing::info!(epoch, eval_loss, "eval");
            }
        }
    }

    progress.finish_and_clear();

    // Final adapter export, rank 0 only. Sharded runs gather full values
    // first.
    let gathered = gather_adapter(&policy.lora_parameters())?;
    let state = adapter_state_dict(&gathered, opts.lora.bias);
    if world.is_main() {
        let output_dir = Path::new(&opts.training.output_dir);
        std::fs::create_dir_all(output_dir)?;
        Array::save_safetensors(
            state,
            None,
            output_dir.join("adapter_model.safetensors"),
        )?;
        std::fs::write(
            output_dir.join("adapter_config.json"),
            serde_json::to_string_pretty(&opts.lora)?,
        )?;
        tracing::info!(path = %output_dir.display(), "saved adapter");
    }

    Ok(TrainReport {
        steps: global_step,
        epochs: opts.training.num_epochs,
        final_loss,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlx_rs::ops::indexing::IndexOp;
    use prefmetal_core::PaddingSide;
    use prefmetal_data::preprocess::TokenizedExample;

    fn example() -> TokenizedExample {
        TokenizedExample {
            prompt_input_ids: vec![1, 2],
            chosen_input_ids: vec![1, 2, 3],
            chosen_attention_mask: vec![1, 1, 1],
            chosen_labels: vec![-100, -100, 3],
            rejected_input_ids: vec![1, 2, 4, 5],
            rejected_attention_mask: vec![1, 1, 1, 1],
            rejected_labels: vec![-100, -100, 4, 5],
        }
    }

    #[test]
    fn test_batch_arrays_shapes() {
        let collator = PreferenceCollator::new(0, PaddingSide::Right);
        let batch = collator.collate(&[example(), example()]);
        let (chosen_ids, chosen_labels, rejected_ids, rejected_labels) = batch_arrays(&batch);

        assert_eq!(chosen_ids.shape(), &[2, 3]);
        assert_eq!(chosen_labels.shape(), &[2, 3]);
        assert_eq!(rejected_ids.shape(), &[2, 4]);
        assert_eq!(rejected_labels.shape(), &[2, 4]);
    }

    #[test]
    fn test_batch_arrays_values() {
        let collator = PreferenceCollator::new(9, PaddingSide::Right);
        let batch = collator.collate(&[example()]);
        let (chosen_ids, chosen_labels, _, rejected_labels) = batch_arrays(&batch);

        assert_eq!(chosen_ids.index((0, 2)).item::<i32>(), 3);
        assert_eq!(chosen_labels.index((0, 0)).item::<i64>(), -100);
        assert_eq!(rejected_labels.index((0, 3)).item::<i64>(), 5);
    }

    #[test]
    fn test_per_pair_rewards_extraction() {
        let rewards = Array::from_slice(&[0.5_f32, -0.25, 1.0], &[3]);
        let values = per_pair_rewards(&rewards).unwrap();
        assert_eq!(values.len(), 3);
        assert!((values[1] + 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_train_rejects_invalid_config() {
        let opts = TrainOptions {
            training: TrainingConfig {
                batch_size: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(train(&opts).is_err());
    }
}
