//! Direct Preference Optimization loss.
//!
//! Trains the policy to prefer chosen responses over rejected ones without a
//! separate reward model, against a frozen reference:
//!
//! ```text
//! L = -log(sigmoid(beta * ((log_pi(y_w|x) - log_ref(y_w|x))
//!                        - (log_pi(y_l|x) - log_ref(y_l|x)))))
//! ```
//!
//! From "Direct Preference Optimization: Your Language Model is Secretly a
//! Reward Model" (Rafailov et al.).

use mlx_rs::ops::indexing::IndexOp;
use mlx_rs::{Array, Dtype};

use prefmetal_lora::PrefLoraForCausalLM;

use crate::{Result, TrainerError};

/// DPO hyperparameters.
#[derive(Debug, Clone)]
pub struct DpoConfig {
    /// Preference temperature. Higher values make the policy track the
    /// preference labels more aggressively. Typical range 0.1 to 0.5.
    pub beta: f32,
}

impl Default for DpoConfig {
    fn default() -> Self {
        Self { beta: 0.1 }
    }
}

impl DpoConfig {
    /// Create a config with the given beta.
    pub fn new(beta: f32) -> Self {
        Self { beta }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.beta <= 0.0 {
            return Err(TrainerError::Config("DPO beta must be positive".into()));
        }
        Ok(())
    }
}

/// Sum per-sequence log probabilities of the labeled tokens.
///
/// `logits` is [batch, seq_len, vocab], `labels` is [batch, seq_len] with
/// `-100` marking ignored positions. Logits and labels are shifted for
/// next-token prediction, so position `t` scores `labels[t + 1]`.
///
/// Returns the summed log probabilities, shape [batch].
pub fn compute_log_probs(logits: &Array, labels: &Array) -> Result<Array> {
    let seq_len = logits.dim(1);

    let pred_logits = logits.index((.., ..seq_len - 1, ..));
    let target_labels = labels.index((.., 1..));

    let log_probs = mlx_rs::nn::log_softmax(&pred_logits, -1)?;

    // Ignore sentinel must match the labels dtype before comparison.
    let labels_dtype = target_labels.dtype();
    let ignore_index = Array::from_int(-100).as_dtype(labels_dtype)?;
    let valid_mask = target_labels.ne(&ignore_index)?;

    // Replace -100 with 0 so gathering stays in range; masked out below.
    let zero = Array::from_int(0).as_dtype(labels_dtype)?;
    let gather_labels = mlx_rs::ops::maximum(&target_labels, &zero)?;
    let gather_indices = gather_labels.expand_dims(-1i32)?;

    let gathered = log_probs.take_along_axis(&gather_indices, -1)?;
    let gathered = gathered.squeeze_axes(&[-1i32])?;

    let masked = gathered.multiply(&valid_mask.as_dtype(Dtype::Float32)?)?;
    Ok(masked.sum_axes(&[1i32], false)?)
}

/// Compute the sigmoid DPO loss for a batch.
///
/// All inputs are per-sequence summed log probabilities, shape [batch].
///
/// Returns `(loss, chosen_rewards, rejected_rewards)` where the loss is the
/// batch mean and the rewards are beta-scaled log ratios for logging.
pub fn dpo_loss(
    policy_chosen_logps: &Array,
    policy_rejected_logps: &Array,
    ref_chosen_logps: &Array,
    ref_rejected_logps: &Array,
    beta: f32,
) -> Result<(Array, Array, Array)> {
    // Implicit rewards: log_pi(y|x) - log_ref(y|x)
    let chosen_rewards = policy_chosen_logps.subtract(ref_chosen_logps)?;
    let rejected_rewards = policy_rejected_logps.subtract(ref_rejected_logps)?;

    let beta_arr = Array::from_f32(beta);
    let logits = chosen_rewards
        .subtract(&rejected_rewards)?
        .multiply(&beta_arr)?;

    // -log(sigmoid(x)) = softplus(-x)
    let loss = mlx_rs::nn::softplus(&logits.negative()?)?;
    let loss = loss.mean(None)?;

    let chosen_rewards = chosen_rewards.multiply(&beta_arr)?;
    let rejected_rewards = rejected_rewards.multiply(&beta_arr)?;

    Ok((loss, chosen_rewards, rejected_rewards))
}

/// Run the frozen reference model over one batch and cache its summed log
/// probabilities.
///
/// The reference is computed once per batch; results are evaluated so the
/// training step treats them as constants.
pub fn precompute_reference_log_probs(
    reference: &mut PrefLoraForCausalLM,
    chosen_inputs: &Array,
    chosen_labels: &Array,
    rejected_inputs: &Array,
    rejected_labels: &Array,
) -> Result<(Array, Array)> {
    if chosen_inputs.shape().len() != 2 || rejected_inputs.shape().len() != 2 {
        return Err(TrainerError::Config(format!(
            "reference inputs must be [batch, seq]: chosen {:?}, rejected {:?}",
            chosen_inputs.shape(),
            rejected_inputs.shape()
        )));
    }
    if chosen_inputs.dim(0) != rejected_inputs.dim(0) {
        return Err(TrainerError::Config(format!(
            "batch size mismatch: chosen={}, rejected={}",
            chosen_inputs.dim(0),
            rejected_inputs.dim(0)
        )));
    }

    let chosen_logits = reference.forward(chosen_inputs, None)?;
    let ref_chosen = compute_log_probs(&chosen_logits, chosen_labels)?;

    let rejected_logits = reference.forward(rejected_inputs, None)?;
    let ref_rejected = compute_log_probs(&rejected_logits, rejected_labels)?;

    // Detach from the graph and materialize.
    let ref_chosen = mlx_rs::stop_gradient(&ref_chosen)?;
    let ref_rejected = mlx_rs::stop_gradient(&ref_rejected)?;
    ref_chosen.eval()?;
    ref_rejected.eval()?;

    Ok((ref_chosen, ref_rejected))
}

/// Per-step training metrics.
#[derive(Debug, Clone)]
pub struct DpoMetrics {
    /// DPO loss value.
    pub loss: f32,
    /// Mean beta-scaled reward for chosen responses.
    pub chosen_reward: f32,
    /// Mean beta-scaled reward for rejected responses.
    pub rejected_reward: f32,
    /// Reward margin (chosen - rejected).
    pub reward_margin: f32,
    /// Fraction of pairs where chosen outscores rejected.
    pub accuracy: f32,
}

impl DpoMetrics {
    /// Compute metrics from per-pair rewards.
    ///
    /// An empty batch yields zero rewards and zero accuracy.
    pub fn compute(loss: f32, chosen_rewards: &[f32], rejected_rewards: &[f32]) -> Self {
        if chosen_rewards.is_empty() {
            return Self {
                loss,
                chosen_reward: 0.0,
                rejected_reward: 0.0,
                reward_margin: 0.0,
                accuracy: 0.0,
            };
        }
        let n = chosen_rewards.len() as f32;
        let chosen_reward = chosen_rewards.iter().sum::<f32>() / n;
        let rejected_reward = rejected_rewards.iter().sum::<f32>() / n;

        let correct = chosen_rewards
            .iter()
            .zip(rejected_rewards.iter())
            .filter(|(c, r)| c > r)
            .count();

        Self {
            loss,
            chosen_reward,
            rejected_reward,
            reward_margin: chosen_reward - rejected_reward,
            accuracy: correct as f32 / n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        assert!(DpoConfig::default().validate().is_ok());
        assert!(DpoConfig::new(0.5).validate().is_ok());
        assert!(DpoConfig::new(0.0).validate().is_err());
        assert!(DpoConfig::new(-0.1).validate().is_err());
    }

    #[test]
    fn test_log_probs_uniform_logits() {
        // All-zero logits: log_softmax is -ln(V) everywhere, so the total is
        // -ln(V) per supervised target.
        let batch = 1;
        let seq_len = 3;
        let vocab = 4;
        let logits = mlx_rs::ops::zeros::<f32>(&[batch, seq_len, vocab]).unwrap();
        let labels = Array::from_slice(&[-100_i64, 2, 1], &[1, 3]);

        let logps = compute_log_probs(&logits, &labels).unwrap();
        logps.eval().unwrap();

        assert_eq!(logps.shape(), &[1]);
        let expected = -2.0 * (vocab as f32).ln();
        assert!((logps.item::<f32>() - expected).abs() < 1e-5);
    }

    #[test]
    fn test_log_probs_ignores_masked_positions() {
        let logits = mlx_rs::ops::zeros::<f32>(&[1, 4, 8]).unwrap();
        let all_masked = Array::from_slice(&[-100_i64, -100, -100, -100], &[1, 4]);

        let logps = compute_log_probs(&logits, &all_masked).unwrap();
        logps.eval().unwrap();
        assert!(logps.item::<f32>().abs() < 1e-6);
    }

    #[test]
    fn test_log_probs_i64_labels_shape() {
        let logits_data: Vec<f32> = (0..2 * 4 * 10).map(|i| i as f32 * 0.1).collect();
        let logits = Array::from_slice(&logits_data, &[2, 4, 10]);
        let labels = Array::from_slice(&[-100_i64, 1, 2, 3, -100, 4, 5, 6], &[2, 4]);

        let logps = compute_log_probs(&logits, &labels).unwrap();
        logps.eval().unwrap();
        assert_eq!(logps.shape(), &[2]);
    }

    #[test]
    fn test_dpo_loss_at_initialization() {
        // Policy equal to reference: logits are zero, loss is ln(2).
        let logps = Array::from_slice(&[-5.0_f32, -3.0], &[2]);
        let (loss, chosen_r, rejected_r) =
            dpo_loss(&logps, &logps, &logps, &logps, 0.1).unwrap();
        loss.eval().unwrap();
        chosen_r.eval().unwrap();
        rejected_r.eval().unwrap();

        assert!((loss.item::<f32>() - 2.0_f32.ln()).abs() < 1e-5);
        assert!(chosen_r.index(0).item::<f32>().abs() < 1e-6);
    }

    #[test]
    fn test_dpo_loss_prefers_wider_margin() {
        let ref_logps = Array::from_slice(&[0.0_f32], &[1]);

        let good_chosen = Array::from_slice(&[2.0_f32], &[1]);
        let good_rejected = Array::from_slice(&[-2.0_f32], &[1]);
        let (good_loss, _, _) =
            dpo_loss(&good_chosen, &good_rejected, &ref_logps, &ref_logps, 0.1).unwrap();

        let bad_chosen = Array::from_slice(&[-2.0_f32], &[1]);
        let bad_rejected = Array::from_slice(&[2.0_f32], &[1]);
        let (bad_loss, _, _) =
            dpo_loss(&bad_chosen, &bad_rejected, &ref_logps, &ref_logps, 0.1).unwrap();

        good_loss.eval().unwrap();
        bad_loss.eval().unwrap();
        assert!(good_loss.item::<f32>() < bad_loss.item::<f32>());
    }

    #[test]
    fn test_dpo_loss_known_value() {
        // chosen reward 5, rejected reward 0, beta 0.1:
        // logits = 0.5, loss = softplus(-0.5)
        let chosen = Array::from_slice(&[5.0_f32], &[1]);
        let rejected = Array::from_slice(&[0.0_f32], &[1]);
        let zero = Array::from_slice(&[0.0_f32], &[1]);

        let (loss, chosen_r, rejected_r) =
            dpo_loss(&chosen, &rejected, &zero, &zero, 0.1).unwrap();
        loss.eval().unwrap();
        chosen_r.eval().unwrap();
        rejected_r.eval().unwrap();

        let expected = (1.0_f32 + (-0.5_f32).exp()).ln();
        assert!((loss.item::<f32>() - expected).abs() < 1e-5);
        assert!((chosen_r.index(0).item::<f32>() - 0.5).abs() < 1e-6);
        assert!(rejected_r.index(0).item::<f32>().abs() < 1e-6);
    }

    #[test]
    fn test_metrics() {
        let chosen = vec![1.0_f32, 2.0, 1.5, 0.5];
        let rejected = vec![0.5_f32, 1.0, 2.0, 0.0];

        let metrics = DpoMetrics::compute(0.1, &chosen, &rejected);

        assert_eq!(metrics.loss, 0.1);
        assert!((metrics.chosen_reward - 1.25).abs() < 1e-5);
        assert!((metrics.rejected_reward - 0.875).abs() < 1e-5);
        assert!((metrics.reward_margin - 0.375).abs() < 1e-5);
        assert!((metrics.accuracy - 0.75).abs() < 1e-5);
    }

    #[test]
    fn test_metrics_empty_batch() {
        let metrics = DpoMetrics::compute(0.7, &[], &[]);

        assert_eq!(metrics.loss, 0.7);
        assert_eq!(metrics.chosen_reward, 0.0);
        assert_eq!(metrics.rejected_reward, 0.0);
        assert_eq!(metrics.reward_margin, 0.0);
        assert_eq!(metrics.accuracy, 0.0);
    }
}
