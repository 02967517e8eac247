//! Prefmetal CLI - DPO preference fine-tuning for Apple Silicon.

use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

use prefmetal_core::{
    DataConfig, LoraBias, LoraConfig, ModelConfig, OptimizerType, PaddingSide, TrainingConfig,
};
use prefmetal_data::{
    preprocess_record, ConvTemplate, PreferenceDataset, TokenEncoder, Tokenizer, IGNORE_TOKEN_ID,
};
use prefmetal_trainer::{train, ShardingMode, TrainOptions};

/// Combined configuration for a training run, loadable from a JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FullConfig {
    /// Model configuration.
    #[serde(default)]
    pub model: Option<ModelConfig>,

    /// LoRA configuration.
    #[serde(default)]
    pub lora: LoraConfig,

    /// Training hyperparameters.
    #[serde(default)]
    pub training: TrainingConfig,

    /// Dataset configuration.
    #[serde(default)]
    pub data: Option<DataConfig>,
}

/// Bias handling mode for the exported adapter.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum BiasArg {
    /// Export no bias parameters.
    #[default]
    None,
    /// Export all bias parameters.
    All,
    /// Export biases of modules that carry an adapter.
    LoraOnly,
}

impl From<BiasArg> for LoraBias {
    fn from(value: BiasArg) -> Self {
        match value {
            BiasArg::None => LoraBias::None,
            BiasArg::All => LoraBias::All,
            BiasArg::LoraOnly => LoraBias::LoraOnly,
        }
    }
}

/// Which side of a sequence receives padding.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum PaddingArg {
    /// Pad on the left.
    Left,
    /// Pad on the right.
    #[default]
    Right,
}

impl From<PaddingArg> for PaddingSide {
    fn from(value: PaddingArg) -> Self {
        match value {
            PaddingArg::Left => PaddingSide::Left,
            PaddingArg::Right => PaddingSide::Right,
        }
    }
}

/// Parameter sharding mode.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum ShardingArg {
    /// No sharding.
    #[default]
    None,
    /// Fully sharded data parallel.
    Fsdp,
    /// ZeRO stage 3 sharding.
    Zero3,
}

impl From<ShardingArg> for ShardingMode {
    fn from(value: ShardingArg) -> Self {
        match value {
            ShardingArg::None => ShardingMode::None,
            ShardingArg::Fsdp => ShardingMode::Fsdp,
            ShardingArg::Zero3 => ShardingMode::Zero3,
        }
    }
}

/// Optimizer selection.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OptimizerArg {
    /// AdamW optimizer.
    #[default]
    AdamW,
    /// SGD.
    Sgd,
}

impl From<OptimizerArg> for OptimizerType {
    fn from(value: OptimizerArg) -> Self {
        match value {
            OptimizerArg::AdamW => OptimizerType::AdamW,
            OptimizerArg::Sgd => OptimizerType::Sgd,
        }
    }
}

#[derive(Parser)]
#[command(name = "prefmetal")]
#[command(author, version, about = "DPO preference fine-tuning optimized for Apple Silicon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fine-tune a model on preference pairs with DPO
    Train {
        /// Path to a JSON training configuration file
        #[arg(short, long)]
        config: Option<String>,

        /// Model path (local directory)
        #[arg(short, long)]
        model: Option<String>,

        /// Reference model path (defaults to the policy model path)
        #[arg(long)]
        ref_model: Option<String>,

        /// Trust custom model code in the model directory
        #[arg(long)]
        trust_remote_code: bool,

        /// Training dataset (JSONL file of preference records)
        #[arg(short, long)]
        dataset: Option<String>,

        /// Evaluation dataset (optional JSONL file)
        #[arg(long)]
        eval_dataset: Option<String>,

        /// Output directory
        #[arg(short, long)]
        output: Option<String>,

        /// DPO beta
        #[arg(long)]
        beta: Option<f32>,

        /// LoRA rank
        #[arg(long)]
        lora_r: Option<usize>,

        /// LoRA alpha
        #[arg(long)]
        lora_alpha: Option<f32>,

        /// LoRA dropout
        #[arg(long)]
        lora_dropout: Option<f32>,

        /// Comma-separated projection names whose adapters are trained
        #[arg(long, value_delimiter = ',')]
        target_modules: Option<Vec<String>>,

        /// Use rank-stabilized LoRA scaling
        #[arg(long)]
        use_rslora: bool,

        /// Previously saved adapter weights to start from
        #[arg(long)]
        lora_weights: Option<String>,

        /// Bias export mode
        #[arg(long, value_enum)]
        lora_bias: Option<BiasArg>,

        /// Quantize the frozen base weights (QLoRA)
        #[arg(long)]
        q_lora: bool,

        /// Learning rate
        #[arg(long)]
        learning_rate: Option<f64>,

        /// Weight decay
        #[arg(long)]
        weight_decay: Option<f64>,

        /// Optimizer
        #[arg(long, value_enum)]
        optimizer: Option<OptimizerArg>,

        /// Cache directory for intermediate artifacts
        #[arg(long)]
        cache_dir: Option<String>,

        /// Batch size
        #[arg(long)]
        batch_size: Option<usize>,

        /// Number of epochs
        #[arg(long)]
        epochs: Option<usize>,

        /// Truncation bound shared by prompt, chosen and rejected rows
        #[arg(long)]
        model_max_length: Option<usize>,

        /// Maximum prompt length
        #[arg(long)]
        max_prompt_length: Option<usize>,

        /// Maximum completion length
        #[arg(long)]
        max_target_length: Option<usize>,

        /// Random seed
        #[arg(long)]
        seed: Option<u64>,

        /// Log metrics every N steps
        #[arg(long)]
        logging_steps: Option<usize>,

        /// Save a checkpoint every N steps
        #[arg(long)]
        save_steps: Option<usize>,

        /// Maximum number of checkpoints to keep
        #[arg(long)]
        max_checkpoints: Option<usize>,

        /// Cap the number of training samples
        #[arg(long)]
        max_samples: Option<usize>,

        /// Disable dataset shuffling
        #[arg(long)]
        no_shuffle: bool,

        /// Padding side
        #[arg(long, value_enum)]
        padding_side: Option<PaddingArg>,

        /// Parameter sharding mode
        #[arg(long, value_enum)]
        sharding: Option<ShardingArg>,

        /// Resume from the latest checkpoint in the output directory
        #[arg(long)]
        resume: bool,
    },

    /// Render and mask one dataset record for debugging
    Inspect {
        /// Model path (for its tokenizer and template selection)
        #[arg(short, long)]
        model: String,

        /// Dataset path (JSONL file)
        #[arg(short, long)]
        dataset: String,

        /// Record index to inspect
        #[arg(short, long, default_value = "0")]
        index: usize,

        /// Truncation bound
        #[arg(long, default_value = "512")]
        model_max_length: usize,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            config,
            model,
            ref_model,
            trust_remote_code,
            dataset,
            eval_dataset,
            output,
            beta,
            lora_r,
            lora_alpha,
            lora_dropout,
            target_modules,
            use_rslora,
            lora_weights,
            lora_bias,
            q_lora,
            learning_rate,
            weight_decay,
            optimizer,
            cache_dir,
            batch_size,
            epochs,
            model_max_length,
            max_prompt_length,
            max_target_length,
            seed,
            logging_steps,
            save_steps,
            max_checkpoints,
            max_samples,
            no_shuffle,
            padding_side,
            sharding,
            resume,
        } => {
            let file_config: FullConfig = match &config {
                Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
                None => FullConfig::default(),
            };

            let mut model_config = file_config.model.unwrap_or_default();
            if let Some(m) = model {
                model_config.model_path = m;
            }
            if model_config.model_path.is_empty() {
                anyhow::bail!("a model path is required (--model or config file)");
            }
            if let Some(r) = ref_model {
                model_config.ref_model_path = Some(r);
            }
            if trust_remote_code {
                model_config.trust_remote_code = true;
            }
            if let Some(b) = beta {
                model_config.beta = b;
            }
            if let Some(p) = padding_side {
                model_config.padding_side = p.into();
            }

            let mut lora = file_config.lora;
            if let Some(r) = lora_r {
                lora.r = r;
            }
            if let Some(a) = lora_alpha {
                lora.alpha = a;
            }
            if let Some(d) = lora_dropout {
                lora.dropout = d;
            }
            if let Some(t) = target_modules {
                lora.target_modules = t;
            }
            if use_rslora {
                lora.use_rslora = true;
            }
            if let Some(w) = lora_weights {
                lora.weight_path = Some(w);
            }
            if let Some(b) = lora_bias {
                lora.bias = b.into();
            }
            if q_lora {
                lora.q_lora = true;
            }

            let mut training = file_config.training;
            if let Some(lr) = learning_rate {
                training.learning_rate = lr;
            }
            if let Some(wd) = weight_decay {
                training.weight_decay = wd;
            }
            if let Some(o) = optimizer {
                training.optimizer = o.into();
            }
            if let Some(c) = cache_dir {
                training.cache_dir = Some(c);
            }
            if let Some(bs) = batch_size {
                training.batch_size = bs;
            }
            if let Some(e) = epochs {
                training.num_epochs = e;
            }
            if let Some(l) = model_max_length {
                training.model_max_length = l;
            }
            if let Some(l) = max_prompt_length {
                training.max_prompt_length = l;
            }
            if let Some(l) = max_target_length {
                training.max_target_length = l;
            }
            if let Some(s) = seed {
                training.seed = s;
            }
            if let Some(s) = logging_steps {
                training.logging_steps = s;
            }
            if let Some(s) = save_steps {
                training.save_steps = Some(s);
            }
            if let Some(m) = max_checkpoints {
                training.max_checkpoints = m;
            }
            if let Some(o) = output {
                training.output_dir = o;
            }

            let mut data = file_config.data.unwrap_or_default();
            if let Some(d) = dataset {
                data.data_path = d;
            }
            if data.data_path.is_empty() {
                anyhow::bail!("a dataset path is required (--dataset or config file)");
            }
            if let Some(d) = eval_dataset {
                data.eval_data_path = Some(d);
            }
            if let Some(m) = max_samples {
                data.max_samples = Some(m);
            }
            if no_shuffle {
                data.shuffle = false;
            }
            data.seed = training.seed;

            println!("========================================");
            println!("  Prefmetal DPO Training");
            println!("========================================");
            println!("Model:     {}", model_config.model_path);
            if let Some(ref r) = model_config.ref_model_path {
                println!("Reference: {}", r);
            }
            println!("Dataset:   {}", data.data_path);
            println!("Output:    {}", training.output_dir);
            println!("Beta:      {}", model_config.beta);
            println!(
                "LoRA:      r={} alpha={} targets={:?}{}",
                lora.r,
                lora.alpha,
                lora.target_modules,
                if lora.q_lora { " (QLoRA)" } else { "" }
            );
            println!("========================================\n");

            let opts = TrainOptions {
                model: model_config,
                lora,
                training,
                data,
                sharding: sharding.unwrap_or_default().into(),
                resume,
            };

            let report = train(&opts)?;

            println!("\n========================================");
            println!("  Training complete");
            println!("========================================");
            println!("Steps:      {}", report.steps);
            println!("Epochs:     {}", report.epochs);
            println!("Final loss: {:.4}", report.final_loss);
            println!("========================================\n");
            Ok(())
        }

        Commands::Inspect {
            model,
            dataset,
            index,
            model_max_length,
        } => inspect_record(&model, &dataset, index, model_max_length),
    }
}

/// Print the rendered transcript and per-token supervision of one record.
fn inspect_record(
    model: &str,
    dataset: &str,
    index: usize,
    model_max_length: usize,
) -> anyhow::Result<()> {
    let template = ConvTemplate::for_model(model);
    let tokenizer = Tokenizer::from_model_dir(model)?;

    let records = PreferenceDataset::load_records(dataset)?;
    let record = records
        .get(index)
        .ok_or_else(|| anyhow::anyhow!("record {} out of range ({} records)", index, records.len()))?;

    let example = preprocess_record(record, &template, &tokenizer, model_max_length)?;

    println!("========================================");
    println!("  Record {} ({} template)", index, template.name);
    println!("========================================");

    for (title, ids, labels) in [
        (
            "chosen",
            &example.chosen_input_ids,
            &example.chosen_labels,
        ),
        (
            "rejected",
            &example.rejected_input_ids,
            &example.rejected_labels,
        ),
    ] {
        println!("\n--- {} ({} tokens) ---", title, ids.len());
        for (i, (&id, &label)) in ids.iter().zip(labels.iter()).enumerate() {
            let text = tokenizer.decode(&[id], false)?;
            let marker = if label == IGNORE_TOKEN_ID { " " } else { "*" };
            println!("{:>5} {} {:>8} {:?}", i, marker, id, text);
        }
        let supervised = labels.iter().filter(|&&l| l != IGNORE_TOKEN_ID).count();
        println!("supervised: {}/{} tokens", supervised, ids.len());
    }

    Ok(())
}
