//! Multi-process topology and parameter gathering at save time.
//!
//! Rank layout follows the usual launcher convention: `RANK`, `WORLD_SIZE`,
//! and `LOCAL_RANK` environment variables, all defaulting to a single
//! process. Only rank 0 writes artifacts.

use std::collections::HashMap;
use std::rc::Rc;

use mlx_rs::Array;

use crate::Result;

/// Identity of this process within the training job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorldInfo {
    /// Global rank of this process.
    pub rank: usize,
    /// Total number of processes.
    pub world_size: usize,
    /// Rank within the local node.
    pub local_rank: usize,
}

impl WorldInfo {
    /// Single-process world.
    pub fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            local_rank: 0,
        }
    }

    /// Read the topology from launcher environment variables.
    pub fn from_env() -> Self {
        let parse = |name: &str, default| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(default)
        };
        Self {
            rank: parse("RANK", 0),
            world_size: parse("WORLD_SIZE", 1),
            local_rank: parse("LOCAL_RANK", 0),
        }
    }

    /// Whether this process writes logs and artifacts.
    pub fn is_main(&self) -> bool {
        self.rank == 0
    }
}

impl Default for WorldInfo {
    fn default() -> Self {
        Self::single()
    }
}

/// How trainable parameters are partitioned across processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShardingMode {
    /// Every process holds full parameters.
    #[default]
    None,
    /// Fully sharded data parallel.
    Fsdp,
    /// Optimizer, gradient, and parameter sharding.
    Zero3,
}

impl ShardingMode {
    /// Whether parameters are partitioned and must be gathered before save.
    pub fn is_sharded(&self) -> bool {
        !matches!(self, ShardingMode::None)
    }
}

/// Warn about configurations known to save corrupt adapters.
///
/// Gathering quantized base weights through a sharded save path is not
/// supported; the adapter must be re-exported from an unsharded run.
pub fn check_sharding_support(mode: ShardingMode, q_lora: bool) {
    if q_lora && mode.is_sharded() {
        tracing::warn!(
            ?mode,
            "QLoRA with sharded parameters may produce incomplete adapter saves"
        );
    }
}

/// Materialize full adapter values before rank 0 writes them.
///
/// Each entry is detached from the autodiff graph and evaluated, so the
/// returned map holds concrete arrays rather than lazy graph nodes.
pub fn gather_adapter(params: &HashMap<Rc<str>, Array>) -> Result<HashMap<Rc<str>, Array>> {
    let mut gathered = HashMap::with_capacity(params.len());
    for (key, value) in params {
        let full = mlx_rs::stop_gradient(value)?;
        full.eval()?;
        gathered.insert(key.clone(), full);
    }
    Ok(gathered)
}
