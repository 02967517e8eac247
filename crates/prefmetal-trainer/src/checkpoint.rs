//! Checkpoint save, resume, and rotation.
//!
//! Checkpoints live under the output directory as `checkpoint-{step}/`
//! holding the adapter weights and a metadata file. Resume picks the
//! directory with the highest step.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use mlx_rs::Array;
use serde::{Deserialize, Serialize};

use crate::Result;

const ADAPTER_FILE: &str = "adapter_model.safetensors";
const METADATA_FILE: &str = "metadata.json";

/// Training state stored next to the adapter weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Global optimizer step.
    pub step: usize,
    /// Epoch the step belongs to.
    pub epoch: usize,
    /// Loss at checkpoint time.
    pub loss: f32,
    /// Learning rate in effect.
    pub learning_rate: f64,
    /// Random seed used for the run.
    pub seed: u64,
    /// Unix timestamp in seconds.
    pub timestamp: u64,
}

impl CheckpointMetadata {
    /// Create metadata for the current training state.
    pub fn new(step: usize, epoch: usize, loss: f32, learning_rate: f64, seed: u64) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self {
            step,
            epoch,
            loss,
            learning_rate,
            seed,
            timestamp,
        }
    }
}

/// Manages `checkpoint-{step}` directories under an output directory.
pub struct CheckpointManager {
    output_dir: PathBuf,
    max_checkpoints: usize,
}

impl CheckpointManager {
    /// Create a manager, creating the output directory if needed.
    ///
    /// `max_checkpoints` bounds how many step directories are kept; older
    /// ones are deleted after each save.
    pub fn new<P: AsRef<Path>>(output_dir: P, max_checkpoints: usize) -> Result<Self> {
        let output_dir = output_dir.as_ref().to_path_buf();
        fs::create_dir_all(&output_dir)?;
        Ok(Self {
            output_dir,
            max_checkpoints,
        })
    }

    fn step_dir(&self, step: usize) -> PathBuf {
        self.output_dir.join(format!("checkpoint-{}", step))
    }

    /// Save adapter weights and metadata for one step.
    pub fn save(
        &self,
        adapter: &HashMap<Rc<str>, Array>,
        metadata: &CheckpointMetadata,
    ) -> Result<PathBuf> {
        let dir = self.step_dir(metadata.step);
        fs::create_dir_all(&dir)?;

        Array::save_safetensors(adapter.clone(), None, dir.join(ADAPTER_FILE))?;
        fs::write(
            dir.join(METADATA_FILE),
            serde_json::to_string_pretty(metadata)?,
        )?;

        self.rotate()?;

        tracing::info!(step = metadata.step, path = %dir.display(), "saved checkpoint");
        Ok(dir)
    }

    /// Load a specific checkpoint directory.
    pub fn load<P: AsRef<Path>>(
        checkpoint_dir: P,
    ) -> Result<(HashMap<Rc<str>, Array>, CheckpointMetadata)> {
        let checkpoint_dir = checkpoint_dir.as_ref();

        let weights = Array::load_safetensors(checkpoint_dir.join(ADAPTER_FILE))?;
        let weights: HashMap<Rc<str>, Array> = weights
            .into_iter()
            .map(|(k, v)| (Rc::from(k), v))
            .collect();

        let metadata_json = fs::read_to_string(checkpoint_dir.join(METADATA_FILE))?;
        let metadata: CheckpointMetadata = serde_json::from_str(&metadata_json)?;

        tracing::info!(step = metadata.step, path = %checkpoint_dir.display(), "loaded checkpoint");
        Ok((weights, metadata))
    }

    /// Load the checkpoint with the highest step, if any exist.
    pub fn load_latest(&self) -> Result<Option<(HashMap<Rc<str>, Array>, CheckpointMetadata)>> {
        match self.list()?.pop() {
            Some((_, dir)) => Self::load(dir).map(Some),
            None => Ok(None),
        }
    }

    /// List checkpoint directories sorted by step, oldest first.
    pub fn list(&self) -> Result<Vec<(usize, PathBuf)>> {
        let mut checkpoints: Vec<(usize, PathBuf)> = fs::read_dir(&self.output_dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                let step = name.strip_prefix("checkpoint-")?.parse::<usize>().ok()?;
                Some((step, entry.path()))
            })
            .collect();
        checkpoints.sort_by_key(|(step, _)| *step);
        Ok(checkpoints)
    }

    fn rotate(&self) -> Result<()> {
        let mut checkpoints = self.list()?;
        while checkpoints.len() > self.max_checkpoints {
            let (step, path) = checkpoints.remove(0);
            if let Err(e) = fs::remove_dir_all(&path) {
                tracing::warn!(step, "failed to remove old checkpoint: {}", e);
            }
        }
        Ok(())
    }

    /// The output directory this manager writes under.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn dummy_adapter() -> HashMap<Rc<str>, Array> {
        let mut params = HashMap::new();
        params.insert(
            Rc::from("layers.0.self_attn.q_proj.lora_a"),
            Array::from_slice(&[1.0_f32, 2.0, 3.0], &[3]),
        );
        params
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path(), 3).unwrap();

        let metadata = CheckpointMetadata::new(50, 1, 0.31, 5e-5, 42);
        let saved = manager.save(&dummy_adapter(), &metadata).unwrap();
        assert!(saved.ends_with("checkpoint-50"));

        let (weights, loaded) = CheckpointManager::load(&saved).unwrap();
        assert!(weights.contains_key("layers.0.self_attn.q_proj.lora_a"));
        assert_eq!(loaded.step, 50);
        assert_eq!(loaded.epoch, 1);
        assert_eq!(loaded.seed, 42);
    }

    #[test]
    fn test_latest_is_highest_step() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path(), 10).unwrap();

        for step in [10, 30, 20] {
            let metadata = CheckpointMetadata::new(step, 0, 0.5, 5e-5, 42);
            manager.save(&dummy_adapter(), &metadata).unwrap();
        }

        let (_, metadata) = manager.load_latest().unwrap().unwrap();
        assert_eq!(metadata.step, 30);
    }

    #[test]
    fn test_latest_on_empty_dir() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path(), 3).unwrap();
        assert!(manager.load_latest().unwrap().is_none());
    }

    #[test]
    fn test_rotation_keeps_most_recent() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path(), 3).unwrap();

        for step in [10, 20, 30, 40, 50] {
            let metadata = CheckpointMetadata::new(step, 0, 0.5, 5e-5, 42);
            manager.save(&dummy_adapter(), &metadata).unwrap();
        }

        let steps: Vec<usize> = manager.list().unwrap().iter().map(|(s, _)| *s).collect();
        assert_eq!(steps, vec![30, 40, 50]);
    }
}
