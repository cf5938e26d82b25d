use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use super::Metrics;
use crate::error::{OrchestraError, Result};

/// A full snapshot of the training state at some step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub epoch: usize,
    pub global_step: u64,
    pub state_dict: Vec<f32>,
    pub callback_metrics: Metrics,
}

/// Checks that `state` can be written out and read back.
///
/// # Errors
/// `NonFiniteState` with the first NaN or infinite value.
pub(crate) fn ensure_finite(state: &[f32]) -> Result<()> {
    match state.iter().position(|v| !v.is_finite()) {
        Some(index) => Err(OrchestraError::NonFiniteState {
            index,
            value: state[index],
        }),
        None => Ok(()),
    }
}

/// Writes `checkpoint` to `path` through a temporary sibling file, so readers
/// never observe a partially written checkpoint.
///
/// # Arguments
/// * `checkpoint` - The snapshot to persist.
/// * `path` - The final location of the checkpoint file.
///
/// # Errors
/// `NonFiniteState` if the weights diverged, nothing is written then.
pub fn atomic_save(checkpoint: &Checkpoint, path: &Path) -> Result<()> {
    ensure_finite(&checkpoint.state_dict)?;

    let wrap = |source| OrchestraError::Checkpoint {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(wrap)?;
    }

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "checkpoint".to_string());
    let tmp = path.with_file_name(format!(".{name}.tmp"));

    let file = File::create(&tmp).map_err(wrap)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, checkpoint)?;
    writer.flush().map_err(wrap)?;
    drop(writer);

    fs::rename(&tmp, path).map_err(wrap)
}

/// Reads back a checkpoint written by `atomic_save`.
pub fn load(path: &Path) -> Result<Checkpoint> {
    let file = File::open(path).map_err(|source| OrchestraError::Checkpoint {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(serde_json::from_reader(BufReader::new(file))?)
}

/// Keeps the best checkpoint written during validation.
///
/// Without a `monitor` every validation end produces the new best checkpoint,
/// otherwise only those lowering the monitored metric do.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelCheckpoint {
    pub monitor: Option<String>,
    pub dirpath: Option<PathBuf>,
    pub best_model_path: Option<PathBuf>,
    pub best_score: Option<f64>,
}

impl ModelCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn monitor<S: Into<String>>(mut self, key: S) -> Self {
        self.monitor = Some(key.into());
        self
    }

    pub fn dirpath<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.dirpath = Some(dir.into());
        self
    }

    /// Whether `score` is better than the best one seen so far.
    pub fn improves(&self, score: Option<f64>) -> bool {
        match (score, self.best_score) {
            (Some(score), Some(best)) => score < best,
            _ => true,
        }
    }

    /// The file a checkpoint taken at `epoch`/`step` goes to.
    pub fn path_for(&self, root: &Path, epoch: usize, step: u64) -> PathBuf {
        let dir = self
            .dirpath
            .clone()
            .unwrap_or_else(|| root.join("checkpoints"));

        dir.join(format!("epoch={epoch}-step={step}.ckpt"))
    }

    pub fn record(&mut self, path: PathBuf, score: Option<f64>) {
        self.best_model_path = Some(path);
        self.best_score = score;
    }
}
