use std::{fs, num::NonZeroUsize, path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{OrchestraError, Result};

const DEFAULT_START_TIMEOUT_MS: u64 = 30_000;

fn default_start_timeout_ms() -> u64 {
    DEFAULT_START_TIMEOUT_MS
}

fn saturating_millis(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}

/// Sizing and placement of the worker group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceleratorConfig {
    /// The number of hosts to place workers on.
    pub num_hosts: NonZeroUsize,
    /// The number of workers placed on each host.
    pub num_slots: NonZeroUsize,
    /// Whether each worker reserves a GPU on top of its CPU.
    #[serde(default)]
    pub use_gpu: bool,
    /// How long the workers have to form the ring.
    #[serde(default = "default_start_timeout_ms")]
    pub start_timeout_ms: u64,
    /// Upper bound for a whole training run, unbounded when absent.
    #[serde(default)]
    pub run_timeout_ms: Option<u64>,
}

impl AcceleratorConfig {
    /// Creates a new `AcceleratorConfig` with the default timeouts.
    ///
    /// # Arguments
    /// * `num_hosts` - The number of hosts to place workers on.
    /// * `num_slots` - The number of workers per host.
    /// * `use_gpu` - Whether each worker also reserves a GPU.
    ///
    /// # Errors
    /// `InvalidConfig` if either count is zero.
    pub fn new(num_hosts: usize, num_slots: usize, use_gpu: bool) -> Result<Self> {
        let num_hosts = NonZeroUsize::new(num_hosts)
            .ok_or_else(|| OrchestraError::InvalidConfig("num_hosts must be at least 1".into()))?;
        let num_slots = NonZeroUsize::new(num_slots)
            .ok_or_else(|| OrchestraError::InvalidConfig("num_slots must be at least 1".into()))?;

        Ok(Self {
            num_hosts,
            num_slots,
            use_gpu,
            start_timeout_ms: DEFAULT_START_TIMEOUT_MS,
            run_timeout_ms: None,
        })
    }

    /// Sets the startup timeout, saturating at `u64::MAX` milliseconds.
    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout_ms = saturating_millis(timeout);
        self
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout_ms = Some(saturating_millis(timeout));
        self
    }

    /// Parses a config from a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a config from a JSON file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Checks the invariants serde can't express.
    pub fn validate(&self) -> Result<()> {
        if self.start_timeout_ms == 0 {
            return Err(OrchestraError::InvalidConfig(
                "start_timeout_ms must be greater than 0".into(),
            ));
        }

        if self.run_timeout_ms == Some(0) {
            return Err(OrchestraError::InvalidConfig(
                "run_timeout_ms must be greater than 0 when set".into(),
            ));
        }

        Ok(())
    }

    /// The total amount of workers in the group.
    pub fn num_workers(&self) -> usize {
        self.num_hosts.get() * self.num_slots.get()
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_ms.map(Duration::from_millis)
    }
}

/// The host trainer's configuration, shipped to every worker with the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerConfig {
    pub max_epochs: usize,
    /// Training batches per epoch, split between the ranks.
    pub limit_train_batches: usize,
    /// Validation batches per epoch, split between the ranks. Zero disables validation.
    pub limit_val_batches: usize,
    /// Validation batches run once before training starts.
    pub num_sanity_val_steps: usize,
    pub learning_rate: f32,
    /// GPUs requested per process, zero trains on CPU.
    pub gpus: usize,
    pub default_root_dir: PathBuf,
    /// Whether the job carries a `ModelCheckpoint`.
    pub checkpoint: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            max_epochs: 1,
            limit_train_batches: 10,
            limit_val_batches: 10,
            num_sanity_val_steps: 2,
            learning_rate: 0.1,
            gpus: 0,
            default_root_dir: PathBuf::from("."),
            checkpoint: true,
        }
    }
}

impl TrainerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_epochs == 0 {
            return Err(OrchestraError::InvalidConfig(
                "max_epochs must be at least 1".into(),
            ));
        }

        if self.limit_train_batches == 0 {
            return Err(OrchestraError::InvalidConfig(
                "limit_train_batches must be at least 1".into(),
            ));
        }

        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(OrchestraError::InvalidConfig(format!(
                "learning_rate must be a positive number, got {}",
                self.learning_rate
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accelerator_config_defaults() {
        let config = AcceleratorConfig::new(2, 4, true).unwrap();

        assert_eq!(config.num_workers(), 8);
        assert_eq!(config.start_timeout(), Duration::from_secs(30));
        assert_eq!(config.run_timeout(), None);
    }

    #[test]
    fn huge_timeouts_saturate() {
        let config = AcceleratorConfig::new(1, 1, false)
            .unwrap()
            .with_start_timeout(Duration::MAX)
            .with_run_timeout(Duration::MAX);

        assert_eq!(config.start_timeout_ms, u64::MAX);
        assert_eq!(config.run_timeout_ms, Some(u64::MAX));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_counts_are_rejected() {
        assert!(matches!(
            AcceleratorConfig::new(0, 1, false),
            Err(OrchestraError::InvalidConfig(_))
        ));
        assert!(matches!(
            AcceleratorConfig::new(1, 0, false),
            Err(OrchestraError::InvalidConfig(_))
        ));
    }

    #[test]
    fn loads_from_json_with_defaults() {
        let config = AcceleratorConfig::from_json_str(r#"{"num_hosts": 1, "num_slots": 2}"#).unwrap();

        assert_eq!(config, AcceleratorConfig::new(1, 2, false).unwrap());
    }

    #[test]
    fn json_rejects_zero_slots_and_zero_timeouts() {
        assert!(AcceleratorConfig::from_json_str(r#"{"num_hosts": 1, "num_slots": 0}"#).is_err());

        let err = AcceleratorConfig::from_json_str(
            r#"{"num_hosts": 1, "num_slots": 1, "start_timeout_ms": 0}"#,
        )
        .unwrap_err();
        assert!(matches!(err, OrchestraError::InvalidConfig(_)));
    }

    #[test]
    fn trainer_config_validation() {
        assert!(TrainerConfig::default().validate().is_ok());

        let config = TrainerConfig {
            max_epochs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = TrainerConfig {
            learning_rate: f32::NAN,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
