//! The tuning front end the driver reports to, and the trainer callbacks
//! relaying worker reports to it.

mod callbacks;

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub use callbacks::{
    CallbackSpec, CheckpointReporter, MetricReporter, MetricSelection, ReportCheckpoint, Trigger,
};

use crate::error::Result;

/// A flat `name -> value` report.
pub type ReportDict = BTreeMap<String, f64>;

/// The driver-side tuning front end.
pub trait Tuner: Send + Sync {
    /// Records a new result for the trial.
    fn report(&self, report: &ReportDict) -> Result<()>;

    /// Creates the checkpoint directory of the given step.
    fn checkpoint_dir(&self, step: u64) -> Result<PathBuf>;
}

/// A recorded report, numbered by the order it arrived in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialReport {
    pub training_iteration: usize,
    pub metrics: ReportDict,
    pub checkpoint: Option<PathBuf>,
}

#[derive(Debug, Default)]
struct TrialState {
    reports: Vec<TrialReport>,
    pending_checkpoint: Option<PathBuf>,
}

/// A `Tuner` recording every report of a single trial.
///
/// A checkpoint directory is only attached to a result once the next report
/// arrives.
#[derive(Debug)]
pub struct Trial {
    root: PathBuf,
    state: Mutex<TrialState>,
}

impl Trial {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            state: Mutex::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn reports(&self) -> Vec<TrialReport> {
        self.state.lock().reports.clone()
    }

    /// The checkpoints attached to a report, in report order.
    pub fn checkpoints(&self) -> Vec<PathBuf> {
        self.state
            .lock()
            .reports
            .iter()
            .filter_map(|r| r.checkpoint.clone())
            .collect()
    }

    pub fn last_report(&self) -> Option<TrialReport> {
        self.state.lock().reports.last().cloned()
    }
}

impl Tuner for Trial {
    fn report(&self, report: &ReportDict) -> Result<()> {
        let mut state = self.state.lock();

        let training_iteration = state.reports.len() + 1;
        let checkpoint = state.pending_checkpoint.take();

        debug!(iteration = training_iteration; "trial report received");

        state.reports.push(TrialReport {
            training_iteration,
            metrics: report.clone(),
            checkpoint,
        });

        Ok(())
    }

    fn checkpoint_dir(&self, step: u64) -> Result<PathBuf> {
        let dir = self.root.join(format!("checkpoint_{step:06}"));
        fs::create_dir_all(&dir)?;

        self.state.lock().pending_checkpoint = Some(dir.clone());
        Ok(dir)
    }
}

/// The resources a tuning trial has to request for a worker group.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TuneResources {
    pub cpu: f64,
    pub gpu: f64,
    pub extra_cpu: f64,
    pub extra_gpu: f64,
}

/// Computes the trial resources of a group of `num_workers` workers.
///
/// The driver takes a CPU and the workers are accounted as extra resources.
/// With GPUs the driver takes the fractional remainder of the workers' GPUs,
/// so the trial asks for a whole amount of them.
pub fn tune_resources(num_workers: usize, cpus_per_worker: usize, use_gpu: bool) -> TuneResources {
    let extra_cpu = (num_workers * cpus_per_worker) as f64;

    let (gpu, extra_gpu) = if use_gpu {
        let extra = num_workers as f64 * 0.99;
        (extra.ceil() - extra, extra)
    } else {
        (0.0, 0.0)
    };

    TuneResources {
        cpu: 1.0,
        gpu,
        extra_cpu,
        extra_gpu,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_are_numbered_and_pick_up_the_pending_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let trial = Trial::new(dir.path());

        trial.report(&ReportDict::from([("loss".to_string(), 1.0)])).unwrap();
        let ckpt = trial.checkpoint_dir(12).unwrap();
        trial.report(&ReportDict::from([("loss".to_string(), 0.5)])).unwrap();

        assert!(ckpt.is_dir());
        assert!(ckpt.ends_with("checkpoint_000012"));

        let reports = trial.reports();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].training_iteration, 1);
        assert_eq!(reports[0].checkpoint, None);
        assert_eq!(reports[1].checkpoint, Some(ckpt.clone()));
        assert_eq!(trial.checkpoints(), vec![ckpt]);
    }

    #[test]
    fn checkpoints_without_a_following_report_are_not_registered() {
        let dir = tempfile::tempdir().unwrap();
        let trial = Trial::new(dir.path());

        trial.checkpoint_dir(1).unwrap();
        assert!(trial.checkpoints().is_empty());
    }

    #[test]
    fn gpu_groups_request_whole_gpus() {
        let resources = tune_resources(2, 1, true);

        assert_eq!(resources.cpu, 1.0);
        assert_eq!(resources.extra_cpu, 2.0);
        assert!((resources.extra_gpu - 1.98).abs() < 1e-9);
        assert!((resources.gpu + resources.extra_gpu - 2.0).abs() < 1e-9);
    }

    #[test]
    fn cpu_groups_request_no_gpus() {
        let resources = tune_resources(4, 2, false);

        assert_eq!(resources.extra_cpu, 8.0);
        assert_eq!(resources.gpu, 0.0);
        assert_eq!(resources.extra_gpu, 0.0);
    }
}
