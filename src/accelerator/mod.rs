//! Where the training loop of a `Trainer` runs.

mod ring;

use std::sync::Arc;

use log::info;

pub use ring::{RingAccelerator, RunResult};

use crate::{
    collective::SoloCollective,
    error::{OrchestraError, Result},
    session::{self, Session},
    trainer::{fit_loop, Metrics, Model, TrainingJob},
    tune::Tuner,
};

/// Drives a `TrainingJob` through its lifecycle: `setup`, any number of
/// `train` calls, then `teardown`.
pub trait Accelerator<M: Model> {
    /// Acquires the resources the job runs on.
    ///
    /// # Errors
    /// Fails without taking `job` if the accelerator is already set up.
    fn setup(&mut self, job: TrainingJob<M>) -> Result<()>;

    /// Runs the training loop, the job holds the trained model afterwards.
    ///
    /// A job that already ran all of its epochs is left untouched.
    fn train(&mut self) -> Result<Metrics>;

    /// Releases the resources acquired by `setup`.
    ///
    /// # Errors
    /// `NotSetUp` if `setup` never succeeded, `AlreadyTornDown` on a repeated call.
    fn teardown(&mut self) -> Result<()>;

    /// Gives the job back to the caller.
    fn take_job(&mut self) -> Option<TrainingJob<M>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    Ready,
    TornDown,
}

/// Trains in the calling process.
pub struct LocalAccelerator<M: Model> {
    job: Option<TrainingJob<M>>,
    tuner: Option<Arc<dyn Tuner>>,
    stage: Stage,
}

impl<M: Model> LocalAccelerator<M> {
    pub fn new() -> Self {
        Self {
            job: None,
            tuner: None,
            stage: Stage::Idle,
        }
    }

    /// Relays the job's reporting callbacks to `tuner`.
    pub fn with_tuner(mut self, tuner: Arc<dyn Tuner>) -> Self {
        self.tuner = Some(tuner);
        self
    }
}

impl<M: Model> Default for LocalAccelerator<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Model> Accelerator<M> for LocalAccelerator<M> {
    fn setup(&mut self, job: TrainingJob<M>) -> Result<()> {
        if self.stage == Stage::Ready {
            return Err(OrchestraError::InvalidConfig(
                "accelerator is already set up, tear it down first".into(),
            ));
        }

        self.job = Some(job);
        self.stage = Stage::Ready;
        Ok(())
    }

    fn train(&mut self) -> Result<Metrics> {
        let job = match (self.stage, self.job.as_mut()) {
            (Stage::Ready, Some(job)) => job,
            _ => return Err(OrchestraError::NotSetUp),
        };

        if job.on_gpu() {
            job.state.root_gpu = Some(0);
        }

        let (session, mut relay) = match &self.tuner {
            Some(_) => {
                let (tx, rx) = session::relay_queue();
                (Session::new(0, tx), Some(rx))
            }
            None => (Session::detached(0), None),
        };

        let mut callbacks = job.build_callbacks(&session);
        let metrics = fit_loop::run(job, &mut SoloCollective, &mut callbacks)?;

        if let (Some(rx), Some(tuner)) = (relay.as_mut(), &self.tuner) {
            rx.drain(tuner.as_ref())?;
        }

        Ok(metrics)
    }

    fn teardown(&mut self) -> Result<()> {
        match self.stage {
            Stage::Idle => Err(OrchestraError::NotSetUp),
            Stage::TornDown => Err(OrchestraError::AlreadyTornDown),
            Stage::Ready => {
                info!("local accelerator torn down");
                self.stage = Stage::TornDown;
                Ok(())
            }
        }
    }

    fn take_job(&mut self) -> Option<TrainingJob<M>> {
        self.job.take()
    }
}
