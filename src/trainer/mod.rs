//! A minimal host training framework: the model contract, the job shipped to
//! every worker and the single-process fit loop the workers run.

pub mod checkpoint;
mod events;
pub mod fit_loop;
mod metrics;

use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub use checkpoint::{Checkpoint, ModelCheckpoint};
pub use events::Event;
pub use metrics::{MetricValue, Metrics};

use crate::{
    accelerator::Accelerator,
    config::TrainerConfig,
    error::{OrchestraError, Result},
    session::Session,
    tune::CallbackSpec,
};

/// A trainable model holding its parameters as a flat buffer.
pub trait Model: fmt::Debug + Clone + Send + Serialize + DeserializeOwned + 'static {
    fn params(&self) -> &[f32];

    fn params_mut(&mut self) -> &mut [f32];

    /// Computes the loss of one training batch and writes its gradient into `grad`.
    ///
    /// # Arguments
    /// * `batch_idx` - The global index of the batch.
    /// * `grad` - A zeroed buffer with the same length as `params`.
    ///
    /// # Returns
    /// The batch loss.
    fn training_step(&self, batch_idx: usize, grad: &mut [f32]) -> f32;

    /// Computes the metrics of one validation batch.
    fn validation_step(&self, batch_idx: usize) -> Metrics;

    fn state_dict(&self) -> Vec<f32> {
        self.params().to_vec()
    }

    /// Overwrites the parameters with `state`.
    ///
    /// # Errors
    /// `StateSizeMismatch` if `state` has a different length than the parameters.
    fn load_state_dict(&mut self, state: &[f32]) -> Result<()> {
        let params = self.params_mut();
        if params.len() != state.len() {
            return Err(OrchestraError::StateSizeMismatch {
                got: state.len(),
                expected: params.len(),
            });
        }

        params.copy_from_slice(state);
        Ok(())
    }
}

/// A hook invoked by the fit loop at every lifecycle event.
pub trait Callback<M: Model>: Send {
    fn on_event(&mut self, event: Event, job: &TrainingJob<M>) -> Result<()>;
}

/// The mutable progress of a training run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainState {
    pub global_step: u64,
    pub current_epoch: usize,
    pub callback_metrics: Metrics,
    pub running_sanity_check: bool,
    /// The local GPU this process is bound to, if any.
    pub root_gpu: Option<usize>,
}

/// Everything a worker needs to run the training loop on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingJob<M> {
    pub config: TrainerConfig,
    pub model: M,
    pub callbacks: Vec<CallbackSpec>,
    pub checkpoint_callback: Option<ModelCheckpoint>,
    pub state: TrainState,
}

impl<M: Model> TrainingJob<M> {
    /// Creates a new `TrainingJob`.
    ///
    /// # Arguments
    /// * `config` - The trainer configuration.
    /// * `model` - The model to train.
    ///
    /// # Errors
    /// `InvalidConfig` if the trainer configuration is invalid.
    pub fn new(config: TrainerConfig, model: M) -> Result<Self> {
        config.validate()?;

        let checkpoint_callback = config.checkpoint.then(ModelCheckpoint::new);

        Ok(Self {
            config,
            model,
            callbacks: Vec::new(),
            checkpoint_callback,
            state: TrainState::default(),
        })
    }

    pub fn with_callback(mut self, spec: CallbackSpec) -> Self {
        self.callbacks.push(spec);
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: ModelCheckpoint) -> Self {
        self.checkpoint_callback = Some(checkpoint);
        self
    }

    pub fn on_gpu(&self) -> bool {
        self.config.gpus > 0
    }

    /// Takes a snapshot of the current training state.
    pub fn dump_checkpoint(&self) -> Checkpoint {
        Checkpoint {
            epoch: self.state.current_epoch,
            global_step: self.state.global_step,
            state_dict: self.model.state_dict(),
            callback_metrics: self.state.callback_metrics.clone(),
        }
    }

    /// Instantiates the job's callbacks bound to the given session.
    pub fn build_callbacks(&self, session: &Session) -> Vec<Box<dyn Callback<M>>> {
        self.callbacks
            .iter()
            .map(|spec| spec.build::<M>(session.clone()))
            .collect()
    }
}

/// The driver-side entrypoint of a training run.
pub struct Trainer<M: Model> {
    config: TrainerConfig,
    callbacks: Vec<CallbackSpec>,
    checkpoint: Option<ModelCheckpoint>,
    job: Option<TrainingJob<M>>,
}

impl<M: Model> Trainer<M> {
    pub fn new(config: TrainerConfig) -> Self {
        Self {
            config,
            callbacks: Vec::new(),
            checkpoint: None,
            job: None,
        }
    }

    pub fn with_callback(mut self, spec: CallbackSpec) -> Self {
        self.callbacks.push(spec);
        self
    }

    /// Replaces the default `ModelCheckpoint`.
    pub fn with_checkpoint(mut self, checkpoint: ModelCheckpoint) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    /// Trains `model` with the given accelerator.
    ///
    /// The accelerator is torn down on every exit path once `setup` succeeded.
    ///
    /// # Arguments
    /// * `model` - The model to train.
    /// * `accelerator` - Where and how the training loop runs.
    ///
    /// # Returns
    /// The final metrics of the run.
    pub fn fit<A>(&mut self, model: M, accelerator: &mut A) -> Result<Metrics>
    where
        A: Accelerator<M> + ?Sized,
    {
        let mut job = TrainingJob::new(self.config.clone(), model)?;
        job.callbacks = self.callbacks.clone();
        if let Some(checkpoint) = &self.checkpoint {
            job.checkpoint_callback = Some(checkpoint.clone());
        }

        if let Err(e) = accelerator.setup(job) {
            self.job = accelerator.take_job();
            return Err(e);
        }

        let trained = accelerator.train();
        let released = accelerator.teardown();
        self.job = accelerator.take_job();

        let metrics = trained?;
        released?;
        Ok(metrics)
    }

    /// The job of the last `fit` call, holding the trained model.
    pub fn job(&self) -> Option<&TrainingJob<M>> {
        self.job.as_ref()
    }

    pub fn model(&self) -> Option<&M> {
        self.job.as_ref().map(|job| &job.model)
    }

    /// The best checkpoint of the last `fit` call.
    pub fn best_model_path(&self) -> Option<&std::path::Path> {
        self.job
            .as_ref()?
            .checkpoint_callback
            .as_ref()?
            .best_model_path
            .as_deref()
    }
}
