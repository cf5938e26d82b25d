//! The single-process training loop, synchronized through a `Collective`.

use log::{debug, info};

use super::{
    checkpoint,
    metrics::{self, MetricAccumulator},
    Callback, Event, MetricValue, Metrics, Model, TrainingJob,
};
use crate::{
    collective::Collective,
    error::{OrchestraError, Result},
};

/// The batches one rank visits out of `total`.
///
/// Every rank gets the same amount of batches, the shards wrap around to pad
/// the last ones so collective calls stay in lockstep.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Shard {
    total: usize,
    rank: usize,
    size: usize,
}

impl Shard {
    pub fn new(total: usize, rank: usize, size: usize) -> Self {
        Self { total, rank, size }
    }

    pub fn len(&self) -> usize {
        self.total.div_ceil(self.size)
    }

    pub fn indices(&self) -> impl Iterator<Item = usize> {
        let Self { total, rank, size } = *self;
        (0..self.len()).map(move |k| (rank + k * size) % total)
    }
}

/// Runs `job` to completion on this process.
///
/// # Arguments
/// * `job` - The job to train, its model and state are updated in place.
/// * `collective` - The process group the gradients are averaged over.
/// * `callbacks` - The hooks fired at every lifecycle event.
///
/// # Returns
/// The final `callback_metrics` of the run.
pub fn run<M: Model>(
    job: &mut TrainingJob<M>,
    collective: &mut dyn Collective,
    callbacks: &mut [Box<dyn Callback<M>>],
) -> Result<Metrics> {
    let rank = collective.rank();
    let world = collective.size();

    // Every rank holds the same job, so they all leave here together.
    if job.state.current_epoch >= job.config.max_epochs {
        info!(
            "job already trained for {} epoch(s), nothing to do",
            job.config.max_epochs
        );
        return Ok(job.state.callback_metrics.clone());
    }

    collective.broadcast(job.model.params_mut(), 0)?;
    fire(job, callbacks, Event::FitStart)?;

    let sanity_steps = job.config.num_sanity_val_steps;
    if sanity_steps > 0 && job.config.limit_val_batches > 0 {
        job.state.running_sanity_check = true;
        fire(job, callbacks, Event::SanityCheckStart)?;

        let limit = sanity_steps.min(job.config.limit_val_batches);
        validate(job, collective, callbacks, limit)?;

        fire(job, callbacks, Event::SanityCheckEnd)?;
        job.state.running_sanity_check = false;
        job.state.callback_metrics.clear();
    }

    fire(job, callbacks, Event::TrainStart)?;

    let shard = Shard::new(job.config.limit_train_batches, rank, world);
    let lr = job.config.learning_rate;
    let mut grad = vec![0.0; job.model.params().len()];

    for epoch in job.state.current_epoch..job.config.max_epochs {
        job.state.current_epoch = epoch;
        fire(job, callbacks, Event::EpochStart)?;

        let mut loss_sum = 0.0;
        for batch_idx in shard.indices() {
            fire(job, callbacks, Event::BatchStart)?;

            grad.fill(0.0);
            loss_sum += job.model.training_step(batch_idx, &mut grad);
            collective.allreduce_mean(&mut grad)?;

            for (p, g) in job.model.params_mut().iter_mut().zip(&grad) {
                *p -= lr * g;
            }

            job.state.global_step += 1;
            fire(job, callbacks, Event::BatchEnd)?;
        }

        let mut loss = [f64::from(loss_sum) / shard.len() as f64];
        collective.allreduce_mean_f64(&mut loss)?;
        job.state
            .callback_metrics
            .insert("loss".to_string(), MetricValue::Scalar(loss[0]));

        debug!(rank = rank, epoch = epoch, loss = loss[0]; "epoch finished");

        if job.config.limit_val_batches > 0 {
            validate(job, collective, callbacks, job.config.limit_val_batches)?;
        }

        fire(job, callbacks, Event::EpochEnd)?;
    }

    // From here on `current_epoch` is the next epoch to run.
    job.state.current_epoch = job.config.max_epochs;

    fire(job, callbacks, Event::TrainEnd)?;
    fire(job, callbacks, Event::FitEnd)?;

    if rank == 0 {
        info!(
            "training finished after {} step(s) on {world} process(es)",
            job.state.global_step
        );
    }

    Ok(job.state.callback_metrics.clone())
}

/// Runs `limit` validation batches split between the ranks and merges their
/// averaged metrics into `callback_metrics`.
fn validate<M: Model>(
    job: &mut TrainingJob<M>,
    collective: &mut dyn Collective,
    callbacks: &mut [Box<dyn Callback<M>>],
    limit: usize,
) -> Result<()> {
    fire(job, callbacks, Event::ValidationStart)?;

    let shard = Shard::new(limit, collective.rank(), collective.size());
    let mut acc = MetricAccumulator::default();
    for batch_idx in shard.indices() {
        acc.push(job.model.validation_step(batch_idx));
    }

    let mut logged = acc.mean();
    let mut flat = metrics::flatten(&logged);
    collective.allreduce_mean_f64(&mut flat)?;
    metrics::unflatten(&mut logged, &flat);
    job.state.callback_metrics.extend(logged);

    fire(job, callbacks, Event::ValidationEnd)?;
    save_best_checkpoint(job, collective.rank())
}

/// Updates the job's `ModelCheckpoint`, only rank 0 writes the file.
fn save_best_checkpoint<M: Model>(job: &mut TrainingJob<M>, rank: usize) -> Result<()> {
    if job.state.running_sanity_check {
        return Ok(());
    }

    let Some(ckpt) = &job.checkpoint_callback else {
        return Ok(());
    };

    let score = match &ckpt.monitor {
        Some(key) => {
            let value = job
                .state
                .callback_metrics
                .get(key)
                .ok_or_else(|| OrchestraError::MissingMetric { key: key.clone() })?;
            Some(value.item(key)?)
        }
        None => None,
    };

    if !ckpt.improves(score) {
        return Ok(());
    }

    let path = ckpt.path_for(
        &job.config.default_root_dir,
        job.state.current_epoch,
        job.state.global_step,
    );

    if rank == 0 {
        checkpoint::atomic_save(&job.dump_checkpoint(), &path)?;
        debug!("saved checkpoint at {}", path.display());
    }

    if let Some(ckpt) = &mut job.checkpoint_callback {
        ckpt.record(path, score);
    }

    Ok(())
}

fn fire<M: Model>(
    job: &TrainingJob<M>,
    callbacks: &mut [Box<dyn Callback<M>>],
    event: Event,
) -> Result<()> {
    for callback in callbacks.iter_mut() {
        callback.on_event(event, job)?;
    }

    Ok(())
}
