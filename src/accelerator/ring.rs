use std::{mem, path::PathBuf, sync::Arc};

use actix_rt::{System, SystemRunner};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::Accelerator;
use crate::{
    cluster::{Cluster, ObjectRef, ObjectStore, Placement, WorkerGroup, WorkerInit, WorkerSlot},
    collective::{self, Collective},
    config::AcceleratorConfig,
    error::{OrchestraError, Result},
    session::{self, Relay, RelaySender, Session},
    trainer::{checkpoint, fit_loop, Metrics, Model, TrainingJob},
    tune::Tuner,
};

/// What the rank 0 worker sends back at the end of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub metrics: Metrics,
    pub model_state: Vec<f32>,
    pub best_model_path: Option<PathBuf>,
    pub best_score: Option<f64>,
    pub global_step: u64,
    pub current_epoch: usize,
}

/// A running worker group and the resources it holds.
struct ActiveGroup {
    system: SystemRunner,
    group: WorkerGroup,
    placements: Vec<Placement>,
    /// Set once a run was abandoned while the workers were still busy.
    interrupted: bool,
}

enum Stage {
    Idle,
    Running(ActiveGroup),
    TornDown,
}

/// Trains on a group of cluster workers synchronizing their gradients over a ring.
pub struct RingAccelerator<M: Model> {
    cluster: Cluster,
    config: AcceleratorConfig,
    tuner: Option<Arc<dyn Tuner>>,
    init: Option<WorkerInit>,
    job: Option<TrainingJob<M>>,
    stage: Stage,
}

impl<M: Model> RingAccelerator<M> {
    /// Creates a new `RingAccelerator`.
    ///
    /// # Arguments
    /// * `cluster` - The cluster the workers are placed on.
    /// * `config` - The worker group's sizing and timeouts.
    ///
    /// # Errors
    /// `MissingDependency` if the ring collective wasn't compiled in,
    /// `InvalidConfig` if `config` is invalid.
    pub fn new(cluster: Cluster, config: AcceleratorConfig) -> Result<Self> {
        if !collective::available() {
            return Err(OrchestraError::MissingDependency {
                component: "ring collective",
                remedy: "rebuild with `--features ring`",
            });
        }

        config.validate()?;

        Ok(Self {
            cluster,
            config,
            tuner: None,
            init: None,
            job: None,
            stage: Stage::Idle,
        })
    }

    /// Relays the workers' reporting callbacks to `tuner`.
    pub fn with_tuner(mut self, tuner: Arc<dyn Tuner>) -> Self {
        self.tuner = Some(tuner);
        self
    }

    /// Runs `init` on every worker once it started, right before it joins the ring.
    ///
    /// The hook counts against the startup timeout and its errors fail `setup`.
    pub fn with_init_hook<F>(mut self, init: F) -> Self
    where
        F: Fn(&mut WorkerSlot) -> Result<()> + Send + Sync + 'static,
    {
        self.init = Some(Arc::new(init));
        self
    }

    pub fn config(&self) -> &AcceleratorConfig {
        &self.config
    }

    pub fn num_workers(&self) -> usize {
        self.config.num_workers()
    }

    /// The placements of the running group, if any.
    pub fn placements(&self) -> Option<&[Placement]> {
        match &self.stage {
            Stage::Running(active) => Some(&active.placements),
            _ => None,
        }
    }

    /// The root GPU every worker bound during the last run, in rank order.
    pub fn bound_gpus(&mut self) -> Result<Vec<Option<usize>>> {
        let Stage::Running(active) = &mut self.stage else {
            return Err(OrchestraError::NotSetUp);
        };

        let futures = active.group.run_async(|slot| Ok(slot.bound_gpu()));
        active.system.block_on(session::drain_until(futures, None))
    }

    /// Runs the job on every worker without attaching the outcome to it.
    ///
    /// # Returns
    /// One entry per worker in rank order, only rank 0's holds a result.
    pub fn dispatch(&mut self) -> Result<Vec<Option<RunResult>>> {
        let job = self.job.take().ok_or(OrchestraError::NotSetUp)?;
        let results = self.dispatch_job(&job);
        self.job = Some(job);
        results
    }

    fn dispatch_job(&mut self, job: &TrainingJob<M>) -> Result<Vec<Option<RunResult>>> {
        let Stage::Running(active) = &mut self.stage else {
            return Err(OrchestraError::NotSetUp);
        };

        checkpoint::ensure_finite(job.model.params())?;

        let store = self.cluster.store().clone();
        let job_ref = store.put(job)?;

        let (queue, mut receiver) = match &self.tuner {
            Some(_) => {
                let (tx, rx) = session::relay_queue();
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };

        let use_gpu = self.config.use_gpu && job.on_gpu();
        let futures = active.group.run_async({
            let store = store.clone();
            let job_ref = job_ref.clone();
            move |slot: &mut WorkerSlot| train_remote(slot, &store, &job_ref, queue, use_gpu)
        });

        info!(workers = futures.len(); "training run dispatched");

        let tuner = self.tuner.clone();
        let run_timeout = self.config.run_timeout();
        let results = active.system.block_on(async {
            let relay = match (receiver.as_mut(), tuner.as_deref()) {
                (Some(receiver), Some(tuner)) => Some(Relay { receiver, tuner }),
                _ => None,
            };

            let run = session::drain_until(futures, relay);
            match run_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, run).await {
                    Ok(results) => results,
                    Err(_) => Err(OrchestraError::RunTimeout { timeout }),
                },
                None => run.await,
            }
        });

        if matches!(results, Err(OrchestraError::RunTimeout { .. })) {
            active.interrupted = true;
        }

        store.free(&job_ref);
        results
    }

    fn release(&self, active: ActiveGroup) {
        let ActiveGroup {
            system,
            group,
            placements,
            interrupted,
        } = active;

        if interrupted {
            warn!(
                "releasing {} placement(s) while the workers may still be running the timed out task",
                placements.len()
            );
        }

        // Dropping the runtime stops the arbiters and closes the workers' mailboxes.
        drop(group);
        drop(system);

        self.cluster.release(&placements);
        info!(workers = placements.len(); "worker group released");
    }
}

/// Picks the rank 0 result out of the workers' outputs.
fn select_canonical(results: Vec<Option<RunResult>>) -> Result<RunResult> {
    results
        .into_iter()
        .next()
        .flatten()
        .ok_or(OrchestraError::MissingCanonicalResult)
}

/// Loads the canonical result into the driver's copy of the job.
fn attach<M: Model>(job: &mut TrainingJob<M>, results: Vec<Option<RunResult>>) -> Result<Metrics> {
    let result = select_canonical(results)?;

    job.model.load_state_dict(&result.model_state)?;
    job.state.callback_metrics = result.metrics.clone();
    job.state.global_step = result.global_step;
    job.state.current_epoch = result.current_epoch;

    if let Some(ckpt) = &mut job.checkpoint_callback {
        ckpt.best_model_path = result.best_model_path;
        ckpt.best_score = result.best_score;
    }

    Ok(result.metrics)
}

/// The training task every worker runs.
fn train_remote<M: Model>(
    slot: &mut WorkerSlot,
    store: &ObjectStore,
    job_ref: &ObjectRef<TrainingJob<M>>,
    queue: Option<RelaySender>,
    use_gpu: bool,
) -> Result<Option<RunResult>> {
    slot.begin_run();

    let mut job = store.get(job_ref)?;
    let mut ring = slot.init_collective()?;
    let rank = ring.rank();

    let session = match queue {
        Some(queue) => slot.init_session(rank, queue)?,
        None => Session::detached(rank),
    };

    if use_gpu {
        job.state.root_gpu = Some(slot.bind_gpu(ring.local_rank())?);
    }

    debug!(rank = rank, local_rank = ring.local_rank(); "starting training");

    let mut callbacks = job.build_callbacks(&session);
    let metrics = fit_loop::run(&mut job, &mut ring, &mut callbacks)?;
    slot.restore_collective(ring);

    if rank != 0 {
        return Ok(None);
    }

    let (best_model_path, best_score) = job
        .checkpoint_callback
        .map(|ckpt| (ckpt.best_model_path, ckpt.best_score))
        .unwrap_or_default();

    Ok(Some(RunResult {
        metrics,
        model_state: job.model.state_dict(),
        best_model_path,
        best_score,
        global_step: job.state.global_step,
        current_epoch: job.state.current_epoch,
    }))
}

impl<M: Model> Accelerator<M> for RingAccelerator<M> {
    fn setup(&mut self, job: TrainingJob<M>) -> Result<()> {
        if matches!(self.stage, Stage::Running(_)) {
            return Err(OrchestraError::InvalidConfig(
                "accelerator is already set up, tear it down first".into(),
            ));
        }

        self.job = Some(job);

        let num_hosts = self.config.num_hosts.get();
        let num_slots = self.config.num_slots.get();
        let placements = self.cluster.place(num_hosts, num_slots, self.config.use_gpu)?;

        let system = System::new();
        let timeout = self.config.start_timeout();
        let init = self.init.clone();
        let started = system.block_on(async {
            let group = WorkerGroup::start(&placements);
            group.start_ring(timeout, init).await.map(|_| group)
        });

        match started {
            Ok(group) => {
                info!(
                    "started {} worker(s) on {num_hosts} host(s) x {num_slots} slot(s)",
                    group.len()
                );

                self.stage = Stage::Running(ActiveGroup {
                    system,
                    group,
                    placements,
                    interrupted: false,
                });
                Ok(())
            }
            Err(e) => {
                warn!("worker group failed to start: {e}");
                drop(system);
                self.cluster.release(&placements);
                Err(e)
            }
        }
    }

    fn train(&mut self) -> Result<Metrics> {
        let mut job = self.job.take().ok_or(OrchestraError::NotSetUp)?;

        let outcome = self
            .dispatch_job(&job)
            .and_then(|results| attach(&mut job, results));

        self.job = Some(job);
        outcome
    }

    /// Stops the workers and gives their placements back.
    ///
    /// After a `RunTimeout` the workers may still be finishing the abandoned
    /// task when their resources are released, this is logged as a warning.
    fn teardown(&mut self) -> Result<()> {
        match mem::replace(&mut self.stage, Stage::TornDown) {
            Stage::Idle => {
                self.stage = Stage::Idle;
                Err(OrchestraError::NotSetUp)
            }
            Stage::TornDown => Err(OrchestraError::AlreadyTornDown),
            Stage::Running(active) => {
                self.release(active);
                Ok(())
            }
        }
    }

    fn take_job(&mut self) -> Option<TrainingJob<M>> {
        self.job.take()
    }
}

impl<M: Model> Drop for RingAccelerator<M> {
    fn drop(&mut self) {
        if let Stage::Running(active) = mem::replace(&mut self.stage, Stage::TornDown) {
            warn!("ring accelerator dropped without teardown, releasing its workers");
            self.release(active);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::{
        cluster::ClusterSpec,
        config::TrainerConfig,
        trainer::MetricValue,
    };

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Mean {
        w: Vec<f32>,
        /// Time every training step takes.
        delay_ms: u64,
    }

    impl Model for Mean {
        fn params(&self) -> &[f32] {
            &self.w
        }

        fn params_mut(&mut self) -> &mut [f32] {
            &mut self.w
        }

        fn training_step(&self, batch_idx: usize, grad: &mut [f32]) -> f32 {
            thread::sleep(Duration::from_millis(self.delay_ms));

            let diff = self.w[0] - batch_idx as f32;
            grad[0] = diff;
            0.5 * diff * diff
        }

        fn validation_step(&self, _batch_idx: usize) -> Metrics {
            Metrics::from([
                ("w".to_string(), MetricValue::Scalar(self.w[0] as f64)),
                ("ratio".to_string(), MetricValue::Scalar(f64::INFINITY)),
            ])
        }
    }

    fn job() -> TrainingJob<Mean> {
        let config = TrainerConfig {
            max_epochs: 2,
            limit_train_batches: 4,
            limit_val_batches: 2,
            checkpoint: false,
            ..Default::default()
        };

        let model = Mean {
            w: vec![0.0],
            delay_ms: 0,
        };
        TrainingJob::new(config, model).unwrap()
    }

    fn accelerator(slots: usize) -> RingAccelerator<Mean> {
        let cluster = Cluster::new(ClusterSpec::local(4, 0));
        let config = AcceleratorConfig::new(1, slots, false).unwrap();
        RingAccelerator::new(cluster, config).unwrap()
    }

    #[test]
    fn only_rank_zero_returns_a_result() {
        let mut acc = accelerator(3);
        acc.setup(job()).unwrap();

        let results = acc.dispatch().unwrap();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_some());
        assert_eq!(results.iter().filter(|r| r.is_some()).count(), 1);

        acc.teardown().unwrap();
    }

    #[test]
    fn driver_weights_match_the_canonical_result() {
        let mut acc = accelerator(2);
        acc.setup(job()).unwrap();

        let canonical = acc.dispatch().unwrap().remove(0).unwrap();
        acc.train().unwrap();

        let job = acc.take_job().unwrap();
        assert_eq!(job.model.w, canonical.model_state);
        assert_eq!(job.state.global_step, 4);
    }

    #[test]
    fn canonical_selection_requires_rank_zero() {
        let err = select_canonical(vec![None, None]).unwrap_err();
        assert!(matches!(err, OrchestraError::MissingCanonicalResult));
    }

    #[test]
    fn training_before_setup_fails() {
        let mut acc = accelerator(2);

        assert!(matches!(acc.train(), Err(OrchestraError::NotSetUp)));
        assert!(matches!(acc.teardown(), Err(OrchestraError::NotSetUp)));
    }

    #[test]
    fn oversized_groups_release_nothing() {
        let cluster = Cluster::new(ClusterSpec::local(2, 0));
        let config = AcceleratorConfig::new(1, 3, false).unwrap();
        let mut acc: RingAccelerator<Mean> = RingAccelerator::new(cluster.clone(), config).unwrap();

        let err = acc.setup(job()).unwrap_err();
        assert!(matches!(err, OrchestraError::InsufficientResources { .. }));
        assert_eq!(cluster.available(), vec![(2, 0)]);
        assert!(acc.take_job().is_some());
    }

    #[test]
    fn dropping_a_running_accelerator_releases_its_workers() {
        let cluster = Cluster::new(ClusterSpec::local(2, 0));
        let config = AcceleratorConfig::new(1, 2, false).unwrap();

        let mut acc: RingAccelerator<Mean> = RingAccelerator::new(cluster.clone(), config).unwrap();
        acc.setup(job()).unwrap();
        assert_eq!(cluster.available(), vec![(0, 0)]);

        drop(acc);
        assert_eq!(cluster.available(), vec![(2, 0)]);
    }

    #[test]
    fn a_second_train_is_a_no_op() {
        let mut acc = accelerator(2);
        acc.setup(job()).unwrap();

        let first = acc.train().unwrap();
        assert_eq!(first["ratio"], MetricValue::Scalar(f64::INFINITY));
        let trained = acc.job.as_ref().unwrap().model.w.clone();

        let second = acc.train().unwrap();
        assert_eq!(second, first);

        let job = acc.job.as_ref().unwrap();
        assert_eq!(job.model.w, trained);
        assert_eq!(job.state.global_step, 4);
        assert_eq!(job.state.current_epoch, 2);

        acc.teardown().unwrap();
    }

    #[test]
    fn non_finite_weights_are_not_dispatched() {
        let mut acc = accelerator(2);
        let mut bad = job();
        bad.model.w[0] = f32::NAN;
        acc.setup(bad).unwrap();

        let err = acc.train().unwrap_err();
        assert!(matches!(err, OrchestraError::NonFiniteState { index: 0, .. }));
        assert!(acc.job.is_some());

        acc.teardown().unwrap();
    }

    #[test]
    fn run_timeout_fails_the_run() {
        let cluster = Cluster::new(ClusterSpec::local(2, 0));
        let config = AcceleratorConfig::new(1, 2, false)
            .unwrap()
            .with_run_timeout(Duration::from_millis(50));
        let mut acc = RingAccelerator::new(cluster.clone(), config).unwrap();

        let mut slow = job();
        slow.model.delay_ms = 500;
        acc.setup(slow).unwrap();

        let err = acc.train().unwrap_err();
        assert!(matches!(
            err,
            OrchestraError::RunTimeout { timeout } if timeout == Duration::from_millis(50)
        ));
        assert_eq!(acc.take_job().unwrap().state.global_step, 0);

        acc.teardown().unwrap();
        assert_eq!(cluster.available(), vec![(2, 0)]);
    }

    #[test]
    fn slow_init_hooks_time_out_the_setup() {
        let cluster = Cluster::new(ClusterSpec::local(2, 0));
        let config = AcceleratorConfig::new(1, 2, false)
            .unwrap()
            .with_start_timeout(Duration::from_millis(50));
        let mut acc: RingAccelerator<Mean> = RingAccelerator::new(cluster.clone(), config)
            .unwrap()
            .with_init_hook(|slot: &mut WorkerSlot| {
                if slot.rank() == 1 {
                    thread::sleep(Duration::from_millis(300));
                }
                Ok(())
            });

        let err = acc.setup(job()).unwrap_err();
        assert!(matches!(err, OrchestraError::StartupTimeout { .. }));
        assert_eq!(cluster.available(), vec![(2, 0)]);
        assert!(acc.take_job().is_some());
    }

    #[test]
    fn setting_up_twice_keeps_the_first_job() {
        let mut acc = accelerator(2);
        acc.setup(job()).unwrap();

        let mut other = job();
        other.config.max_epochs = 7;
        assert!(matches!(
            acc.setup(other),
            Err(OrchestraError::InvalidConfig(_))
        ));
        assert_eq!(acc.job.as_ref().unwrap().config.max_epochs, 2);

        acc.teardown().unwrap();
    }

    #[test]
    fn gpu_groups_leave_cpu_jobs_unbound() {
        let cluster = Cluster::new(ClusterSpec::local(2, 2));
        let config = AcceleratorConfig::new(1, 2, true).unwrap();
        let mut acc = RingAccelerator::new(cluster, config).unwrap();

        acc.setup(job()).unwrap();
        acc.train().unwrap();

        assert_eq!(acc.bound_gpus().unwrap(), vec![None, None]);
        assert_eq!(acc.take_job().unwrap().state.root_gpu, None);
    }

    #[cfg(not(feature = "ring"))]
    #[test]
    fn missing_ring_collective_is_reported() {
        let cluster = Cluster::new(ClusterSpec::local(2, 0));
        let config = AcceleratorConfig::new(1, 2, false).unwrap();

        let err = RingAccelerator::<Mean>::new(cluster, config).err();
        assert!(matches!(
            err,
            Some(OrchestraError::MissingDependency { .. })
        ));
    }
}
