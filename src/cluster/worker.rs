use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};

use actix::prelude::*;
use futures::future::{self, FutureExt, LocalBoxFuture};
use log::{debug, info};

use super::Placement;
use crate::{
    collective::{RingEndpoint, RingRendezvous},
    error::{self, OrchestraError, Result},
    session::{RelaySender, Session},
};

/// The state a worker keeps between tasks.
#[derive(Debug)]
pub struct WorkerSlot {
    rank: usize,
    placement: Placement,
    ring: Option<RingEndpoint>,
    session: Option<Session>,
    bound_gpu: Option<usize>,
}

impl WorkerSlot {
    fn new(placement: Placement) -> Self {
        Self {
            rank: placement.rank,
            placement,
            ring: None,
            session: None,
            bound_gpu: None,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn placement(&self) -> &Placement {
        &self.placement
    }

    /// Handshakes with both neighbours and keeps `endpoint` for later runs.
    pub fn install_ring(&mut self, endpoint: RingEndpoint, timeout: Duration) -> Result<()> {
        endpoint.handshake(timeout)?;
        self.ring = Some(endpoint);
        Ok(())
    }

    /// Hands this worker's ring endpoint over to the training loop.
    pub fn init_collective(&mut self) -> Result<RingEndpoint> {
        self.ring.take().ok_or_else(|| {
            OrchestraError::Collective(format!("worker {} has no ring endpoint", self.rank))
        })
    }

    /// Gives the endpoint back once a run finished cleanly.
    pub fn restore_collective(&mut self, endpoint: RingEndpoint) {
        self.ring = Some(endpoint);
    }

    /// Forgets the session of the previous run.
    pub fn begin_run(&mut self) {
        self.session = None;
        self.bound_gpu = None;
    }

    /// Binds this worker to the driver's relay queue.
    ///
    /// Calling it again with the same rank swaps the queue.
    ///
    /// # Errors
    /// `SessionConflict` if a session with a different rank is already set.
    pub fn init_session(&mut self, rank: usize, queue: RelaySender) -> Result<Session> {
        if let Some(existing) = &self.session {
            if existing.rank() != rank {
                return Err(OrchestraError::SessionConflict {
                    existing: existing.rank(),
                    requested: rank,
                });
            }
        }

        let session = Session::new(rank, queue);
        self.session = Some(session.clone());
        Ok(session)
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Makes `device` of the host's visible GPUs the worker's root GPU.
    ///
    /// # Errors
    /// `InvalidConfig` if this worker didn't reserve a GPU.
    pub fn bind_gpu(&mut self, device: usize) -> Result<usize> {
        if self.placement.gpu_ids.is_empty() {
            return Err(OrchestraError::InvalidConfig(format!(
                "worker {} has no GPU reserved",
                self.rank
            )));
        }

        self.bound_gpu = Some(device);
        Ok(device)
    }

    pub fn bound_gpu(&self) -> Option<usize> {
        self.bound_gpu
    }
}

type Task<R> = Box<dyn FnOnce(&mut WorkerSlot) -> Result<R> + Send>;

/// Prepares a freshly started worker, before it joins the ring.
pub type WorkerInit = Arc<dyn Fn(&mut WorkerSlot) -> Result<()> + Send + Sync>;

/// Runs a task on the worker's thread.
struct Execute<R>(Task<R>);

impl<R: 'static> Message for Execute<R> {
    type Result = Result<R>;
}

/// A worker running on its own OS thread.
struct WorkerActor {
    slot: WorkerSlot,
}

impl Actor for WorkerActor {
    type Context = SyncContext<Self>;

    fn started(&mut self, _ctx: &mut Self::Context) {
        debug!(rank = self.slot.rank; "worker started");
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        debug!(rank = self.slot.rank; "worker stopped");
    }
}

impl<R: Send + 'static> Handler<Execute<R>> for WorkerActor {
    type Result = Result<R>;

    fn handle(&mut self, msg: Execute<R>, _ctx: &mut Self::Context) -> Self::Result {
        let rank = self.slot.rank;
        let task = msg.0;

        panic::catch_unwind(AssertUnwindSafe(|| task(&mut self.slot))).unwrap_or_else(|payload| {
            Err(OrchestraError::WorkerPanicked {
                rank,
                msg: panic_message(payload),
            })
        })
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(msg) => *msg,
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown panic".to_string()),
    }
}

/// A driver-side handle to one worker.
#[derive(Clone)]
pub struct RemoteWorker {
    rank: usize,
    placement: Placement,
    addr: Addr<WorkerActor>,
}

impl RemoteWorker {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn placement(&self) -> &Placement {
        &self.placement
    }

    /// Submits `task` to the worker.
    ///
    /// # Returns
    /// A future resolving to the task's output, its errors wrapped with the
    /// worker's rank.
    pub fn execute<R, F>(&self, task: F) -> LocalBoxFuture<'static, Result<R>>
    where
        R: Send + 'static,
        F: FnOnce(&mut WorkerSlot) -> Result<R> + Send + 'static,
    {
        let rank = self.rank;
        let request = self.addr.send(Execute(Box::new(task)));

        async move {
            match request.await {
                Ok(result) => result.map_err(|e| e.in_worker(rank)),
                Err(e) => Err(OrchestraError::Mailbox {
                    rank,
                    msg: e.to_string(),
                }),
            }
        }
        .boxed_local()
    }
}

/// An ordered, fixed-size group of workers.
pub struct WorkerGroup {
    workers: Vec<RemoteWorker>,
}

impl WorkerGroup {
    /// Starts one worker per placement.
    ///
    /// Must be called from within a running actix `System`.
    pub fn start(placements: &[Placement]) -> Self {
        let workers = placements
            .iter()
            .map(|placement| {
                let init = placement.clone();
                let addr = SyncArbiter::start(1, move || WorkerActor {
                    slot: WorkerSlot::new(init.clone()),
                });

                RemoteWorker {
                    rank: placement.rank,
                    placement: placement.clone(),
                    addr,
                }
            })
            .collect();

        Self { workers }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn workers(&self) -> &[RemoteWorker] {
        &self.workers
    }

    /// Submits a copy of `task` to every worker.
    ///
    /// # Returns
    /// One future per worker, in rank order.
    pub fn run_async<R, F>(&self, task: F) -> Vec<LocalBoxFuture<'static, Result<R>>>
    where
        R: Send + 'static,
        F: FnOnce(&mut WorkerSlot) -> Result<R> + Send + Clone + 'static,
    {
        self.workers
            .iter()
            .map(|worker| worker.execute(task.clone()))
            .collect()
    }

    /// Submits `task` to the worker at `index` only.
    pub fn run_on<R, F>(&self, index: usize, task: F) -> Option<LocalBoxFuture<'static, Result<R>>>
    where
        R: Send + 'static,
        F: FnOnce(&mut WorkerSlot) -> Result<R> + Send + 'static,
    {
        self.workers.get(index).map(|worker| worker.execute(task))
    }

    /// Connects the workers into a ring.
    ///
    /// # Arguments
    /// * `timeout` - How long the whole group has to form the ring.
    /// * `init` - Runs on every worker right before it joins, counting against `timeout`.
    ///
    /// # Errors
    /// `StartupTimeout` if not every worker acknowledged its endpoint within
    /// `timeout`, or the first error raised by `init`.
    pub async fn start_ring(&self, timeout: Duration, init: Option<WorkerInit>) -> Result<()> {
        let placements: Vec<_> = self.workers.iter().map(|w| w.placement.clone()).collect();
        let endpoints = RingRendezvous::build(&placements);

        let installs = self
            .workers
            .iter()
            .zip(endpoints)
            .map(|(worker, endpoint)| {
                let init = init.clone();
                worker.execute(move |slot| {
                    if let Some(init) = init {
                        init(slot)?;
                    }
                    slot.install_ring(endpoint, timeout)
                })
            });

        let results = tokio::time::timeout(timeout, future::join_all(installs))
            .await
            .map_err(|_| OrchestraError::StartupTimeout { timeout })?;

        error::gather(results).map_err(|e| match e {
            OrchestraError::Worker { source, .. }
                if matches!(*source, OrchestraError::StartupTimeout { .. }) =>
            {
                *source
            }
            e => e,
        })?;

        info!("ring of {} worker(s) formed", self.workers.len());
        Ok(())
    }
}
