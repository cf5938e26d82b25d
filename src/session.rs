//! Worker sessions and the relay queue carrying their tuning actions back to
//! the driver.

use std::{fmt, future::Future, pin::pin};

use futures::future;
use log::{debug, trace};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

use crate::{
    error::{self, OrchestraError, Result},
    tune::Tuner,
};

/// A deferred call against the driver's tuning front end.
pub type RelayAction = Box<dyn FnOnce(&dyn Tuner) -> Result<()> + Send>;

/// Creates an unbounded relay queue.
///
/// # Returns
/// The sending half, cloned into every worker, and the driver's receiving half.
pub fn relay_queue() -> (RelaySender, RelayReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (RelaySender { tx }, RelayReceiver { rx })
}

/// The worker side of the relay queue.
#[derive(Clone)]
pub struct RelaySender {
    tx: UnboundedSender<RelayAction>,
}

impl RelaySender {
    fn send(&self, action: RelayAction) -> Result<()> {
        self.tx
            .send(action)
            .map_err(|_| OrchestraError::Tune("relay queue was closed by the driver".to_string()))
    }
}

impl fmt::Debug for RelaySender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelaySender")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// The driver side of the relay queue.
pub struct RelayReceiver {
    rx: UnboundedReceiver<RelayAction>,
}

impl RelayReceiver {
    /// Executes every queued action, in the order they were enqueued.
    ///
    /// # Returns
    /// The amount of executed actions.
    pub fn drain(&mut self, tuner: &dyn Tuner) -> Result<usize> {
        let mut executed = 0;

        loop {
            match self.rx.try_recv() {
                Ok(action) => {
                    action(tuner)?;
                    executed += 1;
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }

        if executed > 0 {
            debug!(actions = executed; "drained relay queue");
        }

        Ok(executed)
    }
}

/// A worker's binding to the driver for the duration of a run.
#[derive(Debug, Clone)]
pub struct Session {
    rank: usize,
    queue: Option<RelaySender>,
}

impl Session {
    pub fn new(rank: usize, queue: RelaySender) -> Self {
        Self {
            rank,
            queue: Some(queue),
        }
    }

    /// A session with nowhere to relay to, every action is dropped.
    pub fn detached(rank: usize) -> Self {
        Self { rank, queue: None }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn is_relayed(&self) -> bool {
        self.queue.is_some()
    }

    /// Enqueues `action` to be run by the driver.
    ///
    /// Without a queue the action is discarded.
    pub fn put_queue<F>(&self, action: F) -> Result<()>
    where
        F: FnOnce(&dyn Tuner) -> Result<()> + Send + 'static,
    {
        match &self.queue {
            Some(queue) => {
                trace!(rank = self.rank; "relaying action");
                queue.send(Box::new(action))
            }
            None => {
                debug!(rank = self.rank; "no relay queue, dropping action");
                Ok(())
            }
        }
    }
}

/// The driver's receiving end of the queue and the tuner its actions run on.
pub struct Relay<'a> {
    pub receiver: &'a mut RelayReceiver,
    pub tuner: &'a dyn Tuner,
}

/// Waits for every worker while executing relayed actions as they arrive.
///
/// Whatever is still queued once the workers finished runs before returning,
/// so every action enqueued by a worker is executed exactly once, in order.
///
/// # Arguments
/// * `futures` - One future per worker.
/// * `relay` - The queue to drain, if a tuning session is active.
///
/// # Returns
/// The workers' outputs in order, or the first root-cause failure.
pub async fn drain_until<R, F>(futures: Vec<F>, relay: Option<Relay<'_>>) -> Result<Vec<R>>
where
    F: Future<Output = Result<R>>,
{
    let mut all = pin!(future::join_all(futures));

    let results = match relay {
        None => all.await,
        Some(Relay { receiver, tuner }) => {
            let results = loop {
                tokio::select! {
                    biased;
                    Some(action) = receiver.rx.recv() => action(tuner)?,
                    results = &mut all => break results,
                }
            };

            receiver.drain(tuner)?;
            results
        }
    };

    error::gather(results)
}
