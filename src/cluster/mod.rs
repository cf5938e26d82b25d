//! An in-process cluster: resource placement, a shared object store and
//! worker actors.

mod object_store;
mod worker;

use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub use object_store::{ObjectRef, ObjectStore};
pub use worker::{RemoteWorker, WorkerGroup, WorkerInit, WorkerSlot};

use crate::error::{OrchestraError, Result};

/// The resources of one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSpec {
    pub cpus: usize,
    #[serde(default)]
    pub gpus: usize,
}

/// The hosts a cluster is made of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub hosts: Vec<HostSpec>,
}

impl ClusterSpec {
    /// A single-host cluster.
    pub fn local(cpus: usize, gpus: usize) -> Self {
        Self {
            hosts: vec![HostSpec { cpus, gpus }],
        }
    }
}

/// Where a worker was placed and what it reserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub rank: usize,
    pub host: usize,
    /// The worker's index among the workers of its host.
    pub local_slot: usize,
    /// The host-local ids of the GPUs reserved for this worker.
    pub gpu_ids: Vec<usize>,
}

#[derive(Debug)]
struct HostState {
    free_cpus: usize,
    free_gpus: Vec<usize>,
}

/// A handle to the cluster, cloning it shares the same resources.
#[derive(Debug, Clone)]
pub struct Cluster {
    hosts: Arc<Mutex<Vec<HostState>>>,
    store: ObjectStore,
}

impl Cluster {
    pub fn new(spec: ClusterSpec) -> Self {
        let hosts = spec
            .hosts
            .into_iter()
            .map(|h| HostState {
                free_cpus: h.cpus,
                free_gpus: (0..h.gpus).collect(),
            })
            .collect();

        Self {
            hosts: Arc::new(Mutex::new(hosts)),
            store: ObjectStore::default(),
        }
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    /// The free `(cpus, gpus)` of every host.
    pub fn available(&self) -> Vec<(usize, usize)> {
        self.hosts
            .lock()
            .iter()
            .map(|h| (h.free_cpus, h.free_gpus.len()))
            .collect()
    }

    /// Reserves `num_hosts * num_slots` worker slots, packed `num_slots` per host.
    ///
    /// Every slot takes 1 CPU, plus 1 GPU if `use_gpu`. Nothing is reserved if
    /// the whole group doesn't fit.
    ///
    /// # Arguments
    /// * `num_hosts` - The amount of hosts to spread the workers over.
    /// * `num_slots` - The amount of workers per host.
    /// * `use_gpu` - Whether each worker needs a GPU.
    ///
    /// # Returns
    /// The placements ordered by rank, or `InsufficientResources`.
    pub fn place(&self, num_hosts: usize, num_slots: usize, use_gpu: bool) -> Result<Vec<Placement>> {
        let mut hosts = self.hosts.lock();

        let fits = |h: &HostState| {
            h.free_cpus >= num_slots && (!use_gpu || h.free_gpus.len() >= num_slots)
        };

        let chosen: Vec<usize> = hosts
            .iter()
            .enumerate()
            .filter(|(_, h)| fits(h))
            .map(|(i, _)| i)
            .take(num_hosts)
            .collect();

        if chosen.len() < num_hosts {
            warn!(
                "can't place {num_hosts} x {num_slots} workers, only {} host(s) have room",
                chosen.len()
            );

            return Err(OrchestraError::InsufficientResources {
                num_hosts,
                num_slots,
                use_gpu,
                found: chosen.len(),
            });
        }

        let mut placements = Vec::with_capacity(num_hosts * num_slots);
        for host in chosen {
            let state = &mut hosts[host];
            state.free_cpus -= num_slots;

            for local_slot in 0..num_slots {
                let gpu_ids = if use_gpu {
                    vec![state.free_gpus.remove(0)]
                } else {
                    Vec::new()
                };

                placements.push(Placement {
                    rank: placements.len(),
                    host,
                    local_slot,
                    gpu_ids,
                });
            }
        }

        debug!(workers = placements.len(); "placed worker group");
        Ok(placements)
    }

    /// Returns the resources held by `placements` to the cluster.
    pub fn release(&self, placements: &[Placement]) {
        let mut hosts = self.hosts.lock();

        for placement in placements {
            if let Some(state) = hosts.get_mut(placement.host) {
                state.free_cpus += 1;
                state.free_gpus.extend(&placement.gpu_ids);
                state.free_gpus.sort_unstable();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster() -> Cluster {
        Cluster::new(ClusterSpec {
            hosts: vec![
                HostSpec { cpus: 1, gpus: 0 },
                HostSpec { cpus: 4, gpus: 2 },
                HostSpec { cpus: 2, gpus: 2 },
            ],
        })
    }

    #[test]
    fn placements_pack_slots_per_host() {
        let cluster = cluster();
        let placements = cluster.place(2, 2, true).unwrap();

        let layout: Vec<_> = placements
            .iter()
            .map(|p| (p.rank, p.host, p.local_slot, p.gpu_ids.clone()))
            .collect();

        assert_eq!(
            layout,
            vec![
                (0, 1, 0, vec![0]),
                (1, 1, 1, vec![1]),
                (2, 2, 0, vec![0]),
                (3, 2, 1, vec![1]),
            ]
        );
        assert_eq!(cluster.available(), vec![(1, 0), (2, 0), (0, 0)]);
    }

    #[test]
    fn failed_placements_reserve_nothing() {
        let cluster = cluster();
        let err = cluster.place(3, 2, false).unwrap_err();

        assert!(matches!(
            err,
            OrchestraError::InsufficientResources { found: 2, .. }
        ));
        assert_eq!(cluster.available(), vec![(1, 0), (4, 2), (2, 2)]);
    }

    #[test]
    fn release_returns_every_reservation() {
        let cluster = cluster();
        let placements = cluster.place(1, 2, true).unwrap();
        cluster.release(&placements);

        assert_eq!(cluster.available(), vec![(1, 0), (4, 2), (2, 2)]);
    }
}
