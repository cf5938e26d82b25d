//! Distributed data-parallel training for a single-process training loop.
//!
//! A `RingAccelerator` places a group of workers on a `Cluster`, connects
//! them into a ring and runs the trainer's fit loop on every one of them,
//! averaging gradients over the ring. Reporting callbacks running on the
//! workers relay their results to a `Tuner` living on the driver.

pub mod accelerator;
pub mod cluster;
pub mod collective;
pub mod config;
pub mod error;
pub mod session;
pub mod trainer;
pub mod tune;

pub use accelerator::{Accelerator, LocalAccelerator, RingAccelerator, RunResult};
pub use cluster::{Cluster, ClusterSpec, HostSpec};
pub use config::{AcceleratorConfig, TrainerConfig};
pub use error::{OrchestraError, Result};
pub use trainer::{Event, MetricValue, Metrics, Model, Trainer, TrainingJob};
pub use tune::{CallbackSpec, MetricSelection, Trial, Tuner};
