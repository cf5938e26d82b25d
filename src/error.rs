use std::{error::Error, fmt, io, path::PathBuf, time::Duration};

/// The crate's result type.
pub type Result<T> = std::result::Result<T, OrchestraError>;

/// All errors that can occur while coordinating a distributed training run.
#[derive(Debug)]
pub enum OrchestraError {
    /// A required component is not available in this build.
    MissingDependency {
        component: &'static str,
        remedy: &'static str,
    },
    /// Invalid configuration, caught before any worker is started.
    InvalidConfig(String),
    /// The cluster can't hold the requested worker group.
    InsufficientResources {
        num_hosts: usize,
        num_slots: usize,
        use_gpu: bool,
        found: usize,
    },
    /// The workers failed to form the ring before the startup timeout.
    StartupTimeout { timeout: Duration },
    /// The whole run exceeded its configured timeout.
    RunTimeout { timeout: Duration },
    /// A worker task failed, `source` is the error raised on the worker.
    Worker {
        rank: usize,
        source: Box<OrchestraError>,
    },
    /// A worker task panicked.
    WorkerPanicked { rank: usize, msg: String },
    /// The worker actor is no longer reachable.
    Mailbox { rank: usize, msg: String },
    /// A ring peer went away or sent a malformed frame.
    Collective(String),
    /// A reported metric key is not present in the trainer's metrics.
    MissingMetric { key: String },
    /// A reported metric can't be converted into a scalar.
    NonScalarMetric { key: String, len: usize },
    /// A session was initialized twice with different ranks.
    SessionConflict { existing: usize, requested: usize },
    /// A state blob doesn't match the model's parameter count.
    StateSizeMismatch { got: usize, expected: usize },
    /// A model state holds a NaN or infinite parameter.
    NonFiniteState { index: usize, value: f32 },
    /// The rank 0 worker returned no result.
    MissingCanonicalResult,
    /// An operation that requires `setup` was called before it.
    NotSetUp,
    /// `teardown` was called twice without an intervening `setup`.
    AlreadyTornDown,
    /// The tuning front end rejected an action.
    Tune(String),
    /// A checkpoint could not be written or read.
    Checkpoint { path: PathBuf, source: io::Error },
    Io(io::Error),
    Serde(serde_json::Error),
}

impl OrchestraError {
    /// Wraps an error raised inside the worker with the given rank.
    pub(crate) fn in_worker(self, rank: usize) -> Self {
        match self {
            e @ (Self::Worker { .. } | Self::WorkerPanicked { .. } | Self::Mailbox { .. }) => e,
            e => Self::Worker {
                rank,
                source: Box::new(e),
            },
        }
    }

    /// Whether this error is only the consequence of another worker leaving the ring.
    pub(crate) fn is_peer_loss(&self) -> bool {
        match self {
            Self::Collective(_) => true,
            Self::Worker { source, .. } => source.is_peer_loss(),
            _ => false,
        }
    }
}

/// Collects every worker's result, failing with the root cause if any failed.
///
/// Once a worker fails its ring neighbours fail too, so errors that only
/// report a lost peer are returned only when nothing else went wrong.
pub(crate) fn gather<R>(results: Vec<Result<R>>) -> Result<Vec<R>> {
    let mut values = Vec::with_capacity(results.len());
    let mut peer_loss = None;
    let mut root_cause = None;

    for result in results {
        match result {
            Ok(value) => values.push(value),
            Err(e) if e.is_peer_loss() => {
                peer_loss.get_or_insert(e);
            }
            Err(e) => {
                root_cause.get_or_insert(e);
            }
        }
    }

    match root_cause.or(peer_loss) {
        Some(e) => Err(e),
        None => Ok(values),
    }
}

impl fmt::Display for OrchestraError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingDependency { component, remedy } => {
                write!(f, "{component} is not available: {remedy}")
            }
            Self::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            Self::InsufficientResources {
                num_hosts,
                num_slots,
                use_gpu,
                found,
            } => {
                let per_slot = if *use_gpu { "1 CPU + 1 GPU" } else { "1 CPU" };
                write!(
                    f,
                    "cluster can't place {num_hosts} host(s) x {num_slots} slot(s) ({per_slot} each), \
                     only {found} host(s) have room"
                )
            }
            Self::StartupTimeout { timeout } => {
                write!(f, "ring did not form within {timeout:?}")
            }
            Self::RunTimeout { timeout } => write!(f, "training run exceeded {timeout:?}"),
            Self::Worker { rank, source } => write!(f, "worker {rank} failed: {source}"),
            Self::WorkerPanicked { rank, msg } => write!(f, "worker {rank} panicked: {msg}"),
            Self::Mailbox { rank, msg } => write!(f, "worker {rank} unreachable: {msg}"),
            Self::Collective(msg) => write!(f, "collective error: {msg}"),
            Self::MissingMetric { key } => {
                write!(f, "metric `{key}` was not reported by the trainer")
            }
            Self::NonScalarMetric { key, len } => {
                write!(f, "metric `{key}` has {len} elements, expected a scalar")
            }
            Self::SessionConflict { existing, requested } => write!(
                f,
                "session already initialized with rank {existing}, refusing rank {requested}"
            ),
            Self::StateSizeMismatch { got, expected } => {
                write!(f, "state size mismatch: got {got}, expected {expected}")
            }
            Self::NonFiniteState { index, value } => {
                write!(f, "model state holds {value} at index {index}")
            }
            Self::MissingCanonicalResult => f.write_str("rank 0 worker returned no result"),
            Self::NotSetUp => f.write_str("accelerator is not set up"),
            Self::AlreadyTornDown => f.write_str("accelerator was already torn down"),
            Self::Tune(msg) => write!(f, "tune error: {msg}"),
            Self::Checkpoint { path, source } => {
                write!(f, "checkpoint {}: {source}", path.display())
            }
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Serde(e) => write!(f, "serialization error: {e}"),
        }
    }
}

impl Error for OrchestraError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Worker { source, .. } => Some(source.as_ref()),
            Self::Checkpoint { source, .. } => Some(source),
            Self::Io(e) => Some(e),
            Self::Serde(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for OrchestraError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for OrchestraError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serde(e)
    }
}
