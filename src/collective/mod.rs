//! Process-group operations the fit loop synchronizes through.

mod ring;

pub use ring::{RingEndpoint, RingRendezvous};

use crate::error::Result;

/// A fixed group of processes exchanging flat `f32` buffers.
///
/// Every member must issue the same sequence of calls with buffers of the
/// same length, otherwise the group deadlocks or fails.
pub trait Collective: Send {
    /// This process' index in the group.
    fn rank(&self) -> usize;

    /// The amount of processes in the group.
    fn size(&self) -> usize;

    /// This process' index among the group members sharing its host.
    fn local_rank(&self) -> usize;

    /// The amount of group members sharing this process' host.
    fn local_size(&self) -> usize;

    /// Replaces `buf` with the elementwise mean of every member's `buf`.
    ///
    /// The sum is taken in double precision.
    fn allreduce_mean(&mut self, buf: &mut [f32]) -> Result<()> {
        let mut wide: Vec<f64> = buf.iter().map(|v| f64::from(*v)).collect();
        self.allreduce_mean_f64(&mut wide)?;

        buf.iter_mut().zip(wide).for_each(|(v, w)| *v = w as f32);
        Ok(())
    }

    /// Same as `allreduce_mean`, for values that must not lose precision.
    fn allreduce_mean_f64(&mut self, buf: &mut [f64]) -> Result<()>;

    /// Replaces `buf` with the `root`'s `buf`.
    fn broadcast(&mut self, buf: &mut [f32], root: usize) -> Result<()>;

    /// Blocks until every member reached the barrier.
    fn barrier(&mut self) -> Result<()> {
        self.allreduce_mean(&mut [0.0])
    }
}

/// The trivial group of a single process.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoloCollective;

impl Collective for SoloCollective {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn local_rank(&self) -> usize {
        0
    }

    fn local_size(&self) -> usize {
        1
    }

    fn allreduce_mean(&mut self, _buf: &mut [f32]) -> Result<()> {
        Ok(())
    }

    fn allreduce_mean_f64(&mut self, _buf: &mut [f64]) -> Result<()> {
        Ok(())
    }

    fn broadcast(&mut self, _buf: &mut [f32], _root: usize) -> Result<()> {
        Ok(())
    }
}

/// Whether the ring backend was compiled in.
pub fn available() -> bool {
    cfg!(feature = "ring")
}
