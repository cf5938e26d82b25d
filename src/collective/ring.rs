use std::{
    collections::HashMap,
    sync::mpsc::{self, Receiver, RecvTimeoutError, Sender},
    time::Duration,
};

use log::debug;

use super::Collective;
use crate::{
    cluster::Placement,
    error::{OrchestraError, Result},
};

/// A message travelling between neighbouring ranks.
///
/// Chunks are always carried in double precision, `f32` buffers widen losslessly.
#[derive(Debug)]
enum Frame {
    Hello(usize),
    Chunk(Vec<f64>),
}

/// One member's position in the ring: it only ever talks to its neighbours.
#[derive(Debug)]
pub struct RingEndpoint {
    rank: usize,
    size: usize,
    local_rank: usize,
    local_size: usize,
    to_next: Sender<Frame>,
    from_prev: Receiver<Frame>,
}

/// Wires up the endpoints of a whole worker group.
pub struct RingRendezvous;

impl RingRendezvous {
    /// Builds one endpoint per placement.
    ///
    /// # Arguments
    /// * `placements` - The group's placements, ordered by rank.
    ///
    /// # Returns
    /// The endpoints, where the `i`-th one belongs to `placements[i]`.
    pub fn build(placements: &[Placement]) -> Vec<RingEndpoint> {
        let size = placements.len();

        let mut per_host: HashMap<usize, usize> = HashMap::new();
        for placement in placements {
            *per_host.entry(placement.host).or_default() += 1;
        }

        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| mpsc::channel()).unzip();

        // The i-th channel carries frames from rank i to rank i + 1.
        let mut senders: Vec<Option<Sender<Frame>>> = senders.into_iter().map(Some).collect();
        let mut receivers: Vec<Option<Receiver<Frame>>> = receivers.into_iter().map(Some).collect();

        placements
            .iter()
            .enumerate()
            .filter_map(|(rank, placement)| {
                let prev = (rank + size - 1) % size;

                Some(RingEndpoint {
                    rank,
                    size,
                    local_rank: placement.local_slot,
                    local_size: per_host.get(&placement.host).copied().unwrap_or(1),
                    to_next: senders[rank].take()?,
                    from_prev: receivers[prev].take()?,
                })
            })
            .collect()
    }
}

impl RingEndpoint {
    /// Checks that both neighbours are connected.
    ///
    /// # Arguments
    /// * `timeout` - How long to wait for the previous rank's hello.
    ///
    /// # Errors
    /// `StartupTimeout` if the previous rank doesn't answer in time.
    pub fn handshake(&self, timeout: Duration) -> Result<()> {
        self.send(Frame::Hello(self.rank))?;

        let expected = self.prev();
        match self.from_prev.recv_timeout(timeout) {
            Ok(Frame::Hello(rank)) if rank == expected => {
                debug!(rank = self.rank, prev = rank; "ring link established");
                Ok(())
            }
            Ok(frame) => Err(OrchestraError::Collective(format!(
                "rank {} expected a hello from rank {expected}, got {frame:?}",
                self.rank
            ))),
            Err(RecvTimeoutError::Timeout) => Err(OrchestraError::StartupTimeout { timeout }),
            Err(RecvTimeoutError::Disconnected) => Err(self.lost()),
        }
    }

    fn prev(&self) -> usize {
        (self.rank + self.size - 1) % self.size
    }

    fn send(&self, frame: Frame) -> Result<()> {
        self.to_next.send(frame).map_err(|_| {
            OrchestraError::Collective(format!(
                "rank {} left the ring",
                (self.rank + 1) % self.size
            ))
        })
    }

    fn recv_chunk(&self, len: usize) -> Result<Vec<f64>> {
        match self.from_prev.recv() {
            Ok(Frame::Chunk(chunk)) if chunk.len() == len => Ok(chunk),
            Ok(Frame::Chunk(chunk)) => Err(OrchestraError::Collective(format!(
                "rank {} sent {} values, expected {len}",
                self.prev(),
                chunk.len()
            ))),
            Ok(frame) => Err(OrchestraError::Collective(format!(
                "unexpected frame from rank {}: {frame:?}",
                self.prev()
            ))),
            Err(_) => Err(self.lost()),
        }
    }

    fn lost(&self) -> OrchestraError {
        OrchestraError::Collective(format!("rank {} left the ring", self.prev()))
    }

    /// The bounds of the `i`-th of `size` chunks of a buffer of `len` values.
    fn chunk(&self, len: usize, i: usize) -> std::ops::Range<usize> {
        i * len / self.size..(i + 1) * len / self.size
    }
}

impl Collective for RingEndpoint {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn local_rank(&self) -> usize {
        self.local_rank
    }

    fn local_size(&self) -> usize {
        self.local_size
    }

    fn allreduce_mean_f64(&mut self, buf: &mut [f64]) -> Result<()> {
        let n = self.size;
        if n == 1 {
            return Ok(());
        }

        let len = buf.len();

        // Reduce-scatter: after n - 1 steps each rank holds the full sum of
        // chunk `rank + 1`.
        for step in 0..n - 1 {
            let send = self.chunk(len, (self.rank + n - step) % n);
            self.send(Frame::Chunk(buf[send].to_vec()))?;

            let recv = self.chunk(len, (self.rank + n - step - 1) % n);
            let chunk = self.recv_chunk(recv.len())?;
            buf[recv].iter_mut().zip(chunk).for_each(|(acc, v)| *acc += v);
        }

        // All-gather: pass the reduced chunks around the ring.
        for step in 0..n - 1 {
            let send = self.chunk(len, (self.rank + 1 + n - step) % n);
            self.send(Frame::Chunk(buf[send].to_vec()))?;

            let recv = self.chunk(len, (self.rank + n - step) % n);
            let chunk = self.recv_chunk(recv.len())?;
            buf[recv].copy_from_slice(&chunk);
        }

        let n = n as f64;
        buf.iter_mut().for_each(|v| *v /= n);
        Ok(())
    }

    fn broadcast(&mut self, buf: &mut [f32], root: usize) -> Result<()> {
        let n = self.size;
        if n == 1 {
            return Ok(());
        }

        if root >= n {
            return Err(OrchestraError::Collective(format!(
                "broadcast root {root} is out of a ring of {n}"
            )));
        }

        if self.rank != root {
            let chunk = self.recv_chunk(buf.len())?;
            buf.iter_mut().zip(chunk).for_each(|(v, w)| *v = w as f32);
        }

        // The rank right before the root is the last one.
        if (self.rank + 1) % n != root {
            self.send(Frame::Chunk(buf.iter().map(|v| f64::from(*v)).collect()))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn placements(hosts: &[usize]) -> Vec<Placement> {
        let mut slots: HashMap<usize, usize> = HashMap::new();

        hosts
            .iter()
            .enumerate()
            .map(|(rank, &host)| {
                let slot = slots.entry(host).or_default();
                let placement = Placement {
                    rank,
                    host,
                    local_slot: *slot,
                    gpu_ids: Vec::new(),
                };
                *slot += 1;
                placement
            })
            .collect()
    }

    /// Runs `f` on every endpoint of a ring in its own thread.
    fn on_ring<T, F>(hosts: &[usize], f: F) -> Vec<Result<T>>
    where
        T: Send + 'static,
        F: Fn(RingEndpoint) -> Result<T> + Send + Clone + 'static,
    {
        let handles: Vec<_> = RingRendezvous::build(&placements(hosts))
            .into_iter()
            .map(|endpoint| {
                let f = f.clone();
                thread::spawn(move || f(endpoint))
            })
            .collect();

        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn endpoints_know_their_host_neighbourhood() {
        let endpoints = RingRendezvous::build(&placements(&[0, 0, 1]));
        let ranks: Vec<_> = endpoints
            .iter()
            .map(|e| (e.rank(), e.size(), e.local_rank(), e.local_size()))
            .collect();

        assert_eq!(ranks, vec![(0, 3, 0, 2), (1, 3, 1, 2), (2, 3, 0, 1)]);
    }

    #[test]
    fn allreduce_averages_uneven_buffers() {
        let results = on_ring(&[0, 0, 0], |mut endpoint| {
            let r = endpoint.rank() as f32;
            let mut buf: Vec<f32> = (0..7).map(|i| r * 10.0 + i as f32).collect();
            endpoint.allreduce_mean(&mut buf)?;
            Ok(buf)
        });

        let expected: Vec<f32> = (0..7).map(|i| 10.0 + i as f32).collect();
        for result in results {
            assert_eq!(result.unwrap(), expected);
        }
    }

    #[test]
    fn allreduce_handles_buffers_shorter_than_the_ring() {
        let results = on_ring(&[0, 0, 0, 0], |mut endpoint| {
            let mut buf = vec![endpoint.rank() as f32];
            endpoint.allreduce_mean(&mut buf)?;
            Ok(buf)
        });

        for result in results {
            assert_eq!(result.unwrap(), vec![1.5]);
        }
    }

    #[test]
    fn double_precision_means_are_exact() {
        let results = on_ring(&[0, 0], |mut endpoint| {
            let mut buf = vec![0.1, 1e40];
            endpoint.allreduce_mean_f64(&mut buf)?;
            Ok(buf)
        });

        for result in results {
            assert_eq!(result.unwrap(), vec![0.1, 1e40]);
        }
    }

    #[test]
    fn broadcast_copies_the_root_buffer() {
        let results = on_ring(&[0, 1, 1], |mut endpoint| {
            let mut buf = vec![endpoint.rank() as f32; 4];
            endpoint.broadcast(&mut buf, 1)?;
            endpoint.barrier()?;
            Ok(buf)
        });

        for result in results {
            assert_eq!(result.unwrap(), vec![1.0; 4]);
        }
    }

    #[test]
    fn handshake_completes_on_a_full_ring() {
        let results = on_ring(&[0, 0], |endpoint| endpoint.handshake(Duration::from_secs(5)));
        assert!(results.iter().all(Result::is_ok));
    }

    #[test]
    fn dropped_peers_surface_as_collective_errors() {
        let mut endpoints = RingRendezvous::build(&placements(&[0, 0]));
        let mut first = endpoints.remove(0);
        drop(endpoints);

        let err = first.allreduce_mean(&mut [1.0, 2.0]).unwrap_err();
        assert!(matches!(err, OrchestraError::Collective(_)));
    }
}
