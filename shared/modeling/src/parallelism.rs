use std::sync::{Arc, Condvar, Mutex};
use tch::Tensor;
use tessera_core::{Barrier, CancelledBarrier};
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum CommunicatorError {
    #[error("collective state poisoned by a peer rank panic")]
    Poisoned,

    #[error("gather slot for rank {0} already occupied")]
    SlotOccupied(usize),

    #[error("gather round completed with a missing contribution from rank {0}")]
    MissingContribution(usize),
}

#[derive(Debug)]
struct GatherState {
    slots: Vec<Option<Tensor>>,
    deposited: usize,
    collected: usize,
    generation: u64,
}

#[derive(Debug)]
struct GroupShared {
    world_size: usize,
    gather: Mutex<GatherState>,
    gather_cond: Condvar,
    fence: std::sync::Barrier,
}

/// Per-rank handle to an in-process rank group.
///
/// Ranks are threads of one process; collectives rendezvous through shared
/// state instead of a wire transport, but keep the blocking, all-ranks-arrive
/// semantics of their distributed counterparts.
#[derive(Debug, Clone)]
pub struct Communicator {
    rank: usize,
    shared: Arc<GroupShared>,
}

/// Creates a rank group of `world_size` communicators, one per rank thread.
pub fn local_group(world_size: usize) -> Vec<Communicator> {
    assert!(world_size > 0, "world_size must be positive");
    let shared = Arc::new(GroupShared {
        world_size,
        gather: Mutex::new(GatherState {
            slots: (0..world_size).map(|_| None).collect(),
            deposited: 0,
            collected: 0,
            generation: 0,
        }),
        gather_cond: Condvar::new(),
        fence: std::sync::Barrier::new(world_size),
    });
    (0..world_size)
        .map(|rank| Communicator {
            rank,
            shared: shared.clone(),
        })
        .collect()
}

impl Communicator {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.shared.world_size
    }

    /// Gathers every rank's tensor, ordered by rank, each moved to the
    /// caller's device. Contributions are deep copies, so callers may keep
    /// mutating their local tensor immediately.
    pub fn all_gather(&self, local: &Tensor) -> Result<Vec<Tensor>, CommunicatorError> {
        let world_size = self.shared.world_size;
        let contribution = local.copy();

        let mut state = self
            .shared
            .gather
            .lock()
            .map_err(|_| CommunicatorError::Poisoned)?;

        // Wait for the previous round to finish collecting before depositing.
        while state.deposited == world_size {
            state = self
                .shared
                .gather_cond
                .wait(state)
                .map_err(|_| CommunicatorError::Poisoned)?;
        }

        if state.slots[self.rank].is_some() {
            return Err(CommunicatorError::SlotOccupied(self.rank));
        }
        let round = state.generation;
        state.slots[self.rank] = Some(contribution);
        state.deposited += 1;
        trace!(rank = self.rank, round, "all_gather deposit");
        if state.deposited == world_size {
            self.shared.gather_cond.notify_all();
        }

        while state.generation == round && state.deposited < world_size {
            state = self
                .shared
                .gather_cond
                .wait(state)
                .map_err(|_| CommunicatorError::Poisoned)?;
        }

        let mut gathered = Vec::with_capacity(world_size);
        for (rank, slot) in state.slots.iter().enumerate() {
            let tensor = slot
                .as_ref()
                .ok_or(CommunicatorError::MissingContribution(rank))?;
            gathered.push(tensor.to_device(local.device()));
        }

        state.collected += 1;
        if state.collected == world_size {
            for slot in state.slots.iter_mut() {
                *slot = None;
            }
            state.deposited = 0;
            state.collected = 0;
            state.generation = state.generation.wrapping_add(1);
            self.shared.gather_cond.notify_all();
        }

        Ok(gathered)
    }

    /// Replaces `tensor` in place with the element-wise mean over all ranks.
    /// The reduction order is fixed by rank, so every rank computes a
    /// bitwise-identical result.
    pub fn all_reduce_mean(&self, tensor: &mut Tensor) -> Result<(), CommunicatorError> {
        let gathered = self.all_gather(tensor)?;
        let mut acc = tensor.zeros_like();
        for contribution in &gathered {
            acc = acc + contribution;
        }
        let mean = acc / (self.shared.world_size as f64);
        let _ = tensor.copy_(&mean);
        Ok(())
    }

    /// Blocking fence across all ranks of the group. Reusable.
    pub fn barrier(&self) {
        self.shared.fence.wait();
    }
}

impl Barrier for Communicator {
    fn wait(&self) -> Result<(), CancelledBarrier> {
        self.barrier();
        Ok(())
    }

    fn cancel(&self) {}

    fn reset(&self) {}

    fn is_cancelled(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tch::{Device, Kind};

    fn run_ranks<F>(world_size: usize, test_fn: F)
    where
        F: Fn(Communicator) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let comms = local_group(world_size);
        let test_fn = Arc::new(test_fn);

        let threads: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                let test_fn = test_fn.clone();
                std::thread::spawn(move || test_fn(comm).unwrap())
            })
            .collect();

        for thread in threads {
            thread.join().expect("rank thread panicked");
        }
    }

    #[test]
    fn all_gather_orders_contributions_by_rank() {
        run_ranks(3, |comm| {
            let local = Tensor::full(
                [2],
                comm.rank() as i64,
                (Kind::Float, Device::Cpu),
            );
            let gathered = comm.all_gather(&local)?;
            assert_eq!(gathered.len(), 3);
            for (rank, tensor) in gathered.iter().enumerate() {
                let expected = Tensor::full([2], rank as i64, (Kind::Float, Device::Cpu));
                assert!(tensor.equal(&expected));
            }
            Ok(())
        });
    }

    #[test]
    fn all_gather_is_reusable_across_rounds() {
        run_ranks(2, |comm| {
            for round in 0..4i64 {
                let local = Tensor::full(
                    [1],
                    comm.rank() as i64 * 10 + round,
                    (Kind::Float, Device::Cpu),
                );
                let gathered = comm.all_gather(&local)?;
                for (rank, tensor) in gathered.iter().enumerate() {
                    assert_eq!(
                        tensor.double_value(&[0]),
                        (rank as i64 * 10 + round) as f64
                    );
                }
            }
            Ok(())
        });
    }

    #[test]
    fn all_reduce_mean_matches_on_every_rank() {
        let results = Arc::new(Mutex::new(Vec::new()));
        {
            let results = results.clone();
            run_ranks(2, move |comm| {
                let mut local = Tensor::full(
                    [3],
                    (comm.rank() as i64 + 1) * 2,
                    (Kind::Float, Device::Cpu),
                );
                comm.all_reduce_mean(&mut local)?;
                results.lock().unwrap().push(local.copy());
                Ok(())
            });
        }

        let results = results.lock().unwrap();
        assert_eq!(results.len(), 2);
        // mean of 2 and 4
        let expected = Tensor::full([3], 3i64, (Kind::Float, Device::Cpu));
        for tensor in results.iter() {
            assert!(tensor.equal(&expected));
        }
    }

    #[test]
    fn barrier_fences_all_ranks() {
        let arrivals = Arc::new(Mutex::new(0usize));
        {
            let arrivals = arrivals.clone();
            run_ranks(3, move |comm| {
                *arrivals.lock().unwrap() += 1;
                comm.barrier();
                assert_eq!(*arrivals.lock().unwrap(), 3);
                Ok(())
            });
        }
    }
}
