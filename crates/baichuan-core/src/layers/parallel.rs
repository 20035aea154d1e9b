//! Tensor-parallel linear layers and the collectives they rely on.
//!
//! Weights are sharded from the full checkpoint tensor at load time:
//! - [`ColumnLinear`] keeps a slice of the output features and can gather the
//!   full output back.
//! - [`RowLinear`] keeps a slice of the input features and sums the partial
//!   outputs of all ranks.
//!
//! Collectives go through [`Communicator`]. [`SingleRank`] is the identity,
//! [`local_group`] joins N threads of one process.

use std::fmt;
use std::sync::{Arc, Barrier, Mutex};

use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::error::{Error, Result};

/// Collective operations over the ranks of a tensor-parallel group.
///
/// Every rank must enter each collective in the same order. A rank that fails
/// inside a collective still completes its part of the exchange, so peers get
/// an error instead of blocking.
pub trait Communicator: Send + Sync + fmt::Debug {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Element-wise sum of `x` across all ranks.
    fn all_reduce_sum(&self, x: &Tensor) -> Result<Tensor>;

    /// Concatenation of `x` from every rank, in rank order, along `dim`.
    fn all_gather(&self, x: &Tensor, dim: usize) -> Result<Tensor>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SingleRank;

impl Communicator for SingleRank {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, x: &Tensor) -> Result<Tensor> {
        Ok(x.clone())
    }

    fn all_gather(&self, x: &Tensor, _dim: usize) -> Result<Tensor> {
        Ok(x.clone())
    }
}

#[derive(Debug)]
struct Rendezvous {
    barrier: Barrier,
    slots: Mutex<Vec<Option<Tensor>>>,
}

/// One member of an in-process group created by [`local_group`].
#[derive(Debug)]
pub struct LocalCommunicator {
    rank: usize,
    world_size: usize,
    shared: Arc<Rendezvous>,
}

/// Create `world_size` communicators that exchange tensors through shared
/// memory. Each must be driven from its own thread; every rank has to issue
/// the same sequence of collectives.
pub fn local_group(world_size: usize) -> Vec<Arc<dyn Communicator>> {
    let shared = Arc::new(Rendezvous {
        barrier: Barrier::new(world_size),
        slots: Mutex::new(vec![None; world_size]),
    });
    (0..world_size)
        .map(|rank| {
            Arc::new(LocalCommunicator {
                rank,
                world_size,
                shared: shared.clone(),
            }) as Arc<dyn Communicator>
        })
        .collect()
}

impl LocalCommunicator {
    fn exchange(&self, x: &Tensor) -> Result<Vec<Tensor>> {
        let published = match self.shared.slots.lock() {
            Ok(mut slots) => {
                slots[self.rank] = Some(x.clone());
                Ok(())
            }
            Err(_) => Err(poisoned()),
        };
        self.shared.barrier.wait();
        let gathered = match self.shared.slots.lock() {
            Ok(slots) => slots
                .iter()
                .enumerate()
                .map(|(rank, slot)| {
                    slot.clone().ok_or_else(|| {
                        Error::CommError(format!("rank {rank} did not contribute a tensor"))
                    })
                })
                .collect::<Result<Vec<_>>>(),
            Err(_) => Err(poisoned()),
        };
        // Nobody may publish the next tensor before every rank has read this one.
        self.shared.barrier.wait();
        published?;
        gathered
    }
}

fn poisoned() -> Error {
    Error::CommError("rendezvous lock poisoned".to_string())
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum(&self, x: &Tensor) -> Result<Tensor> {
        let parts = self.exchange(x)?;
        let mut acc = parts[0].clone();
        for part in &parts[1..] {
            acc = acc.add(part)?;
        }
        Ok(acc)
    }

    fn all_gather(&self, x: &Tensor, dim: usize) -> Result<Tensor> {
        let parts = self.exchange(x)?;
        Tensor::cat(&parts, dim).map_err(Error::from)
    }
}

/// Slice `rank`'s share of `tensor` along `dim`.
pub fn shard(tensor: &Tensor, dim: usize, rank: usize, world_size: usize) -> Result<Tensor> {
    let size = tensor.dim(dim)?;
    if size % world_size != 0 {
        return Err(Error::InvalidConfig(format!(
            "dimension {dim} of size {size} cannot be split across {world_size} ranks"
        )));
    }
    let chunk = size / world_size;
    tensor
        .narrow(dim, rank * chunk, chunk)?
        .contiguous()
        .map_err(Error::from)
}

/// Linear layer split along its output features.
#[derive(Debug, Clone)]
pub struct ColumnLinear {
    linear: Linear,
    gather_output: bool,
    comm: Arc<dyn Communicator>,
}

impl ColumnLinear {
    /// Build from a weight that already holds only this rank's rows.
    pub fn from_local(weight: Tensor, gather_output: bool, comm: Arc<dyn Communicator>) -> Self {
        Self {
            linear: Linear::new(weight, None),
            gather_output,
            comm,
        }
    }

    /// Build from the full `[out_features, in_features]` weight.
    pub fn from_full(
        weight: &Tensor,
        gather_output: bool,
        comm: Arc<dyn Communicator>,
    ) -> Result<Self> {
        let local = shard(weight, 0, comm.rank(), comm.world_size())?;
        Ok(Self::from_local(local, gather_output, comm))
    }

    pub fn load(
        in_features: usize,
        out_features: usize,
        gather_output: bool,
        vb: VarBuilder,
        comm: Arc<dyn Communicator>,
    ) -> Result<Self> {
        let weight = vb.get((out_features, in_features), "weight")?;
        Self::from_full(&weight, gather_output, comm)
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let y = self.linear.forward(x)?;
        if self.gather_output && self.comm.world_size() > 1 {
            let last = y.rank() - 1;
            self.comm.all_gather(&y, last)
        } else {
            Ok(y)
        }
    }
}

/// Linear layer split along its input features. Outputs are summed across
/// ranks.
#[derive(Debug, Clone)]
pub struct RowLinear {
    linear: Linear,
    comm: Arc<dyn Communicator>,
}

impl RowLinear {
    /// Build from the full `[out_features, in_features]` weight.
    pub fn from_full(weight: &Tensor, comm: Arc<dyn Communicator>) -> Result<Self> {
        let local = shard(weight, 1, comm.rank(), comm.world_size())?;
        Ok(Self {
            linear: Linear::new(local, None),
            comm,
        })
    }

    pub fn load(
        in_features: usize,
        out_features: usize,
        vb: VarBuilder,
        comm: Arc<dyn Communicator>,
    ) -> Result<Self> {
        let weight = vb.get((out_features, in_features), "weight")?;
        Self::from_full(&weight, comm)
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let y = self.linear.forward(x)?;
        if self.comm.world_size() > 1 {
            self.comm.all_reduce_sum(&y)
        } else {
            Ok(y)
        }
    }
}
