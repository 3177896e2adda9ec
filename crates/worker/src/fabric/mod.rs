//! Process-group communication fabric
//!
//! A worker joins a group of `world_size` processes through a [`Transport`]
//! (gRPC peer links between processes, crossbeam channels inside one
//! process). Collective operations run over [`ProcessGroup`]s, ordered
//! subsets of the world, and the 2-D [`ProcessGroupMesh`] derives the tensor-parallel and
//! pipeline-parallel subgroups from a rank's position.
//!
//! Every collective blocks until all members of the group take part. Members
//! must issue the same collectives in the same order; a peer that never calls
//! in leaves the others blocked.

pub mod local;
pub mod tcp;

use candle_core::Tensor;
use shardline_common::metrics::METRICS;
use shardline_common::{Result, ShardlineError};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub use local::LocalTransport;
pub use tcp::{LinkOptions, TcpTransport};

/// Mesh axis along which pipeline stages are laid out
pub const PP_AXIS: usize = 0;

/// Mesh axis along which tensor-parallel shards are laid out
pub const TP_AXIS: usize = 1;

/// Fabric-level failures, surfaced as collective errors
#[derive(Error, Debug)]
pub enum FabricError {
    #[error("rank {rank} is outside a group of {world_size}")]
    RankOutOfRange { rank: usize, world_size: usize },

    #[error("rank {0} has no link to itself")]
    SelfLink(usize),

    #[error("link to rank {peer} failed: {status}")]
    Link {
        peer: usize,
        #[source]
        status: tonic::Status,
    },

    #[error("rank {0} disconnected")]
    Disconnected(usize),

    #[error("length mismatch from rank {peer}: expected {expected}, got {actual}")]
    LengthMismatch {
        peer: usize,
        expected: usize,
        actual: usize,
    },

    #[error("rank {rank} is not a member of group {ranks:?}")]
    NotAMember { rank: usize, ranks: Vec<usize> },
}

impl From<FabricError> for ShardlineError {
    fn from(err: FabricError) -> Self {
        ShardlineError::Collective(err.to_string())
    }
}

/// Blocking point-to-point link between the processes of a group
///
/// Messages between a pair of ranks are delivered in FIFO order.
pub trait Transport: Send + Sync {
    /// This process's rank in the world
    fn rank(&self) -> usize;

    /// Number of processes in the world
    fn world_size(&self) -> usize;

    /// Send a message to `peer`
    fn send(&self, peer: usize, data: &[f32]) -> Result<()>;

    /// Block until the next message from `peer` arrives
    fn recv(&self, peer: usize) -> Result<Vec<f32>>;
}

/// An ordered subset of the world's ranks sharing a transport
#[derive(Clone)]
pub struct ProcessGroup {
    transport: Arc<dyn Transport>,
    ranks: Vec<usize>,
}

impl fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("rank", &self.transport.rank())
            .field("ranks", &self.ranks)
            .finish()
    }
}

impl ProcessGroup {
    /// Create a group over `ranks`; this process must be one of them
    pub fn new(transport: Arc<dyn Transport>, mut ranks: Vec<usize>) -> Result<Self> {
        ranks.sort_unstable();
        ranks.dedup();

        let world_size = transport.world_size();
        if let Some(&rank) = ranks.iter().find(|&&r| r >= world_size) {
            return Err(FabricError::RankOutOfRange { rank, world_size }.into());
        }
        if !ranks.contains(&transport.rank()) {
            return Err(FabricError::NotAMember {
                rank: transport.rank(),
                ranks,
            }
            .into());
        }

        Ok(Self { transport, ranks })
    }

    /// Group containing every rank of the world
    pub fn world(transport: Arc<dyn Transport>) -> Self {
        let ranks = (0..transport.world_size()).collect();
        Self { transport, ranks }
    }

    /// Global ranks of the members, ascending
    pub fn ranks(&self) -> &[usize] {
        &self.ranks
    }

    pub fn size(&self) -> usize {
        self.ranks.len()
    }

    /// This process's global rank
    pub fn global_rank(&self) -> usize {
        self.transport.rank()
    }

    /// This process's index within the group
    pub fn group_rank(&self) -> usize {
        self.ranks
            .iter()
            .position(|&r| r == self.transport.rank())
            .unwrap_or_default()
    }

    fn leader(&self) -> usize {
        self.ranks[0]
    }

    /// Sum `data` element-wise across the group, in place
    ///
    /// The leader (lowest rank) adds contributions in ascending rank order
    /// and sends the result back, so every member ends with identical bits.
    pub fn all_reduce_sum(&self, data: &mut [f32]) -> Result<()> {
        if self.ranks.len() == 1 {
            return Ok(());
        }

        METRICS.forward.collective_duration.observe_closure_duration(|| -> Result<()> {
            let me = self.transport.rank();
            let leader = self.leader();

            if me == leader {
                for &peer in &self.ranks[1..] {
                    let contribution = self.transport.recv(peer)?;
                    check_len(peer, data.len(), contribution.len())?;
                    for (acc, value) in data.iter_mut().zip(contribution) {
                        *acc += value;
                    }
                }
                for &peer in &self.ranks[1..] {
                    self.transport.send(peer, data)?;
                }
            } else {
                self.transport.send(leader, data)?;
                let reduced = self.transport.recv(leader)?;
                check_len(leader, data.len(), reduced.len())?;
                data.copy_from_slice(&reduced);
            }

            Ok(())
        })
    }

    /// Replace `data` on every member with the root's copy
    pub fn broadcast(&self, root: usize, data: &mut Vec<f32>) -> Result<()> {
        if !self.ranks.contains(&root) {
            return Err(FabricError::NotAMember {
                rank: root,
                ranks: self.ranks.clone(),
            }
            .into());
        }
        if self.ranks.len() == 1 {
            return Ok(());
        }

        METRICS.forward.collective_duration.observe_closure_duration(|| -> Result<()> {
            if self.transport.rank() == root {
                for &peer in self.ranks.iter().filter(|&&r| r != root) {
                    self.transport.send(peer, data)?;
                }
            } else {
                *data = self.transport.recv(root)?;
            }
            Ok(())
        })
    }

    /// Point-to-point send to another member
    pub fn send_to(&self, peer: usize, data: &[f32]) -> Result<()> {
        self.check_peer(peer)?;
        self.transport.send(peer, data)
    }

    /// Point-to-point receive from another member
    pub fn recv_from(&self, peer: usize) -> Result<Vec<f32>> {
        self.check_peer(peer)?;
        self.transport.recv(peer)
    }

    /// Block until every member reaches the barrier
    pub fn barrier(&self) -> Result<()> {
        let mut token = [0.0f32];
        self.all_reduce_sum(&mut token)
    }

    /// All-reduce a tensor of any dtype, returning the summed tensor
    pub fn all_reduce_tensor(&self, tensor: &Tensor) -> Result<Tensor> {
        if self.ranks.len() == 1 {
            return Ok(tensor.clone());
        }

        let dtype = tensor.dtype();
        let shape = tensor.shape().clone();
        let mut data = tensor
            .to_dtype(candle_core::DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        self.all_reduce_sum(&mut data)?;

        Ok(Tensor::from_vec(data, shape, tensor.device())?.to_dtype(dtype)?)
    }

    fn check_peer(&self, peer: usize) -> Result<()> {
        if peer == self.transport.rank() {
            return Err(FabricError::SelfLink(peer).into());
        }
        if !self.ranks.contains(&peer) {
            return Err(FabricError::NotAMember {
                rank: peer,
                ranks: self.ranks.clone(),
            }
            .into());
        }
        Ok(())
    }
}

fn check_len(peer: usize, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(FabricError::LengthMismatch {
            peer,
            expected,
            actual,
        }
        .into());
    }
    Ok(())
}

/// 2-D layout of the world as `(pp_size, tp_size)`, ranks row-major
#[derive(Clone)]
pub struct ProcessGroupMesh {
    transport: Arc<dyn Transport>,
    shape: [usize; 2],
}

impl ProcessGroupMesh {
    pub fn new(transport: Arc<dyn Transport>, pp_size: usize, tp_size: usize) -> Result<Self> {
        if pp_size * tp_size != transport.world_size() {
            return Err(ShardlineError::config(format!(
                "mesh ({}, {}) does not cover a world of {}",
                pp_size,
                tp_size,
                transport.world_size()
            )));
        }

        Ok(Self {
            transport,
            shape: [pp_size, tp_size],
        })
    }

    /// `[pp_index, tp_index]` of a global rank
    pub fn coordinate(&self, rank: usize) -> [usize; 2] {
        [rank / self.shape[TP_AXIS], rank % self.shape[TP_AXIS]]
    }

    /// Coordinate of this process
    pub fn local_coordinate(&self) -> [usize; 2] {
        self.coordinate(self.transport.rank())
    }

    /// Group of ranks that share this process's coordinate on every axis but `axis`
    pub fn group_along_axis(&self, axis: usize) -> Result<ProcessGroup> {
        let [pp_idx, tp_idx] = self.local_coordinate();
        let tp_size = self.shape[TP_AXIS];

        let ranks = match axis {
            TP_AXIS => (0..tp_size).map(|t| pp_idx * tp_size + t).collect(),
            PP_AXIS => (0..self.shape[PP_AXIS]).map(|p| p * tp_size + tp_idx).collect(),
            other => {
                return Err(ShardlineError::invalid_input(format!(
                    "mesh has no axis {}",
                    other
                )))
            }
        };

        ProcessGroup::new(self.transport.clone(), ranks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_mesh_groups() {
        let transports = LocalTransport::group(6);
        let rank4: Arc<dyn Transport> = Arc::new(transports.into_iter().nth(4).unwrap());
        let mesh = ProcessGroupMesh::new(rank4, 3, 2).unwrap();

        assert_eq!(mesh.local_coordinate(), [2, 0]);
        assert_eq!(mesh.group_along_axis(TP_AXIS).unwrap().ranks(), &[4, 5]);
        assert_eq!(mesh.group_along_axis(PP_AXIS).unwrap().ranks(), &[0, 2, 4]);
        assert!(mesh.group_along_axis(2).is_err());
    }

    #[test]
    fn test_mesh_must_cover_world() {
        let transport: Arc<dyn Transport> = Arc::new(LocalTransport::group(1).remove(0));
        assert!(ProcessGroupMesh::new(transport, 2, 1).is_err());
    }

    #[test]
    fn test_all_reduce_and_broadcast() {
        let handles: Vec<_> = LocalTransport::group(4)
            .into_iter()
            .map(|transport| {
                thread::spawn(move || {
                    let rank = transport.rank();
                    let group = ProcessGroup::world(Arc::new(transport));

                    let mut data = vec![rank as f32, 1.0];
                    group.all_reduce_sum(&mut data).unwrap();

                    let mut payload = if rank == 2 { vec![7.0, 8.0, 9.0] } else { Vec::new() };
                    group.broadcast(2, &mut payload).unwrap();
                    group.barrier().unwrap();

                    (data, payload)
                })
            })
            .collect();

        for handle in handles {
            let (data, payload) = handle.join().unwrap();
            assert_eq!(data, vec![6.0, 4.0]);
            assert_eq!(payload, vec![7.0, 8.0, 9.0]);
        }
    }

    #[test]
    fn test_subgroup_membership() {
        let transport: Arc<dyn Transport> = Arc::new(LocalTransport::group(4).remove(1));
        assert!(ProcessGroup::new(transport.clone(), vec![0, 2]).is_err());
        assert!(ProcessGroup::new(transport.clone(), vec![1, 7]).is_err());

        let group = ProcessGroup::new(transport, vec![3, 1]).unwrap();
        assert_eq!(group.ranks(), &[1, 3]);
        assert_eq!(group.group_rank(), 0);
        assert!(group.send_to(1, &[1.0]).is_err());
        assert!(group.send_to(2, &[1.0]).is_err());
    }
}
