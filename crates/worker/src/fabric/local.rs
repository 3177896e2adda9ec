//! In-process transport over crossbeam channels
//!
//! Used for single-process groups and for running several ranks on threads
//! in tests. Every ordered pair of ranks gets its own unbounded channel.

use super::{FabricError, Transport};
use crossbeam::channel::{unbounded, Receiver, Sender};
use shardline_common::Result;

/// One rank's endpoints into an in-process mesh
pub struct LocalTransport {
    rank: usize,
    world_size: usize,
    senders: Vec<Sender<Vec<f32>>>,
    receivers: Vec<Receiver<Vec<f32>>>,
}

impl LocalTransport {
    /// Create a fully connected group of `world_size` ranks, indexed by rank
    pub fn group(world_size: usize) -> Vec<LocalTransport> {
        let mut senders: Vec<Vec<Sender<Vec<f32>>>> = vec![Vec::new(); world_size];
        let mut receivers: Vec<Vec<Receiver<Vec<f32>>>> = vec![Vec::new(); world_size];

        // senders[from][to] pairs with receivers[to][from]
        for from in 0..world_size {
            for to in 0..world_size {
                let (tx, rx) = unbounded();
                senders[from].push(tx);
                receivers[to].push(rx);
            }
        }

        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (senders, receivers))| LocalTransport {
                rank,
                world_size,
                senders,
                receivers,
            })
            .collect()
    }

    fn check_peer(&self, peer: usize) -> Result<()> {
        if peer >= self.world_size {
            return Err(FabricError::RankOutOfRange {
                rank: peer,
                world_size: self.world_size,
            }
            .into());
        }
        if peer == self.rank {
            return Err(FabricError::SelfLink(peer).into());
        }
        Ok(())
    }
}

impl Transport for LocalTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn send(&self, peer: usize, data: &[f32]) -> Result<()> {
        self.check_peer(peer)?;
        self.senders[peer]
            .send(data.to_vec())
            .map_err(|_| FabricError::Disconnected(peer).into())
    }

    fn recv(&self, peer: usize) -> Result<Vec<f32>> {
        self.check_peer(peer)?;
        self.receivers[peer]
            .recv()
            .map_err(|_| FabricError::Disconnected(peer).into())
    }
}
