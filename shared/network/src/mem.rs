use async_trait::async_trait;

use crate::fabric::{Fabric, FabricError};
use crate::message::Message;

/// In-process fabric over unbounded channels, for same-host worker pools
/// and tests. FIFO per sender/receiver pair holds because every send
/// enqueues atomically into the receiver's single inbox.
pub struct MemFabric {
    rank: usize,
    world: usize,
    inbox: flume::Receiver<(usize, Message)>,
    peers: Vec<flume::Sender<(usize, Message)>>,
}

/// Builds the endpoints of a world of `world` workers plus the root.
/// Returns `(root, workers)`, workers indexed by rank.
pub fn mem_fabric(world: usize) -> (MemFabric, Vec<MemFabric>) {
    let channels: Vec<_> = (0..=world).map(|_| flume::unbounded()).collect();
    let senders: Vec<_> = channels.iter().map(|(tx, _)| tx.clone()).collect();
    let mut endpoints: Vec<MemFabric> = channels
        .into_iter()
        .enumerate()
        .map(|(rank, (_, rx))| MemFabric {
            rank,
            world,
            inbox: rx,
            peers: senders.clone(),
        })
        .collect();
    let root = endpoints.pop().expect("world + 1 endpoints");
    (root, endpoints)
}

#[async_trait]
impl Fabric for MemFabric {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world(&self) -> usize {
        self.world
    }

    async fn send(&mut self, dst: usize, message: Message) -> Result<(), FabricError> {
        self.peers
            .get(dst)
            .ok_or(FabricError::Unreachable(dst))?
            .send((self.rank, message))
            .map_err(|_| FabricError::Unreachable(dst))
    }

    async fn recv(&mut self) -> Result<(usize, Message), FabricError> {
        self.inbox
            .recv_async()
            .await
            .map_err(|_| FabricError::Closed)
    }

    fn try_recv(&mut self) -> Result<Option<(usize, Message)>, FabricError> {
        match self.inbox.try_recv() {
            Ok(item) => Ok(Some(item)),
            Err(flume::TryRecvError::Empty) => Ok(None),
            Err(flume::TryRecvError::Disconnected) => Err(FabricError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_per_pair() {
        let (mut root, mut workers) = mem_fabric(2);
        let mut w0 = workers.remove(0);
        for i in 0..4u32 {
            w0.send(2, Message::BarrierReady(i)).await.unwrap();
        }
        for i in 0..4u32 {
            let (src, msg) = root.recv().await.unwrap();
            assert_eq!(src, 0);
            match msg {
                Message::BarrierReady(got) => assert_eq!(got, i),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(root.try_recv().unwrap().is_none());
    }
}
