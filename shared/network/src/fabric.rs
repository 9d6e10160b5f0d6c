use async_trait::async_trait;
use thiserror::Error;

use crate::message::Message;

#[derive(Debug, Error)]
pub enum FabricError {
    #[error("peer {0} is not reachable")]
    Unreachable(usize),

    #[error("fabric closed")]
    Closed,

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("message codec: {0}")]
    Codec(#[from] postcard::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Ordered, typed point-to-point messaging between the solve participants.
///
/// Endpoints are the workers `0..world` plus the root at rank `world`.
/// Delivery is FIFO per ordered sender/receiver pair; there is no global
/// ordering. Collectives are layered on top of this interface.
#[async_trait]
pub trait Fabric: Send {
    fn rank(&self) -> usize;

    /// Number of workers. The root's rank equals this value.
    fn world(&self) -> usize;

    fn root(&self) -> usize {
        self.world()
    }

    fn is_root(&self) -> bool {
        self.rank() == self.world()
    }

    async fn send(&mut self, dst: usize, message: Message) -> Result<(), FabricError>;

    /// Waits for the next message from any peer.
    async fn recv(&mut self) -> Result<(usize, Message), FabricError>;

    /// Returns a queued message without waiting, if one is available.
    fn try_recv(&mut self) -> Result<Option<(usize, Message)>, FabricError>;
}

#[async_trait]
impl<T: Fabric + ?Sized> Fabric for Box<T> {
    fn rank(&self) -> usize {
        (**self).rank()
    }

    fn world(&self) -> usize {
        (**self).world()
    }

    async fn send(&mut self, dst: usize, message: Message) -> Result<(), FabricError> {
        (**self).send(dst, message).await
    }

    async fn recv(&mut self) -> Result<(usize, Message), FabricError> {
        (**self).recv().await
    }

    fn try_recv(&mut self) -> Result<Option<(usize, Message)>, FabricError> {
        (**self).try_recv()
    }
}
