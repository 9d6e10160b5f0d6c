use std::collections::VecDeque;

use tracing::trace;

use crate::fabric::{Fabric, FabricError};
use crate::message::Message;

/// Sends one message to every worker. Root only.
pub async fn bcast<F: Fabric>(fabric: &mut F, message: Message) -> Result<(), FabricError> {
    debug_assert!(fabric.is_root());
    for dst in 0..fabric.world() {
        fabric.send(dst, message.clone()).await?;
    }
    Ok(())
}

/// A fabric endpoint with a stash, so callers can wait for one kind of
/// message while unrelated traffic keeps arriving out of order.
pub struct Mailbox<F: Fabric> {
    fabric: F,
    stash: VecDeque<(usize, Message)>,
}

impl<F: Fabric> Mailbox<F> {
    pub fn new(fabric: F) -> Self {
        Self {
            fabric,
            stash: VecDeque::new(),
        }
    }

    pub fn rank(&self) -> usize {
        self.fabric.rank()
    }

    pub fn world(&self) -> usize {
        self.fabric.world()
    }

    pub fn root(&self) -> usize {
        self.fabric.root()
    }

    pub async fn send(&mut self, dst: usize, message: Message) -> Result<(), FabricError> {
        self.fabric.send(dst, message).await
    }

    pub async fn bcast(&mut self, message: Message) -> Result<(), FabricError> {
        bcast(&mut self.fabric, message).await
    }

    /// Next message, stashed ones first.
    pub async fn recv(&mut self) -> Result<(usize, Message), FabricError> {
        if let Some(item) = self.stash.pop_front() {
            return Ok(item);
        }
        self.fabric.recv().await
    }

    /// Next message without waiting, stashed ones first.
    pub fn try_recv(&mut self) -> Result<Option<(usize, Message)>, FabricError> {
        if let Some(item) = self.stash.pop_front() {
            return Ok(Some(item));
        }
        self.fabric.try_recv()
    }

    /// Puts a message at the head of the queue, to be seen by the next
    /// receive call.
    pub fn stash_front(&mut self, src: usize, message: Message) {
        self.stash.push_front((src, message));
    }

    /// Waits for the first message matching `pred`, stashing everything
    /// else for later.
    pub async fn wait_for(
        &mut self,
        pred: impl Fn(usize, &Message) -> bool,
    ) -> Result<(usize, Message), FabricError> {
        let mut inspected = 0;
        while inspected < self.stash.len() {
            let (src, msg) = &self.stash[inspected];
            if pred(*src, msg) {
                return Ok(self.stash.remove(inspected).expect("index in range"));
            }
            inspected += 1;
        }
        loop {
            let (src, msg) = self.fabric.recv().await?;
            if pred(src, &msg) {
                return Ok((src, msg));
            }
            trace!(src, kind = msg.kind(), "stashing message");
            self.stash.push_back((src, msg));
        }
    }

    /// Synchronizes all participants on a named barrier. Workers report to
    /// the root; the root waits for every report and releases.
    pub async fn barrier(&mut self, id: u32) -> Result<(), FabricError> {
        if self.fabric.is_root() {
            for _ in 0..self.fabric.world() {
                self.wait_for(|_, m| matches!(m, Message::BarrierReady(got) if *got == id))
                    .await?;
            }
            self.bcast(Message::BarrierRelease(id)).await
        } else {
            let root = self.fabric.root();
            self.fabric.send(root, Message::BarrierReady(id)).await?;
            self.wait_for(|_, m| matches!(m, Message::BarrierRelease(got) if *got == id))
                .await?;
            Ok(())
        }
    }
}
