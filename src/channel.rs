//! Work channel port: hands an agent type to exactly one available runner in
//! the common case. Delivery is at-least-once and unordered across publishers;
//! consumers must tolerate redelivery.

use crate::error::SchedulerError;
use crate::ports::PortFuture;
use crate::types::AgentType;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub agent_type: AgentType,
    /// 1 for the first delivery of a published message.
    pub attempt: u32,
}

impl Delivery {
    #[must_use]
    pub const fn first(agent_type: AgentType) -> Self {
        Self {
            agent_type,
            attempt: 1,
        }
    }

    #[must_use]
    pub fn next_attempt(self) -> Self {
        Self {
            agent_type: self.agent_type,
            attempt: self.attempt.saturating_add(1),
        }
    }
}

pub trait WorkChannel: Send + Sync {
    fn publish<'a>(&'a self, agent_type: &'a AgentType) -> PortFuture<'a, ()>;

    /// Wait up to `wait` for the next message. `None` means nothing arrived.
    fn next_delivery(&self, wait: Duration) -> PortFuture<'_, Option<Delivery>>;

    /// Put a delivery back on the channel for another runner.
    fn redeliver(&self, delivery: Delivery) -> PortFuture<'_, ()>;
}

/// Single-process channel over an unbounded tokio mpsc queue; FIFO.
#[derive(Debug, Clone)]
pub struct InProcessChannel {
    sender: UnboundedSender<Delivery>,
    receiver: Arc<Mutex<UnboundedReceiver<Delivery>>>,
}

impl Default for InProcessChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessChannel {
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }

    /// Take the next delivery without waiting.
    pub async fn try_next(&self) -> Option<Delivery> {
        self.receiver.lock().await.try_recv().ok()
    }

    /// Drain everything currently queued, in delivery order.
    pub async fn drain(&self) -> Vec<Delivery> {
        let mut receiver = self.receiver.lock().await;
        std::iter::from_fn(|| receiver.try_recv().ok()).collect()
    }

    fn send(&self, delivery: Delivery) -> crate::Result<()> {
        self.sender
            .send(delivery)
            .map_err(|e| SchedulerError::ChannelError(format!("Work channel closed: {e}")))
    }
}

impl WorkChannel for InProcessChannel {
    fn publish<'a>(&'a self, agent_type: &'a AgentType) -> PortFuture<'a, ()> {
        Box::pin(async move { self.send(Delivery::first(agent_type.clone())) })
    }

    fn next_delivery(&self, wait: Duration) -> PortFuture<'_, Option<Delivery>> {
        Box::pin(async move {
            let mut receiver = self.receiver.lock().await;
            Ok(tokio::time::timeout(wait, receiver.recv())
                .await
                .ok()
                .flatten())
        })
    }

    fn redeliver(&self, delivery: Delivery) -> PortFuture<'_, ()> {
        Box::pin(async move { self.send(delivery) })
    }
}
