use async_trait::async_trait;
use tokio::sync::broadcast;

use clearscan_model::QueueEvent;

use crate::error::Result;

#[async_trait]
pub trait QueueEventPublisher: Send + Sync {
    async fn publish(&self, event: QueueEvent) -> Result<()>;
}

/// Lets the queue sync loop subscribe without depending on a concrete bus.
pub trait QueueEventStream: Send + Sync {
    fn subscribe_queue(&self) -> broadcast::Receiver<QueueEvent>;
}

/// In-process fan-out of worker queue events. External transports (Redis
/// pub/sub in the server) publish into it.
#[derive(Debug)]
pub struct InProcQueueEventBus {
    sender: broadcast::Sender<QueueEvent>,
}

impl InProcQueueEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl QueueEventPublisher for InProcQueueEventBus {
    async fn publish(&self, event: QueueEvent) -> Result<()> {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
        Ok(())
    }
}

impl QueueEventStream for InProcQueueEventBus {
    fn subscribe_queue(&self) -> broadcast::Receiver<QueueEvent> {
        self.subscribe()
    }
}
