//! Bridges the worker's Redis pub/sub channel onto the in-process queue
//! event bus.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use clearscan_core::orchestration::QueueEventPublisher;
use clearscan_model::QueueEvent;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub struct RedisQueueEventForwarder {
    client: redis::Client,
    channel: String,
    publisher: Arc<dyn QueueEventPublisher>,
}

impl fmt::Debug for RedisQueueEventForwarder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisQueueEventForwarder")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl RedisQueueEventForwarder {
    pub fn new(
        url: &str,
        channel: impl Into<String>,
        publisher: Arc<dyn QueueEventPublisher>,
    ) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)
            .with_context(|| format!("failed to parse redis url {url}"))?;
        Ok(Self {
            client,
            channel: channel.into(),
            publisher,
        })
    }

    /// Subscribes until cancelled, resubscribing after connection loss.
    /// Events published while disconnected are picked up by the sweeper.
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.subscribe_once(&cancel) => match result {
                    Ok(()) if cancel.is_cancelled() => break,
                    Ok(()) => warn!(
                        target: "scan::queue",
                        channel = %self.channel,
                        "redis subscription closed; reconnecting"
                    ),
                    Err(err) => warn!(
                        target: "scan::queue",
                        channel = %self.channel,
                        error = %format!("{err:#}"),
                        "redis subscription failed; reconnecting"
                    ),
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }
        info!(target: "scan::queue", "redis queue event forwarder stopped");
    }

    async fn subscribe_once(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .context("failed to connect to redis")?;
        pubsub
            .subscribe(&self.channel)
            .await
            .with_context(|| format!("failed to subscribe to {}", self.channel))?;
        info!(target: "scan::queue", channel = %self.channel, "subscribed to queue events");

        let mut messages = pubsub.on_message();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                next = messages.next() => match next {
                    Some(message) => self.forward(message.get_payload_bytes()).await,
                    None => return Ok(()),
                }
            }
        }
    }

    async fn forward(&self, payload: &[u8]) {
        let event = match decode_event(payload) {
            Ok(event) => event,
            Err(err) => {
                warn!(target: "scan::queue", error = %err, "dropping undecodable queue event");
                return;
            }
        };
        debug!(target: "scan::queue", %event, "forwarding queue event");
        if let Err(err) = self.publisher.publish(event).await {
            warn!(target: "scan::queue", error = %err, "failed to publish queue event");
        }
    }
}

pub fn decode_event(payload: &[u8]) -> serde_json::Result<QueueEvent> {
    serde_json::from_slice(payload)
}
