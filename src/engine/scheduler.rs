//! Delayed one-shot publishes.

use crate::mqtt::{Message, Publisher};
use log::warn;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Publishes a message once after a delay, independent of the tick loop.
///
/// Scheduled work only touches the bus, never engine state.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay: Duration, message: Message);
}

/// Scheduler backed by tokio timers.
///
/// Under a paused test runtime the delays follow virtual time.
pub struct TokioScheduler {
    publisher: Arc<dyn Publisher>,
    shutdown: CancellationToken,
}

impl TokioScheduler {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self::with_shutdown(publisher, CancellationToken::new())
    }

    /// Pending publishes are dropped once `shutdown` is cancelled.
    pub fn with_shutdown(publisher: Arc<dyn Publisher>, shutdown: CancellationToken) -> Self {
        Self {
            publisher,
            shutdown,
        }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, message: Message) {
        let publisher = self.publisher.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let topic = message.topic.clone();
                    if let Err(e) = publisher.publish(message).await {
                        warn!("[Engine] Delayed publish to {} failed: {}", topic, e);
                    }
                }
            }
        });
    }
}
