//! Broadcast bus: Redis pub/sub -> local SSE fan-out.
//!
//! The refresh loop in any instance publishes new-event batches on one
//! channel; every instance subscribes and replays each batch into its local
//! session registry. The indirection exists so N instances behind a load
//! balancer all deliver every batch to their own attached clients.

use crate::sse::SseRegistry;
use external_services::hyperliquid::Liquidation;
use external_services::redis_client::BROADCAST_CHANNEL;
use external_services::CacheClient;
use futures::StreamExt;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(1);

/// One batch of newly observed events, ascending by `tid`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub events: Vec<Liquidation>,
    pub timestamp: i64,
}

/// Subscribes to the broadcast channel and fans batches out locally.
pub struct BroadcastBus {
    cache: CacheClient,
    registry: Arc<SseRegistry>,
}

impl BroadcastBus {
    pub fn new(cache: CacheClient, registry: Arc<SseRegistry>) -> Self {
        Self { cache, registry }
    }

    /// Run the bus until shutdown, resubscribing with a short backoff when
    /// the pub/sub connection drops.
    pub async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) {
        info!("Starting broadcast bus on '{}'", BROADCAST_CHANNEL);

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("broadcast bus received shutdown signal");
                    break;
                }

                result = self.subscribe_and_dispatch() => {
                    match result {
                        Ok(()) => warn!("broadcast subscription ended unexpectedly"),
                        Err(e) => warn!("broadcast subscription failed: {}", e),
                    }
                    counter!("liquidation_broadcast_resubscribes_total").increment(1);
                }
            }

            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                _ = tokio::time::sleep(RESUBSCRIBE_BACKOFF) => {}
            }
        }

        info!("Broadcast bus stopped");
    }

    async fn subscribe_and_dispatch(&self) -> external_services::Result<()> {
        let mut pubsub = self.cache.pubsub().await?;
        pubsub.subscribe(BROADCAST_CHANNEL).await?;
        info!("broadcast bus subscribed to '{}'", BROADCAST_CHANNEL);

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("unreadable broadcast payload: {}", e);
                    continue;
                }
            };

            match serde_json::from_str::<BroadcastMessage>(&payload) {
                Ok(message) => {
                    counter!("liquidation_broadcast_received_total").increment(1);
                    self.registry.broadcast_local(&message.events);
                }
                Err(e) => warn!("discarding malformed broadcast message: {}", e),
            }
        }

        Ok(())
    }
}
