//! Forced-close sweeps driven by an external trigger.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::registry::ConnectionRegistry;

/// Runs until the trigger source goes away. Each received event performs
/// exactly one sweep that force-closes every registered connection; events
/// missed while a sweep is in flight coalesce into the next one.
pub async fn run(registry: Arc<ConnectionRegistry>, mut trigger: broadcast::Receiver<()>) {
    loop {
        match trigger.recv().await {
            Ok(()) => {
                info!("Invalidation trigger received, closing all connections");
                let closed = registry.close_where(|_| true).await;
                info!(closed, "Invalidation sweep complete");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Invalidation triggers coalesced");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
