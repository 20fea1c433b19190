use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

use crate::services::ConversationService;

/// Background loop that expires self-destructing messages and clears
/// lapsed typing indicators.
pub fn spawn(service: Arc<ConversationService>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = service.sweep_expired().await {
                warn!("message expiry sweep failed: {e}");
            }
            service.sweep_typing().await;
        }
    })
}
