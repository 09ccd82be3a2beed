use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::{transport::Transport, BusResult};

/// Returns expired peek-locks to their entity so another receiver gets them.
pub struct LockReaper {
    transport: Arc<dyn Transport>,
    interval: Duration,
}

impl LockReaper {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            interval: Duration::from_secs(5),
        }
    }

    pub fn with_interval(transport: Arc<dyn Transport>, interval: Duration) -> Self {
        Self { transport, interval }
    }

    /// Run until `shutdown` fires.
    pub async fn run(self, mut shutdown: oneshot::Receiver<()>) {
        let mut ticker = interval(self.interval);

        debug!("Starting lock reaper with interval: {:?}", self.interval);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    match self.reap_expired_locks().await {
                        Ok(0) => {}
                        Ok(reclaimed) => info!("Reclaimed {} expired locks", reclaimed),
                        Err(e) => warn!("Error during lock reaping: {}", e),
                    }
                }
            }
        }

        debug!("Lock reaper stopped");
    }

    /// Run one reaper cycle
    pub async fn reap_expired_locks(&self) -> BusResult<usize> {
        self.transport.reclaim_expired_locks().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use crate::types::{DeliveryMode, EntityPath, LockToken, OutboundMessage};
    use chrono::Utc;

    impl MemoryTransport {
        fn force_lock_expiry(&self, source: &EntityPath, lock: &LockToken) {
            let mut state = self.state.write();
            if let Some(held) = state
                .receivables
                .get_mut(source)
                .and_then(|e| e.locked.get_mut(lock))
            {
                held.locked_until = Utc::now() - chrono::Duration::seconds(1);
            }
        }
    }

    #[tokio::test]
    async fn expired_lock_is_redelivered() {
        let transport = Arc::new(MemoryTransport::with_settings(Duration::from_secs(30), 5));
        let queue = EntityPath::queue("jobs");
        transport.create_entity(&queue).await.unwrap();
        transport
            .send(&queue, OutboundMessage::new(b"{}".to_vec()))
            .await
            .unwrap();

        let first = transport
            .receive(&queue, DeliveryMode::PeekLock, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        let lock = first.lock_token.clone().unwrap();
        transport.force_lock_expiry(&queue, &lock);

        let reaper = LockReaper::new(transport.clone());
        assert_eq!(reaper.reap_expired_locks().await.unwrap(), 1);

        // The stale holder can no longer settle it.
        assert!(transport.complete(&queue, &lock).await.is_err());

        let second = transport
            .receive(&queue, DeliveryMode::PeekLock, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.message_id, first.message_id);
        assert_eq!(second.delivery_count, 2);
    }

    #[tokio::test]
    async fn reaper_stops_on_shutdown() {
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        let (tx, rx) = oneshot::channel();
        let reaper = LockReaper::with_interval(transport, Duration::from_millis(10));

        let task = tokio::spawn(reaper.run(rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
