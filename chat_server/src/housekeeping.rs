use crate::hub::Hub;
use std::sync::{Arc, Weak};
use tokio::time::{interval, Duration};
use tracing::debug;

/// Periodically expire stale typing marks. The task ends once the hub is
/// dropped.
pub fn spawn_typing_expiry(hub: Arc<Hub>, ttl: Duration) {
    let hub: Weak<Hub> = Arc::downgrade(&hub);
    let period = (ttl / 2).max(Duration::from_millis(100));
    tokio::spawn(async move {
        let mut tick = interval(period);
        loop {
            tick.tick().await;
            let Some(hub) = hub.upgrade() else {
                break;
            };
            let expired = hub.expire_typing(ttl);
            if expired > 0 {
                debug!(expired, "typing marks expired");
            }
        }
    });
}
