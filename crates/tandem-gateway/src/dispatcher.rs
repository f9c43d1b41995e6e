use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast};
use uuid::Uuid;

use tandem_types::events::MomentEvent;

const CHANNEL_CAPACITY: usize = 256;

/// Couple-scoped realtime broker.
///
/// One broadcast channel per couple, created lazily on first subscribe and
/// pruned once it has no receivers left. Also tracks which users currently
/// hold at least one live connection, which the notification dispatcher uses
/// to decide who needs a durable record.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// couple_id -> event fan-out channel
    channels: RwLock<HashMap<Uuid, broadcast::Sender<MomentEvent>>>,

    /// user_id -> live connection count
    online: RwLock<HashMap<Uuid, usize>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                channels: RwLock::new(HashMap::new()),
                online: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to a couple's channel, creating it if needed.
    pub async fn subscribe(&self, couple_id: Uuid) -> broadcast::Receiver<MomentEvent> {
        let mut channels = self.inner.channels.write().await;
        channels
            .entry(couple_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish an event on its couple's channel. Dropped silently when the
    /// couple has no connected subscribers.
    pub async fn publish(&self, event: MomentEvent) {
        let couple_id = event.couple_id();
        let mut channels = self.inner.channels.write().await;
        if let Some(tx) = channels.get(&couple_id) {
            if tx.receiver_count() == 0 {
                channels.remove(&couple_id);
                return;
            }
            let _ = tx.send(event);
        }
    }

    pub async fn connect_user(&self, user_id: Uuid) {
        *self.inner.online.write().await.entry(user_id).or_insert(0) += 1;
    }

    pub async fn disconnect_user(&self, user_id: Uuid) {
        let mut online = self.inner.online.write().await;
        if let Some(count) = online.get_mut(&user_id) {
            *count -= 1;
            if *count == 0 {
                online.remove(&user_id);
            }
        }
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.inner.online.read().await.contains_key(&user_id)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expired(couple_id: Uuid) -> MomentEvent {
        MomentEvent::Expired {
            moment_id: Uuid::new_v4(),
            couple_id,
        }
    }

    #[tokio::test]
    async fn events_stay_on_their_couples_channel() {
        let dispatcher = Dispatcher::new();
        let couple_a = Uuid::new_v4();
        let couple_b = Uuid::new_v4();

        let mut rx_a = dispatcher.subscribe(couple_a).await;
        let mut rx_b = dispatcher.subscribe(couple_b).await;

        dispatcher.publish(expired(couple_a)).await;

        let got = rx_a.recv().await.unwrap();
        assert_eq!(got.couple_id(), couple_a);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn online_tracking_counts_connections() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        assert!(!dispatcher.is_online(user).await);

        dispatcher.connect_user(user).await;
        dispatcher.connect_user(user).await;
        dispatcher.disconnect_user(user).await;
        assert!(dispatcher.is_online(user).await);

        dispatcher.disconnect_user(user).await;
        assert!(!dispatcher.is_online(user).await);
    }
}
