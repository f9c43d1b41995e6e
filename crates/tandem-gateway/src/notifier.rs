use std::sync::Arc;

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use tandem_core::publish::TransitionPublisher;
use tandem_db::Database;
use tandem_types::events::MomentEvent;
use tandem_types::models::{Couple, Notification};

use crate::dispatcher::Dispatcher;
use crate::push::{PushGateway, PushMessage};

const PUSH_RETRY_LIMIT: u32 = 3;
const PUSH_RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(1);

/// Observer of coordinator transitions.
///
/// For every event it (a) publishes on the couple's realtime channel and
/// (b) writes a durable notification record, and attempts a push, for each
/// affected user without a live connection. All of it runs detached from the
/// transition: failures here are logged and never roll anything back.
#[derive(Clone)]
pub struct NotificationDispatcher {
    db: Arc<Database>,
    realtime: Dispatcher,
    push: Arc<PushGateway>,
}

impl NotificationDispatcher {
    pub fn new(db: Arc<Database>, realtime: Dispatcher, push: Arc<PushGateway>) -> Self {
        Self { db, realtime, push }
    }

    async fn fan_out(self, event: MomentEvent) {
        self.realtime.publish(event.clone()).await;

        let couple_id = event.couple_id();
        let db = Arc::clone(&self.db);
        let couple = match tokio::task::spawn_blocking(move || db.get_couple(couple_id)).await {
            Ok(Ok(Some(couple))) => couple,
            Ok(Ok(None)) => {
                warn!("No couple {} found during event fan-out", couple_id);
                return;
            }
            Ok(Err(e)) => {
                warn!("Couple lookup failed during fan-out: {}", e);
                return;
            }
            Err(e) => {
                warn!("spawn_blocking join error: {}", e);
                return;
            }
        };

        let message = message_for(&event);
        for user_id in affected_users(&event, &couple) {
            if self.realtime.is_online(user_id).await {
                // Live connection already saw the realtime event.
                continue;
            }

            let record = Notification {
                id: Uuid::new_v4(),
                user_id,
                kind: message.tag.clone(),
                title: message.title.clone(),
                body: message.body.clone(),
                data: message.data.clone(),
                created_at: Utc::now(),
                read_at: None,
            };
            let db = Arc::clone(&self.db);
            match tokio::task::spawn_blocking(move || db.insert_notification(&record)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Failed to store notification for {}: {}", user_id, e),
                Err(e) => warn!("spawn_blocking join error: {}", e),
            }

            self.deliver_push(user_id, &message).await;
        }
    }

    async fn deliver_push(&self, user_id: Uuid, message: &PushMessage) {
        for attempt in 1..=PUSH_RETRY_LIMIT {
            match self.push.send(user_id, message).await {
                Ok(()) => return,
                Err(e) if attempt < PUSH_RETRY_LIMIT => {
                    warn!(
                        "Push attempt {}/{} for {} failed: {}",
                        attempt, PUSH_RETRY_LIMIT, user_id, e
                    );
                    tokio::time::sleep(PUSH_RETRY_DELAY).await;
                }
                Err(e) => {
                    warn!(
                        "Push for {} dropped after {} attempts: {}",
                        user_id, PUSH_RETRY_LIMIT, e
                    );
                }
            }
        }
    }
}

impl TransitionPublisher for NotificationDispatcher {
    fn publish(&self, event: MomentEvent) {
        let this = self.clone();
        tokio::spawn(async move { this.fan_out(event).await });
    }
}

/// Who gets notified: the partner who didn't act, or both on the shared
/// terminal outcomes.
fn affected_users(event: &MomentEvent, couple: &Couple) -> Vec<Uuid> {
    match event {
        MomentEvent::Initiated { initiator, .. } => {
            couple.other_partner(*initiator).into_iter().collect()
        }
        MomentEvent::PartnerCaptured { actor_id, .. } => {
            couple.other_partner(*actor_id).into_iter().collect()
        }
        MomentEvent::Completed { .. } | MomentEvent::Expired { .. } => {
            vec![couple.partner1_id, couple.partner2_id]
        }
    }
}

fn message_for(event: &MomentEvent) -> PushMessage {
    let data = serde_json::json!({
        "moment_id": event.moment_id(),
        "couple_id": event.couple_id(),
    });
    let (title, body) = match event {
        MomentEvent::Initiated { .. } => (
            "New Moment",
            "Your partner started a Moment. Capture yours before it expires.",
        ),
        MomentEvent::PartnerCaptured { .. } => {
            ("Partner captured", "Your partner took their photo. Your turn.")
        }
        MomentEvent::Completed { .. } => (
            "Moment complete",
            "Both photos are in. The fused shot is on its way.",
        ),
        MomentEvent::Expired { .. } => (
            "Moment expired",
            "The capture window closed before both photos landed.",
        ),
    };
    PushMessage {
        title: title.into(),
        body: body.into(),
        tag: event.kind().into(),
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn seed(db: &Database) -> Couple {
        let couple = Couple {
            id: Uuid::new_v4(),
            partner1_id: Uuid::new_v4(),
            partner2_id: Uuid::new_v4(),
            created_at: Utc::now(),
        };
        db.create_couple(&couple).unwrap();
        couple
    }

    async fn wait_for_notifications(db: &Database, user: Uuid) -> Vec<Notification> {
        for _ in 0..100 {
            let found = db.notifications_for_user(user, 10).unwrap();
            if !found.is_empty() {
                return found;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        vec![]
    }

    #[tokio::test]
    async fn offline_partner_gets_a_durable_record() {
        let dir = tempdir().unwrap();
        let db = Arc::new(Database::open(&dir.path().join("t.db")).unwrap());
        let couple = seed(&db);

        let notifier = NotificationDispatcher::new(
            Arc::clone(&db),
            Dispatcher::new(),
            Arc::new(PushGateway::new(None)),
        );

        notifier.publish(MomentEvent::Initiated {
            moment_id: Uuid::new_v4(),
            couple_id: couple.id,
            initiator: couple.partner1_id,
            expires_at: Utc::now(),
        });

        let records = wait_for_notifications(&db, couple.partner2_id).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, "moment:initiated");

        // The actor is never notified about their own initiation.
        assert!(db.notifications_for_user(couple.partner1_id, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn connected_users_skip_the_durable_record() {
        let dir = tempdir().unwrap();
        let db = Arc::new(Database::open(&dir.path().join("t.db")).unwrap());
        let couple = seed(&db);

        let realtime = Dispatcher::new();
        realtime.connect_user(couple.partner2_id).await;

        let notifier = NotificationDispatcher::new(
            Arc::clone(&db),
            realtime,
            Arc::new(PushGateway::new(None)),
        );

        notifier.publish(MomentEvent::PartnerCaptured {
            moment_id: Uuid::new_v4(),
            couple_id: couple.id,
            actor_id: couple.partner1_id,
        });

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        assert!(db.notifications_for_user(couple.partner2_id, 10).unwrap().is_empty());
    }
}
