use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use tandem_db::Database;

use crate::coordinator::{ExpireOutcome, MomentCoordinator};

/// Background task that expires overdue Moments.
///
/// Runs a periodic sweep for non-terminal Moments past their `expires_at`
/// and funnels each through the coordinator's conditional transition, so a
/// Moment that completed between the query and the write is a safe no-op.
pub struct ExpirationScheduler {
    db: Arc<Database>,
    coordinator: Arc<MomentCoordinator>,
    interval: Duration,
}

impl ExpirationScheduler {
    pub fn new(
        db: Arc<Database>,
        coordinator: Arc<MomentCoordinator>,
        interval: Duration,
    ) -> Self {
        Self {
            db,
            coordinator,
            interval,
        }
    }

    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            interval.tick().await;

            match self.sweep_once().await {
                Ok(count) => {
                    if count > 0 {
                        info!("Expiry sweep: {} moments expired", count);
                    }
                }
                Err(e) => {
                    warn!("Expiry sweep error: {}", e);
                }
            }
        }
    }

    /// One sweep pass. Returns how many Moments this pass actually expired.
    pub async fn sweep_once(&self) -> anyhow::Result<usize> {
        let db = Arc::clone(&self.db);
        let overdue = tokio::task::spawn_blocking(move || db.expired_moment_ids(Utc::now()))
            .await
            .map_err(|e| anyhow::anyhow!("spawn_blocking join error: {e}"))??;

        let mut expired = 0;
        for moment_id in overdue {
            match self.coordinator.expire(moment_id).await {
                Ok(ExpireOutcome::Expired) => expired += 1,
                Ok(ExpireOutcome::AlreadyTerminal) => {}
                Err(e) => {
                    warn!("Failed to expire moment {}: {}", moment_id, e);
                }
            }
        }

        Ok(expired)
    }
}
