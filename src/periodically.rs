use chrono::Duration;
use tracing::{info, warn};

use crate::models::{DeliveryRepo, Error, QuotaStore};

/// Ambient background tasks that accompany the campaign engine: nothing
/// here is on the per-recipient pipeline's critical path. Named and
/// shaped after the host crate's own periodic task runner.
pub struct Periodically {
    deliveries: DeliveryRepo,
    quota: QuotaStore,
}

/// How long a `sent` delivery can go without a webhook confirming its
/// terminal state before it is surfaced as aging.
const STALE_SENT_THRESHOLD: Duration = Duration::hours(24);

impl Periodically {
    pub fn new(deliveries: DeliveryRepo, quota: QuotaStore) -> Self {
        Self { deliveries, quota }
    }

    /// Logs the day's quota usage, at the idiom level of a simple
    /// operational heartbeat.
    pub async fn log_quota_usage(&self) -> Result<(), Error> {
        let snapshot = self
            .quota
            .used_today()
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;
        info!(
            date = %snapshot.date,
            used = snapshot.used,
            limit = snapshot.limit,
            "daily quota usage"
        );
        Ok(())
    }

    /// Surfaces `sent` deliveries that have gone unconfirmed for longer
    /// than `STALE_SENT_THRESHOLD`. This crate never auto-retries them:
    /// the provider's webhook remains the only authority on their
    /// terminal state, so this is a visibility signal for operators, not
    /// a state transition.
    pub async fn warn_on_stale_sent(&self) -> Result<(), Error> {
        let cutoff = chrono::Utc::now() - STALE_SENT_THRESHOLD;
        let count = self.deliveries.count_stale_sent(cutoff).await?;

        if count > 0 {
            warn!(count, "deliveries stuck in sent without a webhook confirmation");
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[sqlx::test]
    async fn log_quota_usage_reads_todays_snapshot(pool: sqlx::PgPool) {
        let deliveries = DeliveryRepo::new(pool.clone());
        let quota = QuotaStore::new(pool, 100);
        let periodically = Periodically::new(deliveries, quota);

        periodically.log_quota_usage().await.unwrap();
    }

    #[sqlx::test]
    async fn warn_on_stale_sent_tolerates_an_empty_table(pool: sqlx::PgPool) {
        let deliveries = DeliveryRepo::new(pool.clone());
        let quota = QuotaStore::new(pool, 100);
        let periodically = Periodically::new(deliveries, quota);

        periodically.warn_on_stale_sent().await.unwrap();
    }
}
