use chrono::{NaiveDate, Utc};
use sqlx::PgPool;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("quota storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct QuotaSnapshot {
    pub date: NaiveDate,
    pub used: i64,
    pub limit: i64,
}

/// A persistent per-UTC-day counter. The limit lives in process config, not
/// storage, so it can change across restarts without a migration.
#[derive(Debug, Clone)]
pub struct QuotaStore {
    pool: PgPool,
    limit: i64,
}

impl QuotaStore {
    pub fn new(pool: PgPool, limit: i64) -> Self {
        Self { pool, limit }
    }

    /// Atomically reserves `n` units of today's quota. The `UPDATE ...
    /// WHERE used + n <= limit` guard runs as one statement, so Postgres's
    /// row lock makes two concurrent reservations on the same day
    /// serialize rather than both reading a stale `used` and together
    /// overshooting the limit.
    pub async fn try_reserve(&self, n: i64) -> Result<bool, QuotaError> {
        let today = Utc::now().date_naive();

        sqlx::query!(
            r#"
            INSERT INTO daily_quota (date, used) VALUES ($1, 0)
            ON CONFLICT (date) DO NOTHING
            "#,
            today,
        )
        .execute(&self.pool)
        .await?;

        let row = sqlx::query!(
            r#"
            UPDATE daily_quota
            SET used = used + $2
            WHERE date = $1 AND used + $2 <= $3
            RETURNING used
            "#,
            today,
            n,
            self.limit,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    pub async fn used_today(&self) -> Result<QuotaSnapshot, QuotaError> {
        let today = Utc::now().date_naive();

        let used = sqlx::query!(
            "SELECT used FROM daily_quota WHERE date = $1",
            today,
        )
        .fetch_optional(&self.pool)
        .await?
        .map(|r| r.used)
        .unwrap_or(0);

        Ok(QuotaSnapshot {
            date: today,
            used,
            limit: self.limit,
        })
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::future::join_all;

    #[sqlx::test]
    async fn reserve_up_to_limit_then_deny(pool: PgPool) {
        let store = QuotaStore::new(pool, 2);

        assert!(store.try_reserve(1).await.unwrap());
        assert!(store.try_reserve(1).await.unwrap());
        assert!(!store.try_reserve(1).await.unwrap());

        let snapshot = store.used_today().await.unwrap();
        assert_eq!(snapshot.used, 2);
        assert_eq!(snapshot.limit, 2);
    }

    #[sqlx::test]
    async fn concurrent_reservations_never_overshoot_the_limit(pool: PgPool) {
        let store = QuotaStore::new(pool, 10);

        let attempts = join_all((0..25).map(|_| {
            let store = store.clone();
            async move { store.try_reserve(1).await.unwrap() }
        }))
        .await;

        let granted = attempts.into_iter().filter(|ok| *ok).count();
        assert_eq!(granted, 10);
    }
}
