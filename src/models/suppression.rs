use std::{collections::HashSet, sync::RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use super::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, sqlx::Type)]
#[sqlx(type_name = "suppression_kind", rename_all = "lowercase")]
pub enum SuppressionKind {
    Unsubscribe,
    Bounce,
    Complaint,
    Manual,
}

#[derive(Debug, Clone, Deserialize, Serialize, sqlx::FromRow)]
pub struct Suppression {
    pub email: String,
    pub kind: SuppressionKind,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Read-mostly suppression set, backed by Postgres with an in-memory cache
/// for the hot path (`is_suppressed` is called once per recipient on every
/// campaign). The cache and the store are updated in the same call to
/// `add`, so a reader never observes a state where one knows about a
/// suppression and the other doesn't.
#[derive(Debug, Clone)]
pub struct SuppressionStore {
    pool: PgPool,
    cache: std::sync::Arc<RwLock<HashSet<String>>>,
}

impl SuppressionStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            cache: std::sync::Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// Populates the in-memory cache from storage. Call once at startup;
    /// the cache is kept current afterwards by every `add`.
    pub async fn warm_cache(&self) -> Result<(), Error> {
        let rows = sqlx::query!("SELECT email FROM suppressions")
            .fetch_all(&self.pool)
            .await?;

        let mut cache = self.cache.write().unwrap();
        cache.clear();
        cache.extend(rows.into_iter().map(|r| r.email));
        Ok(())
    }

    pub fn is_suppressed(&self, email: &str) -> bool {
        let normalized = normalize_email(email);
        self.cache.read().unwrap().contains(&normalized)
    }

    pub async fn add(
        &self,
        email: &str,
        kind: SuppressionKind,
        detail: Option<&str>,
    ) -> Result<(), Error> {
        let normalized = normalize_email(email);

        sqlx::query!(
            r#"
            INSERT INTO suppressions (email, kind, detail)
            VALUES ($1, $2, $3)
            ON CONFLICT (email) DO UPDATE
            SET kind = EXCLUDED.kind, detail = EXCLUDED.detail, created_at = now()
            "#,
            normalized,
            kind as _,
            detail,
        )
        .execute(&self.pool)
        .await?;

        self.cache.write().unwrap().insert(normalized);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[sqlx::test]
    async fn add_then_is_suppressed(pool: PgPool) {
        let store = SuppressionStore::new(pool);

        assert!(!store.is_suppressed("B@X.IO"));

        store
            .add("b@x.io", SuppressionKind::Unsubscribe, None)
            .await
            .unwrap();

        // normalized lookups succeed regardless of case/whitespace
        assert!(store.is_suppressed("  B@X.IO  "));
    }

    #[sqlx::test]
    async fn warm_cache_restores_state_after_restart(pool: PgPool) {
        let store = SuppressionStore::new(pool.clone());
        store
            .add("c@x.io", SuppressionKind::Bounce, Some("hard bounce"))
            .await
            .unwrap();

        let fresh = SuppressionStore::new(pool);
        assert!(!fresh.is_suppressed("c@x.io"));
        fresh.warm_cache().await.unwrap();
        assert!(fresh.is_suppressed("c@x.io"));
    }
}
