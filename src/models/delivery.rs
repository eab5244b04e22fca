use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use super::Error;

/// Maximum length of `error_detail`; longer provider error bodies are
/// truncated at the boundary rather than grown into an unbounded column.
const ERROR_DETAIL_MAX_LEN: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, sqlx::Type)]
#[sqlx(type_name = "delivery_status", rename_all = "lowercase")]
pub enum DeliveryStatus {
    Queued,
    Sent,
    Delivered,
    Bounced,
    Complained,
    Failed,
    Suppressed,
    DryRun,
}

impl DeliveryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeliveryStatus::Delivered
                | DeliveryStatus::Bounced
                | DeliveryStatus::Complained
                | DeliveryStatus::Failed
                | DeliveryStatus::Suppressed
                | DeliveryStatus::DryRun
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, sqlx::Type)]
#[sqlx(type_name = "error_kind", rename_all = "lowercase")]
pub enum ErrorKind {
    Network,
    Provider5xx,
    RateLimited,
    Provider4xx,
    Render,
    QuotaExhausted,
    Storage,
    Cancelled,
}

#[derive(Debug, Clone, Deserialize, Serialize, sqlx::FromRow)]
pub struct DeliveryAttempt {
    pub id: i64,
    pub campaign_id: String,
    pub email: String,
    pub template_id: String,
    pub subject: String,
    pub provider_message_id: Option<String>,
    pub status: DeliveryStatus,
    pub attempt_no: i32,
    pub http_status: Option<i32>,
    pub error_kind: Option<ErrorKind>,
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of one completed per-recipient pipeline run, as reported to
/// `DeliveryRepo::record_result`.
#[derive(Debug, Clone)]
pub struct RecordOutcome {
    pub status: DeliveryStatus,
    pub attempt_no: i32,
    pub provider_message_id: Option<String>,
    pub http_status: Option<i32>,
    pub error_kind: Option<ErrorKind>,
    pub error_detail: Option<String>,
}

impl RecordOutcome {
    fn truncate_detail(detail: Option<String>) -> Option<String> {
        detail.map(|mut s| {
            if s.len() > ERROR_DETAIL_MAX_LEN {
                s.truncate(ERROR_DETAIL_MAX_LEN);
            }
            s
        })
    }
}

#[derive(Debug, Default, Clone, Copy, Deserialize, Serialize)]
pub struct CampaignStats {
    pub total: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub suppressed: i64,
    pub dry_run: i64,
}

#[derive(Debug, Clone)]
pub struct DeliveryRepo {
    pool: PgPool,
}

impl DeliveryRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the `queued` row for one pipeline run. Returns its id, used
    /// later to record the outcome.
    pub async fn begin_attempt(
        &self,
        campaign_id: &str,
        email: &str,
        template_id: &str,
        subject: &str,
        attempt_no: i32,
    ) -> Result<i64, Error> {
        let row = sqlx::query!(
            r#"
            INSERT INTO deliveries (campaign_id, email, template_id, subject, status, attempt_no)
            VALUES ($1, $2, $3, $4, 'queued', $5)
            RETURNING id
            "#,
            campaign_id,
            email,
            template_id,
            subject,
            attempt_no,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(row.id)
    }

    /// Move a `queued` attempt to a terminal (or `sent`) state. Rejected if
    /// the row is not currently `queued`.
    pub async fn record_result(
        &self,
        attempt_id: i64,
        outcome: RecordOutcome,
    ) -> Result<(), Error> {
        let detail = RecordOutcome::truncate_detail(outcome.error_detail);

        let result = sqlx::query!(
            r#"
            UPDATE deliveries
            SET status = $2,
                attempt_no = $3,
                provider_message_id = $4,
                http_status = $5,
                error_kind = $6,
                error_detail = $7,
                updated_at = now()
            WHERE id = $1 AND status = 'queued'
            "#,
            attempt_id,
            outcome.status as _,
            outcome.attempt_no,
            outcome.provider_message_id,
            outcome.http_status,
            outcome.error_kind as _,
            detail,
        )
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::Internal(format!(
                "attempt {attempt_id} was not in queued state"
            )));
        }

        Ok(())
    }

    /// Transition the row matching `provider_message_id` to `new_status`,
    /// driven by a verified webhook event. Idempotent: re-applying the same
    /// status is a no-op success, and a row already in `new_status` is left
    /// untouched. A missing row is logged but not an error — the provider
    /// may notify us before our own write lands, or about a message we
    /// never sent.
    pub async fn update_by_message_id(
        &self,
        provider_message_id: &str,
        new_status: DeliveryStatus,
        event_time: DateTime<Utc>,
    ) -> Result<bool, Error> {
        let result = sqlx::query!(
            r#"
            UPDATE deliveries
            SET status = $2, updated_at = $3
            WHERE provider_message_id = $1
              AND status = 'sent'
              AND status <> $2
            "#,
            provider_message_id,
            new_status as _,
            event_time,
        )
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let already = sqlx::query!(
            r#"
            SELECT 1 as "exists!" FROM deliveries
            WHERE provider_message_id = $1 AND status = $2
            "#,
            provider_message_id,
            new_status as _,
        )
        .fetch_optional(&self.pool)
        .await?;

        if already.is_some() {
            tracing::debug!(provider_message_id, ?new_status, "event already applied");
            return Ok(true);
        }

        tracing::warn!(provider_message_id, "no delivery row matches event");
        Ok(false)
    }

    pub async fn stats(&self, campaign_id: &str) -> Result<CampaignStats, Error> {
        let row = sqlx::query!(
            r#"
            SELECT
                count(*) AS "total!",
                count(*) FILTER (
                    WHERE status IN ('sent', 'delivered')
                ) AS "succeeded!",
                count(*) FILTER (
                    WHERE status IN ('failed', 'bounced', 'complained')
                ) AS "failed!",
                count(*) FILTER (WHERE status = 'suppressed') AS "suppressed!",
                count(*) FILTER (WHERE status = 'dry_run') AS "dry_run!"
            FROM deliveries
            WHERE campaign_id = $1
            "#,
            campaign_id,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(CampaignStats {
            total: row.total,
            succeeded: row.succeeded,
            failed: row.failed,
            suppressed: row.suppressed,
            dry_run: row.dry_run,
        })
    }

    pub async fn recent(&self, limit: i64) -> Result<Vec<DeliveryAttempt>, Error> {
        let rows = sqlx::query_as!(
            DeliveryAttempt,
            r#"
            SELECT
                id,
                campaign_id,
                email,
                template_id,
                subject,
                provider_message_id,
                status as "status: _",
                attempt_no,
                http_status,
                error_kind as "error_kind: _",
                error_detail,
                created_at,
                updated_at
            FROM deliveries
            ORDER BY created_at DESC
            LIMIT $1
            "#,
            limit,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Count deliveries stuck in `sent` past `older_than`: the provider
    /// accepted them but no webhook ever confirmed a terminal outcome.
    /// Used by the periodic operational task to surface aging sends; it
    /// does not mutate them; the provider's webhook remains the only
    /// source of truth for their terminal state.
    pub async fn count_stale_sent(&self, older_than: DateTime<Utc>) -> Result<i64, Error> {
        let row = sqlx::query!(
            r#"
            SELECT count(*) AS "count!" FROM deliveries
            WHERE status = 'sent' AND updated_at < $1
            "#,
            older_than,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(row.count)
    }

    pub async fn find_by_message_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<DeliveryAttempt>, Error> {
        let row = sqlx::query_as!(
            DeliveryAttempt,
            r#"
            SELECT
                id,
                campaign_id,
                email,
                template_id,
                subject,
                provider_message_id,
                status as "status: _",
                attempt_no,
                http_status,
                error_kind as "error_kind: _",
                error_detail,
                created_at,
                updated_at
            FROM deliveries
            WHERE provider_message_id = $1
            "#,
            provider_message_id,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[sqlx::test]
    async fn begin_then_record_result(pool: PgPool) {
        let repo = DeliveryRepo::new(pool);

        let id = repo
            .begin_attempt("camp-1", "a@x.io", "t1", "Hi", 1)
            .await
            .unwrap();

        repo.record_result(
            id,
            RecordOutcome {
                status: DeliveryStatus::Sent,
                attempt_no: 1,
                provider_message_id: Some("msg_1".to_owned()),
                http_status: Some(202),
                error_kind: None,
                error_detail: None,
            },
        )
        .await
        .unwrap();

        let attempt = repo.find_by_message_id("msg_1").await.unwrap().unwrap();
        assert_eq!(attempt.status, DeliveryStatus::Sent);
        assert_eq!(attempt.email, "a@x.io");
    }

    #[sqlx::test]
    async fn record_result_rejects_non_queued_row(pool: PgPool) {
        let repo = DeliveryRepo::new(pool);

        let id = repo
            .begin_attempt("camp-1", "a@x.io", "t1", "Hi", 1)
            .await
            .unwrap();

        let outcome = RecordOutcome {
            status: DeliveryStatus::Sent,
            attempt_no: 1,
            provider_message_id: Some("msg_2".to_owned()),
            http_status: Some(202),
            error_kind: None,
            error_detail: None,
        };

        repo.record_result(id, outcome.clone()).await.unwrap();

        let err = repo.record_result(id, outcome).await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[sqlx::test]
    async fn webhook_update_is_idempotent(pool: PgPool) {
        let repo = DeliveryRepo::new(pool);

        let id = repo
            .begin_attempt("camp-1", "a@x.io", "t1", "Hi", 1)
            .await
            .unwrap();
        repo.record_result(
            id,
            RecordOutcome {
                status: DeliveryStatus::Sent,
                attempt_no: 1,
                provider_message_id: Some("msg_42".to_owned()),
                http_status: Some(202),
                error_kind: None,
                error_detail: None,
            },
        )
        .await
        .unwrap();

        let now = Utc::now();
        let applied = repo
            .update_by_message_id("msg_42", DeliveryStatus::Delivered, now)
            .await
            .unwrap();
        assert!(applied);

        // Re-delivering the same event is a no-op, not an error, and the
        // status does not change or double-transition.
        let applied_again = repo
            .update_by_message_id("msg_42", DeliveryStatus::Delivered, now)
            .await
            .unwrap();
        assert!(applied_again);

        let attempt = repo.find_by_message_id("msg_42").await.unwrap().unwrap();
        assert_eq!(attempt.status, DeliveryStatus::Delivered);
    }

    #[sqlx::test]
    async fn update_by_message_id_with_no_match_is_not_an_error(pool: PgPool) {
        let repo = DeliveryRepo::new(pool);
        let applied = repo
            .update_by_message_id("msg_unknown", DeliveryStatus::Delivered, Utc::now())
            .await
            .unwrap();
        assert!(!applied);
    }

    #[sqlx::test]
    async fn counts_sent_deliveries_aging_without_a_webhook(pool: PgPool) {
        let repo = DeliveryRepo::new(pool);

        let id = repo
            .begin_attempt("camp-1", "a@x.io", "t1", "Hi", 1)
            .await
            .unwrap();
        repo.record_result(
            id,
            RecordOutcome {
                status: DeliveryStatus::Sent,
                attempt_no: 1,
                provider_message_id: Some("msg_stale".to_owned()),
                http_status: Some(202),
                error_kind: None,
                error_detail: None,
            },
        )
        .await
        .unwrap();

        assert_eq!(
            repo.count_stale_sent(Utc::now() - chrono::Duration::hours(1))
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            repo.count_stale_sent(Utc::now() + chrono::Duration::hours(1))
                .await
                .unwrap(),
            1
        );
    }
}
