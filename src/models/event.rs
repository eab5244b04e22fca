use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use super::{DeliveryRepo, DeliveryStatus, Error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, sqlx::Type)]
#[sqlx(type_name = "event_type", rename_all = "lowercase")]
pub enum EventType {
    Delivered,
    Bounced,
    Complained,
    Opened,
    Clicked,
    Other,
}

impl EventType {
    /// The `DeliveryStatus` a valid event of this type drives the matching
    /// delivery row towards, if any.
    pub fn delivery_transition(self) -> Option<DeliveryStatus> {
        match self {
            EventType::Delivered => Some(DeliveryStatus::Delivered),
            EventType::Bounced => Some(DeliveryStatus::Bounced),
            EventType::Complained => Some(DeliveryStatus::Complained),
            EventType::Opened | EventType::Clicked | EventType::Other => None,
        }
    }

    pub fn from_provider_type(raw: &str) -> Self {
        match raw {
            "email.delivered" => EventType::Delivered,
            "email.bounced" => EventType::Bounced,
            "email.complained" => EventType::Complained,
            "email.opened" => EventType::Opened,
            "email.clicked" => EventType::Clicked,
            _ => EventType::Other,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewEvent {
    pub provider: String,
    pub event_type: EventType,
    pub provider_message_id: Option<String>,
    pub recipient: Option<String>,
    pub payload_json: serde_json::Value,
    pub signature_valid: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, sqlx::FromRow)]
pub struct Event {
    pub id: i64,
    pub provider: String,
    pub event_type: EventType,
    pub provider_message_id: Option<String>,
    pub recipient: Option<String>,
    pub payload_json: serde_json::Value,
    pub signature_valid: bool,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EventRepo {
    pool: PgPool,
    deliveries: DeliveryRepo,
}

impl EventRepo {
    pub fn new(pool: PgPool) -> Self {
        let deliveries = DeliveryRepo::new(pool.clone());
        Self { pool, deliveries }
    }

    /// Stores an event as-is. The caller (the webhook handler) is
    /// responsible for bounding the raw body size before it ever reaches
    /// this point, via `DefaultBodyLimit` on the route.
    pub async fn save(&self, event: NewEvent) -> Result<Event, Error> {
        let payload = event.payload_json;

        let row = sqlx::query_as!(
            Event,
            r#"
            INSERT INTO events (provider, event_type, provider_message_id, recipient, payload_json, signature_valid)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING
                id,
                provider,
                event_type as "event_type: _",
                provider_message_id,
                recipient,
                payload_json,
                signature_valid,
                received_at
            "#,
            event.provider,
            event.event_type as _,
            event.provider_message_id,
            event.recipient,
            payload,
            event.signature_valid,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    /// Apply a saved event's effect on the matching delivery, iff its
    /// signature was valid and its type maps to a state transition.
    /// Unsigned or non-transitioning events are a no-op by construction,
    /// not by a caller-side check, so this can be called unconditionally.
    pub async fn link_to_delivery(&self, event: &Event) -> Result<bool, Error> {
        if !event.signature_valid {
            return Ok(false);
        }

        let Some(new_status) = event.event_type.delivery_transition() else {
            return Ok(false);
        };

        let Some(provider_message_id) = event.provider_message_id.as_deref() else {
            return Ok(false);
        };

        self.deliveries
            .update_by_message_id(provider_message_id, new_status, event.received_at)
            .await
    }

    pub async fn recent(&self, limit: i64) -> Result<Vec<Event>, Error> {
        let rows = sqlx::query_as!(
            Event,
            r#"
            SELECT
                id,
                provider,
                event_type as "event_type: _",
                provider_message_id,
                recipient,
                payload_json,
                signature_valid,
                received_at
            FROM events
            ORDER BY received_at DESC
            LIMIT $1
            "#,
            limit,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::{DeliveryStatus, RecordOutcome};

    fn event(event_type: EventType, signature_valid: bool, message_id: &str) -> NewEvent {
        NewEvent {
            provider: "resend".to_owned(),
            event_type,
            provider_message_id: Some(message_id.to_owned()),
            recipient: Some("a@x.io".to_owned()),
            payload_json: serde_json::json!({"type": "email.delivered"}),
            signature_valid,
        }
    }

    #[sqlx::test]
    async fn valid_event_transitions_delivery(pool: PgPool) {
        let deliveries = DeliveryRepo::new(pool.clone());
        let events = EventRepo::new(pool);

        let id = deliveries
            .begin_attempt("camp-1", "a@x.io", "t1", "Hi", 1)
            .await
            .unwrap();
        deliveries
            .record_result(
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

        let saved = events
            .save(event(EventType::Delivered, true, "msg_42"))
            .await
            .unwrap();

        let applied = events.link_to_delivery(&saved).await.unwrap();
        assert!(applied);

        let attempt = deliveries.find_by_message_id("msg_42").await.unwrap().unwrap();
        assert_eq!(attempt.status, DeliveryStatus::Delivered);
    }

    #[sqlx::test]
    async fn invalid_signature_never_mutates_delivery(pool: PgPool) {
        let deliveries = DeliveryRepo::new(pool.clone());
        let events = EventRepo::new(pool);

        let id = deliveries
            .begin_attempt("camp-1", "a@x.io", "t1", "Hi", 1)
            .await
            .unwrap();
        deliveries
            .record_result(
                id,
                RecordOutcome {
                    status: DeliveryStatus::Sent,
                    attempt_no: 1,
                    provider_message_id: Some("msg_99".to_owned()),
                    http_status: Some(202),
                    error_kind: None,
                    error_detail: None,
                },
            )
            .await
            .unwrap();

        let saved = events
            .save(event(EventType::Delivered, false, "msg_99"))
            .await
            .unwrap();
        assert!(!saved.signature_valid);

        let applied = events.link_to_delivery(&saved).await.unwrap();
        assert!(!applied);

        let attempt = deliveries.find_by_message_id("msg_99").await.unwrap().unwrap();
        assert_eq!(attempt.status, DeliveryStatus::Sent);
    }
}
