use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
};
use tracing::{info, warn};

use crate::models::{EventType, NewEvent, SuppressionKind, SuppressionStore};

use super::{ApiState, error::ApiError, signature};

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name)?.to_str().ok()
}

/// `data.to` is `string|[string]`; take the bare string, or the first
/// element when the provider sends an array of recipients.
fn extract_recipient(value: &serde_json::Value) -> Option<String> {
    let to = value.pointer("/data/to")?;
    to.as_str()
        .or_else(|| to.get(0).and_then(|v| v.as_str()))
        .map(str::to_owned)
}

/// `POST /resend/webhook`. Verifies the Svix-style signature, persists the
/// event unconditionally (so an invalid signature is still auditable), and
/// only lets a *valid* event mutate delivery state or the suppression list.
pub async fn receive(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let signature_valid = match &state.webhook.secret {
        Some(secret) => {
            let id = header(&headers, "svix-id").unwrap_or("");
            let timestamp = header(&headers, "svix-timestamp").unwrap_or("");
            let sig = header(&headers, "svix-signature").unwrap_or("");
            signature::verify(
                secret,
                id,
                timestamp,
                sig,
                &body,
                state.webhook.replay_window_seconds,
                chrono::Utc::now(),
            )
        }
        None => false,
    };

    let value: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "could not parse webhook body as JSON");
            return Ok(StatusCode::BAD_REQUEST);
        }
    };

    let event_type_raw = value.get("type").and_then(|v| v.as_str()).unwrap_or("");
    let event_type = EventType::from_provider_type(event_type_raw);
    let provider_message_id = value
        .pointer("/data/email_id")
        .and_then(|v| v.as_str())
        .map(str::to_owned);
    let recipient = extract_recipient(&value);

    let event = state
        .events
        .save(NewEvent {
            provider: "resend".to_owned(),
            event_type,
            provider_message_id,
            recipient: recipient.clone(),
            payload_json: value,
            signature_valid,
        })
        .await?;

    if !signature_valid {
        return Ok(StatusCode::UNAUTHORIZED);
    }

    state.events.link_to_delivery(&event).await?;
    apply_suppression_side_effect(&state.suppressions, event_type, recipient.as_deref()).await;

    info!(event_type = ?event_type, provider_message_id = ?event.provider_message_id, "webhook event processed");
    Ok(StatusCode::OK)
}

async fn apply_suppression_side_effect(
    suppressions: &SuppressionStore,
    event_type: EventType,
    recipient: Option<&str>,
) {
    let Some(recipient) = recipient else { return };

    let kind = match event_type {
        EventType::Bounced => SuppressionKind::Bounce,
        EventType::Complained => SuppressionKind::Complaint,
        _ => return,
    };

    if let Err(e) = suppressions.add(recipient, kind, None).await {
        warn!(recipient, error = %e, "failed to record suppression from webhook event");
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn extracts_recipient_from_a_bare_string() {
        let value = serde_json::json!({"data": {"to": "a@x.io"}});
        assert_eq!(extract_recipient(&value).as_deref(), Some("a@x.io"));
    }

    #[test]
    fn extracts_recipient_from_an_array() {
        let value = serde_json::json!({"data": {"to": ["a@x.io", "b@x.io"]}});
        assert_eq!(extract_recipient(&value).as_deref(), Some("a@x.io"));
    }

    #[test]
    fn returns_none_when_to_is_missing() {
        let value = serde_json::json!({"data": {}});
        assert_eq!(extract_recipient(&value), None);
    }
}
