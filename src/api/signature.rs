use aws_lc_rs::hmac;
use base64ct::{Base64, Encoding};
use chrono::{DateTime, Utc};

/// Verifies a Svix-style webhook signature: HMAC-SHA256 over
/// `{id}.{timestamp}.{body}`, keyed by the shared secret, with the
/// timestamp rejected outside the configured replay window. `header`
/// may carry more than one space-separated `v1,<base64>` signature;
/// any one matching is sufficient.
pub fn verify(
    secret: &str,
    id: &str,
    timestamp: &str,
    signature_header: &str,
    body: &[u8],
    replay_window_seconds: i64,
    now: DateTime<Utc>,
) -> bool {
    let Ok(event_time) = timestamp.parse::<i64>() else {
        return false;
    };
    let Some(event_time) = DateTime::from_timestamp(event_time, 0) else {
        return false;
    };

    if (now - event_time).num_seconds().abs() > replay_window_seconds {
        return false;
    }

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    let mut signed_content = Vec::with_capacity(id.len() + timestamp.len() + body.len() + 2);
    signed_content.extend_from_slice(id.as_bytes());
    signed_content.push(b'.');
    signed_content.extend_from_slice(timestamp.as_bytes());
    signed_content.push(b'.');
    signed_content.extend_from_slice(body);

    signature_header.split_whitespace().any(|candidate| {
        let Some(("v1", encoded)) = candidate.split_once(',') else {
            return false;
        };
        let Ok(provided) = Base64::decode_vec(encoded) else {
            return false;
        };
        hmac::verify(&key, &signed_content, &provided).is_ok()
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn sign(secret: &str, id: &str, timestamp: &str, body: &[u8]) -> String {
        let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
        let mut signed_content = Vec::new();
        signed_content.extend_from_slice(id.as_bytes());
        signed_content.push(b'.');
        signed_content.extend_from_slice(timestamp.as_bytes());
        signed_content.push(b'.');
        signed_content.extend_from_slice(body);
        let tag = hmac::sign(&key, &signed_content);
        format!("v1,{}", Base64::encode_string(tag.as_ref()))
    }

    #[test]
    fn accepts_a_correctly_signed_recent_event() {
        let now = Utc::now();
        let timestamp = now.timestamp().to_string();
        let body = br#"{"type":"email.delivered"}"#;
        let header = sign("whsec_test", "msg_1", &timestamp, body);

        assert!(verify("whsec_test", "msg_1", &timestamp, &header, body, 300, now));
    }

    #[test]
    fn rejects_a_tampered_body() {
        let now = Utc::now();
        let timestamp = now.timestamp().to_string();
        let header = sign("whsec_test", "msg_1", &timestamp, b"original");

        assert!(!verify(
            "whsec_test",
            "msg_1",
            &timestamp,
            &header,
            b"tampered",
            300,
            now
        ));
    }

    #[test]
    fn rejects_an_expired_timestamp() {
        let now = Utc::now();
        let old = now - chrono::Duration::seconds(600);
        let timestamp = old.timestamp().to_string();
        let body = b"hello";
        let header = sign("whsec_test", "msg_1", &timestamp, body);

        assert!(!verify("whsec_test", "msg_1", &timestamp, &header, body, 300, now));
    }

    #[test]
    fn rejects_the_wrong_secret() {
        let now = Utc::now();
        let timestamp = now.timestamp().to_string();
        let body = b"hello";
        let header = sign("whsec_right", "msg_1", &timestamp, body);

        assert!(!verify("whsec_wrong", "msg_1", &timestamp, &header, body, 300, now));
    }
}
