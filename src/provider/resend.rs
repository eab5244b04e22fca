use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ProviderClient, SendRequest, SendResult};

const SEND_TIMEOUT: Duration = Duration::from_secs(30);
const BASE_URL: &str = "https://api.resend.com";

#[derive(Debug, Serialize)]
struct ResendSendBody<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    html: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ResendAccepted {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ResendErrorBody {
    #[serde(default)]
    message: String,
}

/// Production `ProviderClient`, a thin wrapper over `POST /emails` on the
/// Resend HTTP API. Never retries; classifies the response into the three
/// `SendResult` variants and lets the caller's `RetryController` decide
/// what to do next.
pub struct ResendClient {
    http: reqwest::Client,
    api_key: String,
}

impl ResendClient {
    pub fn new(api_key: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        Self { http, api_key }
    }
}

#[async_trait]
impl ProviderClient for ResendClient {
    async fn send(&self, request: SendRequest) -> SendResult {
        let body = ResendSendBody {
            from: &request.from_addr,
            to: &request.to_addr,
            subject: &request.subject,
            html: &request.html,
            text: &request.text,
            reply_to: request.reply_to.as_deref(),
        };

        let response = match self
            .http
            .post(format!("{BASE_URL}/emails"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_timeout() || e.is_connect() => {
                warn!("network error calling Resend: {e}");
                return SendResult::TransientFailure {
                    http_status: None,
                    retry_after_seconds: None,
                    detail: e.to_string(),
                };
            }
            Err(e) => {
                warn!("request error calling Resend: {e}");
                return SendResult::TransientFailure {
                    http_status: None,
                    retry_after_seconds: None,
                    detail: e.to_string(),
                };
            }
        };

        let status = response.status();

        if status.is_success() {
            return match response.json::<ResendAccepted>().await {
                Ok(accepted) => {
                    debug!(provider_message_id = accepted.id, "send accepted");
                    SendResult::Accepted {
                        provider_message_id: accepted.id,
                        http_status: status.as_u16(),
                    }
                }
                Err(e) => SendResult::TransientFailure {
                    http_status: Some(status.as_u16()),
                    retry_after_seconds: None,
                    detail: format!("could not parse success response: {e}"),
                },
            };
        }

        let retry_after_seconds = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let detail = response
            .json::<ResendErrorBody>()
            .await
            .map(|b| b.message)
            .unwrap_or_else(|_| status.canonical_reason().unwrap_or("unknown error").to_owned());

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            SendResult::TransientFailure {
                http_status: Some(status.as_u16()),
                retry_after_seconds,
                detail,
            }
        } else {
            SendResult::PermanentFailure {
                http_status: Some(status.as_u16()),
                detail,
            }
        }
    }
}
