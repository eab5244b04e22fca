mod mock;
mod resend;

pub use mock::MockProviderClient;
pub use resend::ResendClient;

use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct SendRequest {
    pub from_addr: String,
    pub to_addr: String,
    pub subject: String,
    pub html: String,
    pub text: String,
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone)]
pub enum SendResult {
    Accepted {
        provider_message_id: String,
        http_status: u16,
    },
    TransientFailure {
        http_status: Option<u16>,
        retry_after_seconds: Option<u64>,
        detail: String,
    },
    PermanentFailure {
        http_status: Option<u16>,
        detail: String,
    },
}

/// Thin wrapper over the provider's send API. Implementations never retry
/// internally — that is the retry controller's job — and never block past
/// their own internal timeout.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn send(&self, request: SendRequest) -> SendResult;
}
