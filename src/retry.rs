use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::{
    config::RetryConfig,
    models::ErrorKind,
    provider::{ProviderClient, SendRequest, SendResult},
};

#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Accepted {
        provider_message_id: String,
        http_status: u16,
        attempt_no: u32,
    },
    Failed {
        error_kind: ErrorKind,
        http_status: Option<u16>,
        detail: String,
        attempt_no: u32,
    },
    Cancelled {
        attempt_no: u32,
    },
}

fn classify_transient(http_status: Option<u16>) -> ErrorKind {
    match http_status {
        Some(429) => ErrorKind::RateLimited,
        Some(status) if (500..600).contains(&status) => ErrorKind::Provider5xx,
        _ => ErrorKind::Network,
    }
}

/// Classifies errors, computes jittered exponential backoff, and enforces
/// `max_attempts`. Never retries a `PermanentFailure`; a cancellation
/// signal during a sleep aborts the whole run rather than continuing.
pub struct RetryController {
    config: RetryConfig,
}

impl RetryController {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    fn delay(&self, attempt: u32, retry_after_seconds: Option<u64>) -> Duration {
        let exp = self.config.base_seconds * 2f64.powi(attempt as i32 - 1);
        let capped = exp.min(self.config.max_seconds);
        let jitter = rand::rng().random_range(0.8..=1.2);
        let jittered = capped * jitter;

        let seconds = match retry_after_seconds {
            Some(retry_after) => jittered.max(retry_after as f64).max(30.0),
            None => jittered,
        };

        Duration::from_secs_f64(seconds.max(0.0))
    }

    /// Runs `send` up to `max_attempts` times, sleeping between transient
    /// failures. `attempt_no` in the returned outcome reflects the last try
    /// made, matching `DeliveryAttempt.attempt_no`.
    pub async fn run<P: ProviderClient + ?Sized>(
        &self,
        provider: &P,
        request: SendRequest,
        cancel: &CancellationToken,
    ) -> AttemptOutcome {
        let mut attempt_no: u32 = 0;

        loop {
            attempt_no += 1;

            if cancel.is_cancelled() {
                return AttemptOutcome::Cancelled { attempt_no };
            }

            match provider.send(request.clone()).await {
                SendResult::Accepted {
                    provider_message_id,
                    http_status,
                } => {
                    return AttemptOutcome::Accepted {
                        provider_message_id,
                        http_status,
                        attempt_no,
                    };
                }
                SendResult::PermanentFailure {
                    http_status,
                    detail,
                } => {
                    return AttemptOutcome::Failed {
                        error_kind: ErrorKind::Provider4xx,
                        http_status,
                        detail,
                        attempt_no,
                    };
                }
                SendResult::TransientFailure {
                    http_status,
                    retry_after_seconds,
                    detail,
                } => {
                    let error_kind = classify_transient(http_status);

                    if attempt_no >= self.config.max_attempts {
                        return AttemptOutcome::Failed {
                            error_kind,
                            http_status,
                            detail,
                            attempt_no,
                        };
                    }

                    let sleep = self.delay(attempt_no, retry_after_seconds);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            return AttemptOutcome::Cancelled { attempt_no };
                        }
                        _ = tokio::time::sleep(sleep) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::provider::MockProviderClient;

    fn request() -> SendRequest {
        SendRequest {
            from_addr: "sender@example.com".to_owned(),
            to_addr: "a@x.io".to_owned(),
            subject: "Hi".to_owned(),
            html: "<p>hi</p>".to_owned(),
            text: "hi".to_owned(),
            reply_to: None,
        }
    }

    fn config() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_seconds: 0.001,
            max_seconds: 0.01,
        }
    }

    #[tokio::test]
    async fn succeeds_on_first_try() {
        let provider = MockProviderClient::always_accept();
        let controller = RetryController::new(config());
        let cancel = CancellationToken::new();

        let outcome = controller.run(&provider, request(), &cancel).await;
        assert!(matches!(outcome, AttemptOutcome::Accepted { attempt_no: 1, .. }));
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let provider = MockProviderClient::new(vec![SendResult::TransientFailure {
            http_status: Some(503),
            retry_after_seconds: None,
            detail: "unavailable".to_owned(),
        }]);
        let controller = RetryController::new(config());
        let cancel = CancellationToken::new();

        let outcome = controller.run(&provider, request(), &cancel).await;
        assert!(matches!(outcome, AttemptOutcome::Accepted { attempt_no: 2, .. }));
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn never_retries_permanent_failure() {
        let provider = MockProviderClient::new(vec![SendResult::PermanentFailure {
            http_status: Some(422),
            detail: "bad address".to_owned(),
        }]);
        let controller = RetryController::new(config());
        let cancel = CancellationToken::new();

        let outcome = controller.run(&provider, request(), &cancel).await;
        assert!(matches!(
            outcome,
            AttemptOutcome::Failed {
                error_kind: ErrorKind::Provider4xx,
                attempt_no: 1,
                ..
            }
        ));
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn stops_after_max_attempts() {
        let provider = MockProviderClient::new(vec![
            SendResult::TransientFailure {
                http_status: Some(503),
                retry_after_seconds: None,
                detail: "unavailable".to_owned(),
            },
            SendResult::TransientFailure {
                http_status: Some(503),
                retry_after_seconds: None,
                detail: "unavailable".to_owned(),
            },
            SendResult::TransientFailure {
                http_status: Some(503),
                retry_after_seconds: None,
                detail: "unavailable".to_owned(),
            },
        ]);
        let controller = RetryController::new(config());
        let cancel = CancellationToken::new();

        let outcome = controller.run(&provider, request(), &cancel).await;
        assert!(matches!(
            outcome,
            AttemptOutcome::Failed { attempt_no: 3, .. }
        ));
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn cancellation_during_sleep_aborts_the_run() {
        let provider = MockProviderClient::new(vec![SendResult::TransientFailure {
            http_status: Some(503),
            retry_after_seconds: None,
            detail: "unavailable".to_owned(),
        }]);
        let controller = RetryController::new(RetryConfig {
            max_attempts: 5,
            base_seconds: 60.0,
            max_seconds: 60.0,
        });
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = controller.run(&provider, request(), &cancel).await;
        assert!(matches!(outcome, AttemptOutcome::Cancelled { attempt_no: 1 }));
        assert_eq!(provider.call_count(), 1);
    }
}
