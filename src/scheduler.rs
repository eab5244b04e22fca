use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::{sync::mpsc, sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

use crate::{
    models::{CampaignStats, DeliveryRepo, DeliveryStatus, ErrorKind, QuotaStore, RecordOutcome, SuppressionStore},
    provider::{ProviderClient, SendRequest},
    rate_limiter::{AcquireOutcome, RateLimiter},
    recipient::Recipient,
    render::Renderer,
    retry::{AttemptOutcome, RetryController},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CampaignOptions {
    pub concurrency: usize,
    pub dry_run: bool,
}

impl CampaignOptions {
    const MIN_CONCURRENCY: usize = 1;
    const MAX_CONCURRENCY: usize = 1000;

    pub fn new(concurrency: usize, dry_run: bool) -> Self {
        Self {
            concurrency: concurrency.clamp(Self::MIN_CONCURRENCY, Self::MAX_CONCURRENCY),
            dry_run,
        }
    }
}

pub struct CampaignRequest {
    pub campaign_id: String,
    pub template_id: String,
    pub subject_override: Option<String>,
    pub from_addr: String,
    pub recipients: Box<dyn Iterator<Item = Recipient> + Send>,
    pub options: CampaignOptions,
}

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    AttemptCompleted {
        email: String,
        status: DeliveryStatus,
    },
    Finished {
        stats: CampaignStats,
    },
    Cancelled {
        stats: CampaignStats,
    },
    QuotaExhausted {
        stats: CampaignStats,
    },
    Errored {
        stats: CampaignStats,
    },
}

/// Orchestrates one campaign end to end: a bounded pool of workers pulls
/// recipients from the source, each running the full per-recipient
/// pipeline (suppression check, quota reservation, rate limiting,
/// rendering, send-with-retry, persistence) independently. Mirrors the
/// accept-loop-plus-spawned-task shape used for connection handling
/// elsewhere in this crate, gated by a semaphore instead of relying on
/// the accept source itself to bound concurrency.
#[derive(Clone)]
pub struct Scheduler {
    deliveries: DeliveryRepo,
    suppressions: SuppressionStore,
    quota: QuotaStore,
    rate_limiter: Arc<RateLimiter>,
    retry: Arc<RetryController>,
    provider: Arc<dyn ProviderClient>,
    renderer: Arc<dyn Renderer>,
}

impl Scheduler {
    pub fn new(
        deliveries: DeliveryRepo,
        suppressions: SuppressionStore,
        quota: QuotaStore,
        rate_limiter: Arc<RateLimiter>,
        retry: Arc<RetryController>,
        provider: Arc<dyn ProviderClient>,
        renderer: Arc<dyn Renderer>,
    ) -> Self {
        Self {
            deliveries,
            suppressions,
            quota,
            rate_limiter,
            retry,
            provider,
            renderer,
        }
    }

    pub async fn run(
        &self,
        request: CampaignRequest,
        cancel: CancellationToken,
        progress: mpsc::UnboundedSender<ProgressEvent>,
    ) -> CampaignStats {
        let CampaignRequest {
            campaign_id,
            template_id,
            subject_override,
            from_addr,
            mut recipients,
            options,
        } = request;

        let semaphore = Arc::new(Semaphore::new(options.concurrency));
        let quota_exhausted = Arc::new(AtomicBool::new(false));
        let had_error = Arc::new(AtomicBool::new(false));
        let mut workers = JoinSet::new();

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if quota_exhausted.load(Ordering::Relaxed) {
                drain_quota_exhausted(
                    &self.deliveries,
                    &campaign_id,
                    &template_id,
                    subject_override.as_deref(),
                    &mut recipients,
                    &progress,
                )
                .await;
                break;
            }

            let Some(recipient) = recipients.next() else {
                break;
            };

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => permit.expect("semaphore is never closed"),
            };

            let ctx = WorkerContext {
                campaign_id: campaign_id.clone(),
                template_id: template_id.clone(),
                subject_override: subject_override.clone(),
                from_addr: from_addr.clone(),
                dry_run: options.dry_run,
                deliveries: self.deliveries.clone(),
                suppressions: self.suppressions.clone(),
                quota: self.quota.clone(),
                rate_limiter: self.rate_limiter.clone(),
                retry: self.retry.clone(),
                provider: self.provider.clone(),
                renderer: self.renderer.clone(),
                quota_exhausted: quota_exhausted.clone(),
                had_error: had_error.clone(),
                cancel: cancel.clone(),
                progress: progress.clone(),
            };

            let email = recipient.email.clone();
            let span = info_span!("campaign_attempt", campaign_id = %ctx.campaign_id, email = %email);
            workers.spawn(async move {
                let _permit = permit;
                process_recipient(ctx, recipient).await;
            }.instrument(span));
        }

        while workers.join_next().await.is_some() {}

        let stats = self
            .deliveries
            .stats(&campaign_id)
            .await
            .unwrap_or_default();

        let event = if cancel.is_cancelled() {
            info!(campaign_id, ?stats, "campaign cancelled");
            ProgressEvent::Cancelled { stats }
        } else if quota_exhausted.load(Ordering::Relaxed) {
            info!(campaign_id, ?stats, "campaign halted: quota exhausted");
            ProgressEvent::QuotaExhausted { stats }
        } else if had_error.load(Ordering::Relaxed) {
            info!(campaign_id, ?stats, "campaign errored");
            ProgressEvent::Errored { stats }
        } else {
            info!(campaign_id, ?stats, "campaign finished");
            ProgressEvent::Finished { stats }
        };
        let _ = progress.send(event);

        stats
    }
}

/// Marks every recipient the source had not yet yielded as `failed` with
/// `error_kind=quota_exhausted`, so P1 (`succeeded + failed + suppressed +
/// dry_run = total`) holds even when the source outruns `concurrency`.
async fn drain_quota_exhausted(
    deliveries: &DeliveryRepo,
    campaign_id: &str,
    template_id: &str,
    subject_override: Option<&str>,
    recipients: &mut dyn Iterator<Item = Recipient>,
    progress: &mpsc::UnboundedSender<ProgressEvent>,
) {
    for recipient in recipients {
        let attempt_id = match deliveries
            .begin_attempt(
                campaign_id,
                &recipient.email,
                template_id,
                subject_override.unwrap_or(""),
                1,
            )
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(email = %recipient.email, error = %e, "failed to create delivery attempt row while draining");
                continue;
            }
        };

        let outcome = RecordOutcome {
            status: DeliveryStatus::Failed,
            attempt_no: 1,
            provider_message_id: None,
            http_status: None,
            error_kind: Some(ErrorKind::QuotaExhausted),
            error_detail: Some("daily quota exhausted".to_owned()),
        };

        if let Err(e) = deliveries.record_result(attempt_id, outcome).await {
            warn!(email = %recipient.email, error = %e, "failed to record drained delivery outcome");
        }

        let _ = progress.send(ProgressEvent::AttemptCompleted {
            email: recipient.email,
            status: DeliveryStatus::Failed,
        });
    }
}

struct WorkerContext {
    campaign_id: String,
    template_id: String,
    subject_override: Option<String>,
    from_addr: String,
    dry_run: bool,
    deliveries: DeliveryRepo,
    suppressions: SuppressionStore,
    quota: QuotaStore,
    rate_limiter: Arc<RateLimiter>,
    retry: Arc<RetryController>,
    provider: Arc<dyn ProviderClient>,
    renderer: Arc<dyn Renderer>,
    quota_exhausted: Arc<AtomicBool>,
    had_error: Arc<AtomicBool>,
    cancel: CancellationToken,
    progress: mpsc::UnboundedSender<ProgressEvent>,
}

async fn process_recipient(ctx: WorkerContext, recipient: Recipient) {
    let attempt_id = match ctx
        .deliveries
        .begin_attempt(
            &ctx.campaign_id,
            &recipient.email,
            &ctx.template_id,
            ctx.subject_override.as_deref().unwrap_or(""),
            1,
        )
        .await
    {
        Ok(id) => id,
        Err(e) => {
            ctx.had_error.store(true, Ordering::Relaxed);
            warn!(email = %recipient.email, error = %e, "failed to create delivery attempt row");
            return;
        }
    };

    let outcome = run_pipeline(&ctx, &recipient).await;
    report(&ctx, attempt_id, &recipient.email, outcome).await;
}

async fn run_pipeline(ctx: &WorkerContext, recipient: &Recipient) -> RecordOutcome {
    if ctx.suppressions.is_suppressed(&recipient.email) {
        return RecordOutcome {
            status: DeliveryStatus::Suppressed,
            attempt_no: 1,
            provider_message_id: None,
            http_status: None,
            error_kind: None,
            error_detail: None,
        };
    }

    if ctx.dry_run {
        return match ctx
            .renderer
            .render(&ctx.template_id, ctx.subject_override.as_deref(), &recipient.vars)
        {
            Ok(_) => RecordOutcome {
                status: DeliveryStatus::DryRun,
                attempt_no: 1,
                provider_message_id: None,
                http_status: None,
                error_kind: None,
                error_detail: None,
            },
            Err(e) => RecordOutcome {
                status: DeliveryStatus::Failed,
                attempt_no: 1,
                provider_message_id: None,
                http_status: None,
                error_kind: Some(ErrorKind::Render),
                error_detail: Some(e.to_string()),
            },
        };
    }

    match ctx.quota.try_reserve(1).await {
        Ok(true) => {}
        Ok(false) => {
            ctx.quota_exhausted.store(true, Ordering::Relaxed);
            return RecordOutcome {
                status: DeliveryStatus::Failed,
                attempt_no: 1,
                provider_message_id: None,
                http_status: None,
                error_kind: Some(ErrorKind::QuotaExhausted),
                error_detail: Some("daily quota exhausted".to_owned()),
            };
        }
        Err(e) => {
            ctx.had_error.store(true, Ordering::Relaxed);
            return RecordOutcome {
                status: DeliveryStatus::Failed,
                attempt_no: 1,
                provider_message_id: None,
                http_status: None,
                error_kind: Some(ErrorKind::Storage),
                error_detail: Some(e.to_string()),
            };
        }
    }

    if ctx.rate_limiter.acquire(&ctx.cancel).await == AcquireOutcome::Cancelled {
        return RecordOutcome {
            status: DeliveryStatus::Failed,
            attempt_no: 1,
            provider_message_id: None,
            http_status: None,
            error_kind: Some(ErrorKind::Cancelled),
            error_detail: Some("cancelled while waiting for a rate-limit token".to_owned()),
        };
    }

    let rendered = match ctx
        .renderer
        .render(&ctx.template_id, ctx.subject_override.as_deref(), &recipient.vars)
    {
        Ok(rendered) => rendered,
        Err(e) => {
            return RecordOutcome {
                status: DeliveryStatus::Failed,
                attempt_no: 1,
                provider_message_id: None,
                http_status: None,
                error_kind: Some(ErrorKind::Render),
                error_detail: Some(e.to_string()),
            };
        }
    };

    let request = SendRequest {
        from_addr: ctx.from_addr.clone(),
        to_addr: recipient.email.clone(),
        subject: rendered.subject,
        html: rendered.html,
        text: rendered.text,
        reply_to: None,
    };

    match ctx.retry.run(ctx.provider.as_ref(), request, &ctx.cancel).await {
        AttemptOutcome::Accepted {
            provider_message_id,
            http_status,
            attempt_no,
        } => RecordOutcome {
            status: DeliveryStatus::Sent,
            attempt_no: attempt_no as i32,
            provider_message_id: Some(provider_message_id),
            http_status: Some(http_status as i32),
            error_kind: None,
            error_detail: None,
        },
        AttemptOutcome::Failed {
            error_kind,
            http_status,
            detail,
            attempt_no,
        } => RecordOutcome {
            status: DeliveryStatus::Failed,
            attempt_no: attempt_no as i32,
            provider_message_id: None,
            http_status: http_status.map(|s| s as i32),
            error_kind: Some(error_kind),
            error_detail: Some(detail),
        },
        AttemptOutcome::Cancelled { attempt_no } => RecordOutcome {
            status: DeliveryStatus::Failed,
            attempt_no: attempt_no as i32,
            provider_message_id: None,
            http_status: None,
            error_kind: Some(ErrorKind::Cancelled),
            error_detail: Some("cancelled before a terminal provider response".to_owned()),
        },
    }
}

async fn report(ctx: &WorkerContext, attempt_id: i64, email: &str, outcome: RecordOutcome) {
    let status = outcome.status;

    if let Err(e) = ctx.deliveries.record_result(attempt_id, outcome).await {
        ctx.had_error.store(true, Ordering::Relaxed);
        warn!(email, error = %e, "failed to record delivery outcome");
    }

    let _ = ctx.progress.send(ProgressEvent::AttemptCompleted {
        email: email.to_owned(),
        status,
    });
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;

    use crate::{
        config::RetryConfig,
        provider::MockProviderClient,
        render::{InMemoryRenderer, Template},
    };

    fn renderer() -> Arc<InMemoryRenderer> {
        Arc::new(InMemoryRenderer::new().with_template(
            "t1",
            Template {
                subject: "Hi".to_owned(),
                html: "<p>hi</p>".to_owned(),
                text: "hi".to_owned(),
            },
        ))
    }

    fn recipient(email: &str) -> Recipient {
        Recipient::new(email.to_owned(), None, HashMap::new()).unwrap()
    }

    /// S4: daily limit 2, prior used 1, 3 recipients. One attempt succeeds,
    /// the other two — one discovered mid-pipeline, one never pulled from
    /// the source — fail with `quota_exhausted`, and the campaign's final
    /// reason reflects that rather than `finished`.
    #[sqlx::test]
    async fn quota_exhaustion_marks_unprocessed_recipients_failed(pool: sqlx::PgPool) {
        let deliveries = DeliveryRepo::new(pool.clone());
        let suppressions = SuppressionStore::new(pool.clone());
        suppressions.warm_cache().await.unwrap();
        let quota = QuotaStore::new(pool.clone(), 2);
        assert!(quota.try_reserve(1).await.unwrap());

        let scheduler = Scheduler::new(
            deliveries.clone(),
            suppressions,
            quota,
            Arc::new(RateLimiter::new(6000)),
            Arc::new(RetryController::new(RetryConfig {
                max_attempts: 1,
                base_seconds: 0.01,
                max_seconds: 0.01,
            })),
            Arc::new(MockProviderClient::always_accept()),
            renderer(),
        );

        let recipients: Vec<Recipient> = vec![
            recipient("a@x.io"),
            recipient("b@x.io"),
            recipient("c@x.io"),
        ];
        let request = CampaignRequest {
            campaign_id: "camp-s4".to_owned(),
            template_id: "t1".to_owned(),
            subject_override: None,
            from_addr: "sender@example.com".to_owned(),
            recipients: Box::new(recipients.into_iter()),
            options: CampaignOptions::new(1, false),
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let stats = scheduler
            .run(request, CancellationToken::new(), tx)
            .await;

        assert_eq!(stats.total, 3);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 2);

        let mut saw_quota_exhausted = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, ProgressEvent::QuotaExhausted { .. }) {
                saw_quota_exhausted = true;
            }
        }
        assert!(saw_quota_exhausted);
    }
}
