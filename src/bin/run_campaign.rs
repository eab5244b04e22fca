use std::{collections::HashMap, path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::Context;
use bulk_mailer::{
    config::Config,
    models::{DeliveryRepo, QuotaStore, SuppressionStore},
    preflight::Preflight,
    provider::ResendClient,
    rate_limiter::RateLimiter,
    recipient::Recipient,
    render::InMemoryRenderer,
    retry::RetryController,
    scheduler::{CampaignOptions, CampaignRequest, ProgressEvent, Scheduler},
};
use sqlx::{
    ConnectOptions,
    postgres::{PgConnectOptions, PgPoolOptions},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

struct Args {
    recipients_path: PathBuf,
    template_id: String,
    subject: Option<String>,
    dry_run: bool,
    concurrency: Option<usize>,
    campaign_id: Option<String>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut positional = Vec::new();
    let mut subject = None;
    let mut dry_run = false;
    let mut concurrency = None;
    let mut campaign_id = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--subject" => subject = args.next(),
            "--dry-run" => dry_run = true,
            "--concurrency" => {
                concurrency = args
                    .next()
                    .and_then(|v| v.parse().ok())
                    .context("--concurrency requires an integer value")?
                    .into();
            }
            "--campaign-id" => campaign_id = args.next(),
            other => positional.push(other.to_owned()),
        }
    }

    anyhow::ensure!(
        positional.len() == 2,
        "usage: run_campaign <recipients_path> <template_id> [--subject S] [--dry-run] [--concurrency N] [--campaign-id ID]"
    );

    Ok(Args {
        recipients_path: PathBuf::from(&positional[0]),
        template_id: positional[1].clone(),
        subject,
        dry_run,
        concurrency,
        campaign_id,
    })
}

/// One recipient per line, each a JSON object `{"email", "name"?, "vars"?}`.
/// The real CSV/XLSX importer is an external collaborator; this is the
/// minimal built-in source needed to drive the binary end to end.
fn load_recipients(path: &std::path::Path) -> anyhow::Result<Vec<Recipient>> {
    #[derive(serde::Deserialize)]
    struct RecipientRecord {
        email: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        vars: HashMap<String, String>,
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read recipients file {}", path.display()))?;

    let mut recipients = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record: RecipientRecord = serde_json::from_str(line)
            .with_context(|| format!("malformed recipient on line {}", lineno + 1))?;
        let recipient = Recipient::new(record.email, record.name, record.vars)
            .map_err(|e| anyhow::anyhow!("invalid recipient on line {}: {e}", lineno + 1))?;
        recipients.push(recipient);
    }

    Ok(recipients)
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    bulk_mailer::init_tracing();

    match run().await {
        Ok(code) => code,
        Err(e) => {
            error!("run_campaign failed: {e:?}");
            ExitCode::from(3)
        }
    }
}

async fn run() -> anyhow::Result<ExitCode> {
    let args = parse_args()?;

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {e}");
            return Ok(ExitCode::from(2));
        }
    };

    let db_options = PgConnectOptions::from_url(&config.database_url.parse()?)?
        .application_name("bulk-mailer-run-campaign");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect_with(db_options)
        .await
        .context("failed to connect to database")?;

    #[cfg(feature = "apply-db-migrations")]
    sqlx::migrate!("./migrations").run(&pool).await?;

    let deliveries = DeliveryRepo::new(pool.clone());
    let suppressions = SuppressionStore::new(pool.clone());
    suppressions.warm_cache().await?;
    let quota = QuotaStore::new(pool.clone(), config.limits.daily);

    // The real templating engine is an external collaborator; this
    // standalone binary exercises the pipeline against an in-memory
    // renderer that renders any recipient.vars into the requested
    // template's exact text, since templates here are loaded by the
    // operator rather than fetched from a template store.
    let renderer: Arc<InMemoryRenderer> = Arc::new(InMemoryRenderer::new().with_template(
        &args.template_id,
        bulk_mailer::render::Template {
            subject: args.subject.clone().unwrap_or_default(),
            html: String::new(),
            text: String::new(),
        },
    ));

    let preflight = Preflight::new(&config, renderer.as_ref(), &quota);
    let report = preflight
        .check(&args.template_id, Some(&args.recipients_path), false)
        .await;

    if !report.ok() {
        for error in &report.errors {
            error!("preflight: {error}");
        }
        return Ok(ExitCode::from(2));
    }
    for warning in &report.warnings {
        tracing::warn!("preflight: {warning}");
    }

    let recipients = load_recipients(&args.recipients_path)?;
    anyhow::ensure!(!recipients.is_empty(), "recipients file contains no valid recipients");

    let rate_limiter = Arc::new(RateLimiter::new(config.limits.per_minute));
    let retry = Arc::new(RetryController::new(config.retry));
    let provider = Arc::new(ResendClient::new(config.provider.api_key.clone()));

    let scheduler = Scheduler::new(
        deliveries,
        suppressions,
        quota,
        rate_limiter,
        retry,
        provider,
        renderer,
    );

    let cancel = CancellationToken::new();
    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        cancel_on_signal.cancel();
    });

    let campaign_id = args
        .campaign_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let from_addr = config.provider.from_email.to_string();
    let concurrency = args.concurrency.unwrap_or(config.scheduler_concurrency_default);

    let request = CampaignRequest {
        campaign_id: campaign_id.clone(),
        template_id: args.template_id,
        subject_override: args.subject,
        from_addr,
        recipients: Box::new(recipients.into_iter()),
        options: CampaignOptions::new(concurrency, args.dry_run),
    };

    let (progress_tx, mut progress_rx) = tokio::sync::mpsc::unbounded_channel();
    let progress_task = tokio::spawn(async move {
        let mut exit_code = ExitCode::SUCCESS;
        while let Some(event) = progress_rx.recv().await {
            match event {
                ProgressEvent::AttemptCompleted { email, status } => {
                    info!(campaign_id = %campaign_id, email, ?status, "attempt completed");
                }
                ProgressEvent::Finished { stats } => {
                    info!(campaign_id = %campaign_id, ?stats, "campaign finished");
                    exit_code = ExitCode::SUCCESS;
                }
                ProgressEvent::Cancelled { stats } => {
                    info!(campaign_id = %campaign_id, ?stats, "campaign cancelled");
                    exit_code = ExitCode::from(130);
                }
                ProgressEvent::QuotaExhausted { stats } => {
                    info!(campaign_id = %campaign_id, ?stats, "campaign halted: quota exhausted");
                    exit_code = ExitCode::from(3);
                }
                ProgressEvent::Errored { stats } => {
                    info!(campaign_id = %campaign_id, ?stats, "campaign errored");
                    exit_code = ExitCode::from(3);
                }
            }
        }
        exit_code
    });

    let stats = scheduler.run(request, cancel, progress_tx).await;
    let exit_code = progress_task.await.unwrap_or(ExitCode::from(3));

    info!(?stats, "run_campaign exiting");

    Ok(exit_code)
}
