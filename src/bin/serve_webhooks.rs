use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    process::ExitCode,
    time::Duration,
};

use anyhow::Context;
use bulk_mailer::{
    api::ApiServer,
    config::Config,
    models::{DeliveryRepo, QuotaStore},
    periodically::Periodically,
};
use sqlx::{
    ConnectOptions,
    postgres::{PgConnectOptions, PgPoolOptions},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const PERIODIC_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    bulk_mailer::init_tracing();

    match run().await {
        Ok(code) => code,
        Err(e) => {
            error!("serve_webhooks failed: {e:?}");
            ExitCode::from(3)
        }
    }
}

async fn run() -> anyhow::Result<ExitCode> {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {e}");
            return Ok(ExitCode::from(2));
        }
    };

    let db_options = PgConnectOptions::from_url(&config.database_url.parse()?)?
        .application_name("bulk-mailer-serve-webhooks");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect_with(db_options)
        .await
        .context("failed to connect to database")?;

    #[cfg(feature = "apply-db-migrations")]
    sqlx::migrate!("./migrations").run(&pool).await?;

    let shutdown = CancellationToken::new();

    let bind_addr: SocketAddr = match std::env::var("BIND_ADDR") {
        Ok(raw) => raw.parse().context("BIND_ADDR must be a valid socket address")?,
        Err(_) => SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(0, 0, 0, 0), 3000)),
    };

    let server = ApiServer::new(bind_addr, pool.clone(), config.webhook.clone(), shutdown.clone()).await;
    server.spawn();
    info!("webhook server listening on {bind_addr}");

    let deliveries = DeliveryRepo::new(pool.clone());
    let quota = QuotaStore::new(pool, config.limits.daily);
    let periodically = Periodically::new(deliveries, quota);
    let periodic_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PERIODIC_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = periodic_shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = periodically.log_quota_usage().await {
                        error!("error logging quota usage: {e}");
                    }
                    if let Err(e) = periodically.warn_on_stale_sent().await {
                        error!("error checking for stale sent deliveries: {e}");
                    }
                }
            }
        }
    });

    bulk_mailer::shutdown_signal(shutdown.clone()).await;
    info!("received shutdown signal, stopping webhook server");
    shutdown.cancel();

    tokio::time::sleep(Duration::from_secs(2)).await;

    Ok(ExitCode::SUCCESS)
}
