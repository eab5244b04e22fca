use axum::{
    Router,
    extract::FromRef,
    routing::{get, post},
};
use sqlx::PgPool;
use std::{net::SocketAddr, time::Duration};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::{
    config::WebhookConfig,
    models::{DeliveryRepo, EventRepo, SuppressionStore},
};

mod error;
mod events;
mod health;
mod signature;
mod stats;
mod webhook;

/// Webhook deliveries must be acknowledged quickly regardless of
/// downstream persistence latency.
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ApiServerError {
    #[error("failed to bind to address: {0}")]
    Bind(std::io::Error),
    #[error("server error: {0}")]
    Serve(std::io::Error),
}

#[derive(Clone)]
pub struct ApiState {
    pool: PgPool,
    deliveries: DeliveryRepo,
    events: EventRepo,
    suppressions: SuppressionStore,
    webhook: WebhookConfig,
}

impl FromRef<ApiState> for PgPool {
    fn from_ref(state: &ApiState) -> Self {
        state.pool.clone()
    }
}

impl FromRef<ApiState> for DeliveryRepo {
    fn from_ref(state: &ApiState) -> Self {
        state.deliveries.clone()
    }
}

impl FromRef<ApiState> for EventRepo {
    fn from_ref(state: &ApiState) -> Self {
        state.events.clone()
    }
}

pub struct ApiServer {
    router: Router,
    socket: SocketAddr,
    shutdown: CancellationToken,
}

impl ApiServer {
    pub async fn new(
        socket: SocketAddr,
        pool: PgPool,
        webhook: WebhookConfig,
        shutdown: CancellationToken,
    ) -> ApiServer {
        let state = ApiState {
            deliveries: DeliveryRepo::new(pool.clone()),
            events: EventRepo::new(pool.clone()),
            suppressions: SuppressionStore::new(pool.clone()),
            webhook,
            pool,
        };
        state
            .suppressions
            .warm_cache()
            .await
            .expect("failed to warm suppression cache");

        let router = Router::new()
            .route("/health", get(health::health))
            .route("/events", get(events::recent))
            .route("/campaigns/{campaign_id}/stats", get(stats::campaign_stats))
            .route(
                "/resend/webhook",
                post(webhook::receive).layer(TimeoutLayer::new(WEBHOOK_TIMEOUT)),
            )
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        ApiServer {
            socket,
            router,
            shutdown,
        }
    }

    pub async fn serve(self) -> Result<(), ApiServerError> {
        let listener = TcpListener::bind(self.socket)
            .await
            .map_err(ApiServerError::Bind)?;

        info!("API server listening on {}", self.socket);

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(wait_for_shutdown(self.shutdown))
        .await
        .map_err(ApiServerError::Serve)
    }

    pub fn spawn(self) {
        tokio::spawn(async {
            let token = self.shutdown.clone();
            if let Err(e) = self.serve().await {
                error!("server error: {:?}", e);
                token.cancel();
                error!("shutting down API server")
            }
        });
    }
}

async fn wait_for_shutdown(token: CancellationToken) {
    token.cancelled().await;
}
