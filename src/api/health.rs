use axum::{Json, extract::State};
use serde::Serialize;
use sqlx::PgPool;
use tracing::error;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    healthy: bool,
    database: &'static str,
}

pub async fn health(State(pool): State<PgPool>) -> Json<HealthResponse> {
    match sqlx::query("SELECT 1").execute(&pool).await {
        Ok(_) => Json(HealthResponse {
            healthy: true,
            database: "reachable",
        }),
        Err(e) => {
            error!(error = %e, "health check: database unreachable");
            Json(HealthResponse {
                healthy: false,
                database: "unreachable",
            })
        }
    }
}
