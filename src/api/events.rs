use axum::extract::{Query, State};
use serde::Deserialize;

use crate::models::{Event, EventRepo};

use super::error::ApiResult;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    limit: Option<i64>,
}

const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 1000;

pub async fn recent(
    Query(query): Query<EventsQuery>,
    State(events): State<EventRepo>,
) -> ApiResult<Vec<Event>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let events = events.recent(limit).await?;
    Ok(axum::Json(events))
}
