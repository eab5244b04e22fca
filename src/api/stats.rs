use axum::extract::{Path, State};

use crate::models::{CampaignStats, DeliveryRepo};

use super::error::ApiResult;

pub async fn campaign_stats(
    Path(campaign_id): Path<String>,
    State(deliveries): State<DeliveryRepo>,
) -> ApiResult<CampaignStats> {
    let stats = deliveries.stats(&campaign_id).await?;
    Ok(axum::Json(stats))
}
