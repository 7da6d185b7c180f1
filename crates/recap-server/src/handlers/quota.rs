//! Quota queries.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;

use recap_models::QuotaSnapshot;
use recap_store::QuotaLedger as _;

use crate::error::ApiResult;
use crate::state::{owner_id, AppState};

/// GET /api/quota
pub async fn get_quota(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<QuotaSnapshot>> {
    let owner = owner_id(&headers)?;
    state
        .ledger
        .ensure_account(&owner, state.config.default_subscription_minutes)
        .await?;
    Ok(Json(state.ledger.snapshot(&owner).await?))
}
