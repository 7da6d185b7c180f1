//! Job admission, status, listing, cancellation and output delivery.

use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use recap_blob::BlobStore as _;
use recap_models::{BlobHandle, Job, JobConfig, JobId, JobSnapshot};
use recap_store::{JobStore as _, QuotaLedger as _};

use crate::error::{ApiError, ApiResult};
use crate::state::{owner_id, AppState};

/// Admission request payload.
#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    /// Handle of an already-uploaded source blob
    #[serde(default)]
    pub source_handle: Option<String>,
    /// Token from the upload flow, resolved to a blob under the media bucket
    #[serde(default)]
    pub upload_token: Option<String>,
    /// Source duration in seconds, measured at upload time
    pub source_duration_seconds: f64,
    #[serde(default)]
    pub target_duration_minutes: Option<f64>,
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub series_id: Option<String>,
    #[serde(default)]
    pub character_guide: Option<String>,
    #[serde(default)]
    pub short_clip_mode: bool,
    #[serde(default)]
    pub ai_segment_matching: bool,
}

#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    pub job_id: JobId,
}

fn valid_series_id(series_id: &str) -> bool {
    (1..=64).contains(&series_id.len())
        && series_id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// POST /api/jobs
pub async fn create_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateJobRequest>,
) -> ApiResult<Json<CreateJobResponse>> {
    let owner = owner_id(&headers)?;

    if request.source_duration_seconds <= 0.0 {
        return Err(ApiError::invalid_input("source_duration_seconds must be positive"));
    }
    if let Some(target) = request.target_duration_minutes {
        if target <= 0.0 {
            return Err(ApiError::invalid_input("target_duration_minutes must be positive"));
        }
    }
    if let Some(series_id) = &request.series_id {
        if !valid_series_id(series_id) {
            return Err(ApiError::invalid_input(
                "series_id must match [a-z0-9-]{1,64}",
            ));
        }
    }

    let source = match (&request.source_handle, &request.upload_token) {
        (Some(handle), None) => BlobHandle::from_string(handle),
        (None, Some(token)) => {
            BlobHandle::new(&state.config.media_bucket, format!("uploads/{token}"))
        }
        _ => {
            return Err(ApiError::invalid_input(
                "exactly one of source_handle or upload_token is required",
            ))
        }
    };

    // Admission-time availability pre-check. The authoritative reserve
    // still happens when the controller enters Reserving.
    state
        .ledger
        .ensure_account(&owner, state.config.default_subscription_minutes)
        .await?;
    let quota = state.ledger.snapshot(&owner).await?;
    if quota.total_available_minutes <= 0.0 {
        return Err(ApiError::PaymentRequired(
            "no minutes available; top up or renew your subscription".to_string(),
        ));
    }
    let estimate = (request.source_duration_seconds / 60.0)
        .min(quota.subscription_minutes_limit + quota.top_up_minutes_remaining);
    if quota.total_available_minutes < estimate {
        return Err(ApiError::QuotaExceeded(format!(
            "this video needs up to {estimate:.1} minutes, {:.1} available",
            quota.total_available_minutes
        )));
    }

    let config = JobConfig {
        target_duration_minutes: request.target_duration_minutes,
        script: request.script,
        series_id: request.series_id,
        character_guide: request.character_guide,
        short_clip_mode: request.short_clip_mode,
        ai_segment_matching: request.ai_segment_matching,
    };
    let job = Job::new(&owner, source, request.source_duration_seconds, config);
    let job_id = state.store.create(job).await?;

    info!(job_id = %job_id, owner = %owner, "Admitted job");
    Ok(Json(CreateJobResponse { job_id }))
}

/// Load a snapshot and enforce ownership.
pub async fn owned_snapshot(
    state: &AppState,
    owner: &str,
    job_id: &JobId,
) -> ApiResult<JobSnapshot> {
    let snapshot = state.store.get_snapshot(job_id).await?;
    if snapshot.owner_id != owner {
        return Err(ApiError::forbidden("job belongs to another user"));
    }
    Ok(snapshot)
}

/// GET /api/jobs/{id}
pub async fn get_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobSnapshot>> {
    let owner = owner_id(&headers)?;
    let snapshot = owned_snapshot(&state, &owner, &JobId::from_string(job_id)).await?;
    Ok(Json(snapshot))
}

/// GET /api/jobs
pub async fn list_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<JobSnapshot>>> {
    let owner = owner_id(&headers)?;
    Ok(Json(state.store.list_by_owner(&owner).await?))
}

/// POST /api/jobs/{id}/cancel
pub async fn cancel_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobSnapshot>> {
    let owner = owner_id(&headers)?;
    let job_id = JobId::from_string(job_id);
    owned_snapshot(&state, &owner, &job_id).await?;

    let snapshot = state.controller.cancel(&job_id).await?;
    Ok(Json(snapshot))
}

#[derive(Debug, Serialize)]
pub struct OutputUrlResponse {
    pub url: String,
    pub expires_in_seconds: u64,
}

/// GET /api/jobs/{id}/output
///
/// Presigned read URL for a completed job's output; generated on demand,
/// never stored.
pub async fn output_url(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> ApiResult<Json<OutputUrlResponse>> {
    let owner = owner_id(&headers)?;
    let snapshot = owned_snapshot(&state, &owner, &JobId::from_string(job_id)).await?;

    let output = snapshot
        .output
        .ok_or_else(|| ApiError::not_found("job has no output yet"))?;
    let ttl = Duration::from_secs(state.config.presign_ttl_seconds);
    let url = state
        .blobs
        .presign_get(&output, ttl)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    Ok(Json(OutputUrlResponse {
        url,
        expires_in_seconds: ttl.as_secs(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_series_id_validation() {
        assert!(valid_series_id("my-show-s01"));
        assert!(valid_series_id("a"));
        assert!(!valid_series_id(""));
        assert!(!valid_series_id("My-Show"));
        assert!(!valid_series_id("show_underscore"));
        assert!(!valid_series_id(&"x".repeat(65)));
    }
}
