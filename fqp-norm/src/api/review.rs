//! Review actor endpoints
//!
//! Label cache decisions and unit review queue decisions. Only these
//! handlers move cache rows out of `PENDING_REVIEW`.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::{label_cache, status_report, unit_reviews, StatusReport};
use crate::error::{ApiError, ApiResult};
use crate::models::{FigureCorrection, LabelMapping, MappingStatus, ReviewQueueStatus, UnitReviewRow};
use crate::AppState;

const DEFAULT_REVIEWER: &str = "api";
const DEFAULT_LIST_LIMIT: i64 = 200;

fn reviewer_name(reviewer: Option<String>) -> String {
    reviewer
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| DEFAULT_REVIEWER.to_string())
}

/// Decode an optional JSON body; an empty body yields the defaults
fn optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> ApiResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid request body: {}", e)))
}

fn required(field: &str, value: &str) -> ApiResult<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ApiError::BadRequest(format!("'{}' must not be empty", field)));
    }
    Ok(value.to_string())
}

#[derive(Debug, Deserialize)]
pub struct LabelListQuery {
    /// Defaults to PENDING_REVIEW
    pub status: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct LabelListResponse {
    pub count: usize,
    pub mappings: Vec<LabelMapping>,
}

#[derive(Debug, Deserialize)]
pub struct ApproveLabelRequest {
    pub raw_label: String,
    pub domain_category: String,
    /// Replaces the suggested canonical id
    pub edited_label: Option<String>,
    pub reviewer: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RejectLabelRequest {
    pub raw_label: String,
    pub domain_category: String,
    pub reviewer: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DecisionResponse {
    pub status: &'static str,
}

/// GET /labels/pending
pub async fn list_labels(
    State(state): State<AppState>,
    Query(query): Query<LabelListQuery>,
) -> ApiResult<Json<LabelListResponse>> {
    let status = match query.status.as_deref() {
        None => Some(MappingStatus::PendingReview),
        Some(s) if s.eq_ignore_ascii_case("all") => None,
        Some(s) => Some(
            s.to_uppercase()
                .parse::<MappingStatus>()
                .map_err(ApiError::BadRequest)?,
        ),
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, 10_000);

    let mappings = label_cache::list(&state.db, status, limit).await?;
    Ok(Json(LabelListResponse {
        count: mappings.len(),
        mappings,
    }))
}

/// POST /labels/approve
pub async fn approve_label(
    State(state): State<AppState>,
    Json(request): Json<ApproveLabelRequest>,
) -> ApiResult<Json<DecisionResponse>> {
    let raw_label = required("raw_label", &request.raw_label)?;
    let domain_category = required("domain_category", &request.domain_category)?;
    let edited = request
        .edited_label
        .as_deref()
        .map(str::trim)
        .filter(|l| !l.is_empty());
    let reviewer = reviewer_name(request.reviewer);

    if !label_cache::approve(&state.db, &raw_label, &domain_category, edited, &reviewer).await? {
        return Err(ApiError::NotFound(format!(
            "No cached mapping for '{}' in '{}'",
            raw_label, domain_category
        )));
    }

    info!(raw_label = %raw_label, domain_category = %domain_category, edited = edited.is_some(), reviewer = %reviewer, "Label mapping approved");
    Ok(Json(DecisionResponse { status: "APPROVED" }))
}

/// POST /labels/reject
pub async fn reject_label(
    State(state): State<AppState>,
    Json(request): Json<RejectLabelRequest>,
) -> ApiResult<Json<DecisionResponse>> {
    let raw_label = required("raw_label", &request.raw_label)?;
    let domain_category = required("domain_category", &request.domain_category)?;
    let reviewer = reviewer_name(request.reviewer);

    if !label_cache::reject(&state.db, &raw_label, &domain_category, &reviewer).await? {
        return Err(ApiError::NotFound(format!(
            "No cached mapping for '{}' in '{}'",
            raw_label, domain_category
        )));
    }

    info!(raw_label = %raw_label, domain_category = %domain_category, reviewer = %reviewer, "Label mapping rejected");
    Ok(Json(DecisionResponse { status: "REJECTED" }))
}

#[derive(Debug, Deserialize)]
pub struct UnitReviewListQuery {
    pub status: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ApproveUnitReviewRequest {
    pub reviewer: Option<String>,
    #[serde(default)]
    pub corrections: Option<Vec<FigureCorrection>>,
}

#[derive(Debug, Deserialize, Default)]
pub struct RejectUnitReviewRequest {
    pub reviewer: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RequeueResponse {
    pub status: &'static str,
    pub doc_id: i64,
}

/// GET /unit-reviews
pub async fn list_unit_reviews(
    State(state): State<AppState>,
    Query(query): Query<UnitReviewListQuery>,
) -> ApiResult<Json<Vec<UnitReviewRow>>> {
    let status = query
        .status
        .as_deref()
        .map(|s| s.to_uppercase().parse::<ReviewQueueStatus>())
        .transpose()
        .map_err(ApiError::BadRequest)?;

    Ok(Json(unit_reviews::list(&state.db, status).await?))
}

/// Load a queue row that must still await a decision
async fn pending_review(state: &AppState, id: i64) -> ApiResult<UnitReviewRow> {
    let row = unit_reviews::load(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Unit review {} not found", id)))?;
    if row.status != ReviewQueueStatus::PendingReview {
        return Err(ApiError::Conflict(format!(
            "Unit review {} is already {}",
            id,
            row.status.as_str()
        )));
    }
    Ok(row)
}

/// POST /unit-reviews/:id/approve
pub async fn approve_unit_review(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    body: Bytes,
) -> ApiResult<Json<DecisionResponse>> {
    let request: ApproveUnitReviewRequest = optional_body(&body)?;
    pending_review(&state, id).await?;

    let reviewer = reviewer_name(request.reviewer);
    let corrections = request.corrections.as_deref();
    if let Some(corrections) = corrections {
        if let Some(blank) = corrections.iter().find(|c| c.label.trim().is_empty()) {
            return Err(ApiError::BadRequest(format!(
                "Correction without a label: {:?}",
                blank
            )));
        }
    }

    if !unit_reviews::approve(&state.db, id, &reviewer, corrections).await? {
        return Err(ApiError::Conflict(format!("Unit review {} changed concurrently", id)));
    }

    info!(review_id = id, reviewer = %reviewer, corrections = corrections.map_or(0, |c| c.len()), "Unit review approved");
    Ok(Json(DecisionResponse { status: "APPROVED" }))
}

/// POST /unit-reviews/:id/reject
pub async fn reject_unit_review(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    body: Bytes,
) -> ApiResult<Json<DecisionResponse>> {
    let request: RejectUnitReviewRequest = optional_body(&body)?;
    pending_review(&state, id).await?;

    let reviewer = reviewer_name(request.reviewer);
    if !unit_reviews::reject(&state.db, id, &reviewer).await? {
        return Err(ApiError::Conflict(format!("Unit review {} changed concurrently", id)));
    }

    info!(review_id = id, reviewer = %reviewer, "Unit review rejected");
    Ok(Json(DecisionResponse { status: "REJECTED" }))
}

/// POST /unit-reviews/:id/requeue
pub async fn requeue_unit_review(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<RequeueResponse>> {
    let row = unit_reviews::load(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Unit review {} not found", id)))?;
    if row.status != ReviewQueueStatus::Rejected {
        return Err(ApiError::Conflict(format!(
            "Only rejected reviews can be requeued; {} is {}",
            id,
            row.status.as_str()
        )));
    }

    let doc_id = unit_reviews::requeue(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::Conflict(format!("Unit review {} changed concurrently", id)))?;

    info!(review_id = id, doc_id, "Unit review requeued for discovery");
    Ok(Json(RequeueResponse {
        status: "REQUEUED",
        doc_id,
    }))
}

/// GET /status
pub async fn pipeline_status(State(state): State<AppState>) -> ApiResult<Json<StatusReport>> {
    Ok(Json(status_report(&state.db).await?))
}

/// Build review routes
pub fn review_routes() -> Router<AppState> {
    Router::new()
        .route("/labels/pending", get(list_labels))
        .route("/labels/approve", post(approve_label))
        .route("/labels/reject", post(reject_label))
        .route("/unit-reviews", get(list_unit_reviews))
        .route("/unit-reviews/:id/approve", post(approve_unit_review))
        .route("/unit-reviews/:id/reject", post(reject_unit_review))
        .route("/unit-reviews/:id/requeue", post(requeue_unit_review))
        .route("/status", get(pipeline_status))
}
