//! Axum router and all HTTP handlers for sfx-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and
//! attaches middleware layers. Handlers are `pub(crate)` so the scenario
//! tests in `tests/` can compose the router directly.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use serde_json::json;
use tracing::info;

use sfx_schemas::{
    CampaignSyncRequest, CampaignSyncResult, ErrorCode, JobsStatus, LeaseBatchRequest, LeaseItem,
    LeaseOutcome, RecoveryJobRequest, ReplenishJobRequest, ReplenishJobSummary, WriteReport,
    WriteReportBatchRequest,
};

use crate::auth::{limiter_identity, AuthedTenant, JobAuth};
use crate::error::{ApiError, ApiJson};
use crate::ratelimit::RouteClass;
use crate::state::AppState;

const MAX_BATCH: usize = 100;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (tracing, CORS) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .route("/v1/health", get(health))
        .route("/v1/suffix/lease", post(suffix_lease))
        .route("/v1/suffix/lease/batch", post(suffix_lease_batch))
        .route("/v1/suffix/report", post(suffix_report))
        .route("/v1/suffix/report/batch", post(suffix_report_batch))
        .route("/v1/campaigns/sync", post(campaigns_sync))
        .route("/v1/jobs", get(jobs_status))
        .route("/v1/jobs/alerts", get(jobs_alerts))
        .route("/v1/jobs/replenish", post(jobs_replenish))
        .route("/v1/jobs/recovery", post(jobs_recovery))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            rate_limit_mw,
        ))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Rate limiting middleware
// ---------------------------------------------------------------------------

fn classify(path: &str, method: &axum::http::Method) -> RouteClass {
    if path.starts_with("/v1/suffix/") {
        RouteClass::SuffixBatch
    } else if *method == axum::http::Method::POST
        && (path.starts_with("/v1/jobs") || path == "/v1/campaigns/sync")
    {
        RouteClass::AdminMutation
    } else {
        RouteClass::Generic
    }
}

pub(crate) async fn rate_limit_mw(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let class = classify(req.uri().path(), req.method());
    let identity = limiter_identity(req.headers());
    let decision = state.limiter.check(class, &identity);

    if !decision.allowed {
        let mut resp = ApiError::new(ErrorCode::RateLimitExceeded, "rate limit exceeded")
            .into_response();
        set_rate_headers(&mut resp, &decision);
        if let Ok(v) = HeaderValue::from_str(&decision.reset_secs.to_string()) {
            resp.headers_mut().insert("Retry-After", v);
        }
        return resp;
    }

    let mut resp = next.run(req).await;
    set_rate_headers(&mut resp, &decision);
    resp
}

fn set_rate_headers(resp: &mut Response, decision: &crate::ratelimit::RateDecision) {
    let headers = resp.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&decision.limit.to_string()) {
        headers.insert("X-RateLimit-Limit", v);
    }
    if let Ok(v) = HeaderValue::from_str(&decision.remaining.to_string()) {
        headers.insert("X-RateLimit-Remaining", v);
    }
    if let Ok(v) = HeaderValue::from_str(&decision.reset_secs.to_string()) {
        headers.insert("X-RateLimit-Reset", v);
    }
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "ok": true,
            "service": st.build.service,
            "version": st.build.version,
        })),
    )
}

// ---------------------------------------------------------------------------
// POST /v1/suffix/lease
// ---------------------------------------------------------------------------

fn validate_lease_item(item: &LeaseItem) -> Result<(), ApiError> {
    if item.campaign_id.is_empty() {
        return Err(ApiError::validation("campaignId must be non-empty"));
    }
    if item.idempotency_key.is_empty() {
        return Err(ApiError::validation("idempotencyKey must be non-empty"));
    }
    if item.window_start_epoch_seconds <= 0 {
        return Err(ApiError::validation(
            "windowStartEpochSeconds must be a positive integer",
        ));
    }
    if item.now_clicks < 0 {
        return Err(ApiError::validation("nowClicks must be non-negative"));
    }
    Ok(())
}

/// Single-item lease: terminal decisions are 200; error codes map to their
/// HTTP statuses (NO_STOCK 409, PENDING_IMPORT 202, ...).
pub(crate) async fn suffix_lease(
    State(st): State<Arc<AppState>>,
    AuthedTenant(tenant_id): AuthedTenant,
    ApiJson(item): ApiJson<LeaseItem>,
) -> Result<Response, ApiError> {
    validate_lease_item(&item)?;

    let outcome = st.engine.assign_one(tenant_id, &item).await;
    Ok(lease_outcome_response(outcome))
}

fn lease_outcome_response(outcome: LeaseOutcome) -> Response {
    let status = match &outcome {
        LeaseOutcome::Error { code, .. } => StatusCode::from_u16(code.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        _ => StatusCode::OK,
    };
    (status, Json(outcome)).into_response()
}

// ---------------------------------------------------------------------------
// POST /v1/suffix/lease/batch
// ---------------------------------------------------------------------------

/// Batched lease: the request fails as a whole only on validation; item
/// outcomes are embedded per entry and never abort their siblings.
pub(crate) async fn suffix_lease_batch(
    State(st): State<Arc<AppState>>,
    AuthedTenant(tenant_id): AuthedTenant,
    ApiJson(body): ApiJson<LeaseBatchRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.campaigns.is_empty() || body.campaigns.len() > MAX_BATCH {
        return Err(ApiError::validation(format!(
            "campaigns must hold 1..={MAX_BATCH} items"
        )));
    }
    if !(10..=60).contains(&body.cycle_minutes) {
        return Err(ApiError::validation("cycleMinutes must be within [10, 60]"));
    }
    for item in &body.campaigns {
        validate_lease_item(item)?;
    }

    info!(
        %tenant_id,
        script_instance_id = %body.script_instance_id,
        items = body.campaigns.len(),
        "lease batch"
    );

    let results = st.engine.assign_batch(tenant_id, &body.campaigns).await;
    Ok(Json(json!({ "results": results })))
}

// ---------------------------------------------------------------------------
// POST /v1/suffix/report + /batch
// ---------------------------------------------------------------------------

pub(crate) async fn suffix_report(
    State(st): State<Arc<AppState>>,
    AuthedTenant(tenant_id): AuthedTenant,
    ApiJson(report): ApiJson<WriteReport>,
) -> Result<Response, ApiError> {
    let outcome = st.engine.report_one(tenant_id, &report).await;

    if !outcome.ok && outcome.message == "not-found" {
        return Err(ApiError::new(ErrorCode::NotFound, "assignment not found"));
    }
    if !outcome.ok {
        return Err(ApiError::new(ErrorCode::InternalError, outcome.message));
    }
    Ok((StatusCode::OK, Json(json!({ "ok": true }))).into_response())
}

pub(crate) async fn suffix_report_batch(
    State(st): State<Arc<AppState>>,
    AuthedTenant(tenant_id): AuthedTenant,
    ApiJson(body): ApiJson<WriteReportBatchRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.reports.is_empty() || body.reports.len() > MAX_BATCH {
        return Err(ApiError::validation(format!(
            "reports must hold 1..={MAX_BATCH} items"
        )));
    }

    let results = st.engine.report_batch(tenant_id, &body.reports).await;
    Ok(Json(json!({ "results": results })))
}

// ---------------------------------------------------------------------------
// POST /v1/campaigns/sync
// ---------------------------------------------------------------------------

pub(crate) async fn campaigns_sync(
    State(st): State<Arc<AppState>>,
    AuthedTenant(tenant_id): AuthedTenant,
    ApiJson(body): ApiJson<CampaignSyncRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.campaigns.is_empty() || body.campaigns.len() > MAX_BATCH {
        return Err(ApiError::validation(format!(
            "campaigns must hold 1..={MAX_BATCH} rows"
        )));
    }

    let mut results = Vec::with_capacity(body.campaigns.len());
    for row in &body.campaigns {
        if row.campaign_id.is_empty() {
            return Err(ApiError::validation("campaignId must be non-empty"));
        }
        let outcome = sfx_db::upsert_campaign(
            &st.pool,
            tenant_id,
            &row.campaign_id,
            &sfx_db::CampaignUpsert {
                display_name: row.meta.display_name.clone(),
                country_code: row.meta.country_code.clone(),
                final_url: row.meta.final_url.clone(),
                external_account_id: row.meta.external_account_id.clone(),
                status: row.meta.status.clone(),
                time_zone: row.meta.time_zone.clone(),
            },
        )
        .await
        .map_err(|e| ApiError::internal("campaign sync", e))?;

        results.push(CampaignSyncResult {
            campaign_id: row.campaign_id.clone(),
            outcome: outcome.as_str().to_string(),
        });
    }

    sfx_db::insert_audit_event(
        &st.pool,
        tenant_id,
        "campaigns.synced",
        "",
        json!({ "count": results.len() }),
    )
    .await
    .map_err(|e| ApiError::internal("campaign sync audit", e))?;

    Ok(Json(json!({ "results": results })))
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

pub(crate) async fn jobs_status(
    State(st): State<Arc<AppState>>,
    _auth: JobAuth,
) -> Json<JobsStatus> {
    Json(st.jobs.read().await.clone())
}

pub(crate) async fn jobs_alerts(
    State(st): State<Arc<AppState>>,
    AuthedTenant(tenant_id): AuthedTenant,
) -> Result<Json<serde_json::Value>, ApiError> {
    let alerts = sfx_db::recent_alerts(&st.pool, tenant_id, 200)
        .await
        .map_err(|e| ApiError::internal("alert history", e))?;

    let views: Vec<sfx_schemas::AlertView> = alerts
        .into_iter()
        .map(|a| sfx_schemas::AlertView {
            alert_id: a.alert_id,
            alert_type: a.alert_type,
            level: a.level,
            campaign_id: a.campaign_id,
            title: a.title,
            body: a.body,
            created_at: a.created_at,
            acknowledged_at: a.acknowledged_at,
        })
        .collect();

    Ok(Json(json!({ "alerts": views })))
}

/// Replenish on demand: `mode=all` sweeps every low pool (cron or operator),
/// `mode=single` tops up one campaign for the authenticated tenant.
pub(crate) async fn jobs_replenish(
    State(st): State<Arc<AppState>>,
    auth: JobAuth,
    ApiJson(body): ApiJson<ReplenishJobRequest>,
) -> Result<Json<ReplenishJobSummary>, ApiError> {
    match body.mode.as_str() {
        "all" => {
            let summary = st
                .replenisher
                .tick_all()
                .await
                .map_err(|e| ApiError::internal("replenish all", e))?;

            let mut jobs = st.jobs.write().await;
            jobs.replenish_last_tick_at = Some(chrono::Utc::now());
            jobs.replenish_last_triggered = summary.campaigns_triggered;
            drop(jobs);

            Ok(Json(summary))
        }
        "single" => {
            let JobAuth::Tenant(tenant_id) = auth else {
                return Err(ApiError::new(
                    ErrorCode::Forbidden,
                    "single-campaign replenish requires a tenant api key",
                ));
            };
            let Some(campaign_id) = body.campaign_id.as_deref() else {
                return Err(ApiError::validation("campaignId required for mode=single"));
            };

            let produced = st
                .replenisher
                .replenish_campaign(tenant_id, campaign_id, body.force.unwrap_or(false))
                .await
                .map_err(|e| ApiError::internal("replenish single", e))?;

            Ok(Json(ReplenishJobSummary {
                campaigns_scanned: 1,
                campaigns_triggered: i64::from(produced > 0),
            }))
        }
        other => Err(ApiError::validation(format!(
            "mode must be \"all\" or \"single\", got {other:?}"
        ))),
    }
}

pub(crate) async fn jobs_recovery(
    State(st): State<Arc<AppState>>,
    _auth: JobAuth,
    ApiJson(body): ApiJson<RecoveryJobRequest>,
) -> Result<Json<sfx_schemas::RecoveryCounts>, ApiError> {
    if body.action != "run" {
        return Err(ApiError::validation("action must be \"run\""));
    }

    let counts = sfx_recovery::run_recovery_tick(&st.pool, &st.settings)
        .await
        .map_err(|e| ApiError::internal("recovery tick", e))?;

    let mut jobs = st.jobs.write().await;
    jobs.recovery_last_tick_at = Some(chrono::Utc::now());
    jobs.recovery_last_counts = Some(counts.clone());
    drop(jobs);

    Ok(Json(counts))
}
