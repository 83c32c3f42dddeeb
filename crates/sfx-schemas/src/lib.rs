//! Wire types shared across the suffix-pool crates.
//!
//! Request/response bodies use camelCase on the wire and reject unknown
//! fields; optional fields are modeled as absence (`Option`), never null
//! sentinels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Lease (assign) request
// ---------------------------------------------------------------------------

/// One campaign entry of a lease request: the ad-script's observation that a
/// campaign's click counter now reads `now_clicks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LeaseItem {
    pub campaign_id: String,
    pub now_clicks: i64,
    pub observed_at: DateTime<Utc>,
    pub window_start_epoch_seconds: i64,
    /// Unique within the tenant; replays with the same key return the same
    /// decision.
    pub idempotency_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<CampaignMeta>,
}

/// Campaign metadata block accompanying a lease item (lazy import) or a
/// `/v1/campaigns/sync` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CampaignMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_account_id: Option<String>,
    /// "active" | "inactive"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// IANA zone name for day-rollover detection. Absent means UTC.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LeaseBatchRequest {
    pub campaigns: Vec<LeaseItem>,
    pub script_instance_id: String,
    /// Reporting cadence of the calling ad-script, minutes. Valid range 10-60.
    pub cycle_minutes: i64,
}

// ---------------------------------------------------------------------------
// Lease outcome
// ---------------------------------------------------------------------------

/// Per-item outcome of an assign call. Exactly one of the variants applies;
/// the tag is the `action`/`code` the ad-script dispatches on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeaseOutcome {
    #[serde(rename_all = "camelCase")]
    Apply {
        campaign_id: String,
        assignment_id: Uuid,
        final_url_suffix: String,
    },
    #[serde(rename_all = "camelCase")]
    Noop { campaign_id: String, reason: String },
    #[serde(rename_all = "camelCase")]
    Error {
        campaign_id: String,
        code: ErrorCode,
        message: String,
    },
}

impl LeaseOutcome {
    pub fn campaign_id(&self) -> &str {
        match self {
            LeaseOutcome::Apply { campaign_id, .. } => campaign_id,
            LeaseOutcome::Noop { campaign_id, .. } => campaign_id,
            LeaseOutcome::Error { campaign_id, .. } => campaign_id,
        }
    }
}

/// Error codes surfaced in response bodies. The daemon maps these to HTTP
/// statuses on single-item endpoints; batch endpoints embed them per item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    PendingImport,
    NoStock,
    RateLimitExceeded,
    InternalError,
}

impl ErrorCode {
    /// HTTP status for single-item surfaces.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorCode::ValidationError => 422,
            ErrorCode::Unauthorized => 401,
            ErrorCode::Forbidden => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::Conflict => 409,
            ErrorCode::PendingImport => 202,
            ErrorCode::NoStock => 409,
            ErrorCode::RateLimitExceeded => 429,
            ErrorCode::InternalError => 500,
        }
    }
}

// ---------------------------------------------------------------------------
// Write-outcome reports
// ---------------------------------------------------------------------------

/// The ad-script's report of what happened when it wrote a leased suffix
/// into the ad platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WriteReport {
    pub assignment_id: Uuid,
    pub campaign_id: String,
    pub write_success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_error_message: Option<String>,
    pub reported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WriteReportBatchRequest {
    pub reports: Vec<WriteReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportOutcome {
    pub assignment_id: Uuid,
    pub ok: bool,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Campaign sync
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CampaignSyncRow {
    pub campaign_id: String,
    pub meta: CampaignMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CampaignSyncRequest {
    pub campaigns: Vec<CampaignSyncRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignSyncResult {
    pub campaign_id: String,
    /// "created" | "updated"
    pub outcome: String,
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReplenishJobRequest {
    /// "all" | "single"
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
    /// Replenish even when stock is at or above the low-water mark.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplenishJobSummary {
    pub campaigns_scanned: i64,
    pub campaigns_triggered: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RecoveryJobRequest {
    /// "run" is the only recognized action.
    pub action: String,
}

/// Counts produced by one recovery tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryCounts {
    pub leases_expired: i64,
    pub stale_stock_failed: i64,
    pub stock_alerts: i64,
    pub failure_rate_alerts: i64,
    pub ip_usage_purged: i64,
    pub alerts_purged: i64,
}

/// Background-loop status exposed by GET /v1/jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobsStatus {
    pub replenish_last_tick_at: Option<DateTime<Utc>>,
    pub replenish_last_triggered: i64,
    pub recovery_last_tick_at: Option<DateTime<Utc>>,
    pub recovery_last_counts: Option<RecoveryCounts>,
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertView {
    pub alert_id: i64,
    pub alert_type: String,
    /// "info" | "warning" | "error"
    pub level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Redirect chain (tracker wire shape, also audited)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RedirectType {
    Http,
    MetaRefresh,
    JsLocation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainStep {
    pub step: u32,
    pub url: String,
    pub domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub redirect_type: RedirectType,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_outcome_apply_serializes_with_action_tag() {
        let out = LeaseOutcome::Apply {
            campaign_id: "C1".to_string(),
            assignment_id: Uuid::nil(),
            final_url_suffix: "gclid=abc&t=1".to_string(),
        };
        let v = serde_json::to_value(&out).unwrap();
        assert_eq!(v["action"], "APPLY");
        assert_eq!(v["finalUrlSuffix"], "gclid=abc&t=1");
    }

    #[test]
    fn lease_item_rejects_unknown_fields() {
        let raw = r#"{
            "campaignId": "C1",
            "nowClicks": 5,
            "observedAt": "2025-01-15T10:00:00Z",
            "windowStartEpochSeconds": 1736935200,
            "idempotencyKey": "k1",
            "bogus": true
        }"#;
        let err = serde_json::from_str::<LeaseItem>(raw).unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn error_code_status_mapping() {
        assert_eq!(ErrorCode::NoStock.http_status(), 409);
        assert_eq!(ErrorCode::PendingImport.http_status(), 202);
        assert_eq!(ErrorCode::ValidationError.http_status(), 422);
    }
}
