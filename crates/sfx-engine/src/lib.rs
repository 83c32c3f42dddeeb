//! The assignment engine: decides APPLY / NOOP per reported click
//! increment, leases pool items atomically, enforces idempotency across
//! retries, records write outcomes, and kicks replenishment when it
//! consumes or misses stock.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::future::join_all;
use rand::Rng;
use serde_json::json;
use sqlx::PgPool;
use tracing::{error, warn};
use uuid::Uuid;

use sfx_config::Settings;
use sfx_db::{
    AssignConflict, AssignmentRow, AssignmentStatus, ReportApplyOutcome, TryAssignArgs,
    TryAssignOutcome, WriteReportArgs,
};
use sfx_producer::Replenisher;
use sfx_schemas::{
    CampaignMeta, ErrorCode, LeaseItem, LeaseOutcome, ReportOutcome, WriteReport,
};

mod rollover;

pub use rollover::{is_day_rollover, local_date_string};

/// Conflict-retry policy: up to 3 attempts, jittered doubling backoff.
const ASSIGN_RETRIES: u32 = 3;
const RETRY_BASE_MS: u64 = 50;

pub struct Engine {
    pool: PgPool,
    settings: Settings,
    replenisher: Arc<Replenisher>,
}

impl Engine {
    pub fn new(pool: PgPool, settings: Settings, replenisher: Arc<Replenisher>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            settings,
            replenisher,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    // -----------------------------------------------------------------
    // assign
    // -----------------------------------------------------------------

    /// Process a batch of click observations. Items are independent and run
    /// concurrently; one item's failure never blocks another's success.
    pub async fn assign_batch(&self, tenant_id: Uuid, items: &[LeaseItem]) -> Vec<LeaseOutcome> {
        join_all(items.iter().map(|item| self.assign_one(tenant_id, item))).await
    }

    /// One item, every outcome folded into the wire shape. Errors that
    /// survive the retry policy become per-item INTERNAL_ERROR.
    pub async fn assign_one(&self, tenant_id: Uuid, item: &LeaseItem) -> LeaseOutcome {
        match self.assign_inner(tenant_id, item).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    %tenant_id,
                    campaign_id = %item.campaign_id,
                    idempotency_key = %item.idempotency_key,
                    error = ?e,
                    "assign failed"
                );
                LeaseOutcome::Error {
                    campaign_id: item.campaign_id.clone(),
                    code: ErrorCode::InternalError,
                    message: "assignment failed; retry with the same idempotencyKey".to_string(),
                }
            }
        }
    }

    async fn assign_inner(&self, tenant_id: Uuid, item: &LeaseItem) -> Result<LeaseOutcome> {
        if item.idempotency_key.is_empty() {
            return Ok(LeaseOutcome::Error {
                campaign_id: item.campaign_id.clone(),
                code: ErrorCode::ValidationError,
                message: "idempotencyKey must be non-empty".to_string(),
            });
        }
        if item.window_start_epoch_seconds <= 0 {
            return Ok(LeaseOutcome::Error {
                campaign_id: item.campaign_id.clone(),
                code: ErrorCode::ValidationError,
                message: "windowStartEpochSeconds must be positive".to_string(),
            });
        }

        // 1. Idempotency: a known key replays its recorded decision.
        if let Some(existing) =
            sfx_db::find_assignment_by_idempotency_key(&self.pool, tenant_id, &item.idempotency_key)
                .await?
        {
            return Ok(replay_outcome(&item.campaign_id, &existing));
        }

        // 2. Campaign metadata hydration.
        let campaign = match self.hydrate_campaign(tenant_id, item).await? {
            Ok(campaign) => campaign,
            Err(outcome) => return Ok(outcome),
        };

        // 3. Click state: observations always land.
        let prior = sfx_db::upsert_observed_clicks(
            &self.pool,
            tenant_id,
            &item.campaign_id,
            item.now_clicks,
            item.observed_at,
        )
        .await?;

        // 4. Day rollover.
        let mut delta = item.now_clicks - prior.last_applied_clicks;
        if rollover::is_day_rollover(
            delta,
            prior.last_applied_clicks,
            prior.last_observed_at,
            item.observed_at,
            campaign.time_zone.as_deref(),
        ) {
            sfx_db::reset_applied_clicks(&self.pool, tenant_id, &item.campaign_id).await?;
            delta = item.now_clicks;
        }

        // 5. Decision.
        if delta <= 0 {
            return Ok(LeaseOutcome::Noop {
                campaign_id: item.campaign_id.clone(),
                reason: "delta≤0".to_string(),
            });
        }

        // Active-lease reuse: a rerun inside the same window (different
        // idempotency key) gets the lease that is already out.
        if let Some(active) =
            sfx_db::find_leased_assignment(&self.pool, tenant_id, &item.campaign_id).await?
        {
            return Ok(apply_outcome(&item.campaign_id, &active));
        }

        self.lease_with_retries(tenant_id, item).await
    }

    /// The consuming transaction, retried on storage conflicts with
    /// randomized jittered backoff; unique-index losses replay the winner.
    async fn lease_with_retries(&self, tenant_id: Uuid, item: &LeaseItem) -> Result<LeaseOutcome> {
        let args = TryAssignArgs {
            tenant_id,
            campaign_id: item.campaign_id.clone(),
            idempotency_key: item.idempotency_key.clone(),
            now_clicks: item.now_clicks,
            window_start_epoch_seconds: item.window_start_epoch_seconds,
        };

        for attempt in 0..ASSIGN_RETRIES {
            let outcome = match sfx_db::try_assign(&self.pool, &args).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let retryable = e
                        .downcast_ref::<sqlx::Error>()
                        .map(sfx_db::is_retryable_conflict)
                        .unwrap_or(false);
                    if retryable && attempt + 1 < ASSIGN_RETRIES {
                        tokio::time::sleep(jitter(attempt)).await;
                        continue;
                    }
                    return Err(e);
                }
            };

            match outcome {
                TryAssignOutcome::Assigned(assignment) => {
                    self.replenisher.trigger_async(tenant_id, &item.campaign_id);
                    if let Err(e) = sfx_db::insert_audit_event(
                        &self.pool,
                        tenant_id,
                        "suffix.assigned",
                        &item.campaign_id,
                        json!({
                            "assignmentId": assignment.assignment_id,
                            "poolItemId": assignment.pool_item_id,
                            "nowClicks": item.now_clicks,
                            "windowStartEpochSeconds": item.window_start_epoch_seconds,
                        }),
                    )
                    .await
                    {
                        warn!(error = %e, "audit write for assignment failed");
                    }
                    return Ok(apply_outcome(&item.campaign_id, &assignment));
                }
                TryAssignOutcome::NoStock => {
                    self.replenisher.trigger_async(tenant_id, &item.campaign_id);
                    return Ok(LeaseOutcome::Error {
                        campaign_id: item.campaign_id.clone(),
                        code: ErrorCode::NoStock,
                        message: "no suffix available; replenishment triggered".to_string(),
                    });
                }
                TryAssignOutcome::Conflict(AssignConflict::IdempotencyKey) => {
                    // Another writer won with our key; its decision is ours.
                    if let Some(existing) = sfx_db::find_assignment_by_idempotency_key(
                        &self.pool,
                        tenant_id,
                        &item.idempotency_key,
                    )
                    .await?
                    {
                        return Ok(replay_outcome(&item.campaign_id, &existing));
                    }
                    // The winner vanished (deleted between insert and read):
                    // fall through to retry.
                }
                TryAssignOutcome::Conflict(AssignConflict::ActiveLease) => {
                    if let Some(active) =
                        sfx_db::find_leased_assignment(&self.pool, tenant_id, &item.campaign_id)
                            .await?
                    {
                        return Ok(apply_outcome(&item.campaign_id, &active));
                    }
                    // The competing lease resolved already; retry.
                }
            }

            tokio::time::sleep(jitter(attempt)).await;
        }

        Ok(LeaseOutcome::Error {
            campaign_id: item.campaign_id.clone(),
            code: ErrorCode::InternalError,
            message: "assignment contention persisted; retry with the same idempotencyKey"
                .to_string(),
        })
    }

    /// Campaign lookup with lazy creation from the request's meta block.
    async fn hydrate_campaign(
        &self,
        tenant_id: Uuid,
        item: &LeaseItem,
    ) -> Result<std::result::Result<sfx_db::CampaignRow, LeaseOutcome>> {
        let existing = sfx_db::fetch_campaign(&self.pool, tenant_id, &item.campaign_id).await?;

        match (existing, &item.meta) {
            (Some(campaign), Some(meta)) => {
                if meta_differs(&campaign, meta) {
                    sfx_db::upsert_campaign(
                        &self.pool,
                        tenant_id,
                        &item.campaign_id,
                        &to_upsert(meta),
                    )
                    .await?;
                    let refreshed =
                        sfx_db::fetch_campaign(&self.pool, tenant_id, &item.campaign_id).await?;
                    Ok(Ok(refreshed.unwrap_or(campaign)))
                } else {
                    Ok(Ok(campaign))
                }
            }
            (Some(campaign), None) => Ok(Ok(campaign)),
            (None, Some(meta)) => {
                sfx_db::upsert_campaign(&self.pool, tenant_id, &item.campaign_id, &to_upsert(meta))
                    .await?;
                let created = sfx_db::fetch_campaign(&self.pool, tenant_id, &item.campaign_id)
                    .await?;
                match created {
                    Some(campaign) => Ok(Ok(campaign)),
                    None => Ok(Err(LeaseOutcome::Error {
                        campaign_id: item.campaign_id.clone(),
                        code: ErrorCode::InternalError,
                        message: "campaign creation did not take effect".to_string(),
                    })),
                }
            }
            (None, None) => Ok(Err(LeaseOutcome::Error {
                campaign_id: item.campaign_id.clone(),
                code: ErrorCode::PendingImport,
                message: "campaign unknown; sync metadata or attach a meta block".to_string(),
            })),
        }
    }

    // -----------------------------------------------------------------
    // report
    // -----------------------------------------------------------------

    /// Record a batch of write outcomes. Independent per report.
    pub async fn report_batch(&self, tenant_id: Uuid, reports: &[WriteReport]) -> Vec<ReportOutcome> {
        join_all(
            reports
                .iter()
                .map(|report| self.report_one(tenant_id, report)),
        )
        .await
    }

    pub async fn report_one(&self, tenant_id: Uuid, report: &WriteReport) -> ReportOutcome {
        let args = WriteReportArgs {
            tenant_id,
            campaign_id: report.campaign_id.clone(),
            assignment_id: report.assignment_id,
            write_success: report.write_success,
            write_error_message: report.write_error_message.clone(),
            reported_at: report.reported_at,
        };

        match sfx_db::apply_write_report(&self.pool, &args).await {
            Ok(ReportApplyOutcome::Applied) => {
                // A failed write freed its pool item; a successful one
                // consumed it. Either way the pool moved: top it up.
                self.replenisher
                    .trigger_async(tenant_id, &report.campaign_id);
                ReportOutcome {
                    assignment_id: report.assignment_id,
                    ok: true,
                    message: "logged".to_string(),
                }
            }
            Ok(ReportApplyOutcome::AlreadyLogged) => ReportOutcome {
                assignment_id: report.assignment_id,
                ok: true,
                message: "already-logged".to_string(),
            },
            Ok(ReportApplyOutcome::NotFound) => ReportOutcome {
                assignment_id: report.assignment_id,
                ok: false,
                message: "not-found".to_string(),
            },
            Err(e) => {
                error!(
                    %tenant_id,
                    assignment_id = %report.assignment_id,
                    error = ?e,
                    "write report failed"
                );
                ReportOutcome {
                    assignment_id: report.assignment_id,
                    ok: false,
                    message: "internal error; retry the report".to_string(),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn jitter(attempt: u32) -> Duration {
    let base = RETRY_BASE_MS << attempt;
    let spread = rand::rng().random_range(0..=base);
    Duration::from_millis(base + spread)
}

/// Replay semantics for a known idempotency key: live or consumed
/// assignments re-return APPLY; terminal failures map to a NOOP so the
/// client advances its window.
fn replay_outcome(campaign_id: &str, existing: &AssignmentRow) -> LeaseOutcome {
    match existing.status {
        AssignmentStatus::Leased | AssignmentStatus::Consumed => {
            apply_outcome(campaign_id, existing)
        }
        AssignmentStatus::Failed | AssignmentStatus::Expired => LeaseOutcome::Noop {
            campaign_id: campaign_id.to_string(),
            reason: "replay-of-completed-window".to_string(),
        },
    }
}

fn apply_outcome(campaign_id: &str, assignment: &AssignmentRow) -> LeaseOutcome {
    LeaseOutcome::Apply {
        campaign_id: campaign_id.to_string(),
        assignment_id: assignment.assignment_id,
        final_url_suffix: assignment.final_url_suffix.clone(),
    }
}

/// Does the request's meta block change anything the row already has?
fn meta_differs(campaign: &sfx_db::CampaignRow, meta: &CampaignMeta) -> bool {
    fn differs(current: &str, incoming: Option<&String>) -> bool {
        incoming.map(|v| v != current).unwrap_or(false)
    }

    differs(&campaign.display_name, meta.display_name.as_ref())
        || differs(&campaign.country_code, meta.country_code.as_ref())
        || differs(&campaign.final_url, meta.final_url.as_ref())
        || differs(
            &campaign.external_account_id,
            meta.external_account_id.as_ref(),
        )
        || differs(&campaign.status, meta.status.as_ref())
        || meta
            .time_zone
            .as_ref()
            .map(|z| campaign.time_zone.as_deref() != Some(z.as_str()))
            .unwrap_or(false)
}

fn to_upsert(meta: &CampaignMeta) -> sfx_db::CampaignUpsert {
    sfx_db::CampaignUpsert {
        display_name: meta.display_name.clone(),
        country_code: meta.country_code.clone(),
        final_url: meta.final_url.clone(),
        external_account_id: meta.external_account_id.clone(),
        status: meta.status.clone(),
        time_zone: meta.time_zone.clone(),
    }
}
