//! Recovery & alerting: reclaim stuck leases, sweep stale stock, raise
//! stock/failure-rate alerts, and enforce retention windows. One tick is
//! idempotent; alert floods are damped by the 1-hour dedup window.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use tracing::{info, warn};

use sfx_config::Settings;
use sfx_schemas::RecoveryCounts;

/// Alerts of the same (tenant, type, campaign) within this window collapse.
const ALERT_DEDUP_MINUTES: i64 = 60;

/// Stock-at-zero thresholds.
const STOCK_WARN_MINUTES: i64 = 15;
const STOCK_ERROR_MINUTES: i64 = 60;

/// Failure-rate alert threshold over the trailing hour.
const FAILURE_RATE_THRESHOLD: f64 = 0.10;

/// One recovery pass. Invoked by the daemon cron and by the jobs endpoint.
pub async fn run_recovery_tick(pool: &PgPool, settings: &Settings) -> Result<RecoveryCounts> {
    let mut counts = RecoveryCounts::default();

    counts.leases_expired = recover_stuck_leases(pool, settings).await?;
    counts.stale_stock_failed =
        sfx_db::fail_stale_available(pool, settings.suffix_ttl_hours).await?;
    counts.stock_alerts = raise_stock_alerts(pool).await?;
    counts.failure_rate_alerts = raise_failure_rate_alerts(pool).await?;

    // Retention: the IP dedup window plus a day of slack, alerts at 30 days.
    counts.ip_usage_purged = sfx_db::purge_ip_usage_older_than_hours(pool, 48).await?;
    counts.alerts_purged = sfx_db::purge_alerts_older_than_days(pool, 30).await?;

    info!(
        leases_expired = counts.leases_expired,
        stale_stock_failed = counts.stale_stock_failed,
        stock_alerts = counts.stock_alerts,
        failure_rate_alerts = counts.failure_rate_alerts,
        "recovery tick complete"
    );

    Ok(counts)
}

/// Expire leases older than the TTL and free their pool items. An info
/// alert records the count per affected tenant.
async fn recover_stuck_leases(pool: &PgPool, settings: &Settings) -> Result<i64> {
    let expired = sfx_db::expire_stuck_leases(pool, settings.lease_ttl_minutes).await?;
    if expired.is_empty() {
        return Ok(0);
    }

    warn!(count = expired.len(), "expired stuck leases");

    let mut per_tenant: std::collections::HashMap<uuid::Uuid, i64> = std::collections::HashMap::new();
    for lease in &expired {
        *per_tenant.entry(lease.tenant_id).or_default() += 1;
    }
    for (tenant_id, count) in per_tenant {
        sfx_db::insert_alert_deduped(
            pool,
            tenant_id,
            "lease-recovered",
            "info",
            None,
            "stuck leases recovered",
            &format!("{count} leased assignment(s) expired and returned to stock"),
            ALERT_DEDUP_MINUTES,
        )
        .await?;
    }

    Ok(expired.len() as i64)
}

/// Campaigns dry for more than the warning threshold get a warning alert;
/// past the error threshold the level escalates.
async fn raise_stock_alerts(pool: &PgPool) -> Result<i64> {
    let dry = sfx_db::zero_stock_campaigns(pool).await?;
    let now = Utc::now();
    let mut raised = 0i64;

    for row in dry {
        let dry_for = now.signed_duration_since(row.zero_since);
        let (level, threshold) = if dry_for >= ChronoDuration::minutes(STOCK_ERROR_MINUTES) {
            ("error", STOCK_ERROR_MINUTES)
        } else if dry_for >= ChronoDuration::minutes(STOCK_WARN_MINUTES) {
            ("warning", STOCK_WARN_MINUTES)
        } else {
            continue;
        };

        let inserted = sfx_db::insert_alert_deduped(
            pool,
            row.tenant_id,
            "stock-empty",
            level,
            Some(&row.campaign_id),
            "suffix stock empty",
            &format!(
                "campaign {} has had no available suffixes for over {} minutes",
                row.campaign_id, threshold
            ),
            ALERT_DEDUP_MINUTES,
        )
        .await?;
        if inserted {
            raised += 1;
        }
    }

    Ok(raised)
}

/// More than 10% failed write logs in the trailing hour raises a
/// tenant-level alert.
async fn raise_failure_rate_alerts(pool: &PgPool) -> Result<i64> {
    let ratios = sfx_db::failed_write_ratios_last_hour(pool).await?;
    let mut raised = 0i64;

    for ratio in ratios {
        if ratio.total == 0 || ratio.failed_fraction() <= FAILURE_RATE_THRESHOLD {
            continue;
        }

        let inserted = sfx_db::insert_alert_deduped(
            pool,
            ratio.tenant_id,
            "write-failure-rate",
            "error",
            None,
            "elevated suffix write failures",
            &format!(
                "{} of {} write reports failed in the last hour",
                ratio.failed, ratio.total
            ),
            ALERT_DEDUP_MINUTES,
        )
        .await?;
        if inserted {
            raised += 1;
        }
    }

    Ok(raised)
}
