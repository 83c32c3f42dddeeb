//! Alert rows and the recovery-side aggregate queries.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct AlertRow {
    pub alert_id: i64,
    pub tenant_id: Uuid,
    pub alert_type: String,
    pub level: String,
    pub campaign_id: Option<String>,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

/// Guarded insert: the alert lands only when no alert of the same
/// (tenant, type, campaign) was created within the dedup window.
/// Returns true when a row was inserted.
pub async fn insert_alert_deduped(
    pool: &PgPool,
    tenant_id: Uuid,
    alert_type: &str,
    level: &str,
    campaign_id: Option<&str>,
    title: &str,
    body: &str,
    dedup_window_minutes: i64,
) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        insert into alerts (tenant_id, alert_type, level, campaign_id, title, body)
        select $1, $2, $3, $4, $5, $6
        where not exists (
            select 1
            from alerts
            where tenant_id = $1
              and alert_type = $2
              and campaign_id is not distinct from $4
              and deleted_at is null
              and created_at > now() - ($7 * interval '1 minute')
        )
        returning alert_id
        "#,
    )
    .bind(tenant_id)
    .bind(alert_type)
    .bind(level)
    .bind(campaign_id)
    .bind(title)
    .bind(body)
    .bind(dedup_window_minutes)
    .fetch_optional(pool)
    .await
    .context("insert_alert_deduped failed")?;

    Ok(row.is_some())
}

/// Newest-first alert history for a tenant (30-day retention window).
pub async fn recent_alerts(pool: &PgPool, tenant_id: Uuid, limit: i64) -> Result<Vec<AlertRow>> {
    let rows = sqlx::query(
        r#"
        select alert_id, tenant_id, alert_type, level, campaign_id, title, body,
               created_at, acknowledged_at
        from alerts
        where tenant_id = $1
          and deleted_at is null
          and created_at > now() - interval '30 days'
        order by created_at desc
        limit $2
        "#,
    )
    .bind(tenant_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("recent_alerts failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(AlertRow {
            alert_id: row.try_get("alert_id")?,
            tenant_id: row.try_get("tenant_id")?,
            alert_type: row.try_get("alert_type")?,
            level: row.try_get("level")?,
            campaign_id: row.try_get("campaign_id")?,
            title: row.try_get("title")?,
            body: row.try_get("body")?,
            created_at: row.try_get("created_at")?,
            acknowledged_at: row.try_get("acknowledged_at")?,
        });
    }
    Ok(out)
}

/// Hard-delete alerts past the 30-day retention.
pub async fn purge_alerts_older_than_days(pool: &PgPool, days: i64) -> Result<i64> {
    let res = sqlx::query(
        r#"
        delete from alerts
        where created_at < now() - ($1 * interval '1 day')
        "#,
    )
    .bind(days)
    .execute(pool)
    .await
    .context("purge_alerts_older_than_days failed")?;
    Ok(res.rows_affected() as i64)
}

#[derive(Debug, Clone)]
pub struct WriteRatio {
    pub tenant_id: Uuid,
    pub total: i64,
    pub failed: i64,
}

impl WriteRatio {
    pub fn failed_fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.failed as f64 / self.total as f64
        }
    }
}

/// Per-tenant write-log failure counts over the trailing hour.
pub async fn failed_write_ratios_last_hour(pool: &PgPool) -> Result<Vec<WriteRatio>> {
    let rows = sqlx::query(
        r#"
        select tenant_id,
               count(*)::bigint as total,
               count(*) filter (where write_success = false)::bigint as failed
        from write_logs
        where reported_at > now() - interval '1 hour'
        group by tenant_id
        "#,
    )
    .fetch_all(pool)
    .await
    .context("failed_write_ratios_last_hour failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(WriteRatio {
            tenant_id: row.try_get("tenant_id")?,
            total: row.try_get("total")?,
            failed: row.try_get("failed")?,
        });
    }
    Ok(out)
}
