//! Proxy providers, exit-IP usage and the replenishment advisory lock.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres, Row};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ProxyProviderRow {
    pub proxy_provider_id: i64,
    pub name: String,
    pub host: String,
    pub port: i32,
    pub username_template: String,
    pub password: String,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

/// Enabled providers assigned to a tenant, in try order: ascending
/// priority, ties broken by creation time.
pub async fn providers_for_tenant(pool: &PgPool, tenant_id: Uuid) -> Result<Vec<ProxyProviderRow>> {
    let rows = sqlx::query(
        r#"
        select p.proxy_provider_id, p.name, p.host, p.port, p.username_template,
               p.password, p.priority, p.created_at
        from proxy_providers p
        join proxy_assignments a
          on a.proxy_provider_id = p.proxy_provider_id
         and a.deleted_at is null
        where a.tenant_id = $1
          and p.enabled = true
          and p.deleted_at is null
        order by p.priority asc, p.created_at asc, p.proxy_provider_id asc
        "#,
    )
    .bind(tenant_id)
    .fetch_all(pool)
    .await
    .context("providers_for_tenant failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(ProxyProviderRow {
            proxy_provider_id: row.try_get("proxy_provider_id")?,
            name: row.try_get("name")?,
            host: row.try_get("host")?,
            port: row.try_get("port")?,
            username_template: row.try_get("username_template")?,
            password: row.try_get("password")?,
            priority: row.try_get("priority")?,
            created_at: row.try_get("created_at")?,
        });
    }
    Ok(out)
}

pub async fn insert_proxy_provider(
    pool: &PgPool,
    name: &str,
    host: &str,
    port: i32,
    username_template: &str,
    password: &str,
    priority: i32,
) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        insert into proxy_providers (name, host, port, username_template, password, priority)
        values ($1, $2, $3, $4, $5, $6)
        returning proxy_provider_id
        "#,
    )
    .bind(name)
    .bind(host)
    .bind(port)
    .bind(username_template)
    .bind(password)
    .bind(priority)
    .fetch_one(pool)
    .await
    .context("insert_proxy_provider failed")?;
    Ok(id)
}

pub async fn assign_proxy_to_tenant(
    pool: &PgPool,
    tenant_id: Uuid,
    proxy_provider_id: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into proxy_assignments (tenant_id, proxy_provider_id)
        values ($1, $2)
        "#,
    )
    .bind(tenant_id)
    .bind(proxy_provider_id)
    .execute(pool)
    .await
    .context("assign_proxy_to_tenant failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Exit-IP usage (24 h dedup window)
// ---------------------------------------------------------------------------

/// Distinct exit IPs used by (tenant, campaign) within the trailing window.
pub async fn used_exit_ips(
    pool: &PgPool,
    tenant_id: Uuid,
    campaign_id: &str,
    window_hours: i64,
) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        select distinct exit_ip
        from proxy_ip_usage
        where tenant_id = $1
          and campaign_id = $2
          and used_at > now() - ($3 * interval '1 hour')
        "#,
    )
    .bind(tenant_id)
    .bind(campaign_id)
    .bind(window_hours)
    .fetch_all(pool)
    .await
    .context("used_exit_ips failed")?;

    Ok(rows.into_iter().map(|(ip,)| ip).collect())
}

/// Record one successful suffix production against an exit IP. Failed
/// attempts never call this - they do not consume the IP budget.
pub async fn record_ip_usage(
    pool: &PgPool,
    tenant_id: Uuid,
    campaign_id: &str,
    exit_ip: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into proxy_ip_usage (tenant_id, campaign_id, exit_ip)
        values ($1, $2, $3)
        "#,
    )
    .bind(tenant_id)
    .bind(campaign_id)
    .bind(exit_ip)
    .execute(pool)
    .await
    .context("record_ip_usage failed")?;
    Ok(())
}

/// Usage rows older than the dedup window are dead weight; purge them.
pub async fn purge_ip_usage_older_than_hours(pool: &PgPool, hours: i64) -> Result<i64> {
    let res = sqlx::query(
        r#"
        delete from proxy_ip_usage
        where used_at < now() - ($1 * interval '1 hour')
        "#,
    )
    .bind(hours)
    .execute(pool)
    .await
    .context("purge_ip_usage_older_than_hours failed")?;
    Ok(res.rows_affected() as i64)
}

// ---------------------------------------------------------------------------
// Replenishment advisory lock
// ---------------------------------------------------------------------------

/// Session-level advisory lock keyed by (tenant, campaign). The caller must
/// hold the connection for the duration of the replenish batch and release
/// with [`advisory_unlock_campaign`]; the lock also dies with the session,
/// so a crashed worker cannot wedge a campaign.
///
/// Returns false when another session already holds the lock.
pub async fn try_advisory_lock_campaign(
    conn: &mut PoolConnection<Postgres>,
    tenant_id: Uuid,
    campaign_id: &str,
) -> Result<bool> {
    let (locked,): (bool,) = sqlx::query_as(
        r#"
        select pg_try_advisory_lock(hashtextextended($1 || '|' || $2, 0))
        "#,
    )
    .bind(tenant_id.to_string())
    .bind(campaign_id)
    .fetch_one(&mut **conn)
    .await
    .context("try_advisory_lock_campaign failed")?;
    Ok(locked)
}

pub async fn advisory_unlock_campaign(
    conn: &mut PoolConnection<Postgres>,
    tenant_id: Uuid,
    campaign_id: &str,
) -> Result<bool> {
    let (released,): (bool,) = sqlx::query_as(
        r#"
        select pg_advisory_unlock(hashtextextended($1 || '|' || $2, 0))
        "#,
    )
    .bind(tenant_id.to_string())
    .bind(campaign_id)
    .fetch_one(&mut **conn)
    .await
    .context("advisory_unlock_campaign failed")?;
    Ok(released)
}
