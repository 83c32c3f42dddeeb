// crates/sfx-db/src/lib.rs
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;
use sqlx::{postgres::PgPoolOptions, PgPool};
use uuid::Uuid;

pub const ENV_DB_URL: &str = "SFX_DATABASE_URL";

pub mod alerts;
pub mod net;
pub mod stock;

pub use alerts::{
    failed_write_ratios_last_hour, insert_alert_deduped, purge_alerts_older_than_days,
    recent_alerts, AlertRow, WriteRatio,
};
pub use net::{
    advisory_unlock_campaign, assign_proxy_to_tenant, insert_proxy_provider,
    providers_for_tenant, purge_ip_usage_older_than_hours, record_ip_usage,
    try_advisory_lock_campaign, used_exit_ips, ProxyProviderRow,
};
pub use stock::{
    apply_write_report, available_count, expire_stuck_leases, fail_stale_available,
    fetch_click_state, fetch_pool_item, find_assignment_by_idempotency_key,
    find_leased_assignment, find_write_log, insert_pool_item, low_stock_campaigns,
    reset_applied_clicks, try_assign, upsert_observed_clicks, zero_stock_campaigns,
    AssignConflict, AssignmentRow, AssignmentStatus, ClickStateRow, ExpiredLease, LowStockRow,
    NewPoolItem,
    PoolItemRow, PoolItemStatus, ReportApplyOutcome, TryAssignArgs, TryAssignOutcome, WriteLogRow,
    WriteReportArgs, ZeroStockRow,
};

/// Connect to Postgres using SFX_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Test helper used by integration tests:
/// - Connect using SFX_DATABASE_URL
/// - Ensure migrations are applied
pub async fn testkit_db_pool() -> Result<PgPool> {
    let pool = connect_from_env().await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;
    let ok = one == 1;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='suffix_pool'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok,
        has_pool_table: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_pool_table: bool,
}

/// Detect a Postgres unique violation (SQLSTATE 23505) against a specific
/// index or constraint.
pub(crate) fn is_unique_constraint_violation(err: &sqlx::Error, constraint: &str) -> bool {
    let sqlx::Error::Database(db) = err else {
        return false;
    };
    db.code().as_deref() == Some("23505") && db.constraint() == Some(constraint)
}

/// Retryable transaction conflicts: serialization failure / deadlock.
pub fn is_retryable_conflict(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            matches!(db_err.code().as_deref(), Some("40001") | Some("40P01"))
        }
        _ => false,
    }
}

// -----------------------------
// Tenants
// -----------------------------

pub async fn insert_tenant(pool: &PgPool, tenant_id: Uuid, name: &str) -> Result<()> {
    sqlx::query(
        r#"
        insert into tenants (tenant_id, name)
        values ($1, $2)
        on conflict (tenant_id) do nothing
        "#,
    )
    .bind(tenant_id)
    .bind(name)
    .execute(pool)
    .await
    .context("insert_tenant failed")?;
    Ok(())
}

// -----------------------------
// API keys (verification side)
// -----------------------------

/// Register an API-key hash for a tenant. The plaintext key never reaches
/// this crate; callers hash it first.
pub async fn insert_api_key(
    pool: &PgPool,
    tenant_id: Uuid,
    key_hash: &str,
    key_prefix: &str,
    label: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into api_keys (tenant_id, key_hash, key_prefix, label)
        values ($1, $2, $3, $4)
        "#,
    )
    .bind(tenant_id)
    .bind(key_hash)
    .bind(key_prefix)
    .bind(label)
    .execute(pool)
    .await
    .context("insert_api_key failed")?;
    Ok(())
}

/// Resolve an API-key hash to its tenant. Soft-deleted keys do not resolve.
pub async fn find_tenant_by_key_hash(pool: &PgPool, key_hash: &str) -> Result<Option<Uuid>> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        select tenant_id
        from api_keys
        where key_hash = $1
          and deleted_at is null
        limit 1
        "#,
    )
    .bind(key_hash)
    .fetch_optional(pool)
    .await
    .context("find_tenant_by_key_hash failed")?;
    Ok(row.map(|(t,)| t))
}

// -----------------------------
// Campaigns
// -----------------------------

#[derive(Debug, Clone)]
pub struct CampaignRow {
    pub campaign_pk: i64,
    pub tenant_id: Uuid,
    pub campaign_id: String,
    pub display_name: String,
    pub country_code: String,
    pub final_url: String,
    pub external_account_id: String,
    pub status: String,
    pub time_zone: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

fn map_campaign(row: &sqlx::postgres::PgRow) -> Result<CampaignRow> {
    Ok(CampaignRow {
        campaign_pk: row.try_get("campaign_pk")?,
        tenant_id: row.try_get("tenant_id")?,
        campaign_id: row.try_get("campaign_id")?,
        display_name: row.try_get("display_name")?,
        country_code: row.try_get("country_code")?,
        final_url: row.try_get("final_url")?,
        external_account_id: row.try_get("external_account_id")?,
        status: row.try_get("status")?,
        time_zone: row.try_get("time_zone")?,
        last_synced_at: row.try_get("last_synced_at")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Scoped find-first with the soft-delete predicate. Uniqueness of
/// (tenant_id, campaign_id) among live rows is an application invariant
/// backed by a partial unique index.
pub async fn fetch_campaign(
    pool: &PgPool,
    tenant_id: Uuid,
    campaign_id: &str,
) -> Result<Option<CampaignRow>> {
    let row = sqlx::query(
        r#"
        select campaign_pk, tenant_id, campaign_id, display_name, country_code,
               final_url, external_account_id, status, time_zone, last_synced_at, created_at
        from campaigns
        where tenant_id = $1
          and campaign_id = $2
          and deleted_at is null
        order by campaign_pk asc
        limit 1
        "#,
    )
    .bind(tenant_id)
    .bind(campaign_id)
    .fetch_optional(pool)
    .await
    .context("fetch_campaign failed")?;

    row.as_ref().map(map_campaign).transpose()
}

#[derive(Debug, Clone, Default)]
pub struct CampaignUpsert {
    pub display_name: Option<String>,
    pub country_code: Option<String>,
    pub final_url: Option<String>,
    pub external_account_id: Option<String>,
    pub status: Option<String>,
    pub time_zone: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

impl UpsertOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpsertOutcome::Created => "created",
            UpsertOutcome::Updated => "updated",
        }
    }
}

/// Create or refresh campaign metadata and bump last_synced_at.
///
/// Absent fields keep their current values on update; on create they fall
/// back to the column defaults.
pub async fn upsert_campaign(
    pool: &PgPool,
    tenant_id: Uuid,
    campaign_id: &str,
    meta: &CampaignUpsert,
) -> Result<UpsertOutcome> {
    let existing = fetch_campaign(pool, tenant_id, campaign_id).await?;

    match existing {
        None => {
            let res = sqlx::query(
                r#"
                insert into campaigns (
                    tenant_id, campaign_id, display_name, country_code, final_url,
                    external_account_id, status, time_zone, last_synced_at
                ) values (
                    $1, $2, coalesce($3, ''), coalesce($4, ''), coalesce($5, ''),
                    coalesce($6, ''), coalesce($7, 'active'), $8, now()
                )
                "#,
            )
            .bind(tenant_id)
            .bind(campaign_id)
            .bind(&meta.display_name)
            .bind(&meta.country_code)
            .bind(&meta.final_url)
            .bind(&meta.external_account_id)
            .bind(&meta.status)
            .bind(&meta.time_zone)
            .execute(pool)
            .await;

            match res {
                Ok(_) => Ok(UpsertOutcome::Created),
                // Lost a concurrent-create race: the row exists now, refresh it.
                Err(e) if is_unique_constraint_violation(&e, "uq_campaigns_tenant_campaign_live") => {
                    update_campaign_meta(pool, tenant_id, campaign_id, meta).await?;
                    Ok(UpsertOutcome::Updated)
                }
                Err(e) => Err(anyhow::Error::new(e).context("upsert_campaign insert failed")),
            }
        }
        Some(_) => {
            update_campaign_meta(pool, tenant_id, campaign_id, meta).await?;
            Ok(UpsertOutcome::Updated)
        }
    }
}

async fn update_campaign_meta(
    pool: &PgPool,
    tenant_id: Uuid,
    campaign_id: &str,
    meta: &CampaignUpsert,
) -> Result<()> {
    sqlx::query(
        r#"
        update campaigns
        set display_name        = coalesce($3, display_name),
            country_code        = coalesce($4, country_code),
            final_url           = coalesce($5, final_url),
            external_account_id = coalesce($6, external_account_id),
            status              = coalesce($7, status),
            time_zone           = coalesce($8, time_zone),
            last_synced_at      = now()
        where tenant_id = $1
          and campaign_id = $2
          and deleted_at is null
        "#,
    )
    .bind(tenant_id)
    .bind(campaign_id)
    .bind(&meta.display_name)
    .bind(&meta.country_code)
    .bind(&meta.final_url)
    .bind(&meta.external_account_id)
    .bind(&meta.status)
    .bind(&meta.time_zone)
    .execute(pool)
    .await
    .context("update_campaign_meta failed")?;
    Ok(())
}

// -----------------------------
// Affiliate links
// -----------------------------

#[derive(Debug, Clone)]
pub struct AffiliateLinkRow {
    pub affiliate_link_id: i64,
    pub tenant_id: Uuid,
    pub campaign_id: String,
    pub entry_url: String,
    pub priority: i32,
    pub enabled: bool,
}

pub async fn insert_affiliate_link(
    pool: &PgPool,
    tenant_id: Uuid,
    campaign_id: &str,
    entry_url: &str,
    priority: i32,
) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        insert into affiliate_links (tenant_id, campaign_id, entry_url, priority)
        values ($1, $2, $3, $4)
        returning affiliate_link_id
        "#,
    )
    .bind(tenant_id)
    .bind(campaign_id)
    .bind(entry_url)
    .bind(priority)
    .fetch_one(pool)
    .await
    .context("insert_affiliate_link failed")?;
    Ok(id)
}

/// The entry URL the producer routes through: best-priority enabled link
/// (lower priority value wins, ties broken by insertion order).
pub async fn best_affiliate_link(
    pool: &PgPool,
    tenant_id: Uuid,
    campaign_id: &str,
) -> Result<Option<AffiliateLinkRow>> {
    let row = sqlx::query(
        r#"
        select affiliate_link_id, tenant_id, campaign_id, entry_url, priority, enabled
        from affiliate_links
        where tenant_id = $1
          and campaign_id = $2
          and enabled = true
          and deleted_at is null
        order by priority asc, affiliate_link_id asc
        limit 1
        "#,
    )
    .bind(tenant_id)
    .bind(campaign_id)
    .fetch_optional(pool)
    .await
    .context("best_affiliate_link failed")?;

    let Some(row) = row else { return Ok(None) };

    Ok(Some(AffiliateLinkRow {
        affiliate_link_id: row.try_get("affiliate_link_id")?,
        tenant_id: row.try_get("tenant_id")?,
        campaign_id: row.try_get("campaign_id")?,
        entry_url: row.try_get("entry_url")?,
        priority: row.try_get("priority")?,
        enabled: row.try_get("enabled")?,
    }))
}

// -----------------------------
// Audit log (append-only)
// -----------------------------

/// Insert one audit row (append-only semantics enforced at app layer:
/// nothing in this crate updates or deletes audit_log).
pub async fn insert_audit_event(
    pool: &PgPool,
    tenant_id: Uuid,
    action: &str,
    subject: &str,
    payload: Value,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into audit_log (tenant_id, action, subject, payload)
        values ($1, $2, $3, $4)
        "#,
    )
    .bind(tenant_id)
    .bind(action)
    .bind(subject)
    .bind(payload)
    .execute(pool)
    .await
    .context("insert_audit_event failed")?;
    Ok(())
}

/// Parse helper shared by the status enums in `stock`.
pub(crate) fn invalid_status(kind: &str, got: &str) -> anyhow::Error {
    anyhow!("invalid {kind} status: {got}")
}
