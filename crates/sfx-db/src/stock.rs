//! Pool items, assignments, click state and write logs.
//!
//! All multi-row transitions here run in a single transaction; pool rows
//! are claimed with `for update skip locked` so two concurrent assigners
//! never consume the same item.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::{invalid_status, is_unique_constraint_violation};

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolItemStatus {
    Available,
    Leased,
    Consumed,
    Failed,
}

impl PoolItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolItemStatus::Available => "available",
            PoolItemStatus::Leased => "leased",
            PoolItemStatus::Consumed => "consumed",
            PoolItemStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "available" => Ok(PoolItemStatus::Available),
            "leased" => Ok(PoolItemStatus::Leased),
            "consumed" => Ok(PoolItemStatus::Consumed),
            "failed" => Ok(PoolItemStatus::Failed),
            other => Err(invalid_status("pool item", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentStatus {
    Leased,
    Consumed,
    Failed,
    Expired,
}

impl AssignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentStatus::Leased => "leased",
            AssignmentStatus::Consumed => "consumed",
            AssignmentStatus::Failed => "failed",
            AssignmentStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "leased" => Ok(AssignmentStatus::Leased),
            "consumed" => Ok(AssignmentStatus::Consumed),
            "failed" => Ok(AssignmentStatus::Failed),
            "expired" => Ok(AssignmentStatus::Expired),
            other => Err(invalid_status("assignment", other)),
        }
    }

    /// Terminal for the assignment; only the pool item may re-enter
    /// `available` from failed/expired.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AssignmentStatus::Leased)
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PoolItemRow {
    pub pool_item_id: i64,
    pub tenant_id: Uuid,
    pub campaign_id: String,
    pub final_url_suffix: String,
    pub exit_ip: String,
    pub source_affiliate_link_id: Option<i64>,
    pub status: PoolItemStatus,
    pub created_at: DateTime<Utc>,
    pub leased_at: Option<DateTime<Utc>>,
    pub consumed_at: Option<DateTime<Utc>>,
}

fn map_pool_item(row: &sqlx::postgres::PgRow) -> Result<PoolItemRow> {
    Ok(PoolItemRow {
        pool_item_id: row.try_get("pool_item_id")?,
        tenant_id: row.try_get("tenant_id")?,
        campaign_id: row.try_get("campaign_id")?,
        final_url_suffix: row.try_get("final_url_suffix")?,
        exit_ip: row.try_get("exit_ip")?,
        source_affiliate_link_id: row.try_get("source_affiliate_link_id")?,
        status: PoolItemStatus::parse(&row.try_get::<String, _>("status")?)?,
        created_at: row.try_get("created_at")?,
        leased_at: row.try_get("leased_at")?,
        consumed_at: row.try_get("consumed_at")?,
    })
}

#[derive(Debug, Clone)]
pub struct AssignmentRow {
    pub assignment_id: Uuid,
    pub tenant_id: Uuid,
    pub campaign_id: String,
    pub pool_item_id: i64,
    pub final_url_suffix: String,
    pub idempotency_key: String,
    pub now_clicks_at_assign: i64,
    pub window_start_epoch_seconds: i64,
    pub status: AssignmentStatus,
    pub applied: Option<bool>,
    pub error_message: Option<String>,
    pub assigned_at: DateTime<Utc>,
    pub acked_at: Option<DateTime<Utc>>,
}

const ASSIGNMENT_COLS: &str = r#"assignment_id, tenant_id, campaign_id, pool_item_id,
       final_url_suffix, idempotency_key, now_clicks_at_assign,
       window_start_epoch_seconds, status, applied, error_message,
       assigned_at, acked_at"#;

fn map_assignment(row: &sqlx::postgres::PgRow) -> Result<AssignmentRow> {
    Ok(AssignmentRow {
        assignment_id: row.try_get("assignment_id")?,
        tenant_id: row.try_get("tenant_id")?,
        campaign_id: row.try_get("campaign_id")?,
        pool_item_id: row.try_get("pool_item_id")?,
        final_url_suffix: row.try_get("final_url_suffix")?,
        idempotency_key: row.try_get("idempotency_key")?,
        now_clicks_at_assign: row.try_get("now_clicks_at_assign")?,
        window_start_epoch_seconds: row.try_get("window_start_epoch_seconds")?,
        status: AssignmentStatus::parse(&row.try_get::<String, _>("status")?)?,
        applied: row.try_get("applied")?,
        error_message: row.try_get("error_message")?,
        assigned_at: row.try_get("assigned_at")?,
        acked_at: row.try_get("acked_at")?,
    })
}

#[derive(Debug, Clone)]
pub struct ClickStateRow {
    pub tenant_id: Uuid,
    pub campaign_id: String,
    pub last_applied_clicks: i64,
    pub last_observed_clicks: i64,
    pub last_observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct WriteLogRow {
    pub write_log_id: i64,
    pub assignment_id: Uuid,
    pub tenant_id: Uuid,
    pub write_success: bool,
    pub write_error_message: Option<String>,
    pub reported_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Pool items
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewPoolItem {
    pub tenant_id: Uuid,
    pub campaign_id: String,
    pub final_url_suffix: String,
    pub exit_ip: String,
    pub source_affiliate_link_id: Option<i64>,
}

/// Insert a freshly produced pool item with status `available`.
pub async fn insert_pool_item(pool: &PgPool, item: &NewPoolItem) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        insert into suffix_pool (
            tenant_id, campaign_id, final_url_suffix, exit_ip, source_affiliate_link_id
        ) values ($1, $2, $3, $4, $5)
        returning pool_item_id
        "#,
    )
    .bind(item.tenant_id)
    .bind(&item.campaign_id)
    .bind(&item.final_url_suffix)
    .bind(&item.exit_ip)
    .bind(item.source_affiliate_link_id)
    .fetch_one(pool)
    .await
    .context("insert_pool_item failed")?;
    Ok(id)
}

/// Current `available` stock for one (tenant, campaign).
pub async fn available_count(pool: &PgPool, tenant_id: Uuid, campaign_id: &str) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as(
        r#"
        select count(*)::bigint
        from suffix_pool
        where tenant_id = $1
          and campaign_id = $2
          and status = 'available'
          and deleted_at is null
        "#,
    )
    .bind(tenant_id)
    .bind(campaign_id)
    .fetch_one(pool)
    .await
    .context("available_count failed")?;
    Ok(n)
}

// ---------------------------------------------------------------------------
// Assignment (the consuming transaction)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TryAssignArgs {
    pub tenant_id: Uuid,
    pub campaign_id: String,
    pub idempotency_key: String,
    pub now_clicks: i64,
    pub window_start_epoch_seconds: i64,
}

/// Why an assignment insert lost; the caller re-reads and replays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignConflict {
    /// Another writer inserted the same (tenant, idempotency_key) first.
    IdempotencyKey,
    /// Another writer holds the single leased slot for this campaign.
    ActiveLease,
}

#[derive(Debug)]
pub enum TryAssignOutcome {
    Assigned(AssignmentRow),
    NoStock,
    Conflict(AssignConflict),
}

/// Atomically lease the oldest available pool item for a campaign.
///
/// One transaction:
/// 1. claim the oldest `available` pool row (`for update skip locked`);
/// 2. transition it to `leased`;
/// 3. insert the assignment (status `leased`, suffix denormalized);
/// 4. bump `last_applied_clicks` monotonically via `greatest(...)`.
///
/// Unique-index losses (idempotency key, one-leased-per-campaign) roll the
/// transaction back and surface as `Conflict` so the engine can re-read the
/// winner and return it - that is the replay path, not an error.
pub async fn try_assign(pool: &PgPool, args: &TryAssignArgs) -> Result<TryAssignOutcome> {
    let mut tx: Transaction<'_, Postgres> =
        pool.begin().await.context("try_assign begin failed")?;

    let claimed = sqlx::query(
        r#"
        select pool_item_id, final_url_suffix
        from suffix_pool
        where tenant_id = $1
          and campaign_id = $2
          and status = 'available'
          and deleted_at is null
        order by created_at asc, pool_item_id asc
        limit 1
        for update skip locked
        "#,
    )
    .bind(args.tenant_id)
    .bind(&args.campaign_id)
    .fetch_optional(&mut *tx)
    .await
    .context("try_assign claim select failed")?;

    let Some(claimed) = claimed else {
        tx.rollback().await.ok();
        return Ok(TryAssignOutcome::NoStock);
    };

    let pool_item_id: i64 = claimed.try_get("pool_item_id")?;
    let final_url_suffix: String = claimed.try_get("final_url_suffix")?;

    sqlx::query(
        r#"
        update suffix_pool
        set status = 'leased',
            leased_at = now()
        where pool_item_id = $1
        "#,
    )
    .bind(pool_item_id)
    .execute(&mut *tx)
    .await
    .context("try_assign pool transition failed")?;

    let assignment_id = Uuid::new_v4();
    let inserted = sqlx::query(&format!(
        r#"
        insert into suffix_assignments (
            assignment_id, tenant_id, campaign_id, pool_item_id, final_url_suffix,
            idempotency_key, now_clicks_at_assign, window_start_epoch_seconds, status
        ) values ($1, $2, $3, $4, $5, $6, $7, $8, 'leased')
        returning {ASSIGNMENT_COLS}
        "#
    ))
    .bind(assignment_id)
    .bind(args.tenant_id)
    .bind(&args.campaign_id)
    .bind(pool_item_id)
    .bind(&final_url_suffix)
    .bind(&args.idempotency_key)
    .bind(args.now_clicks)
    .bind(args.window_start_epoch_seconds)
    .fetch_one(&mut *tx)
    .await;

    let row = match inserted {
        Ok(row) => row,
        Err(e) => {
            tx.rollback().await.ok();
            if is_unique_constraint_violation(&e, "uq_assignments_tenant_idem_live") {
                return Ok(TryAssignOutcome::Conflict(AssignConflict::IdempotencyKey));
            }
            if is_unique_constraint_violation(&e, "uq_assignments_one_leased_live") {
                return Ok(TryAssignOutcome::Conflict(AssignConflict::ActiveLease));
            }
            return Err(anyhow::Error::new(e).context("try_assign insert failed"));
        }
    };

    sqlx::query(
        r#"
        update click_states
        set last_applied_clicks = greatest(last_applied_clicks, $3),
            updated_at = now()
        where tenant_id = $1
          and campaign_id = $2
        "#,
    )
    .bind(args.tenant_id)
    .bind(&args.campaign_id)
    .bind(args.now_clicks)
    .execute(&mut *tx)
    .await
    .context("try_assign click bump failed")?;

    let assignment = map_assignment(&row)?;

    tx.commit().await.context("try_assign commit failed")?;

    Ok(TryAssignOutcome::Assigned(assignment))
}

/// Idempotency lookup: scoped find-first with the soft-delete predicate.
pub async fn find_assignment_by_idempotency_key(
    pool: &PgPool,
    tenant_id: Uuid,
    idempotency_key: &str,
) -> Result<Option<AssignmentRow>> {
    let row = sqlx::query(&format!(
        r#"
        select {ASSIGNMENT_COLS}
        from suffix_assignments
        where tenant_id = $1
          and idempotency_key = $2
          and deleted_at is null
        order by assigned_at asc
        limit 1
        "#
    ))
    .bind(tenant_id)
    .bind(idempotency_key)
    .fetch_optional(pool)
    .await
    .context("find_assignment_by_idempotency_key failed")?;

    row.as_ref().map(map_assignment).transpose()
}

/// The at-most-one active lease for a campaign, if any.
pub async fn find_leased_assignment(
    pool: &PgPool,
    tenant_id: Uuid,
    campaign_id: &str,
) -> Result<Option<AssignmentRow>> {
    let row = sqlx::query(&format!(
        r#"
        select {ASSIGNMENT_COLS}
        from suffix_assignments
        where tenant_id = $1
          and campaign_id = $2
          and status = 'leased'
          and deleted_at is null
        limit 1
        "#
    ))
    .bind(tenant_id)
    .bind(campaign_id)
    .fetch_optional(pool)
    .await
    .context("find_leased_assignment failed")?;

    row.as_ref().map(map_assignment).transpose()
}

// ---------------------------------------------------------------------------
// Click state
// ---------------------------------------------------------------------------

pub async fn fetch_click_state(
    pool: &PgPool,
    tenant_id: Uuid,
    campaign_id: &str,
) -> Result<Option<ClickStateRow>> {
    let row = sqlx::query(
        r#"
        select tenant_id, campaign_id, last_applied_clicks, last_observed_clicks, last_observed_at
        from click_states
        where tenant_id = $1
          and campaign_id = $2
        "#,
    )
    .bind(tenant_id)
    .bind(campaign_id)
    .fetch_optional(pool)
    .await
    .context("fetch_click_state failed")?;

    let Some(row) = row else { return Ok(None) };

    Ok(Some(ClickStateRow {
        tenant_id: row.try_get("tenant_id")?,
        campaign_id: row.try_get("campaign_id")?,
        last_applied_clicks: row.try_get("last_applied_clicks")?,
        last_observed_clicks: row.try_get("last_observed_clicks")?,
        last_observed_at: row.try_get("last_observed_at")?,
    }))
}

/// Upsert the observation side of the click state and return the row as it
/// stood BEFORE this observation (the rollover decision needs the previous
/// `last_observed_at`).
pub async fn upsert_observed_clicks(
    pool: &PgPool,
    tenant_id: Uuid,
    campaign_id: &str,
    observed_clicks: i64,
    observed_at: DateTime<Utc>,
) -> Result<ClickStateRow> {
    let prior = fetch_click_state(pool, tenant_id, campaign_id).await?;

    sqlx::query(
        r#"
        insert into click_states (
            tenant_id, campaign_id, last_applied_clicks, last_observed_clicks, last_observed_at
        ) values ($1, $2, 0, $3, $4)
        on conflict (tenant_id, campaign_id) do update
            set last_observed_clicks = excluded.last_observed_clicks,
                last_observed_at     = excluded.last_observed_at,
                updated_at           = now()
        "#,
    )
    .bind(tenant_id)
    .bind(campaign_id)
    .bind(observed_clicks)
    .bind(observed_at)
    .execute(pool)
    .await
    .context("upsert_observed_clicks failed")?;

    Ok(prior.unwrap_or(ClickStateRow {
        tenant_id,
        campaign_id: campaign_id.to_string(),
        last_applied_clicks: 0,
        last_observed_clicks: observed_clicks,
        last_observed_at: observed_at,
    }))
}

/// Day rollover: zero the applied counter so the fresh day's count becomes
/// the delta.
pub async fn reset_applied_clicks(pool: &PgPool, tenant_id: Uuid, campaign_id: &str) -> Result<()> {
    sqlx::query(
        r#"
        update click_states
        set last_applied_clicks = 0,
            updated_at = now()
        where tenant_id = $1
          and campaign_id = $2
        "#,
    )
    .bind(tenant_id)
    .bind(campaign_id)
    .execute(pool)
    .await
    .context("reset_applied_clicks failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Write reports
// ---------------------------------------------------------------------------

pub async fn find_write_log(pool: &PgPool, assignment_id: Uuid) -> Result<Option<WriteLogRow>> {
    let row = sqlx::query(
        r#"
        select write_log_id, assignment_id, tenant_id, write_success,
               write_error_message, reported_at
        from write_logs
        where assignment_id = $1
        "#,
    )
    .bind(assignment_id)
    .fetch_optional(pool)
    .await
    .context("find_write_log failed")?;

    let Some(row) = row else { return Ok(None) };

    Ok(Some(WriteLogRow {
        write_log_id: row.try_get("write_log_id")?,
        assignment_id: row.try_get("assignment_id")?,
        tenant_id: row.try_get("tenant_id")?,
        write_success: row.try_get("write_success")?,
        write_error_message: row.try_get("write_error_message")?,
        reported_at: row.try_get("reported_at")?,
    }))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportApplyOutcome {
    NotFound,
    AlreadyLogged,
    Applied,
}

#[derive(Debug, Clone)]
pub struct WriteReportArgs {
    pub tenant_id: Uuid,
    pub campaign_id: String,
    pub assignment_id: Uuid,
    pub write_success: bool,
    pub write_error_message: Option<String>,
    pub reported_at: DateTime<Utc>,
}

/// Apply one write-outcome report in a single transaction.
///
/// Success: assignment -> `consumed` (acked, applied=true), pool item ->
/// `consumed`. Failure: assignment -> `failed` (applied=false, message
/// recorded), pool item back to `available` with its lease cleared - the
/// freed suffix is eligible for a future assignment. A write-log row is
/// inserted either way; a pre-existing log row makes the whole call a no-op
/// (`AlreadyLogged`).
pub async fn apply_write_report(pool: &PgPool, args: &WriteReportArgs) -> Result<ReportApplyOutcome> {
    let mut tx: Transaction<'_, Postgres> =
        pool.begin().await.context("apply_write_report begin failed")?;

    let assignment = sqlx::query(
        r#"
        select pool_item_id, status
        from suffix_assignments
        where assignment_id = $1
          and tenant_id = $2
          and campaign_id = $3
          and deleted_at is null
        for update
        "#,
    )
    .bind(args.assignment_id)
    .bind(args.tenant_id)
    .bind(&args.campaign_id)
    .fetch_optional(&mut *tx)
    .await
    .context("apply_write_report assignment select failed")?;

    let Some(assignment) = assignment else {
        tx.rollback().await.ok();
        return Ok(ReportApplyOutcome::NotFound);
    };

    let pool_item_id: i64 = assignment.try_get("pool_item_id")?;

    let existing_log: Option<(i64,)> = sqlx::query_as(
        r#"
        select write_log_id
        from write_logs
        where assignment_id = $1
        "#,
    )
    .bind(args.assignment_id)
    .fetch_optional(&mut *tx)
    .await
    .context("apply_write_report log lookup failed")?;

    if existing_log.is_some() {
        tx.rollback().await.ok();
        return Ok(ReportApplyOutcome::AlreadyLogged);
    }

    if args.write_success {
        sqlx::query(
            r#"
            update suffix_assignments
            set status = 'consumed',
                applied = true,
                acked_at = $2
            where assignment_id = $1
            "#,
        )
        .bind(args.assignment_id)
        .bind(args.reported_at)
        .execute(&mut *tx)
        .await
        .context("apply_write_report consume assignment failed")?;

        sqlx::query(
            r#"
            update suffix_pool
            set status = 'consumed',
                consumed_at = $2
            where pool_item_id = $1
            "#,
        )
        .bind(pool_item_id)
        .bind(args.reported_at)
        .execute(&mut *tx)
        .await
        .context("apply_write_report consume pool item failed")?;
    } else {
        sqlx::query(
            r#"
            update suffix_assignments
            set status = 'failed',
                applied = false,
                acked_at = $2,
                error_message = $3
            where assignment_id = $1
            "#,
        )
        .bind(args.assignment_id)
        .bind(args.reported_at)
        .bind(&args.write_error_message)
        .execute(&mut *tx)
        .await
        .context("apply_write_report fail assignment failed")?;

        sqlx::query(
            r#"
            update suffix_pool
            set status = 'available',
                leased_at = null
            where pool_item_id = $1
              and status = 'leased'
            "#,
        )
        .bind(pool_item_id)
        .execute(&mut *tx)
        .await
        .context("apply_write_report release pool item failed")?;
    }

    sqlx::query(
        r#"
        insert into write_logs (
            assignment_id, tenant_id, write_success, write_error_message, reported_at
        ) values ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(args.assignment_id)
    .bind(args.tenant_id)
    .bind(args.write_success)
    .bind(&args.write_error_message)
    .bind(args.reported_at)
    .execute(&mut *tx)
    .await
    .context("apply_write_report log insert failed")?;

    tx.commit().await.context("apply_write_report commit failed")?;

    Ok(ReportApplyOutcome::Applied)
}

// ---------------------------------------------------------------------------
// Recovery queries
// ---------------------------------------------------------------------------

/// One lease reclaimed by recovery.
#[derive(Debug, Clone)]
pub struct ExpiredLease {
    pub tenant_id: Uuid,
    pub campaign_id: String,
    pub pool_item_id: i64,
}

/// Expire leased assignments older than `ttl_minutes` and return their pool
/// items to `available`. Returns the reclaimed leases so the caller can
/// alert per tenant.
pub async fn expire_stuck_leases(pool: &PgPool, ttl_minutes: i64) -> Result<Vec<ExpiredLease>> {
    let mut tx: Transaction<'_, Postgres> =
        pool.begin().await.context("expire_stuck_leases begin failed")?;

    let rows = sqlx::query(
        r#"
        update suffix_assignments
        set status = 'expired'
        where status = 'leased'
          and deleted_at is null
          and assigned_at < now() - ($1 * interval '1 minute')
        returning tenant_id, campaign_id, pool_item_id
        "#,
    )
    .bind(ttl_minutes)
    .fetch_all(&mut *tx)
    .await
    .context("expire_stuck_leases expire failed")?;

    let mut expired = Vec::with_capacity(rows.len());
    for row in &rows {
        expired.push(ExpiredLease {
            tenant_id: row.try_get("tenant_id")?,
            campaign_id: row.try_get("campaign_id")?,
            pool_item_id: row.try_get("pool_item_id")?,
        });
    }

    if !expired.is_empty() {
        let ids: Vec<i64> = expired.iter().map(|e| e.pool_item_id).collect();
        sqlx::query(
            r#"
            update suffix_pool
            set status = 'available',
                leased_at = null
            where pool_item_id = any($1)
              and status = 'leased'
            "#,
        )
        .bind(&ids)
        .execute(&mut *tx)
        .await
        .context("expire_stuck_leases release failed")?;
    }

    tx.commit().await.context("expire_stuck_leases commit failed")?;

    Ok(expired)
}

/// Sweep stale `available` items (older than `ttl_hours`) to `failed`.
pub async fn fail_stale_available(pool: &PgPool, ttl_hours: i64) -> Result<i64> {
    let res = sqlx::query(
        r#"
        update suffix_pool
        set status = 'failed'
        where status = 'available'
          and deleted_at is null
          and created_at < now() - ($1 * interval '1 hour')
        "#,
    )
    .bind(ttl_hours)
    .execute(pool)
    .await
    .context("fail_stale_available failed")?;
    Ok(res.rows_affected() as i64)
}

#[derive(Debug, Clone)]
pub struct LowStockRow {
    pub tenant_id: Uuid,
    pub campaign_id: String,
    pub available: i64,
}

/// Active campaigns whose available stock is below `low_watermark`.
pub async fn low_stock_campaigns(pool: &PgPool, low_watermark: i64) -> Result<Vec<LowStockRow>> {
    let rows = sqlx::query(
        r#"
        select c.tenant_id, c.campaign_id, count(p.pool_item_id)::bigint as available
        from campaigns c
        left join suffix_pool p
          on p.tenant_id = c.tenant_id
         and p.campaign_id = c.campaign_id
         and p.status = 'available'
         and p.deleted_at is null
        where c.status = 'active'
          and c.deleted_at is null
        group by c.tenant_id, c.campaign_id
        having count(p.pool_item_id) < $1
        order by c.tenant_id, c.campaign_id
        "#,
    )
    .bind(low_watermark)
    .fetch_all(pool)
    .await
    .context("low_stock_campaigns failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(LowStockRow {
            tenant_id: row.try_get("tenant_id")?,
            campaign_id: row.try_get("campaign_id")?,
            available: row.try_get("available")?,
        });
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct ZeroStockRow {
    pub tenant_id: Uuid,
    pub campaign_id: String,
    /// Last instant the pool was known non-empty: the newest pool
    /// transition, falling back to campaign creation.
    pub zero_since: DateTime<Utc>,
}

/// Active campaigns with zero available stock, with the best estimate of
/// when the pool went dry (for the 15/60-minute alert thresholds).
pub async fn zero_stock_campaigns(pool: &PgPool) -> Result<Vec<ZeroStockRow>> {
    let rows = sqlx::query(
        r#"
        select c.tenant_id,
               c.campaign_id,
               coalesce(
                   (select greatest(max(p.leased_at), max(p.consumed_at), max(p.created_at))
                    from suffix_pool p
                    where p.tenant_id = c.tenant_id
                      and p.campaign_id = c.campaign_id
                      and p.deleted_at is null),
                   c.created_at
               ) as zero_since
        from campaigns c
        where c.status = 'active'
          and c.deleted_at is null
          and not exists (
              select 1
              from suffix_pool p
              where p.tenant_id = c.tenant_id
                and p.campaign_id = c.campaign_id
                and p.status = 'available'
                and p.deleted_at is null
          )
        "#,
    )
    .fetch_all(pool)
    .await
    .context("zero_stock_campaigns failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(ZeroStockRow {
            tenant_id: row.try_get("tenant_id")?,
            campaign_id: row.try_get("campaign_id")?,
            zero_since: row.try_get("zero_since")?,
        });
    }
    Ok(out)
}

/// Fetch one pool item by id (tests and recovery introspection).
pub async fn fetch_pool_item(pool: &PgPool, pool_item_id: i64) -> Result<Option<PoolItemRow>> {
    let row = sqlx::query(
        r#"
        select pool_item_id, tenant_id, campaign_id, final_url_suffix, exit_ip,
               source_affiliate_link_id, status, created_at, leased_at, consumed_at
        from suffix_pool
        where pool_item_id = $1
          and deleted_at is null
        "#,
    )
    .bind(pool_item_id)
    .fetch_optional(pool)
    .await
    .context("fetch_pool_item failed")?;

    row.as_ref().map(map_pool_item).transpose()
}
