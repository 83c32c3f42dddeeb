//! Write-report transitions: success consumes, failure frees the pool item,
//! and a second report of either kind is a no-op.

use chrono::Utc;
use sfx_db::{
    AssignmentStatus, PoolItemStatus, ReportApplyOutcome, TryAssignArgs, TryAssignOutcome,
    WriteReportArgs,
};

async fn assign_one(
    pool: &sqlx::PgPool,
    tenant: uuid::Uuid,
    campaign: &str,
    key: &str,
) -> anyhow::Result<sfx_db::AssignmentRow> {
    let out = sfx_db::try_assign(
        pool,
        &TryAssignArgs {
            tenant_id: tenant,
            campaign_id: campaign.to_string(),
            idempotency_key: key.to_string(),
            now_clicks: 5,
            window_start_epoch_seconds: 1,
        },
    )
    .await?;
    match out {
        TryAssignOutcome::Assigned(a) => Ok(a),
        other => anyhow::bail!("expected assignment, got {other:?}"),
    }
}

#[tokio::test]
async fn failed_write_recovers_the_pool_item() -> anyhow::Result<()> {
    let Some(pool) = sfx_testkit::maybe_db_pool().await? else {
        return Ok(());
    };

    let tenant = sfx_testkit::seed_tenant(&pool).await?;
    let campaign = sfx_testkit::unique_campaign_id("wfail");
    sfx_testkit::seed_campaign(&pool, tenant, &campaign).await?;
    sfx_testkit::seed_pool_item(&pool, tenant, &campaign, "gclid=zzz").await?;

    let assigned = assign_one(&pool, tenant, &campaign, "k1").await?;

    let outcome = sfx_db::apply_write_report(
        &pool,
        &WriteReportArgs {
            tenant_id: tenant,
            campaign_id: campaign.clone(),
            assignment_id: assigned.assignment_id,
            write_success: false,
            write_error_message: Some("ad platform 500".to_string()),
            reported_at: Utc::now(),
        },
    )
    .await?;
    assert_eq!(outcome, ReportApplyOutcome::Applied);

    let item = sfx_db::fetch_pool_item(&pool, assigned.pool_item_id)
        .await?
        .expect("pool item exists");
    assert_eq!(
        item.status,
        PoolItemStatus::Available,
        "failed write returns the suffix to stock"
    );

    let a = sfx_db::find_assignment_by_idempotency_key(&pool, tenant, "k1")
        .await?
        .expect("assignment exists");
    assert_eq!(a.status, AssignmentStatus::Failed);
    assert_eq!(a.applied, Some(false));

    // The freed suffix serves the next window.
    let again = assign_one(&pool, tenant, &campaign, "k2").await?;
    assert_eq!(again.final_url_suffix, "gclid=zzz");

    Ok(())
}

#[tokio::test]
async fn successful_write_consumes_and_replays_are_noops() -> anyhow::Result<()> {
    let Some(pool) = sfx_testkit::maybe_db_pool().await? else {
        return Ok(());
    };

    let tenant = sfx_testkit::seed_tenant(&pool).await?;
    let campaign = sfx_testkit::unique_campaign_id("wok");
    sfx_testkit::seed_campaign(&pool, tenant, &campaign).await?;
    sfx_testkit::seed_pool_item(&pool, tenant, &campaign, "gclid=ok").await?;

    let assigned = assign_one(&pool, tenant, &campaign, "k1").await?;

    let report = WriteReportArgs {
        tenant_id: tenant,
        campaign_id: campaign.clone(),
        assignment_id: assigned.assignment_id,
        write_success: true,
        write_error_message: None,
        reported_at: Utc::now(),
    };

    assert_eq!(
        sfx_db::apply_write_report(&pool, &report).await?,
        ReportApplyOutcome::Applied
    );
    assert_eq!(
        sfx_db::apply_write_report(&pool, &report).await?,
        ReportApplyOutcome::AlreadyLogged,
        "second report must not re-apply"
    );

    let item = sfx_db::fetch_pool_item(&pool, assigned.pool_item_id)
        .await?
        .expect("pool item exists");
    assert_eq!(item.status, PoolItemStatus::Consumed);
    assert!(item.consumed_at.is_some());

    let log = sfx_db::find_write_log(&pool, assigned.assignment_id)
        .await?
        .expect("write log exists");
    assert!(log.write_success);

    let missing = sfx_db::apply_write_report(
        &pool,
        &WriteReportArgs {
            assignment_id: uuid::Uuid::new_v4(),
            ..report
        },
    )
    .await?;
    assert_eq!(missing, ReportApplyOutcome::NotFound);

    Ok(())
}
