//! Click-state bookkeeping: observations always land, the applied counter
//! only moves through greatest() bumps and explicit rollover resets.

use chrono::{TimeZone, Utc};
use sfx_db::{TryAssignArgs, TryAssignOutcome};

#[tokio::test]
async fn applied_clicks_are_monotonic_within_a_day() -> anyhow::Result<()> {
    let Some(pool) = sfx_testkit::maybe_db_pool().await? else {
        return Ok(());
    };

    let tenant = sfx_testkit::seed_tenant(&pool).await?;
    let campaign = sfx_testkit::unique_campaign_id("clicks");
    sfx_testkit::seed_campaign(&pool, tenant, &campaign).await?;
    sfx_testkit::seed_pool_item(&pool, tenant, &campaign, "s=1").await?;

    let t0 = Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap();

    // First observation creates the row with applied = 0.
    let prior = sfx_db::upsert_observed_clicks(&pool, tenant, &campaign, 5, t0).await?;
    assert_eq!(prior.last_applied_clicks, 0);

    let out = sfx_db::try_assign(
        &pool,
        &TryAssignArgs {
            tenant_id: tenant,
            campaign_id: campaign.clone(),
            idempotency_key: "c1".to_string(),
            now_clicks: 5,
            window_start_epoch_seconds: 1,
        },
    )
    .await?;
    assert!(matches!(out, TryAssignOutcome::Assigned(_)));

    let st = sfx_db::fetch_click_state(&pool, tenant, &campaign)
        .await?
        .expect("click state exists");
    assert_eq!(st.last_applied_clicks, 5);
    assert_eq!(st.last_observed_clicks, 5);

    // A lower later observation must not drag the applied counter down:
    // greatest() keeps 5 even if a stale report raced in.
    sqlx::query(
        "update click_states set last_applied_clicks = greatest(last_applied_clicks, $3)
         where tenant_id = $1 and campaign_id = $2",
    )
    .bind(tenant)
    .bind(&campaign)
    .bind(3i64)
    .execute(&pool)
    .await?;

    let st = sfx_db::fetch_click_state(&pool, tenant, &campaign)
        .await?
        .expect("click state exists");
    assert_eq!(st.last_applied_clicks, 5, "greatest() is monotonic");

    // Day rollover resets to zero.
    sfx_db::reset_applied_clicks(&pool, tenant, &campaign).await?;
    let st = sfx_db::fetch_click_state(&pool, tenant, &campaign)
        .await?
        .expect("click state exists");
    assert_eq!(st.last_applied_clicks, 0);

    Ok(())
}

#[tokio::test]
async fn observation_upsert_returns_prior_state() -> anyhow::Result<()> {
    let Some(pool) = sfx_testkit::maybe_db_pool().await? else {
        return Ok(());
    };

    let tenant = sfx_testkit::seed_tenant(&pool).await?;
    let campaign = sfx_testkit::unique_campaign_id("prior");
    sfx_testkit::seed_campaign(&pool, tenant, &campaign).await?;

    let t0 = Utc.with_ymd_and_hms(2025, 1, 10, 23, 59, 0).unwrap();
    let t1 = Utc.with_ymd_and_hms(2025, 1, 11, 0, 1, 0).unwrap();

    sfx_db::upsert_observed_clicks(&pool, tenant, &campaign, 500, t0).await?;

    // The rollover decision needs yesterday's observation stamp, not the
    // one we are writing now.
    let prior = sfx_db::upsert_observed_clicks(&pool, tenant, &campaign, 3, t1).await?;
    assert_eq!(prior.last_observed_at, t0);
    assert_eq!(prior.last_observed_clicks, 500);

    let st = sfx_db::fetch_click_state(&pool, tenant, &campaign)
        .await?
        .expect("click state exists");
    assert_eq!(st.last_observed_at, t1);
    assert_eq!(st.last_observed_clicks, 3);

    Ok(())
}
