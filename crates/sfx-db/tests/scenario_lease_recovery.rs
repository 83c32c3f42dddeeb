//! Stuck-lease recovery: expired assignments are terminal, their pool items
//! return to stock.

use sfx_db::{AssignmentStatus, PoolItemStatus, TryAssignArgs, TryAssignOutcome};

#[tokio::test]
async fn stuck_lease_expires_and_frees_the_pool_item() -> anyhow::Result<()> {
    let Some(pool) = sfx_testkit::maybe_db_pool().await? else {
        return Ok(());
    };

    let tenant = sfx_testkit::seed_tenant(&pool).await?;
    let campaign = sfx_testkit::unique_campaign_id("recov");
    sfx_testkit::seed_campaign(&pool, tenant, &campaign).await?;
    sfx_testkit::seed_pool_item(&pool, tenant, &campaign, "gclid=stuck").await?;

    let out = sfx_db::try_assign(
        &pool,
        &TryAssignArgs {
            tenant_id: tenant,
            campaign_id: campaign.clone(),
            idempotency_key: "k-stuck".to_string(),
            now_clicks: 1,
            window_start_epoch_seconds: 1,
        },
    )
    .await?;
    let assigned = match out {
        TryAssignOutcome::Assigned(a) => a,
        other => anyhow::bail!("expected assignment, got {other:?}"),
    };

    // ttl 0: everything leased before this instant is stuck.
    let expired = sfx_db::expire_stuck_leases(&pool, 0).await?;
    assert!(
        expired.iter().any(|e| e.tenant_id == tenant),
        "our lease is among the {} expired",
        expired.len()
    );

    let a = sfx_db::find_assignment_by_idempotency_key(&pool, tenant, "k-stuck")
        .await?
        .expect("assignment exists");
    assert_eq!(a.status, AssignmentStatus::Expired);

    let item = sfx_db::fetch_pool_item(&pool, assigned.pool_item_id)
        .await?
        .expect("pool item exists");
    assert_eq!(item.status, PoolItemStatus::Available);
    assert!(item.leased_at.is_none(), "lease stamp cleared");

    assert!(
        sfx_db::find_leased_assignment(&pool, tenant, &campaign)
            .await?
            .is_none(),
        "no active lease remains"
    );

    Ok(())
}
