//! Soft-deleted rows are invisible to every read path, and alert inserts
//! deduplicate within their window.

#[tokio::test]
async fn soft_deleted_campaign_is_invisible() -> anyhow::Result<()> {
    let Some(pool) = sfx_testkit::maybe_db_pool().await? else {
        return Ok(());
    };

    let tenant = sfx_testkit::seed_tenant(&pool).await?;
    let campaign = sfx_testkit::unique_campaign_id("softdel");
    sfx_testkit::seed_campaign(&pool, tenant, &campaign).await?;

    assert!(sfx_db::fetch_campaign(&pool, tenant, &campaign)
        .await?
        .is_some());

    sqlx::query(
        "update campaigns set deleted_at = now() where tenant_id = $1 and campaign_id = $2",
    )
    .bind(tenant)
    .bind(&campaign)
    .execute(&pool)
    .await?;

    assert!(
        sfx_db::fetch_campaign(&pool, tenant, &campaign)
            .await?
            .is_none(),
        "soft-deleted campaign must not resolve"
    );

    Ok(())
}

#[tokio::test]
async fn soft_deleted_api_key_stops_resolving() -> anyhow::Result<()> {
    let Some(pool) = sfx_testkit::maybe_db_pool().await? else {
        return Ok(());
    };

    let tenant = sfx_testkit::seed_tenant(&pool).await?;
    let key = sfx_testkit::seed_api_key(&pool, tenant).await?;
    let hash = {
        use sha2::{Digest, Sha256};
        hex::encode(Sha256::digest(key.as_bytes()))
    };

    assert_eq!(
        sfx_db::find_tenant_by_key_hash(&pool, &hash).await?,
        Some(tenant)
    );

    sqlx::query("update api_keys set deleted_at = now() where key_hash = $1")
        .bind(&hash)
        .execute(&pool)
        .await?;

    assert_eq!(sfx_db::find_tenant_by_key_hash(&pool, &hash).await?, None);

    Ok(())
}

#[tokio::test]
async fn alert_insert_dedupes_within_window() -> anyhow::Result<()> {
    let Some(pool) = sfx_testkit::maybe_db_pool().await? else {
        return Ok(());
    };

    let tenant = sfx_testkit::seed_tenant(&pool).await?;
    let campaign = sfx_testkit::unique_campaign_id("alert");

    let first = sfx_db::insert_alert_deduped(
        &pool,
        tenant,
        "stock-empty",
        "warning",
        Some(&campaign),
        "stock empty",
        "available count has been 0 for 20 minutes",
        60,
    )
    .await?;
    assert!(first, "first alert lands");

    let second = sfx_db::insert_alert_deduped(
        &pool,
        tenant,
        "stock-empty",
        "warning",
        Some(&campaign),
        "stock empty",
        "still empty",
        60,
    )
    .await?;
    assert!(!second, "same (tenant, type, campaign) within 1 h is deduped");

    // Different campaign is a different dedup scope.
    let other = sfx_db::insert_alert_deduped(
        &pool,
        tenant,
        "stock-empty",
        "warning",
        Some("other-campaign"),
        "stock empty",
        "",
        60,
    )
    .await?;
    assert!(other);

    let alerts = sfx_db::recent_alerts(&pool, tenant, 10).await?;
    assert_eq!(alerts.len(), 2);

    Ok(())
}
