//! Developer mock-fallback path: with no proxies assigned and the mock
//! toggle on, production tracks the chain directly and still fills the
//! pool with real landing-page suffixes.

use sfx_producer::{produce_one, ProduceArgs, ProduceOutcome, Replenisher};
use sfx_testkit::RedirectServer;

fn small_settings() -> sfx_config::Settings {
    sfx_config::Settings {
        produce_batch_size: 3,
        low_watermark: 2,
        stock_concurrency: 1,
        ..Default::default()
    }
}

#[tokio::test]
async fn direct_mock_production_fills_the_pool() -> anyhow::Result<()> {
    let Some(pool) = sfx_testkit::maybe_db_pool().await? else {
        return Ok(());
    };
    std::env::set_var(sfx_config::ENV_ALLOW_MOCK_SUFFIX, "1");

    let server = RedirectServer::spawn().await?;
    let tenant = sfx_testkit::seed_tenant(&pool).await?;
    let campaign = sfx_testkit::unique_campaign_id("prod");
    sfx_testkit::seed_campaign(&pool, tenant, &campaign).await?;
    let link_id =
        sfx_db::insert_affiliate_link(&pool, tenant, &campaign, &server.url("/hop/1"), 1).await?;

    let settings = small_settings();
    let outcome = produce_one(
        &pool,
        &settings,
        &ProduceArgs {
            tenant_id: tenant,
            campaign_id: campaign.clone(),
            affiliate_link_id: link_id,
            affiliate_url: server.url("/hop/1"),
            country: "US".to_string(),
        },
    )
    .await?;

    let produced = match outcome {
        ProduceOutcome::Produced(p) => p,
        other => anyhow::bail!("expected production, got {other:?}"),
    };
    assert_eq!(
        produced.final_url_suffix,
        RedirectServer::LANDING_SUFFIX,
        "the landing query is the suffix"
    );
    assert!(produced.redirect_count >= 4, "full chain was walked");

    let item = sfx_db::fetch_pool_item(&pool, produced.pool_item_id)
        .await?
        .expect("pool item persisted");
    assert_eq!(item.status, sfx_db::PoolItemStatus::Available);

    // Direct production never burns the IP budget.
    let used = sfx_db::used_exit_ips(&pool, tenant, &campaign, 24).await?;
    assert!(used.is_empty());

    Ok(())
}

#[tokio::test]
async fn replenish_raises_stock_to_batch_size_and_is_idempotent() -> anyhow::Result<()> {
    let Some(pool) = sfx_testkit::maybe_db_pool().await? else {
        return Ok(());
    };
    std::env::set_var(sfx_config::ENV_ALLOW_MOCK_SUFFIX, "1");

    let server = RedirectServer::spawn().await?;
    let tenant = sfx_testkit::seed_tenant(&pool).await?;
    let campaign = sfx_testkit::unique_campaign_id("replen");
    sfx_testkit::seed_campaign(&pool, tenant, &campaign).await?;
    sfx_db::insert_affiliate_link(&pool, tenant, &campaign, &server.url("/hop/0"), 1).await?;

    let replenisher = Replenisher::new(pool.clone(), small_settings());

    let produced = replenisher
        .replenish_campaign(tenant, &campaign, false)
        .await?;
    assert_eq!(produced, 3, "stock raised to produce_batch_size");
    assert_eq!(sfx_db::available_count(&pool, tenant, &campaign).await?, 3);

    // Healthy stock: a second pass is a no-op unless forced.
    let again = replenisher
        .replenish_campaign(tenant, &campaign, false)
        .await?;
    assert_eq!(again, 0);

    Ok(())
}
