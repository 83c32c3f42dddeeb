//! NO_STOCK kicks replenishment: with the developer mock fallback on and
//! an affiliate link pointing at the in-process redirect server, a drained
//! pool refills asynchronously and the next window applies.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sfx_config::Settings;
use sfx_engine::Engine;
use sfx_producer::Replenisher;
use sfx_schemas::{ErrorCode, LeaseItem, LeaseOutcome};
use sfx_testkit::RedirectServer;

#[tokio::test]
async fn drained_pool_refills_and_the_next_key_applies() -> anyhow::Result<()> {
    let Some(pool) = sfx_testkit::maybe_db_pool().await? else {
        return Ok(());
    };
    std::env::set_var(sfx_config::ENV_ALLOW_MOCK_SUFFIX, "1");

    let server = RedirectServer::spawn().await?;
    let tenant = sfx_testkit::seed_tenant(&pool).await?;
    let campaign = sfx_testkit::unique_campaign_id("s5");
    sfx_testkit::seed_campaign(&pool, tenant, &campaign).await?;
    sfx_db::insert_affiliate_link(&pool, tenant, &campaign, &server.url("/hop/0"), 1).await?;

    let settings = Settings {
        produce_batch_size: 2,
        low_watermark: 1,
        stock_concurrency: 1,
        ..Default::default()
    };
    let replenisher = Replenisher::new(pool.clone(), settings.clone());
    let engine = Engine::new(pool.clone(), settings, Arc::clone(&replenisher));

    let item = |clicks: i64, key: &str| LeaseItem {
        campaign_id: campaign.clone(),
        now_clicks: clicks,
        observed_at: Utc::now(),
        window_start_epoch_seconds: 1,
        idempotency_key: key.to_string(),
        meta: None,
    };

    // Empty pool: the increment cannot be served this cycle.
    let out = engine.assign_one(tenant, &item(1, "s5-k1")).await;
    match out {
        LeaseOutcome::Error { code, .. } => assert_eq!(code, ErrorCode::NoStock),
        other => panic!("expected NO_STOCK, got {other:?}"),
    }

    // The miss triggered replenishment; wait for stock to appear.
    let mut refilled = false;
    for _ in 0..100 {
        if sfx_db::available_count(&pool, tenant, &campaign).await? > 0 {
            refilled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(refilled, "replenishment did not refill the pool in time");

    // Next cycle, next key: the click is served.
    let out = engine.assign_one(tenant, &item(1, "s5-k2")).await;
    match out {
        LeaseOutcome::Apply {
            final_url_suffix, ..
        } => assert_eq!(final_url_suffix, RedirectServer::LANDING_SUFFIX),
        other => panic!("expected APPLY after refill, got {other:?}"),
    }

    Ok(())
}
