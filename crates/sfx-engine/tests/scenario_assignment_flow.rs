//! End-to-end engine scenarios: fresh APPLY, byte-identical replay, second
//! click, NOOP, NO_STOCK, failed-write recovery, active-lease reuse and
//! lazy campaign import.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use sfx_config::Settings;
use sfx_engine::Engine;
use sfx_producer::Replenisher;
use sfx_schemas::{CampaignMeta, ErrorCode, LeaseItem, LeaseOutcome, WriteReport};
use sqlx::PgPool;
use uuid::Uuid;

fn engine(pool: &PgPool) -> Arc<Engine> {
    let settings = Settings::default();
    let replenisher = Replenisher::new(pool.clone(), settings.clone());
    Engine::new(pool.clone(), settings, replenisher)
}

fn item(campaign: &str, clicks: i64, key: &str) -> LeaseItem {
    LeaseItem {
        campaign_id: campaign.to_string(),
        now_clicks: clicks,
        observed_at: Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap(),
        window_start_epoch_seconds: 1_736_935_200,
        idempotency_key: key.to_string(),
        meta: None,
    }
}

fn expect_apply(outcome: &LeaseOutcome) -> (Uuid, String) {
    match outcome {
        LeaseOutcome::Apply {
            assignment_id,
            final_url_suffix,
            ..
        } => (*assignment_id, final_url_suffix.clone()),
        other => panic!("expected APPLY, got {other:?}"),
    }
}

async fn report_success(
    eng: &Engine,
    tenant: Uuid,
    campaign: &str,
    assignment_id: Uuid,
) -> anyhow::Result<()> {
    let out = eng
        .report_one(
            tenant,
            &WriteReport {
                assignment_id,
                campaign_id: campaign.to_string(),
                write_success: true,
                write_error_message: None,
                reported_at: Utc::now(),
            },
        )
        .await;
    anyhow::ensure!(out.ok, "report failed: {}", out.message);
    Ok(())
}

#[tokio::test]
async fn fresh_apply_then_replay_then_second_click_then_noop() -> anyhow::Result<()> {
    let Some(pool) = sfx_testkit::maybe_db_pool().await? else {
        return Ok(());
    };

    let tenant = sfx_testkit::seed_tenant(&pool).await?;
    let campaign = sfx_testkit::unique_campaign_id("flow");
    sfx_testkit::seed_campaign(&pool, tenant, &campaign).await?;
    sfx_testkit::seed_pool_item(&pool, tenant, &campaign, "gclid=abc&t=1").await?;
    let eng = engine(&pool);

    // S1: fresh APPLY hands out the prefilled suffix.
    let s1 = eng.assign_one(tenant, &item(&campaign, 5, "k1")).await;
    let (a1, suffix1) = expect_apply(&s1);
    assert_eq!(suffix1, "gclid=abc&t=1");

    // S2: replay with the same body is byte-identical.
    let s2 = eng.assign_one(tenant, &item(&campaign, 5, "k1")).await;
    assert_eq!(s1, s2, "replay must return the identical outcome");

    // The script wrote the suffix and reports success.
    report_success(&eng, tenant, &campaign, a1).await?;

    // S3: the next click with refilled pool applies a different item.
    sfx_testkit::seed_pool_item(&pool, tenant, &campaign, "gclid=def&t=2").await?;
    let s3 = eng.assign_one(tenant, &item(&campaign, 6, "k2")).await;
    let (a3, suffix3) = expect_apply(&s3);
    assert_ne!(a3, a1);
    assert_eq!(suffix3, "gclid=def&t=2");
    report_success(&eng, tenant, &campaign, a3).await?;

    // S4: same counter again is a NOOP.
    let s4 = eng.assign_one(tenant, &item(&campaign, 6, "k3")).await;
    match s4 {
        LeaseOutcome::Noop { reason, .. } => assert_eq!(reason, "delta≤0"),
        other => panic!("expected NOOP, got {other:?}"),
    }

    Ok(())
}

#[tokio::test]
async fn empty_pool_returns_no_stock() -> anyhow::Result<()> {
    let Some(pool) = sfx_testkit::maybe_db_pool().await? else {
        return Ok(());
    };

    let tenant = sfx_testkit::seed_tenant(&pool).await?;
    let campaign = sfx_testkit::unique_campaign_id("empty");
    sfx_testkit::seed_campaign(&pool, tenant, &campaign).await?;
    let eng = engine(&pool);

    let out = eng.assign_one(tenant, &item(&campaign, 1, "k1")).await;
    match out {
        LeaseOutcome::Error { code, .. } => assert_eq!(code, ErrorCode::NoStock),
        other => panic!("expected NO_STOCK, got {other:?}"),
    }

    Ok(())
}

#[tokio::test]
async fn failed_write_frees_the_suffix_for_the_next_window() -> anyhow::Result<()> {
    let Some(pool) = sfx_testkit::maybe_db_pool().await? else {
        return Ok(());
    };

    let tenant = sfx_testkit::seed_tenant(&pool).await?;
    let campaign = sfx_testkit::unique_campaign_id("s6");
    sfx_testkit::seed_campaign(&pool, tenant, &campaign).await?;
    sfx_testkit::seed_pool_item(&pool, tenant, &campaign, "gclid=recycled").await?;
    let eng = engine(&pool);

    let s1 = eng.assign_one(tenant, &item(&campaign, 5, "k1")).await;
    let (a1, suffix1) = expect_apply(&s1);

    let rep = eng
        .report_one(
            tenant,
            &WriteReport {
                assignment_id: a1,
                campaign_id: campaign.clone(),
                write_success: false,
                write_error_message: Some("ad platform rejected the write".to_string()),
                reported_at: Utc::now(),
            },
        )
        .await;
    assert!(rep.ok);

    // The same suffix serves a fresh APPLY under a new key.
    let s2 = eng.assign_one(tenant, &item(&campaign, 6, "k2")).await;
    let (a2, suffix2) = expect_apply(&s2);
    assert_ne!(a2, a1, "a new assignment record");
    assert_eq!(suffix2, suffix1, "the recovered pool item is reused");

    Ok(())
}

#[tokio::test]
async fn active_lease_is_reused_across_keys_within_a_window() -> anyhow::Result<()> {
    let Some(pool) = sfx_testkit::maybe_db_pool().await? else {
        return Ok(());
    };

    let tenant = sfx_testkit::seed_tenant(&pool).await?;
    let campaign = sfx_testkit::unique_campaign_id("reuse");
    sfx_testkit::seed_campaign(&pool, tenant, &campaign).await?;
    sfx_testkit::seed_pool_item(&pool, tenant, &campaign, "s=1").await?;
    sfx_testkit::seed_pool_item(&pool, tenant, &campaign, "s=2").await?;
    let eng = engine(&pool);

    let first = eng.assign_one(tenant, &item(&campaign, 5, "ka")).await;
    let (a1, suffix1) = expect_apply(&first);

    // The script re-ran mid-window with a fresh key and a higher counter:
    // it must get the lease already out, not a second pool item.
    let second = eng.assign_one(tenant, &item(&campaign, 7, "kb")).await;
    let (a2, suffix2) = expect_apply(&second);
    assert_eq!(a2, a1, "active lease reused");
    assert_eq!(suffix2, suffix1);

    Ok(())
}

#[tokio::test]
async fn unknown_campaign_needs_meta_or_waits_for_import() -> anyhow::Result<()> {
    let Some(pool) = sfx_testkit::maybe_db_pool().await? else {
        return Ok(());
    };

    let tenant = sfx_testkit::seed_tenant(&pool).await?;
    let campaign = sfx_testkit::unique_campaign_id("import");
    let eng = engine(&pool);

    // No metadata anywhere: the client should retry next cycle.
    let out = eng.assign_one(tenant, &item(&campaign, 3, "k1")).await;
    match out {
        LeaseOutcome::Error { code, .. } => assert_eq!(code, ErrorCode::PendingImport),
        other => panic!("expected PENDING_IMPORT, got {other:?}"),
    }

    // A meta block creates the campaign lazily; the item then proceeds to
    // the stock decision (empty pool here, so NO_STOCK).
    let mut with_meta = item(&campaign, 3, "k2");
    with_meta.meta = Some(CampaignMeta {
        display_name: Some("Imported".to_string()),
        country_code: Some("DE".to_string()),
        final_url: Some("https://example.de/".to_string()),
        external_account_id: None,
        status: Some("active".to_string()),
        time_zone: Some("Europe/Berlin".to_string()),
    });
    let out = eng.assign_one(tenant, &with_meta).await;
    match out {
        LeaseOutcome::Error { code, .. } => assert_eq!(code, ErrorCode::NoStock),
        other => panic!("expected NO_STOCK after lazy import, got {other:?}"),
    }

    let created = sfx_db::fetch_campaign(&pool, tenant, &campaign)
        .await?
        .expect("campaign created from meta");
    assert_eq!(created.time_zone.as_deref(), Some("Europe/Berlin"));

    Ok(())
}

#[tokio::test]
async fn day_rollover_resets_the_applied_counter() -> anyhow::Result<()> {
    let Some(pool) = sfx_testkit::maybe_db_pool().await? else {
        return Ok(());
    };

    let tenant = sfx_testkit::seed_tenant(&pool).await?;
    let campaign = sfx_testkit::unique_campaign_id("rollover");
    sfx_testkit::seed_campaign(&pool, tenant, &campaign).await?;
    sfx_testkit::seed_pool_item(&pool, tenant, &campaign, "day=1").await?;
    sfx_testkit::seed_pool_item(&pool, tenant, &campaign, "day=2").await?;
    let eng = engine(&pool);

    // Late on the 10th the counter stands at 500.
    let mut evening = item(&campaign, 500, "r1");
    evening.observed_at = Utc.with_ymd_and_hms(2025, 1, 10, 23, 59, 0).unwrap();
    let (a1, _) = expect_apply(&eng.assign_one(tenant, &evening).await);
    report_success(&eng, tenant, &campaign, a1).await?;

    // Just past local midnight the TODAY counter reads 3.
    let mut morning = item(&campaign, 3, "r2");
    morning.observed_at = Utc.with_ymd_and_hms(2025, 1, 11, 0, 1, 0).unwrap();
    let out = eng.assign_one(tenant, &morning).await;
    expect_apply(&out);

    let st = sfx_db::fetch_click_state(&pool, tenant, &campaign)
        .await?
        .expect("click state exists");
    assert!(
        st.last_applied_clicks >= 3,
        "rollover reset then re-applied, got {}",
        st.last_applied_clicks
    );
    assert!(
        st.last_applied_clicks < 500,
        "the stale day's counter did not survive"
    );

    Ok(())
}
