//! Shared fixtures for the integration tests: seeded tenants/campaigns and
//! an in-process redirect server for tracker/producer tests.
//!
//! DB-backed tests follow the workspace convention: read SFX_DATABASE_URL,
//! skip with an eprintln when it is unset.

use anyhow::Result;
use rand::distr::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use uuid::Uuid;

pub mod redirect_server;

pub use redirect_server::RedirectServer;

/// Connect + migrate, or None when SFX_DATABASE_URL is unset (caller skips).
pub async fn maybe_db_pool() -> Result<Option<PgPool>> {
    if std::env::var(sfx_db::ENV_DB_URL).is_err() {
        eprintln!("SKIP: {} not set", sfx_db::ENV_DB_URL);
        return Ok(None);
    }
    let pool = sfx_db::testkit_db_pool().await?;
    Ok(Some(pool))
}

/// Insert a fresh tenant with a random id.
pub async fn seed_tenant(pool: &PgPool) -> Result<Uuid> {
    let tenant_id = Uuid::new_v4();
    sfx_db::insert_tenant(pool, tenant_id, &format!("test-tenant-{tenant_id}")).await?;
    Ok(tenant_id)
}

/// Insert an active campaign with UTC rollover zone.
pub async fn seed_campaign(pool: &PgPool, tenant_id: Uuid, campaign_id: &str) -> Result<()> {
    sfx_db::upsert_campaign(
        pool,
        tenant_id,
        campaign_id,
        &sfx_db::CampaignUpsert {
            display_name: Some(format!("campaign {campaign_id}")),
            country_code: Some("US".to_string()),
            final_url: Some("https://example.com/".to_string()),
            status: Some("active".to_string()),
            ..Default::default()
        },
    )
    .await?;
    Ok(())
}

/// Generate a well-formed API key (40 chars, ky_test_ prefix), store its
/// hash, return the plaintext for the Authorization header.
pub async fn seed_api_key(pool: &PgPool, tenant_id: Uuid) -> Result<String> {
    let tail: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect();
    let key = format!("ky_test_{tail}");
    let hash = hex::encode(Sha256::digest(key.as_bytes()));
    sfx_db::insert_api_key(pool, tenant_id, &hash, &key[..12], "testkit").await?;
    Ok(key)
}

/// Insert one available pool item and return its id.
pub async fn seed_pool_item(
    pool: &PgPool,
    tenant_id: Uuid,
    campaign_id: &str,
    suffix: &str,
) -> Result<i64> {
    sfx_db::insert_pool_item(
        pool,
        &sfx_db::NewPoolItem {
            tenant_id,
            campaign_id: campaign_id.to_string(),
            final_url_suffix: suffix.to_string(),
            exit_ip: "203.0.113.7".to_string(),
            source_affiliate_link_id: None,
        },
    )
    .await
}

/// A campaign id unique per test run so parallel test binaries sharing one
/// database never collide.
pub fn unique_campaign_id(prefix: &str) -> String {
    let tail: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("{prefix}-{tail}")
}
