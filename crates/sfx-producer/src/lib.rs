//! Suffix production: one affiliate entry URL in, one (suffix, exit IP)
//! pool item out, routed through a selected proxy and the redirect tracker.

use std::time::Duration;

use anyhow::{Context, Result};
use rand::distr::Alphanumeric;
use rand::Rng;
use serde_json::json;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use sfx_config::Settings;
use sfx_proxy::{ExitIpProber, HttpProber, ProxySelector};
use sfx_tracker::{suffix_of, track, TrackArgs};

pub mod replenish;

pub use replenish::Replenisher;

/// Exit-IP marker for items produced without a proxy (mock/direct paths).
const DIRECT_EXIT_IP: &str = "0.0.0.0";

#[derive(Debug, Clone)]
pub struct ProduceArgs {
    pub tenant_id: Uuid,
    pub campaign_id: String,
    pub affiliate_link_id: i64,
    pub affiliate_url: String,
    pub country: String,
}

#[derive(Debug, Clone)]
pub struct ProducedSuffix {
    pub pool_item_id: i64,
    pub final_url_suffix: String,
    pub exit_ip: String,
    pub tracked_url: String,
    pub redirect_count: u32,
}

#[derive(Debug)]
pub enum ProduceOutcome {
    Produced(ProducedSuffix),
    /// Every assigned proxy was tried (or none exist) and none yielded a
    /// usable exit.
    NoProxyAvailable,
    Failed {
        category: &'static str,
        message: String,
    },
}

impl ProduceOutcome {
    pub fn is_produced(&self) -> bool {
        matches!(self, ProduceOutcome::Produced(_))
    }
}

/// Is the developer mock fallback enabled in this environment?
fn mock_fallback_enabled() -> bool {
    std::env::var(sfx_config::ENV_ALLOW_MOCK_SUFFIX)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Produce one pool item for a campaign, with its own selector pass.
/// The whole call is bounded by `produce_total_timeout_secs`.
pub async fn produce_one(
    pool: &PgPool,
    settings: &Settings,
    args: &ProduceArgs,
) -> Result<ProduceOutcome> {
    let mut selector =
        ProxySelector::for_campaign(pool, args.tenant_id, &args.campaign_id, &args.country).await?;
    let prober = HttpProber::new(Duration::from_secs(settings.probe_timeout_secs));

    let budget = Duration::from_secs(settings.produce_total_timeout_secs);
    match tokio::time::timeout(
        budget,
        produce_with_selector(pool, settings, &mut selector, &prober, args),
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(_) => Ok(ProduceOutcome::Failed {
            category: "timeout",
            message: format!("produce budget of {budget:?} exceeded"),
        }),
    }
}

/// Core production step over a caller-owned selector (batch mode shares one
/// selector across calls so the pass never re-probes consumed providers).
pub async fn produce_with_selector<P: ExitIpProber>(
    pool: &PgPool,
    settings: &Settings,
    selector: &mut ProxySelector,
    prober: &P,
    args: &ProduceArgs,
) -> Result<ProduceOutcome> {
    match reqwest::Url::parse(&args.affiliate_url) {
        Ok(u) if matches!(u.scheme(), "http" | "https") => {}
        _ => {
            return Ok(ProduceOutcome::Failed {
                category: "invalid-url",
                message: format!("affiliate url is not http(s): {}", args.affiliate_url),
            })
        }
    }

    while let Some(candidate) = selector.next_usable(prober).await? {
        let outcome = track(&TrackArgs {
            url: args.affiliate_url.clone(),
            proxy: Some(candidate.endpoint.clone()),
            initial_referer: None,
            max_redirects: settings.max_redirects,
            per_request_timeout: Duration::from_secs(settings.redirect_step_timeout_secs),
            total_timeout: Duration::from_secs(settings.produce_total_timeout_secs),
            retry_count: 0,
        })
        .await?;

        if !outcome.success {
            // Connection-class or terminal-status: either way this candidate
            // is spent; move to the next proxy. Failed attempts never record
            // IP usage.
            warn!(
                provider = %candidate.provider_name,
                exit_ip = %candidate.exit_ip,
                category = ?outcome.error_category.map(|c| c.as_str()),
                "tracking through proxy failed"
            );
            continue;
        }

        let final_url = reqwest::Url::parse(&outcome.final_url)
            .context("tracker returned an unparseable final url")?;
        let suffix = suffix_of(&final_url);

        return finish_produced(
            pool,
            args,
            suffix,
            candidate.exit_ip,
            outcome.final_url,
            outcome.chain.len() as u32,
            selector,
            false,
        )
        .await;
    }

    if !mock_fallback_enabled() {
        return Ok(ProduceOutcome::NoProxyAvailable);
    }

    // Developer fallback, never a production path: try the chain directly,
    // and if even that fails emit a synthetic marker suffix.
    let direct = track(&TrackArgs {
        url: args.affiliate_url.clone(),
        proxy: None,
        initial_referer: None,
        max_redirects: settings.max_redirects,
        per_request_timeout: Duration::from_secs(settings.redirect_step_timeout_secs),
        total_timeout: Duration::from_secs(settings.produce_total_timeout_secs),
        retry_count: 0,
    })
    .await?;

    if direct.success {
        let final_url = reqwest::Url::parse(&direct.final_url)
            .context("tracker returned an unparseable final url")?;
        let suffix = suffix_of(&final_url);
        return finish_produced(
            pool,
            args,
            suffix,
            DIRECT_EXIT_IP.to_string(),
            direct.final_url,
            direct.chain.len() as u32,
            selector,
            true,
        )
        .await;
    }

    let marker: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    finish_produced(
        pool,
        args,
        format!("mock=1&mid={marker}"),
        DIRECT_EXIT_IP.to_string(),
        args.affiliate_url.clone(),
        0,
        selector,
        true,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn finish_produced(
    pool: &PgPool,
    args: &ProduceArgs,
    suffix: String,
    exit_ip: String,
    tracked_url: String,
    redirect_count: u32,
    selector: &mut ProxySelector,
    mock: bool,
) -> Result<ProduceOutcome> {
    // Usage is recorded only after a suffix actually composed; the order
    // matters so failed walks never burn the IP budget.
    if exit_ip != DIRECT_EXIT_IP {
        sfx_db::record_ip_usage(pool, args.tenant_id, &args.campaign_id, &exit_ip).await?;
        selector.mark_used(&exit_ip);
    }

    let pool_item_id = sfx_db::insert_pool_item(
        pool,
        &sfx_db::NewPoolItem {
            tenant_id: args.tenant_id,
            campaign_id: args.campaign_id.clone(),
            final_url_suffix: suffix.clone(),
            exit_ip: exit_ip.clone(),
            source_affiliate_link_id: Some(args.affiliate_link_id),
        },
    )
    .await?;

    sfx_db::insert_audit_event(
        pool,
        args.tenant_id,
        "suffix.produced",
        &args.campaign_id,
        json!({
            "poolItemId": pool_item_id,
            "exitIp": exit_ip,
            "redirectCount": redirect_count,
            "mock": mock,
        }),
    )
    .await?;

    info!(
        tenant_id = %args.tenant_id,
        campaign_id = %args.campaign_id,
        pool_item_id,
        exit_ip = %exit_ip,
        redirect_count,
        mock,
        "suffix produced"
    );

    Ok(ProduceOutcome::Produced(ProducedSuffix {
        pool_item_id,
        final_url_suffix: suffix,
        exit_ip,
        tracked_url,
        redirect_count,
    }))
}

#[derive(Debug, Clone, Default)]
pub struct ProduceBatchReport {
    pub requested: i64,
    pub produced: i64,
    /// True when the proxy pass ran dry before reaching the target.
    pub exhausted: bool,
}

/// Serial batch: one selector pass shared across attempts so every success
/// grows the in-pass used-IP set.
pub async fn produce_batch(
    pool: &PgPool,
    settings: &Settings,
    tenant_id: Uuid,
    campaign_id: &str,
    count: i64,
) -> Result<ProduceBatchReport> {
    let mut report = ProduceBatchReport {
        requested: count,
        ..Default::default()
    };
    if count <= 0 {
        return Ok(report);
    }

    let Some(link) = sfx_db::best_affiliate_link(pool, tenant_id, campaign_id).await? else {
        warn!(%tenant_id, campaign_id, "no enabled affiliate link; cannot produce");
        return Ok(report);
    };
    let campaign = sfx_db::fetch_campaign(pool, tenant_id, campaign_id).await?;
    let country = campaign.map(|c| c.country_code).unwrap_or_default();

    let args = ProduceArgs {
        tenant_id,
        campaign_id: campaign_id.to_string(),
        affiliate_link_id: link.affiliate_link_id,
        affiliate_url: link.entry_url,
        country,
    };

    let mut selector =
        ProxySelector::for_campaign(pool, tenant_id, campaign_id, &args.country).await?;
    let prober = HttpProber::new(Duration::from_secs(settings.probe_timeout_secs));

    while report.produced < count {
        let budget = Duration::from_secs(settings.produce_total_timeout_secs);
        let outcome = match tokio::time::timeout(
            budget,
            produce_with_selector(pool, settings, &mut selector, &prober, &args),
        )
        .await
        {
            Ok(outcome) => outcome?,
            Err(_) => {
                report.exhausted = true;
                break;
            }
        };

        match outcome {
            ProduceOutcome::Produced(_) => report.produced += 1,
            ProduceOutcome::NoProxyAvailable => {
                report.exhausted = true;
                break;
            }
            ProduceOutcome::Failed { category, message } => {
                warn!(campaign_id, category, %message, "batch produce attempt failed");
                if selector.remaining() == 0 {
                    report.exhausted = true;
                    break;
                }
            }
        }
    }

    Ok(report)
}
