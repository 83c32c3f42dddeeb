//! Proxy selection for suffix production: tenant-assigned providers in
//! priority order, each probed for its real exit IP, skipping IPs the
//! campaign already used within the dedup window.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Result;
use sqlx::PgPool;
use tracing::{debug, warn};
use uuid::Uuid;

use sfx_db::ProxyProviderRow;
use sfx_tracker::ProxyEndpoint;

mod probe;
mod template;

pub use probe::{parse_probe_body, ExitIpProber, HttpProber, ProbeResult};
pub use template::ExpandCtx;

/// Exit IPs burn for this long per (tenant, campaign).
pub const IP_REUSE_WINDOW_HOURS: i64 = 24;

/// One usable proxy candidate: provider, expanded endpoint, probed egress.
#[derive(Debug, Clone)]
pub struct SelectedProxy {
    pub provider_id: i64,
    pub provider_name: String,
    pub endpoint: ProxyEndpoint,
    pub exit_ip: String,
    pub country: Option<String>,
}

/// Iterator-style selector over one pass. Each provider is considered at
/// most once; the used-IP set grows as the caller records successes so a
/// batch never reuses an exit IP it just burned.
pub struct ProxySelector {
    providers: Vec<ProxyProviderRow>,
    cursor: usize,
    used_ips: HashSet<String>,
    ctx: ExpandCtx,
}

impl ProxySelector {
    /// Load the candidate set for (tenant, campaign) from the store:
    /// enabled assigned providers in priority order plus the trailing-24h
    /// used-IP set.
    pub async fn for_campaign(
        pool: &PgPool,
        tenant_id: Uuid,
        campaign_id: &str,
        country: &str,
    ) -> Result<Self> {
        let providers = sfx_db::providers_for_tenant(pool, tenant_id).await?;
        let used = sfx_db::used_exit_ips(pool, tenant_id, campaign_id, IP_REUSE_WINDOW_HOURS)
            .await?;
        Ok(Self::new(providers, used, country))
    }

    pub fn new(providers: Vec<ProxyProviderRow>, used_ips: Vec<String>, country: &str) -> Self {
        Self {
            providers,
            cursor: 0,
            used_ips: used_ips.into_iter().collect(),
            ctx: ExpandCtx::new(country),
        }
    }

    /// Providers not yet consumed by this pass.
    pub fn remaining(&self) -> usize {
        self.providers.len().saturating_sub(self.cursor)
    }

    /// A successful production burns the IP for the rest of this pass.
    pub fn mark_used(&mut self, exit_ip: &str) {
        self.used_ips.insert(exit_ip.to_string());
    }

    /// Advance to the next usable proxy: expand credentials, probe the exit
    /// IP, skip dead proxies and reused IPs. Returns None when the pass is
    /// exhausted.
    pub async fn next_usable<P: ExitIpProber>(&mut self, prober: &P) -> Result<Option<SelectedProxy>> {
        while self.cursor < self.providers.len() {
            let provider = self.providers[self.cursor].clone();
            self.cursor += 1;

            let endpoint = ProxyEndpoint {
                host: provider.host.clone(),
                port: provider.port as u16,
                username: self.ctx.expand(&provider.username_template),
                password: provider.password.clone(),
            };

            let probed = match prober.probe(&endpoint).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(
                        provider = %provider.name,
                        error = %e,
                        "proxy probe failed, skipping"
                    );
                    continue;
                }
            };

            if self.used_ips.contains(&probed.exit_ip) {
                debug!(
                    provider = %provider.name,
                    exit_ip = %probed.exit_ip,
                    "exit ip reused within 24h, skipping"
                );
                continue;
            }

            return Ok(Some(SelectedProxy {
                provider_id: provider.proxy_provider_id,
                provider_name: provider.name,
                endpoint,
                exit_ip: probed.exit_ip,
                country: probed.country,
            }));
        }
        Ok(None)
    }
}

/// Default probe timeout when no settings object is at hand.
pub fn default_prober() -> HttpProber {
    HttpProber::new(Duration::from_secs(8))
}
