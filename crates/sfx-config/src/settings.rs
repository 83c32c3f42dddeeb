use crate::LoadedConfig;

/// Typed runtime settings read out of the merged config.
///
/// Every field has a default so an empty config is a working config; the
/// YAML layers only need to state what they override.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Target stock level a replenish pass raises a pool to.
    pub produce_batch_size: i64,
    /// Below this available count a (tenant, campaign) pool is replenished.
    pub low_watermark: i64,
    /// A leased assignment older than this is recoverable.
    pub lease_ttl_minutes: i64,
    /// Available pool items older than this are considered stale.
    pub suffix_ttl_hours: i64,
    /// Parallel producer calls within one campaign.
    pub stock_concurrency: usize,
    /// Parallel campaigns replenishing at once.
    pub campaign_concurrency: usize,
    /// Exit-IP probe timeout, seconds.
    pub probe_timeout_secs: u64,
    /// Per-redirect-step timeout, seconds.
    pub redirect_step_timeout_secs: u64,
    /// Total budget for one produce_one call, seconds.
    pub produce_total_timeout_secs: u64,
    /// Maximum redirect steps the tracker walks.
    pub max_redirects: u32,
    /// Replenish cron cadence, seconds.
    pub replenish_interval_secs: u64,
    /// Recovery cron cadence, seconds.
    pub recovery_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            produce_batch_size: 10,
            low_watermark: 3,
            lease_ttl_minutes: 15,
            suffix_ttl_hours: 48,
            stock_concurrency: 2,
            campaign_concurrency: 4,
            probe_timeout_secs: 8,
            redirect_step_timeout_secs: 15,
            produce_total_timeout_secs: 30,
            max_redirects: 10,
            replenish_interval_secs: 600,
            recovery_interval_secs: 600,
        }
    }
}

impl Settings {
    pub fn from_config(cfg: &LoadedConfig) -> Self {
        let d = Settings::default();
        let int = |ptr: &str, fallback: i64| cfg.i64_at(ptr).unwrap_or(fallback);
        let uint = |ptr: &str, fallback: u64| cfg.u64_at(ptr).unwrap_or(fallback);

        Self {
            produce_batch_size: int("/stock/produce_batch_size", d.produce_batch_size),
            low_watermark: int("/stock/low_watermark", d.low_watermark),
            lease_ttl_minutes: int("/stock/lease_ttl_minutes", d.lease_ttl_minutes),
            suffix_ttl_hours: int("/stock/suffix_ttl_hours", d.suffix_ttl_hours),
            stock_concurrency: uint("/stock/stock_concurrency", d.stock_concurrency as u64)
                as usize,
            campaign_concurrency: uint(
                "/stock/campaign_concurrency",
                d.campaign_concurrency as u64,
            ) as usize,
            probe_timeout_secs: uint("/net/probe_timeout_secs", d.probe_timeout_secs),
            redirect_step_timeout_secs: uint(
                "/net/redirect_step_timeout_secs",
                d.redirect_step_timeout_secs,
            ),
            produce_total_timeout_secs: uint(
                "/net/produce_total_timeout_secs",
                d.produce_total_timeout_secs,
            ),
            max_redirects: uint("/net/max_redirects", d.max_redirects as u64) as u32,
            replenish_interval_secs: uint(
                "/jobs/replenish_interval_secs",
                d.replenish_interval_secs,
            ),
            recovery_interval_secs: uint("/jobs/recovery_interval_secs", d.recovery_interval_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_layers_from_strings;

    #[test]
    fn defaults_match_documented_values() {
        let s = load_layers_from_strings(&["{}"]).unwrap().settings();
        assert_eq!(s.produce_batch_size, 10);
        assert_eq!(s.low_watermark, 3);
        assert_eq!(s.lease_ttl_minutes, 15);
        assert_eq!(s.suffix_ttl_hours, 48);
        assert_eq!(s.probe_timeout_secs, 8);
        assert_eq!(s.redirect_step_timeout_secs, 15);
        assert_eq!(s.produce_total_timeout_secs, 30);
    }

    #[test]
    fn overrides_read_from_their_pointers() {
        let s = load_layers_from_strings(&[
            "stock:\n  produce_batch_size: 25\n  low_watermark: 5\nnet:\n  max_redirects: 20\n",
        ])
        .unwrap()
        .settings();

        assert_eq!(s.produce_batch_size, 25);
        assert_eq!(s.low_watermark, 5);
        assert_eq!(s.max_redirects, 20);
        assert_eq!(s.lease_ttl_minutes, 15, "untouched fields keep defaults");
    }
}
