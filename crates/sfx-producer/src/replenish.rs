//! Replenishment: keep every (tenant, campaign) pool at the batch size.
//!
//! Two trigger surfaces: the daemon's cron tick (scan everything under the
//! low-water mark) and `trigger_async` from the assignment engine whenever
//! it consumes or misses stock. Duplicate work is fenced twice: an
//! in-process set (fast path, advisory) and a Postgres session advisory
//! lock (the backstop that holds across processes).

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use sqlx::PgPool;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};
use uuid::Uuid;

use sfx_config::Settings;
use sfx_schemas::ReplenishJobSummary;

pub struct Replenisher {
    pool: PgPool,
    settings: Settings,
    /// Campaigns currently being replenished by this process.
    in_flight: Mutex<HashSet<(Uuid, String)>>,
    /// Cross-campaign parallelism bound for the cron tick.
    campaign_sem: Arc<Semaphore>,
}

impl Replenisher {
    pub fn new(pool: PgPool, settings: Settings) -> Arc<Self> {
        let campaign_sem = Arc::new(Semaphore::new(settings.campaign_concurrency.max(1)));
        Arc::new(Self {
            pool,
            settings,
            in_flight: Mutex::new(HashSet::new()),
            campaign_sem,
        })
    }

    /// Fire-and-forget trigger from the request path. Returns immediately;
    /// the work runs on the runtime's worker pool, never on the caller.
    pub fn trigger_async(self: &Arc<Self>, tenant_id: Uuid, campaign_id: &str) {
        let this = Arc::clone(self);
        let campaign_id = campaign_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = this.replenish_campaign(tenant_id, &campaign_id, false).await {
                error!(
                    %tenant_id,
                    campaign_id = %campaign_id,
                    error = %e,
                    "async replenish failed"
                );
            }
        });
    }

    /// Raise one campaign's stock to the batch size. Returns the number of
    /// items produced (0 when another worker holds the campaign or stock is
    /// already healthy and `force` is unset).
    pub async fn replenish_campaign(
        &self,
        tenant_id: Uuid,
        campaign_id: &str,
        force: bool,
    ) -> Result<i64> {
        let key = (tenant_id, campaign_id.to_string());

        // Fast path: someone in this process is already on it.
        {
            let mut guard = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
            if !guard.insert(key.clone()) {
                debug!(%tenant_id, campaign_id, "replenish already in flight here");
                return Ok(0);
            }
        }

        let result = self
            .replenish_campaign_locked(tenant_id, campaign_id, force)
            .await;

        self.in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&key);

        result
    }

    async fn replenish_campaign_locked(
        &self,
        tenant_id: Uuid,
        campaign_id: &str,
        force: bool,
    ) -> Result<i64> {
        // Backstop: the DB advisory lock fences workers in other processes.
        // Held on a dedicated connection so it survives pool churn and dies
        // with the session if we crash.
        let mut conn = self.pool.acquire().await?;
        if !sfx_db::try_advisory_lock_campaign(&mut conn, tenant_id, campaign_id).await? {
            debug!(%tenant_id, campaign_id, "another worker holds the campaign lock");
            return Ok(0);
        }

        let produced = async {
            let available = sfx_db::available_count(&self.pool, tenant_id, campaign_id).await?;
            if !force && available >= self.settings.low_watermark {
                return Ok(0i64);
            }

            let need = (self.settings.produce_batch_size - available).max(0);
            if need == 0 {
                return Ok(0i64);
            }

            info!(
                %tenant_id,
                campaign_id,
                available,
                need,
                "replenishing pool"
            );

            // Within-campaign parallelism follows stock_concurrency; the
            // serial shared-selector batch is the 1-worker case.
            let report = if self.settings.stock_concurrency > 1 {
                self.produce_parallel(tenant_id, campaign_id, need).await?
            } else {
                crate::produce_batch(&self.pool, &self.settings, tenant_id, campaign_id, need)
                    .await?
            };

            if report.produced > 0 {
                sfx_db::insert_audit_event(
                    &self.pool,
                    tenant_id,
                    "stock.replenished",
                    campaign_id,
                    serde_json::json!({
                        "requested": report.requested,
                        "produced": report.produced,
                        "exhausted": report.exhausted,
                    }),
                )
                .await?;
            }

            Ok(report.produced)
        }
        .await;

        // Release regardless of outcome; errors here only leak until the
        // connection closes.
        let _ = sfx_db::advisory_unlock_campaign(&mut conn, tenant_id, campaign_id).await;

        produced
    }

    /// Bounded-parallel production of `need` items. Each task runs its own
    /// selector pass; exit-IP dedup converges through the usage table, which
    /// is the tolerance the produced-item invariant allows for concurrent
    /// producers.
    async fn produce_parallel(
        &self,
        tenant_id: Uuid,
        campaign_id: &str,
        need: i64,
    ) -> Result<crate::ProduceBatchReport> {
        let mut report = crate::ProduceBatchReport {
            requested: need,
            ..Default::default()
        };

        let Some(link) = sfx_db::best_affiliate_link(&self.pool, tenant_id, campaign_id).await?
        else {
            return Ok(report);
        };
        let country = sfx_db::fetch_campaign(&self.pool, tenant_id, campaign_id)
            .await?
            .map(|c| c.country_code)
            .unwrap_or_default();

        let sem = Arc::new(Semaphore::new(self.settings.stock_concurrency));
        let mut handles = Vec::with_capacity(need as usize);
        for _ in 0..need {
            let pool = self.pool.clone();
            let settings = self.settings.clone();
            let sem = Arc::clone(&sem);
            let args = crate::ProduceArgs {
                tenant_id,
                campaign_id: campaign_id.to_string(),
                affiliate_link_id: link.affiliate_link_id,
                affiliate_url: link.entry_url.clone(),
                country: country.clone(),
            };
            handles.push(tokio::spawn(async move {
                let Ok(_permit) = sem.acquire().await else {
                    return false;
                };
                matches!(
                    crate::produce_one(&pool, &settings, &args).await,
                    Ok(crate::ProduceOutcome::Produced(_))
                )
            }));
        }

        for h in handles {
            if h.await.unwrap_or(false) {
                report.produced += 1;
            }
        }
        report.exhausted = report.produced < need;
        Ok(report)
    }

    /// One cron tick: find every (tenant, campaign) below the low-water
    /// mark and replenish them, bounded by `campaign_concurrency`.
    pub async fn tick_all(self: &Arc<Self>) -> Result<ReplenishJobSummary> {
        let low = sfx_db::low_stock_campaigns(&self.pool, self.settings.low_watermark).await?;
        let scanned = low.len() as i64;

        let mut handles = Vec::with_capacity(low.len());
        for row in low {
            let this = Arc::clone(self);
            let sem = Arc::clone(&self.campaign_sem);
            handles.push(tokio::spawn(async move {
                let Ok(_permit) = sem.acquire().await else {
                    return false;
                };
                match this
                    .replenish_campaign(row.tenant_id, &row.campaign_id, false)
                    .await
                {
                    Ok(n) => n > 0,
                    Err(e) => {
                        error!(
                            tenant_id = %row.tenant_id,
                            campaign_id = %row.campaign_id,
                            error = %e,
                            "tick replenish failed"
                        );
                        false
                    }
                }
            }));
        }

        let mut triggered = 0i64;
        for h in handles {
            if h.await.unwrap_or(false) {
                triggered += 1;
            }
        }

        Ok(ReplenishJobSummary {
            campaigns_scanned: scanned,
            campaigns_triggered: triggered,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}
