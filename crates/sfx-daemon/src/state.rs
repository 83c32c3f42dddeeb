//! Shared runtime state for sfx-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum. The only process-wide
//! mutable pieces are the rate-limit counters and the replenisher's
//! in-flight set, both created here at startup.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::error;

use sfx_config::Settings;
use sfx_engine::Engine;
use sfx_producer::Replenisher;
use sfx_schemas::JobsStatus;

use crate::ratelimit::RateLimiter;

/// Static build metadata included in health responses.
#[derive(Clone, Debug, serde::Serialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

pub struct AppState {
    pub pool: PgPool,
    pub settings: Settings,
    pub engine: Arc<Engine>,
    pub replenisher: Arc<Replenisher>,
    pub limiter: RateLimiter,
    pub jobs: RwLock<JobsStatus>,
    pub cron_secret: Option<String>,
    pub build: BuildInfo,
}

impl AppState {
    pub fn new(pool: PgPool, settings: Settings) -> Arc<Self> {
        let replenisher = Replenisher::new(pool.clone(), settings.clone());
        let engine = Engine::new(pool.clone(), settings.clone(), Arc::clone(&replenisher));

        Arc::new(Self {
            pool,
            settings,
            engine,
            replenisher,
            limiter: RateLimiter::new(),
            jobs: RwLock::new(JobsStatus::default()),
            cron_secret: std::env::var(sfx_config::ENV_CRON_SECRET).ok(),
            build: BuildInfo {
                service: "sfx-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
        })
    }
}

/// Replenishment cron: scan for low pools on a fixed cadence.
pub fn spawn_replenish_loop(state: Arc<AppState>) {
    let interval = Duration::from_secs(state.settings.replenish_interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match state.replenisher.tick_all().await {
                Ok(summary) => {
                    let mut jobs = state.jobs.write().await;
                    jobs.replenish_last_tick_at = Some(chrono::Utc::now());
                    jobs.replenish_last_triggered = summary.campaigns_triggered;
                }
                Err(e) => error!(error = %e, "replenish tick failed"),
            }
        }
    });
}

/// Recovery cron: stuck leases, stale stock, alerts, retention.
pub fn spawn_recovery_loop(state: Arc<AppState>) {
    let interval = Duration::from_secs(state.settings.recovery_interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match sfx_recovery::run_recovery_tick(&state.pool, &state.settings).await {
                Ok(counts) => {
                    let mut jobs = state.jobs.write().await;
                    jobs.recovery_last_tick_at = Some(chrono::Utc::now());
                    jobs.recovery_last_counts = Some(counts);
                }
                Err(e) => error!(error = %e, "recovery tick failed"),
            }
        }
    });
}
