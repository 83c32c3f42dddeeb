//! sfx-daemon entry point.
//!
//! This file is intentionally thin: it sets up tracing, loads config,
//! connects and migrates the store, builds the shared state, wires
//! middleware, and starts the HTTP server. Route handlers live in
//! `routes.rs`; shared state and background loops live in `state.rs`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use sfx_daemon::{routes, state};
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file does
    // not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let settings = load_settings()?;

    let pool = sfx_db::connect_from_env().await?;
    sfx_db::migrate(&pool).await?;

    let shared = state::AppState::new(pool, settings);

    state::spawn_replenish_loop(Arc::clone(&shared));
    state::spawn_recovery_loop(Arc::clone(&shared));

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(local_ops_cors());

    let addr = bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8787)));
    info!("sfx-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// Config layers come from SFX_CONFIG (comma-separated YAML paths); an
/// unset var means defaults only.
fn load_settings() -> anyhow::Result<sfx_config::Settings> {
    let Ok(raw) = std::env::var("SFX_CONFIG") else {
        return Ok(sfx_config::Settings::default());
    };

    let paths: Vec<&str> = raw.split(',').map(str::trim).filter(|p| !p.is_empty()).collect();
    if paths.is_empty() {
        return Ok(sfx_config::Settings::default());
    }

    let loaded = sfx_config::load_layers(&paths)?;
    info!(config_hash = %loaded.config_hash, layers = paths.len(), "config loaded");
    Ok(loaded.settings())
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var("SFX_DAEMON_ADDR").ok()?.parse().ok()
}

/// Browsers only reach this daemon from ops pages served off localhost;
/// the ad-script talks server-to-server and never preflights.
fn local_ops_cors() -> CorsLayer {
    let origins: Vec<HeaderValue> = ["localhost", "127.0.0.1"]
        .iter()
        .flat_map(|host| {
            [
                format!("http://{host}"),
                format!("http://{host}:3000"),
                format!("http://{host}:5173"),
            ]
        })
        .filter_map(|origin| HeaderValue::from_str(&origin).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
