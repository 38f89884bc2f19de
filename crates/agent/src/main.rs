mod api;
mod config;
mod reconcile;
mod state;
mod store;
mod web;
mod zone;

use anyhow::Result;
use std::{env, sync::Arc};
use tokio::sync::{mpsc, RwLock};
use tracing_subscriber::EnvFilter;

use api::ApiClient;
use reconcile::Reconciler;
use state::{SharedState, SystemState};
use store::Store;
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config (file optional, env overrides win) ───────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let mut cfg = if std::path::Path::new(&config_path).exists() {
        config::load(&config_path)?
    } else {
        tracing::info!("no config file at {config_path} — using defaults");
        config::Config::default()
    };

    if let Ok(url) = env::var("BACKEND_URL") {
        cfg.backend_url = url;
    }
    if let Ok(dir) = env::var("STORE_DIR") {
        cfg.store_dir = dir;
    }
    if let Some(port) = env::var("WEB_PORT").ok().and_then(|s| s.parse().ok()) {
        cfg.web_port = port;
    }
    cfg.validate()?;

    // ── Store + backend client ──────────────────────────────────────
    let store = Store::open(&cfg.store_dir)?;
    let api = ApiClient::new(&cfg.backend_url, cfg.request_timeout())?;

    tracing::info!(
        backend = %cfg.backend_url,
        store = %cfg.store_dir,
        poll_sec = cfg.poll_interval_sec,
        "agent starting"
    );

    let reconciler = Arc::new(Reconciler::new(
        api,
        store,
        cfg.connected_zone_id.clone(),
        cfg.seed_zone(),
    ));

    // ── Shared state (what the presentation API reads) ──────────────
    let shared: SharedState = Arc::new(RwLock::new(SystemState::new()));
    {
        let mut st = shared.write().await;
        st.record_system("agent started".to_string());
    }

    let (trigger_tx, trigger_rx) = mpsc::channel(16);

    // ── Presentation API ────────────────────────────────────────────
    let app_state = AppState {
        shared: Arc::clone(&shared),
        reconciler: Arc::clone(&reconciler),
        triggers: trigger_tx,
        critical_moisture: cfg.critical_moisture,
    };
    let web_port = cfg.web_port;
    tokio::spawn(async move {
        web::serve(app_state, web_port).await;
    });

    // ── Reconciliation loop (foreground) ────────────────────────────
    reconcile::run(
        reconciler,
        shared,
        trigger_rx,
        cfg.poll_interval(),
        cfg.critical_moisture,
    )
    .await;

    Ok(())
}
