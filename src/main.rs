// =============================================================================
// Argus Intelligence Engine — Main Entry Point
// =============================================================================
//
// The engine starts Paused and in Paper mode for safety. Operators resume it
// via the dashboard API; live trading requires PREDICTION_PAPER_TRADING=false
// plus venue credentials in the environment.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod bus;
mod news;
mod prediction;
mod resilience;
mod runtime_config;
mod supervisor;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::runtime_config::RuntimeConfig;
use crate::supervisor::Supervisor;
use crate::types::EngineMode;

/// Path of the persisted runtime configuration.
const CONFIG_PATH: &str = "argus_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Argus Intelligence Engine — Starting Up           ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env();

    // SAFETY: always start Paused; the operator resumes explicitly.
    config.engine_mode = EngineMode::Paused;

    info!(
        engine_mode = %config.engine_mode,
        account_mode = %config.account_mode,
        categories = ?config.news_categories,
        "engine starting in SAFE mode (Paused)"
    );

    // ── 2. Build shared state ────────────────────────────────────────────
    let state = Arc::new(AppState::new(config)?);

    // ── 3. Start the API server ──────────────────────────────────────────
    let bind_addr = std::env::var("ARGUS_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    {
        let api_state = state.clone();
        let bind = bind_addr.clone();
        tokio::spawn(async move {
            let app = api::rest::router(api_state);
            let listener = tokio::net::TcpListener::bind(&bind)
                .await
                .expect("failed to bind API server");
            info!(addr = %bind, "API server listening");
            axum::serve(listener, app).await.expect("API server failed");
        });
    }

    // ── 4. Periodic snapshots & health checks ────────────────────────────
    state
        .snapshots
        .start_periodic(tokio::time::Duration::from_secs(300));
    state.breakers.start_health_checks(
        tokio::time::Duration::from_secs(60),
        Vec::new(), // collaborator probes register here in deployments
    );

    // ── 5. Supervisor: news agent + prediction agent ─────────────────────
    let supervisor = Supervisor::new(state.clone());
    let agent_handles = supervisor.start();
    info!(agents = 2, "supervised agents launched");

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    for handle in agent_handles {
        handle.abort();
    }
    state.breakers.stop_health_checks();

    // Final FULL snapshot before exit.
    let final_snapshot = state.snapshots.shutdown();
    info!(
        snapshot_id = %final_snapshot.metadata.id,
        positions = final_snapshot.positions.len(),
        "final snapshot taken"
    );

    if let Err(e) = state.runtime_config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("Argus Intelligence Engine shut down complete.");
    Ok(())
}
