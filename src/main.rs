use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kifulab::analysis::AnalysisCoordinator;
use kifulab::server::{self, AppState};
use kifulab::store::SqliteStore;
use kifulab::supervisor::UsiSupervisor;
use kifulab::sync::Synchronizer;
use kifulab_config::{load_env_file, PathManager, Settings};
use kifulab_core::codec::CodecRegistry;
use kifulab_core::tree::Game;

/// Load the last open game, or start a fresh one. The persisted
/// `analysis_enabled` flag is never honored across restarts — analysis must
/// be explicitly re-enabled by the owner.
fn restore_game(store: &SqliteStore) -> Result<Game> {
    let restored = match store.last_game_id()? {
        Some(game_id) => store.get_game_with_tree(&game_id)?,
        None => None,
    };
    let mut game = match restored {
        Some(game) => game,
        None => {
            let game = Game::new(None, None).context("failed to create initial game")?;
            info!("no previous game found; created {}", game.game_id);
            game
        }
    };
    if game.analysis_enabled() {
        game.set_analysis_enabled(false);
    }
    store.put_game(&game)?;
    store.set_last_game_id(Some(&game.game_id))?;
    Ok(game)
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env_file();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = Settings::load();
    let db_path = settings
        .db_path
        .clone()
        .or_else(PathManager::db_path)
        .context("could not determine database path")?;

    let store = Arc::new(SqliteStore::open(&db_path).with_context(|| {
        format!("failed to open database at {}", db_path.display())
    })?);
    let game = restore_game(&store)?;
    info!("restored game {} ({})", game.game_id, game.title);

    // Record the engine configuration in use alongside the state it produced.
    store.put_app_state(
        "engine_settings",
        &serde_json::json!({
            "command": settings.engine.command,
            "threads": settings.engine.effective_threads(),
            "hash_mb": settings.engine.hash_mb,
        }),
    )?;

    let (events, _) = broadcast::channel(256);
    let supervisor = Arc::new(UsiSupervisor::new(settings.engine.clone()));
    if !supervisor.is_configured() {
        info!("no USI engine configured; analysis is unavailable (set KIFULAB_ENGINE_CMD)");
    }
    let coordinator = Arc::new(AnalysisCoordinator::new(
        Arc::clone(&supervisor),
        Arc::clone(&store),
        events.clone(),
    ));
    let codecs = Arc::new(CodecRegistry::standard());

    let sync = Synchronizer::spawn(
        Arc::clone(&store),
        Arc::clone(&coordinator),
        Arc::clone(&codecs),
        events,
        game,
    );

    let state = AppState {
        sync,
        store,
        codecs,
        supervisor,
    };

    let listener = TcpListener::bind(&settings.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.listen_addr))?;
    info!("listening on http://{}", settings.listen_addr);

    let serve = server::serve(listener, state);
    tokio::select! {
        result = serve => result.context("server error")?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            coordinator.shutdown().await;
        }
    }
    Ok(())
}
