use std::sync::Arc;
use std::time::Duration;

use miette::{IntoDiagnostic, WrapErr};

use encounter_sync::config::{AppConfig, AuthMode};
use encounter_sync::core::collaborators::{
    Authenticator, PassthroughAuthenticator, StaticConditionCatalog, StaticTokenAuthenticator,
    WeakestOpponentAdvisor,
};
use encounter_sync::core::engine::{Engine, EngineServices};
use encounter_sync::core::logging;
use encounter_sync::core::server::{ServerOptions, SyncServer};
use encounter_sync::database::{Database, DatabaseAuthorization};

#[tokio::main]
async fn main() -> miette::Result<()> {
    let config = AppConfig::load().into_diagnostic().wrap_err("Failed to load configuration")?;
    let _log_guard = logging::init(&config.logging, &config.log_dir());
    tracing::info!("{} v{} starting", encounter_sync::NAME, encounter_sync::VERSION);

    let data_dir = config.data_dir();
    let db = Database::new(&data_dir)
        .await
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to open database in {}", data_dir.display()))?;
    tracing::info!(path = %db.path().display(), "Database ready");

    let authenticator: Arc<dyn Authenticator> = match config.auth.mode {
        AuthMode::Passthrough => {
            tracing::warn!("Passthrough authentication enabled; tokens are trusted as user ids");
            Arc::new(PassthroughAuthenticator)
        }
        AuthMode::Static => Arc::new(StaticTokenAuthenticator::new(config.auth.tokens.clone())),
    };

    let db = Arc::new(db);
    let services = EngineServices {
        encounters: db.clone(),
        sessions: db.clone(),
        authorization: Arc::new(DatabaseAuthorization::new((*db).clone())),
        authenticator,
        tokens: db.clone(),
        tactics: Arc::new(WeakestOpponentAdvisor),
        catalog: Arc::new(StaticConditionCatalog::from_lists(
            &config.conditions.stackable,
            &config.conditions.extend_duration,
        )),
    };

    let (engine, synchronizer) = Engine::new(services, config.engine_settings());
    let sync_task = tokio::spawn(synchronizer.run());

    let mut server = SyncServer::new(
        engine.clone(),
        ServerOptions {
            bind: config.bind_addr().into_diagnostic()?,
            path: config.server.path.clone(),
            sweep_interval: config.sweep_interval(),
        },
    );
    let addr = server
        .start()
        .await
        .into_diagnostic()
        .wrap_err("Failed to start WebSocket server")?;
    tracing::info!("Accepting connections on ws://{}{}", addr, config.server.path);

    let failure = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.into_diagnostic().wrap_err("Failed to listen for shutdown signal")?;
            tracing::info!("Shutdown requested");
            None
        }
        exit = server.terminated() => {
            let reason = match exit {
                Ok(()) => "listener closed".to_string(),
                Err(e) => e.to_string(),
            };
            tracing::error!(reason = %reason, "Server stopped unexpectedly; shutting down");
            Some(reason)
        }
    };

    server.stop().await;
    drop(server);
    drop(engine);
    match tokio::time::timeout(Duration::from_secs(5), sync_task).await {
        Ok(Err(e)) => tracing::warn!(error = %e, "Persistence task ended abnormally"),
        Err(_) => tracing::warn!("Persistence task did not stop in time"),
        Ok(Ok(())) => {}
    }
    db.close().await;

    match failure {
        Some(reason) => Err(miette::miette!("WebSocket server stopped unexpectedly: {}", reason)),
        None => Ok(()),
    }
}
