use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use presence_server::config::ServerConfig;
use presence_server::metrics::{self, Metrics};
use presence_server::net::tls::TlsConfig;
use presence_server::net::transport::PresenceServer;
use presence_server::party::PartyCoordinator;
use presence_server::session::{
    spawn_announcer, AllowAll, Dispatcher, FlushLedger, IdentityResolver, Registry, SessionActor,
};
use presence_server::store::{MemoryStore, RecomputeGate, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Presence Server v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::load_or_default();
    config.validate().map_err(anyhow::Error::msg)?;
    info!(
        "Configuration loaded: {}:{}, game={}, max_session_id={}",
        config.bind_address, config.port, config.game_name, config.max_session_id
    );

    let metrics = Arc::new(Metrics::new());

    let metrics_clone = metrics.clone();
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(metrics_clone, metrics_port).await {
            error!("Metrics server error: {}", e);
        }
    });

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let gate = RecomputeGate::new(config.ranking_poll);
    let ledger = Arc::new(FlushLedger::new());

    let registry = Registry::new(config.max_session_id, config.max_connections_per_ip);
    let (session, actor) =
        SessionActor::spawn(registry, store.clone(), ledger.clone(), metrics.clone());

    let parties = Arc::new(PartyCoordinator::new(
        store.clone(),
        Arc::new(session.clone()),
        metrics.clone(),
    ));
    let identity = IdentityResolver::new(
        store.clone(),
        ledger.clone(),
        Arc::new(AllowAll),
        metrics.clone(),
    );
    let dispatcher = Dispatcher::new(
        session.clone(),
        parties.clone(),
        store.clone(),
        gate,
        metrics.clone(),
    );
    let announcer = spawn_announcer(session.clone(), parties, config.announce_interval);

    let tls_config = TlsConfig::load(
        config.tls_cert_path.as_deref(),
        config.tls_key_path.as_deref(),
    )
    .await?;

    let server = PresenceServer::new(
        config.clone(),
        tls_config,
        session.clone(),
        identity,
        dispatcher,
        metrics,
    );

    info!("Server ready on https://{}", server.bind_addr());
    info!(
        "Chrome flag: --ignore-certificate-errors-spki-list={}",
        server.cert_hash()
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Shutdown signal received");
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
        }
        _ = shutdown => {
            info!("Shutting down...");
        }
    }

    // Replies once every released profile has been written
    announcer.abort();
    if let Err(e) = session.shutdown().await {
        error!("Session shutdown failed: {}", e);
    }
    if let Err(e) = actor.await {
        error!("Session actor panicked: {}", e);
    }
    let unwritten = ledger.unwritten();
    if unwritten > 0 {
        error!("{} profiles could not be written", unwritten);
    }
    info!("Server stopped");

    Ok(())
}
