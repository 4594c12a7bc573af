use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use anteroom_core::fingerprint::Fingerprinter;
use anteroom_core::{
    AdmissionController, Config, CredentialService, Events, KeyRing, NatsPublisher,
    NatsPublisherConfig, QueueCatalog, QueueEngine, Reaper, RedisStore, SessionManager, Store,
};

use anteroom_server::app::{self, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };
    anteroom_core::telemetry::init_tracing(&config.log_level);

    let store: Arc<dyn Store> = Arc::new(RedisStore::connect(&config.store_url).await?);
    store.ping().await?;
    info!(store = %config.store_url, "connected to store");

    let publisher = Arc::new(NatsPublisher::spawn(NatsPublisherConfig::new(
        &config.nats_url,
    ))?);
    let events = Events::new(publisher.clone(), config.event_source.clone());

    // Keys are minted at boot; rotation keeps credentials from the previous
    // key valid for their lifetime, so a restart only invalidates
    // credentials older than the process. Positions are in-memory-store
    // state anyway.
    let credentials = Arc::new(CredentialService::new(
        KeyRing::generate()?,
        store.clone(),
        Duration::from_secs(config.waiting_ttl_s),
    ));
    let catalog = Arc::new(QueueCatalog::new(store.clone(), events.clone()));
    let engine = Arc::new(QueueEngine::new(
        store.clone(),
        catalog.clone(),
        events.clone(),
        config.heartbeat_sample,
    ));
    let sessions = Arc::new(SessionManager::new(store.clone(), events.clone()));

    let shutdown = CancellationToken::new();
    let admission = AdmissionController::new(
        store.clone(),
        catalog.clone(),
        engine.clone(),
        credentials.clone(),
        sessions.clone(),
        events.clone(),
        shutdown.clone(),
    );
    let admission_task = admission.spawn();
    let reaper = Reaper::new(
        store.clone(),
        catalog.clone(),
        events.clone(),
        Duration::from_secs(config.cleanup_interval_s),
        config.reap_batch,
        shutdown.clone(),
    );
    let reaper_task = reaper.spawn();

    let state = AppState {
        store: store.clone(),
        engine,
        catalog,
        sessions,
        credentials,
        fingerprinter: Fingerprinter::new(config.fingerprint_salt.clone()),
        admin_key: config.admin_key.clone(),
        lenient_binding: config.lenient_binding,
        rate_limit_per_minute: app::DEFAULT_RATE_LIMIT_PER_MINUTE,
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "starting HTTP server");

    axum::serve(listener, app::router(state).into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server stopped, winding down workers");
    shutdown.cancel();
    let grace = Duration::from_secs(config.shutdown_grace_s);
    let _ = tokio::time::timeout(grace, async {
        let _ = admission_task.await;
        let _ = reaper_task.await;
    })
    .await;
    publisher.shutdown(grace);

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to install CTRL+C handler");
    }

    info!("received shutdown signal");
}
