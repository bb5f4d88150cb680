use std::sync::Arc;

use anyhow::{Context, Result};
use revisit_ledger::{Ledger, SqliteStore};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod events;
mod resolver;

use config::{BusKind, Config};
use dbus_interface::{ResolverService, BUS_NAME, OBJECT_PATH};
use events::{EventBus, EventBusError};
use resolver::IdentityResolver;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    tracing::info!(
        db = %config.db_path.display(),
        threshold = config.match_threshold,
        dim = config.embedding_dim,
        policy = %config.reconcile,
        "revisitd starting"
    );

    let store = SqliteStore::open(&config.db_path)
        .with_context(|| format!("opening {}", config.db_path.display()))?;
    let ledger = Arc::new(Ledger::open(store, config.ledger_options())?);

    let events = EventBus::new(config.event_capacity);
    let resolver = IdentityResolver::new(
        Arc::clone(&ledger),
        config.match_threshold,
        config.embedding_dim,
        events.clone(),
    );
    let engine = engine::spawn_engine(resolver, config.queue_depth)?;

    let service = ResolverService::new(
        engine,
        config.stats_window.as_secs(),
        config.match_threshold,
        config.embedding_dim,
        config.reconcile.to_string(),
    );

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on D-Bus")?;

    // Forward committed resolutions to bus subscribers as signals.
    let iface = connection
        .object_server()
        .interface::<_, ResolverService>(OBJECT_PATH)
        .await?;
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(EventBusError::Lagged(_)) => continue,
                Err(_) => break,
            };
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    tracing::warn!(error = %e, "event serialization failed");
                    continue;
                }
            };
            if let Err(e) = ResolverService::visitor_resolved(iface.signal_emitter(), &json).await {
                tracing::warn!(error = %e, "VisitorResolved signal not sent");
            }
        }
    });

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "revisitd ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("revisitd shutting down");

    Ok(())
}
