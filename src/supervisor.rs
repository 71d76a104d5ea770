//! process lifecycle, mirroring `server/server.go`'s `RunServer`:
//! `SIGHUP` tears down and rebuilds the server (config reload) while
//! letting the outgoing instance drain in place, `SIGINT`/`SIGTERM` triggers
//! one graceful shutdown of the whole process.

use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::error::AppError;
use crate::events::EventBus;
use crate::expirer::Expirer;
use crate::http::{self, AppState};
use crate::protocol::Protocol;
use crate::registry::Registry;
use crate::store::BlobStore;

pub struct Supervisor {
    config_path: String,
}

impl Supervisor {
    pub fn new(config_path: String) -> Self {
        Self { config_path }
    }

    /// Runs instances in a loop, rebuilding on `SIGHUP` and returning once a
    /// terminating signal (`SIGINT`/`SIGTERM`) has been handled.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        loop {
            let settings = Arc::new(Settings::load(&self.config_path)?);
            let cancel = CancellationToken::new();
            let (started_tx, started_rx) = oneshot::channel();

            let instance = tokio::spawn(run_instance(settings, cancel.clone(), started_tx));

            let _ = started_rx.await;
            tracing::info!(event = "startup", "tusistor instance is running");

            tokio::select! {
                _ = sighup.recv() => {
                    tracing::info!(event = "config_reload", "reloading configuration");
                    cancel.cancel();
                    let _ = instance.await;
                    continue;
                }
                _ = sigint.recv() => {
                    tracing::info!(event = "shutdown_started", signal = "SIGINT", "shutdown initiated");
                }
                _ = sigterm.recv() => {
                    tracing::info!(event = "shutdown_started", signal = "SIGTERM", "shutdown initiated");
                }
            }

            cancel.cancel();
            let _ = instance.await;
            tracing::info!(event = "shutdown", "shutdown complete");
            return Ok(());
        }
    }
}

async fn run_instance(settings: Arc<Settings>, cancel: CancellationToken, started: oneshot::Sender<()>) -> Result<(), AppError> {
    let registry: Arc<dyn crate::registry::UploadRegistry> = match settings.database.kind {
        crate::config::DatabaseKind::Sqlite => Arc::new(Registry::connect_sqlite(&settings.database.dsn).await?),
        crate::config::DatabaseKind::Postgres => Arc::new(Registry::connect_postgres(&settings.database.dsn).await?),
    };

    let events = Arc::new(EventBus::new());
    let store = Arc::new(BlobStore::new(
        settings.storage.path.clone(),
        settings.storage.shard_layers,
        registry.clone(),
        events.clone(),
        settings.pre_finish_commands.clone(),
    ));

    let expirer = Expirer::new(registry.clone(), store.clone(), settings.expiration.clone(), cancel.clone());
    let expirer_handle = tokio::spawn(expirer.run());

    let protocol = Protocol { registry, store, events: events.clone(), settings: settings.clone() };
    let state = Arc::new(AppState { protocol, settings: settings.clone() });

    let shutdown = {
        let cancel = cancel.clone();
        async move { cancel.cancelled().await }
    };

    if let Err(e) = http::serve(state, shutdown, started).await {
        tracing::error!(error = %e, "http server exited with an error");
    }

    cancel.cancel();
    let _ = expirer_handle.await;
    events.close();
    Ok(())
}
