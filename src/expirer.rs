//! the background expiration sweep. Derived from `expirer/expirer.go`:
//! a ticker that, on each tick, selects expired uploads and terminates them
//! one at a time, logging and continuing past individual failures rather
//! than aborting the sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::ExpirationConfig;
use crate::registry::UploadRegistry;
use crate::store::BlobStore;

pub struct Expirer {
    registry: Arc<dyn UploadRegistry>,
    store: Arc<BlobStore>,
    config: ExpirationConfig,
    cancel: CancellationToken,
}

impl Expirer {
    pub fn new(registry: Arc<dyn UploadRegistry>, store: Arc<BlobStore>, config: ExpirationConfig, cancel: CancellationToken) -> Self {
        Self { registry, store, config, cancel }
    }

    /// Runs until `cancel` is triggered.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.check_interval_seconds));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("expirer stopping");
                    return;
                }
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn sweep(&self) {
        let now = now_unix();
        let expired = match self.registry.select_expired(now, self.config.anonymous_ttl_seconds, self.config.identified_ttl_seconds).await {
            Ok(ids) => ids,
            Err(e) => {
                crate::error::log(&e);
                return;
            }
        };

        for id in &expired {
            if let Err(e) = self.store.terminate(id).await {
                tracing::warn!(upload_id = %id, error = %e, "failed to terminate expired upload, will retry next sweep");
            }
        }

        match self.registry.purge_tombstoned(now, self.config.grace_seconds, self.config.anonymous_ttl_seconds, self.config.identified_ttl_seconds).await {
            Ok(purged) if purged > 0 => tracing::debug!(purged, "purged tombstoned upload rows"),
            Ok(_) => {}
            Err(e) => crate::error::log(&e),
        }
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}
