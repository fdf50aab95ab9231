//! Background reclaimer: releases claims abandoned by crashed or wedged
//! workers so their tasks become claimable again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::error;

use scout_common::config::TaskReclaimerSettings;
use scout_common::Result;

#[async_trait]
pub trait StaleClaimStore: Send + Sync {
    /// Release every claim older than `older_than` on a non-terminal task.
    async fn unclaim_stale(&self, older_than: Duration) -> Result<()>;
}

pub async fn run_reclaimer(
    store: Arc<dyn StaleClaimStore>,
    settings: TaskReclaimerSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(settings.interval()) => {}
        }
        if *shutdown.borrow() {
            return;
        }

        if let Err(err) = store.unclaim_stale(settings.claim_timeout()).await {
            error!(error = %err, "unclaim stale tasks");
        }
    }
}
