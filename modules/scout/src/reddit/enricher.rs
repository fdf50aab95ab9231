//! Enricher: fetches the full comment thread for crawled posts once they are
//! old enough for their comment sections to have settled.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tracing::{error, info};

use scout_common::config::EnricherSettings;
use scout_common::Result;

use super::Thread;

#[async_trait]
pub trait ThreadFetcher: Send + Sync {
    async fn get_thread(&self, id: &str) -> Result<Thread>;
}

#[async_trait]
pub trait EnricherStorage: Send + Sync {
    /// Ids of posts that are not enriched yet and were created before
    /// `created_before`, oldest first.
    async fn posts_for_enrichment(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>>;
    /// Store the fetched threads and flip the posts to enriched.
    async fn enrich_posts(&self, threads: &[Thread]) -> Result<()>;
}

pub struct Enricher {
    fetcher: Arc<dyn ThreadFetcher>,
    storage: Arc<dyn EnricherStorage>,
    settings: EnricherSettings,
}

impl Enricher {
    pub fn new(
        fetcher: Arc<dyn ThreadFetcher>,
        storage: Arc<dyn EnricherStorage>,
        settings: EnricherSettings,
    ) -> Self {
        Self {
            fetcher,
            storage,
            settings,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut timeout = self.settings.timeout();

        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(timeout) => {}
            }
            if *shutdown.borrow() {
                return;
            }

            timeout = self.settings.timeout();

            if let Err(err) = self.enrich_batch(&shutdown).await {
                error!(error = %err, "error enriching posts");
                timeout = self.settings.error_timeout();
            }
        }
    }

    /// Fetch threads for one batch of aged posts through a bounded worker
    /// pool and persist them together.
    pub async fn enrich_batch(&self, shutdown: &watch::Receiver<bool>) -> Result<()> {
        let cutoff = Utc::now() - self.settings.min_post_age();

        let post_ids = self
            .storage
            .posts_for_enrichment(cutoff, self.settings.batch_size)
            .await?;

        if post_ids.is_empty() {
            return Ok(());
        }

        let threads: Vec<Thread> = stream::iter(post_ids)
            .map(|post_id| async move {
                match self.load_thread(&post_id, shutdown).await {
                    Ok(thread) => Some(thread),
                    Err(err) => {
                        error!(post_id = %post_id, error = %err, "error loading thread");
                        None
                    }
                }
            })
            .buffer_unordered(self.settings.workers.max(1))
            .filter_map(|thread| async move { thread })
            .collect()
            .await;

        if threads.is_empty() {
            return Ok(());
        }

        self.retry(shutdown, || async {
            self.storage.enrich_posts(&threads).await
        })
        .await?;

        for thread in &threads {
            info!(post_id = thread.id(), "enriched post");
        }

        Ok(())
    }

    async fn load_thread(&self, post_id: &str, shutdown: &watch::Receiver<bool>) -> Result<Thread> {
        self.retry(shutdown, || async { self.fetcher.get_thread(post_id).await })
            .await
    }

    /// Up to `retries` attempts, sleeping `error_timeout` between failures.
    /// Bails out early on shutdown.
    async fn retry<T, F, Fut>(&self, shutdown: &watch::Receiver<bool>, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut shutdown = shutdown.clone();
        let mut last_error = None;

        for _ in 0..self.settings.retries.max(1) {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    error!(error = %err, "attempt failed");
                    last_error = Some(err);

                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(self.settings.error_timeout()) => {}
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| scout_common::ScoutError::Other(anyhow::anyhow!("retries exhausted"))))
    }
}
