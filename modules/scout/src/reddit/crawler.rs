//! Crawler: incrementally paginates every bound subreddit, deduplicating
//! against posts the store has already seen.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{error, info};

use scout_common::config::ScraperSettings;
use scout_common::Result;

use super::client::MAX_POSTS_PER_REQUEST;
use super::Post;

/// Paged feed of newest posts for a subreddit.
#[async_trait]
pub trait PostFeed: Send + Sync {
    async fn get_posts(
        &self,
        subreddit: &str,
        after: &str,
        limit: usize,
    ) -> Result<(Vec<Post>, Option<String>)>;
}

#[async_trait]
pub trait CrawlerStorage: Send + Sync {
    /// Bulk insert, silently ignoring posts already present.
    async fn insert_posts(&self, posts: &[Post]) -> Result<()>;
    /// Which of `post_ids` the store already has.
    async fn check_presence(&self, post_ids: &[String]) -> Result<HashSet<String>>;
    /// Subreddits that currently have profile bindings.
    async fn subreddits_for_scraping(&self) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, Default)]
struct SubredditPagination {
    /// Listing cursor; empty means "start from the top".
    next: String,
    /// The subreddit is not crawled again before this instant.
    available_at: Option<DateTime<Utc>>,
}

/// Per-subreddit pagination state for one crawler.
#[derive(Debug, Default)]
pub struct Paginator {
    subreddits: HashMap<String, SubredditPagination>,
    already_fully_scanned: HashSet<String>,
}

impl Paginator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cursor(&self, subreddit: &str) -> Option<&str> {
        self.subreddits.get(subreddit).map(|p| p.next.as_str())
    }

    pub fn is_available(&self, subreddit: &str, now: DateTime<Utc>) -> bool {
        self.subreddits
            .get(subreddit)
            .is_some_and(|p| p.available_at.is_none_or(|at| at <= now))
    }

    pub fn has_fully_scanned(&self, subreddit: &str) -> bool {
        self.already_fully_scanned.contains(subreddit)
    }
}

pub struct Crawler {
    feed: Arc<dyn PostFeed>,
    storage: Arc<dyn CrawlerStorage>,
    settings: ScraperSettings,
}

impl Crawler {
    pub fn new(
        feed: Arc<dyn PostFeed>,
        storage: Arc<dyn CrawlerStorage>,
        settings: ScraperSettings,
    ) -> Self {
        Self {
            feed,
            storage,
            settings,
        }
    }

    /// Crawl until shutdown flips. One subreddit page per tick.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            timeout_seconds = self.settings.timeout_seconds,
            error_timeout_seconds = self.settings.error_timeout_seconds,
            timeout_after_full_scan_seconds = self.settings.timeout_after_full_scan_seconds,
            "starting reddit crawler"
        );

        let mut paginator = Paginator::new();
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

            if let Err(err) = self.scrape_tick(&mut paginator).await {
                error!(error = %err, "error crawling subreddits");
                timeout = self.settings.error_timeout();
            }
        }
    }

    /// One crawl step: sync the subreddit set, pick an available subreddit
    /// and process its next page.
    pub async fn scrape_tick(&self, paginator: &mut Paginator) -> Result<()> {
        self.sync_subreddits(paginator).await?;

        let now = Utc::now();
        let subreddit = paginator
            .subreddits
            .keys()
            .find(|name| paginator.is_available(name, now))
            .cloned()
            .ok_or_else(|| anyhow!("no subreddit available for crawling"))?;

        let cursor = paginator.cursor(&subreddit).unwrap_or_default().to_string();
        let (posts, next) = self
            .feed
            .get_posts(&subreddit, &cursor, MAX_POSTS_PER_REQUEST)
            .await?;

        if posts.is_empty() {
            // End of what the listing API serves: cool down and start over
            // from the top next time.
            info!(subreddit = %subreddit, "subreddit exhausted, cooling down");
            paginator.subreddits.insert(
                subreddit.clone(),
                SubredditPagination {
                    next: String::new(),
                    available_at: Some(now + self.settings.timeout_after_full_scan()),
                },
            );
            paginator.already_fully_scanned.insert(subreddit);
            return Ok(());
        }

        let ids: Vec<String> = posts.iter().map(|post| post.id.clone()).collect();
        let present = self.storage.check_presence(&ids).await?;
        let new_posts: Vec<Post> = posts
            .into_iter()
            .filter(|post| !present.contains(&post.id))
            .collect();

        if new_posts.is_empty() {
            let fully_scanned = paginator.has_fully_scanned(&subreddit);

            if fully_scanned || !self.settings.at_least_one_exhausting_scan {
                // Reached a page with nothing new: the rest is known too.
                info!(
                    subreddit = %subreddit,
                    "reached already-seen posts, cooling down and rescanning from the top later"
                );
                paginator.subreddits.insert(
                    subreddit,
                    SubredditPagination {
                        next: String::new(),
                        available_at: Some(now + self.settings.timeout_after_full_scan()),
                    },
                );
                return Ok(());
            }
            // The first pass must walk to the very end regardless of overlap.
        }

        if !new_posts.is_empty() {
            self.storage.insert_posts(&new_posts).await?;
        }

        paginator.subreddits.insert(
            subreddit,
            SubredditPagination {
                next: next.unwrap_or_default(),
                available_at: None,
            },
        );

        for post in &new_posts {
            info!(post_id = post.id.as_str(), "crawled post");
        }

        Ok(())
    }

    /// Load the bound subreddits, adding new ones and dropping removed ones.
    async fn sync_subreddits(&self, paginator: &mut Paginator) -> Result<()> {
        let subreddits = self.storage.subreddits_for_scraping().await?;
        let wanted: HashSet<String> = subreddits.into_iter().collect();

        for subreddit in &wanted {
            paginator
                .subreddits
                .entry(subreddit.clone())
                .or_default();
        }

        paginator
            .subreddits
            .retain(|subreddit, _| wanted.contains(subreddit));

        Ok(())
    }
}
