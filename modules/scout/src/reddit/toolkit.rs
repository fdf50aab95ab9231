//! The Reddit side of the core's source seam: analysis by post id, raw post
//! access, subreddit profile bindings, and historic post enumeration.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;

use scout_common::{Detection, ProfileSettings, Result, ScoutError, SourcePost};

use super::analyzer::ThreadAnalyzer;
use super::{SubredditSettings, Thread};
use crate::scout::SourceToolkit;

#[async_trait]
pub trait ToolkitStorage: Send + Sync {
    /// Enriched threads by post id. Posts without a stored thread are
    /// omitted.
    async fn get_threads(&self, post_ids: &[String]) -> Result<Vec<Thread>>;
    /// Raw crawl-time post payloads by id.
    async fn get_raw_posts(&self, post_ids: &[String]) -> Result<Vec<(String, serde_json::Value)>>;
    async fn all_subreddit_settings(&self) -> Result<Vec<SubredditSettings>>;
    async fn subreddit_settings_with_profile(
        &self,
        profile_id: i64,
    ) -> Result<Vec<SubredditSettings>>;
    async fn add_profiles_to_subreddit(&self, subreddit: &str, profile_ids: &[i64]) -> Result<()>;
    async fn remove_profiles_from_subreddit(
        &self,
        subreddit: &str,
        profile_ids: &[i64],
    ) -> Result<()>;
    async fn remove_profile_from_all_subreddits(&self, profile_id: i64) -> Result<()>;
    /// Ids of already-scheduled posts in the subreddits, newest first,
    /// optionally windowed to the last `days` days and capped at `limit`.
    async fn scheduled_post_ids_in_subreddits(
        &self,
        subreddits: &[String],
        days: Option<i64>,
        limit: Option<i64>,
    ) -> Result<Vec<String>>;
}

pub struct Toolkit {
    storage: Arc<dyn ToolkitStorage>,
    analyzer: Arc<dyn ThreadAnalyzer>,
}

impl Toolkit {
    pub fn new(storage: Arc<dyn ToolkitStorage>, analyzer: Arc<dyn ThreadAnalyzer>) -> Self {
        Self { storage, analyzer }
    }

    pub async fn all_subreddit_settings(&self) -> Result<Vec<SubredditSettings>> {
        self.storage.all_subreddit_settings().await
    }

    pub async fn subreddit_settings_with_profile(
        &self,
        profile_id: i64,
    ) -> Result<Vec<SubredditSettings>> {
        self.storage.subreddit_settings_with_profile(profile_id).await
    }

    pub async fn add_profiles_to_subreddit(
        &self,
        subreddit: &str,
        profile_ids: &[i64],
    ) -> Result<()> {
        self.storage
            .add_profiles_to_subreddit(subreddit, profile_ids)
            .await
    }

    pub async fn remove_profiles_from_subreddit(
        &self,
        subreddit: &str,
        profile_ids: &[i64],
    ) -> Result<()> {
        self.storage
            .remove_profiles_from_subreddit(subreddit, profile_ids)
            .await
    }
}

#[async_trait]
impl SourceToolkit for Toolkit {
    async fn analyze(&self, source_id: &str, settings: &ProfileSettings) -> Result<Detection> {
        let ids = [source_id.to_string()];
        let threads = self.storage.get_threads(&ids).await?;

        let thread = threads
            .first()
            .ok_or_else(|| ScoutError::NotFound(format!("post {source_id}")))?;

        self.analyzer.analyze(thread, settings).await
    }

    async fn delete_profile(&self, profile_id: i64) -> Result<()> {
        self.storage
            .remove_profile_from_all_subreddits(profile_id)
            .await
    }

    async fn get_source_posts(&self, source_ids: &[String]) -> Result<Vec<SourcePost>> {
        let raw_posts = self.storage.get_raw_posts(source_ids).await?;

        Ok(raw_posts
            .into_iter()
            .filter(|(_, post)| !post.is_null())
            .map(|(source_id, post)| SourcePost { source_id, post })
            .collect())
    }

    async fn scheduled_source_ids(
        &self,
        profile_ids: &[i64],
        days: Option<i64>,
        limit: Option<i64>,
    ) -> Result<Vec<String>> {
        // Invert bindings into profile → subreddits once, then walk the
        // requested profiles.
        let all_settings = self.storage.all_subreddit_settings().await?;

        let mut profile_to_subreddits: HashMap<i64, HashSet<String>> = HashMap::new();
        for settings in &all_settings {
            for profile_id in &settings.profiles {
                profile_to_subreddits
                    .entry(*profile_id)
                    .or_default()
                    .insert(settings.subreddit.clone());
            }
        }

        let mut source_ids: HashSet<String> = HashSet::new();

        for profile_id in profile_ids {
            let Some(subreddits) = profile_to_subreddits.get(profile_id) else {
                continue;
            };
            let subreddits: Vec<String> = subreddits.iter().cloned().collect();

            let post_ids = self
                .storage
                .scheduled_post_ids_in_subreddits(&subreddits, days, limit)
                .await?;

            source_ids.extend(post_ids);
        }

        Ok(source_ids.into_iter().collect())
    }
}
