//! Scheduler: fans newly-enriched posts out to (post × profile) analysis
//! tasks according to each subreddit's profile bindings.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{error, warn};

use scout_common::config::SchedulerSettings;
use scout_common::{AnalysisParameters, NewAnalysisTask, Result, TaskType};

use super::{SubredditSettings, Thread, SOURCE};

#[async_trait]
pub trait SchedulerStorage: Send + Sync {
    /// Enriched, not yet scheduled posts at or above `min_score`, oldest
    /// first.
    async fn posts_for_scheduling(&self, limit: i64, min_score: i32) -> Result<Vec<Thread>>;
    async fn subreddits_settings(&self, subreddits: &[String]) -> Result<Vec<SubredditSettings>>;
    async fn mark_posts_scheduled(&self, post_ids: &[String]) -> Result<()>;
}

/// The slice of the Scout service the scheduler needs.
#[async_trait]
pub trait AnalysisSink: Send + Sync {
    async fn schedule_analysis(&self, tasks: Vec<NewAnalysisTask>) -> Result<()>;
}

#[async_trait]
impl AnalysisSink for crate::Scout {
    async fn schedule_analysis(&self, tasks: Vec<NewAnalysisTask>) -> Result<()> {
        crate::Scout::schedule_analysis(self, tasks).await
    }
}

pub struct Scheduler {
    storage: Arc<dyn SchedulerStorage>,
    sink: Arc<dyn AnalysisSink>,
    settings: SchedulerSettings,
}

impl Scheduler {
    pub fn new(
        storage: Arc<dyn SchedulerStorage>,
        sink: Arc<dyn AnalysisSink>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            storage,
            sink,
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

            if let Err(err) = self.schedule_batch().await {
                error!(error = %err, "schedule posts");
                timeout = self.settings.error_timeout();
            }
        }
    }

    /// Turn one batch of enriched posts into analysis tasks and mark them
    /// scheduled. Posts are only marked after the tasks are durably added,
    /// so a failed add retries the whole batch.
    pub async fn schedule_batch(&self) -> Result<()> {
        let threads = self
            .storage
            .posts_for_scheduling(self.settings.batch_size, self.settings.min_score)
            .await?;

        if threads.is_empty() {
            return Ok(());
        }

        let subreddits: HashSet<String> = threads
            .iter()
            .map(|thread| thread.post.subreddit.clone())
            .collect();
        let subreddits: Vec<String> = subreddits.into_iter().collect();

        let settings_index: HashMap<String, SubredditSettings> = self
            .storage
            .subreddits_settings(&subreddits)
            .await?
            .into_iter()
            .map(|settings| (settings.subreddit.clone(), settings))
            .collect();

        let mut tasks = Vec::new();

        for thread in &threads {
            let Some(subreddit_settings) = settings_index.get(&thread.post.subreddit) else {
                warn!(
                    subreddit = thread.post.subreddit.as_str(),
                    "subreddit has no profile bindings"
                );
                continue;
            };

            for profile_id in &subreddit_settings.profiles {
                tasks.push(NewAnalysisTask {
                    task_type: TaskType::Scheduled,
                    parameters: AnalysisParameters {
                        source: SOURCE.to_string(),
                        source_id: thread.id().to_string(),
                        profile_id: *profile_id,
                        should_save: true,
                    },
                });
            }
        }

        if !tasks.is_empty() {
            self.sink.schedule_analysis(tasks).await?;
        }

        let post_ids: Vec<String> = threads
            .iter()
            .map(|thread| thread.id().to_string())
            .collect();
        self.storage.mark_posts_scheduled(&post_ids).await?;

        Ok(())
    }
}
