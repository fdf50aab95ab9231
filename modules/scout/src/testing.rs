//! In-memory implementations of the store and source seams, for tests.
//!
//! The fakes keep the real semantics where the pipeline depends on them:
//! the task queue honors claim availability and back-off, the profile store
//! enforces the test-mode precondition, the post store tracks the
//! enriched/scheduled lifecycle.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use scout_common::{
    AnalysisTask, Detection, DetectionOrder, DetectionQuery, DetectionRecord, DetectionTags,
    DetectionTagsUpdate, NewAnalysisTask, NewDetection, Profile, ProfileCreateInput,
    ProfileSettings, ProfileSettingsInput, ProfileUpdate, ProfileVersion, Result, ScoutError,
    Setting, TaskType, VersionCreateInput, VersionUpdate,
};

use crate::processor::TaskQueue;
use crate::reclaim::StaleClaimStore;
use crate::reddit::analyzer::ThreadAnalyzer;
use crate::reddit::crawler::{CrawlerStorage, PostFeed};
use crate::reddit::enricher::{EnricherStorage, ThreadFetcher};
use crate::reddit::scheduler::SchedulerStorage;
use crate::reddit::toolkit::ToolkitStorage;
use crate::reddit::{Comment, Post, SubredditSettings, Thread};
use crate::scout::{ScoutStorage, TaskAdder};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn make_post(id: &str, subreddit: &str, score: i32, created_at: DateTime<Utc>) -> Post {
    Post {
        id: id.to_string(),
        full_id: format!("t3_{id}"),
        subreddit: subreddit.to_string(),
        title: format!("post {id}"),
        body: String::new(),
        url: String::new(),
        permalink: format!("/r/{subreddit}/comments/{id}/"),
        score,
        upvote_ratio: 1.0,
        num_comments: 0,
        author: "author".to_string(),
        created_at: Some(created_at),
        nsfw: false,
    }
}

pub fn make_thread(post: Post, comments: Vec<Comment>) -> Thread {
    Thread { post, comments }
}

pub fn settings_input(filter: &str) -> ProfileSettingsInput {
    ProfileSettingsInput {
        relevancy_filter: filter.to_string(),
        extracted_properties: HashMap::new(),
    }
}

// ---------------------------------------------------------------------------
// Task queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StoredTask {
    pub id: i64,
    pub task_type: TaskType,
    pub parameters: scout_common::AnalysisParameters,
    pub errors: Vec<String>,
    pub is_claimed: bool,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claim_available_at: DateTime<Utc>,
    pub committed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl StoredTask {
    fn is_terminal(&self) -> bool {
        self.committed_at.is_some() || self.failed_at.is_some()
    }

    fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        !self.is_claimed && !self.is_terminal() && self.claim_available_at <= now
    }
}

#[derive(Default)]
pub struct MemoryTaskQueue {
    tasks: Mutex<Vec<StoredTask>>,
    next_id: Mutex<i64>,
    error_backoff: Duration,
}

impl MemoryTaskQueue {
    pub fn new(error_backoff: Duration) -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
            next_id: Mutex::new(0),
            error_backoff,
        }
    }

    pub fn snapshot(&self) -> Vec<StoredTask> {
        lock(&self.tasks).clone()
    }

    pub fn committed_ids(&self) -> Vec<i64> {
        lock(&self.tasks)
            .iter()
            .filter(|t| t.committed_at.is_some())
            .map(|t| t.id)
            .collect()
    }

    pub fn failed_ids(&self) -> Vec<i64> {
        lock(&self.tasks)
            .iter()
            .filter(|t| t.failed_at.is_some())
            .map(|t| t.id)
            .collect()
    }

    pub fn task(&self, id: i64) -> Option<StoredTask> {
        lock(&self.tasks).iter().find(|t| t.id == id).cloned()
    }
}

#[async_trait]
impl TaskAdder for MemoryTaskQueue {
    async fn add(&self, new_tasks: Vec<NewAnalysisTask>) -> Result<()> {
        let now = Utc::now();
        let mut tasks = lock(&self.tasks);
        let mut next_id = lock(&self.next_id);

        for task in new_tasks {
            *next_id += 1;
            tasks.push(StoredTask {
                id: *next_id,
                task_type: task.task_type,
                parameters: task.parameters,
                errors: Vec::new(),
                is_claimed: false,
                claimed_at: None,
                claim_available_at: now,
                committed_at: None,
                failed_at: None,
                created_at: now,
            });
        }

        Ok(())
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn claim(
        &self,
        task_types: &[TaskType],
        profile_ids: &[i64],
    ) -> Result<Option<AnalysisTask>> {
        let now = Utc::now();
        let mut tasks = lock(&self.tasks);

        for stored in tasks.iter_mut() {
            if !stored.is_claimable(now) {
                continue;
            }
            if !task_types.contains(&stored.task_type) {
                continue;
            }
            if !profile_ids.contains(&stored.parameters.profile_id) {
                continue;
            }

            stored.is_claimed = true;
            stored.claimed_at = Some(now);

            return Ok(Some(AnalysisTask {
                id: stored.id,
                task_type: stored.task_type,
                parameters: stored.parameters.clone(),
                errors: stored.errors.clone(),
                created_at: stored.created_at,
            }));
        }

        Ok(None)
    }

    async fn unclaim(&self, task_id: i64) -> Result<()> {
        let mut tasks = lock(&self.tasks);
        if let Some(stored) = tasks.iter_mut().find(|t| t.id == task_id) {
            stored.is_claimed = false;
            stored.claimed_at = None;
        }
        Ok(())
    }

    async fn add_error(&self, task_id: i64, message: &str) -> Result<()> {
        let now = Utc::now();
        let mut tasks = lock(&self.tasks);
        if let Some(stored) = tasks.iter_mut().find(|t| t.id == task_id) {
            stored.errors.push(message.to_string());
            stored.claim_available_at = now
                + chrono::Duration::from_std(self.error_backoff)
                    .unwrap_or_else(|_| chrono::Duration::zero());
        }
        Ok(())
    }

    async fn fail(&self, task_id: i64) -> Result<()> {
        let mut tasks = lock(&self.tasks);
        if let Some(stored) = tasks.iter_mut().find(|t| t.id == task_id) {
            stored.failed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn commit(&self, task_id: i64) -> Result<()> {
        let mut tasks = lock(&self.tasks);
        if let Some(stored) = tasks.iter_mut().find(|t| t.id == task_id) {
            stored.committed_at = Some(Utc::now());
        }
        Ok(())
    }
}

#[async_trait]
impl StaleClaimStore for MemoryTaskQueue {
    async fn unclaim_stale(&self, older_than: Duration) -> Result<()> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        let mut tasks = lock(&self.tasks);

        for stored in tasks.iter_mut() {
            if stored.is_claimed
                && !stored.is_terminal()
                && stored.claimed_at.is_some_and(|at| at < cutoff)
            {
                stored.is_claimed = false;
                stored.claimed_at = None;
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scout storage
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ScoutState {
    profiles: HashMap<i64, Profile>,
    next_profile_id: i64,
    detections: Vec<DetectionRecord>,
    next_detection_id: i64,
    tags: HashMap<i64, Option<bool>>,
}

#[derive(Default)]
pub struct MemoryScoutStorage {
    state: Mutex<ScoutState>,
}

impl MemoryScoutStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn detections(&self) -> Vec<DetectionRecord> {
        lock(&self.state).detections.clone()
    }

    fn settings_from_input(
        profile_id: i64,
        version: i64,
        source: Option<&str>,
        input: &ProfileSettingsInput,
    ) -> ProfileSettings {
        ProfileSettings {
            profile_id,
            version,
            source: source.map(str::to_string),
            relevancy_filter: input.relevancy_filter.clone(),
            extracted_properties: input.extracted_properties.clone(),
        }
    }

    fn build_version(
        profile_id: i64,
        version: i64,
        input: &VersionCreateInput,
    ) -> ProfileVersion {
        let now = Utc::now();
        ProfileVersion {
            version,
            test_mode: true,
            default_settings: input
                .default_settings
                .as_ref()
                .map(|s| Self::settings_from_input(profile_id, version, None, s)),
            sources_settings: input
                .sources_settings
                .iter()
                .map(|(source, s)| {
                    (
                        source.clone(),
                        Self::settings_from_input(profile_id, version, Some(source), s),
                    )
                })
                .collect(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[async_trait]
impl ScoutStorage for MemoryScoutStorage {
    async fn get_all_profiles(&self) -> Result<Vec<Profile>> {
        let state = lock(&self.state);
        let mut profiles: Vec<Profile> = state.profiles.values().cloned().collect();
        profiles.sort_by_key(|p| p.id);
        Ok(profiles)
    }

    async fn get_profile(&self, id: i64) -> Result<Option<Profile>> {
        Ok(lock(&self.state).profiles.get(&id).cloned())
    }

    async fn create_profile(&self, input: ProfileCreateInput) -> Result<i64> {
        let mut state = lock(&self.state);
        state.next_profile_id += 1;
        let id = state.next_profile_id;
        let now = Utc::now();

        let version_input = VersionCreateInput {
            default_settings: input.default_settings,
            sources_settings: input.sources_settings,
        };

        state.profiles.insert(
            id,
            Profile {
                id,
                name: input.name,
                selected_version: 1,
                versions: vec![Self::build_version(id, 1, &version_input)],
                created_at: now,
                updated_at: now,
            },
        );

        Ok(id)
    }

    async fn create_profile_version(
        &self,
        profile_id: i64,
        input: VersionCreateInput,
    ) -> Result<i64> {
        let mut state = lock(&self.state);
        let profile = state
            .profiles
            .get_mut(&profile_id)
            .ok_or_else(|| ScoutError::NotFound(format!("profile {profile_id}")))?;

        let version = profile
            .versions
            .iter()
            .map(|v| v.version)
            .max()
            .unwrap_or(0)
            + 1;

        profile
            .versions
            .push(Self::build_version(profile_id, version, &input));

        Ok(version)
    }

    async fn update_profile(&self, update: ProfileUpdate) -> Result<()> {
        let mut state = lock(&self.state);
        if let Some(profile) = state.profiles.get_mut(&update.profile_id) {
            if let Some(name) = update.name {
                profile.name = name;
            }
            profile.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn update_profile_version(
        &self,
        profile_id: i64,
        version: i64,
        update: VersionUpdate,
    ) -> Result<()> {
        let mut state = lock(&self.state);
        let profile = state
            .profiles
            .get_mut(&profile_id)
            .ok_or_else(|| ScoutError::NotFound(format!("profile {profile_id}")))?;

        let target = profile
            .versions
            .iter_mut()
            .find(|v| v.version == version)
            .ok_or_else(|| {
                ScoutError::NotFound(format!("version {version} of profile {profile_id}"))
            })?;

        if !target.test_mode {
            return Err(ScoutError::PreconditionViolated(
                "version is not in test mode".to_string(),
            ));
        }

        match &update.default_settings {
            Setting::Unset => {}
            Setting::Null => target.default_settings = None,
            Setting::Value(input) => {
                target.default_settings =
                    Some(Self::settings_from_input(profile_id, version, None, input));
            }
        }

        for (source, input) in &update.sources_settings {
            match input {
                None => {
                    target.sources_settings.remove(source);
                }
                Some(input) => {
                    target.sources_settings.insert(
                        source.clone(),
                        Self::settings_from_input(profile_id, version, Some(source), input),
                    );
                }
            }
        }

        target.updated_at = Utc::now();
        Ok(())
    }

    async fn deploy_profile_version(&self, profile_id: i64, version: i64) -> Result<()> {
        let mut state = lock(&self.state);
        let profile = state
            .profiles
            .get_mut(&profile_id)
            .ok_or_else(|| ScoutError::NotFound(format!("profile {profile_id}")))?;

        let target = profile
            .versions
            .iter_mut()
            .find(|v| v.version == version)
            .ok_or_else(|| {
                ScoutError::NotFound(format!("version {version} of profile {profile_id}"))
            })?;

        target.test_mode = false;
        target.updated_at = Utc::now();
        profile.selected_version = version;
        profile.updated_at = Utc::now();

        Ok(())
    }

    async fn delete_profile(&self, id: i64) -> Result<()> {
        let mut state = lock(&self.state);
        state.profiles.remove(&id);
        let removed: Vec<i64> = state
            .detections
            .iter()
            .filter(|d| d.profile_id == id)
            .map(|d| d.id)
            .collect();
        state.detections.retain(|d| d.profile_id != id);
        for detection_id in removed {
            state.tags.remove(&detection_id);
        }
        Ok(())
    }

    async fn save_detection(&self, record: NewDetection) -> Result<()> {
        let mut state = lock(&self.state);
        state.next_detection_id += 1;
        let id = state.next_detection_id;
        state.detections.push(DetectionRecord {
            id,
            source: record.source,
            source_id: record.source_id,
            profile_id: record.profile_id,
            version: record.version,
            test_mode: record.test_mode,
            is_relevant: record.is_relevant,
            properties: record.properties,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn list_detections(&self, query: &DetectionQuery) -> Result<Vec<DetectionRecord>> {
        let state = lock(&self.state);

        let mut matching: Vec<DetectionRecord> = state
            .detections
            .iter()
            .filter(|d| match (query.order, query.last_seen_id) {
                (_, None) => true,
                (DetectionOrder::Desc, Some(last)) => d.id < last,
                (DetectionOrder::Asc, Some(last)) => d.id > last,
            })
            .filter(|d| {
                query
                    .filter
                    .is_relevant
                    .is_none_or(|relevant| d.is_relevant == relevant)
            })
            .filter(|d| {
                query
                    .filter
                    .sources
                    .as_ref()
                    .is_none_or(|sources| sources.contains(&d.source))
            })
            .filter(|d| {
                query.filter.profiles.as_ref().is_none_or(|profiles| {
                    profiles.iter().any(|p| {
                        p.profile_id == d.profile_id
                            && (p.source_versions.is_empty()
                                || p.source_versions.iter().any(|sv| {
                                    sv.source.as_ref().is_none_or(|s| *s == d.source)
                                        && sv.versions.contains(&d.version)
                                }))
                    })
                })
            })
            .filter(|d| {
                query
                    .filter
                    .tags
                    .relevancy_detected_correctly
                    .as_ref()
                    .is_none_or(|states| {
                        let tag = state.tags.get(&d.id).copied().flatten();
                        states.contains(&tag)
                    })
            })
            .cloned()
            .collect();

        match query.order {
            DetectionOrder::Asc => matching.sort_by_key(|d| d.id),
            DetectionOrder::Desc => matching.sort_by_key(|d| std::cmp::Reverse(d.id)),
        }
        matching.truncate(query.limit.max(0) as usize);

        Ok(matching)
    }

    async fn get_detection_tags(&self, detection_ids: &[i64]) -> Result<Vec<DetectionTags>> {
        let state = lock(&self.state);
        Ok(detection_ids
            .iter()
            .filter_map(|id| {
                state.tags.get(id).map(|value| DetectionTags {
                    detection_id: *id,
                    relevancy_detected_correctly: *value,
                })
            })
            .collect())
    }

    async fn update_tags(
        &self,
        detection_id: i64,
        update: DetectionTagsUpdate,
    ) -> Result<DetectionTags> {
        let value = match update.relevancy_detected_correctly {
            Setting::Unset => {
                // Nothing to change: report the tag state as stored.
                let existing = lock(&self.state).tags.get(&detection_id).copied().flatten();
                return Ok(DetectionTags {
                    detection_id,
                    relevancy_detected_correctly: existing,
                });
            }
            Setting::Null => None,
            Setting::Value(value) => Some(value),
        };

        lock(&self.state).tags.insert(detection_id, value);

        Ok(DetectionTags {
            detection_id,
            relevancy_detected_correctly: value,
        })
    }

    async fn present_source_ids_for_profile(
        &self,
        profile_id: i64,
        source: &str,
        source_ids: &[String],
    ) -> Result<Vec<String>> {
        let state = lock(&self.state);
        let present: HashSet<String> = state
            .detections
            .iter()
            .filter(|d| d.profile_id == profile_id && d.source == source)
            .map(|d| d.source_id.clone())
            .collect();

        Ok(source_ids
            .iter()
            .filter(|id| present.contains(*id))
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Reddit post store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StoredPost {
    pub post: Post,
    pub thread: Option<Thread>,
    pub is_enriched: bool,
    pub is_scheduled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct RedditState {
    posts: Vec<StoredPost>,
    bindings: HashMap<String, Vec<i64>>,
}

#[derive(Default)]
pub struct MemoryRedditStorage {
    state: Mutex<RedditState>,
}

impl MemoryRedditStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, subreddit: &str, profile_ids: &[i64]) {
        lock(&self.state)
            .bindings
            .insert(subreddit.to_string(), profile_ids.to_vec());
    }

    pub fn unbind(&self, subreddit: &str) {
        lock(&self.state).bindings.remove(subreddit);
    }

    pub fn stored_post(&self, id: &str) -> Option<StoredPost> {
        lock(&self.state)
            .posts
            .iter()
            .find(|p| p.post.id == id)
            .cloned()
    }

    pub fn post_ids(&self) -> Vec<String> {
        lock(&self.state)
            .posts
            .iter()
            .map(|p| p.post.id.clone())
            .collect()
    }

    /// Seed a post that already went through enrichment (and optionally
    /// scheduling).
    pub fn seed_enriched(&self, thread: Thread, scheduled: bool) {
        let created_at = thread.post.created_at.unwrap_or_else(Utc::now);
        lock(&self.state).posts.push(StoredPost {
            post: thread.post.clone(),
            thread: Some(thread),
            is_enriched: true,
            is_scheduled: scheduled,
            created_at,
        });
    }
}

#[async_trait]
impl CrawlerStorage for MemoryRedditStorage {
    async fn insert_posts(&self, posts: &[Post]) -> Result<()> {
        let mut state = lock(&self.state);
        for post in posts {
            if state.posts.iter().any(|p| p.post.id == post.id) {
                continue;
            }
            state.posts.push(StoredPost {
                post: post.clone(),
                thread: None,
                is_enriched: false,
                is_scheduled: false,
                created_at: post.created_at.unwrap_or_else(Utc::now),
            });
        }
        Ok(())
    }

    async fn check_presence(&self, post_ids: &[String]) -> Result<HashSet<String>> {
        let state = lock(&self.state);
        Ok(post_ids
            .iter()
            .filter(|id| state.posts.iter().any(|p| p.post.id == **id))
            .cloned()
            .collect())
    }

    async fn subreddits_for_scraping(&self) -> Result<Vec<String>> {
        Ok(lock(&self.state).bindings.keys().cloned().collect())
    }
}

#[async_trait]
impl EnricherStorage for MemoryRedditStorage {
    async fn posts_for_enrichment(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>> {
        let state = lock(&self.state);
        let mut candidates: Vec<&StoredPost> = state
            .posts
            .iter()
            .filter(|p| !p.is_enriched && p.created_at < created_before)
            .collect();
        candidates.sort_by_key(|p| p.created_at);
        candidates.truncate(limit.max(0) as usize);

        Ok(candidates.iter().map(|p| p.post.id.clone()).collect())
    }

    async fn enrich_posts(&self, threads: &[Thread]) -> Result<()> {
        let mut state = lock(&self.state);
        for thread in threads {
            if let Some(stored) = state.posts.iter_mut().find(|p| p.post.id == thread.id()) {
                stored.thread = Some(thread.clone());
                stored.post.score = thread.post.score;
                stored.is_enriched = true;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SchedulerStorage for MemoryRedditStorage {
    async fn posts_for_scheduling(&self, limit: i64, min_score: i32) -> Result<Vec<Thread>> {
        let state = lock(&self.state);
        let mut candidates: Vec<&StoredPost> = state
            .posts
            .iter()
            .filter(|p| p.is_enriched && !p.is_scheduled && p.post.score >= min_score)
            .collect();
        candidates.sort_by_key(|p| p.created_at);
        candidates.truncate(limit.max(0) as usize);

        Ok(candidates
            .iter()
            .filter_map(|p| p.thread.clone())
            .collect())
    }

    async fn subreddits_settings(&self, subreddits: &[String]) -> Result<Vec<SubredditSettings>> {
        let state = lock(&self.state);
        Ok(subreddits
            .iter()
            .filter_map(|subreddit| {
                state.bindings.get(subreddit).map(|profiles| SubredditSettings {
                    subreddit: subreddit.clone(),
                    profiles: profiles.clone(),
                })
            })
            .collect())
    }

    async fn mark_posts_scheduled(&self, post_ids: &[String]) -> Result<()> {
        let mut state = lock(&self.state);
        for stored in state.posts.iter_mut() {
            if post_ids.contains(&stored.post.id) {
                stored.is_scheduled = true;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ToolkitStorage for MemoryRedditStorage {
    async fn get_threads(&self, post_ids: &[String]) -> Result<Vec<Thread>> {
        let state = lock(&self.state);
        Ok(post_ids
            .iter()
            .filter_map(|id| {
                state
                    .posts
                    .iter()
                    .find(|p| p.post.id == *id)
                    .and_then(|p| p.thread.clone())
            })
            .collect())
    }

    async fn get_raw_posts(&self, post_ids: &[String]) -> Result<Vec<(String, serde_json::Value)>> {
        let state = lock(&self.state);
        Ok(post_ids
            .iter()
            .filter_map(|id| {
                state.posts.iter().find(|p| p.post.id == *id).map(|p| {
                    (
                        p.post.id.clone(),
                        serde_json::to_value(&p.post).unwrap_or_default(),
                    )
                })
            })
            .collect())
    }

    async fn all_subreddit_settings(&self) -> Result<Vec<SubredditSettings>> {
        let state = lock(&self.state);
        Ok(state
            .bindings
            .iter()
            .map(|(subreddit, profiles)| SubredditSettings {
                subreddit: subreddit.clone(),
                profiles: profiles.clone(),
            })
            .collect())
    }

    async fn subreddit_settings_with_profile(
        &self,
        profile_id: i64,
    ) -> Result<Vec<SubredditSettings>> {
        let state = lock(&self.state);
        Ok(state
            .bindings
            .iter()
            .filter(|(_, profiles)| profiles.contains(&profile_id))
            .map(|(subreddit, profiles)| SubredditSettings {
                subreddit: subreddit.clone(),
                profiles: profiles.clone(),
            })
            .collect())
    }

    async fn add_profiles_to_subreddit(&self, subreddit: &str, profile_ids: &[i64]) -> Result<()> {
        let mut state = lock(&self.state);
        let entry = state.bindings.entry(subreddit.to_string()).or_default();
        for id in profile_ids {
            if !entry.contains(id) {
                entry.push(*id);
            }
        }
        entry.sort_unstable();
        Ok(())
    }

    async fn remove_profiles_from_subreddit(
        &self,
        subreddit: &str,
        profile_ids: &[i64],
    ) -> Result<()> {
        let mut state = lock(&self.state);
        if let Some(entry) = state.bindings.get_mut(subreddit) {
            entry.retain(|id| !profile_ids.contains(id));
        }
        Ok(())
    }

    async fn remove_profile_from_all_subreddits(&self, profile_id: i64) -> Result<()> {
        let mut state = lock(&self.state);
        for profiles in state.bindings.values_mut() {
            profiles.retain(|id| *id != profile_id);
        }
        Ok(())
    }

    async fn scheduled_post_ids_in_subreddits(
        &self,
        subreddits: &[String],
        days: Option<i64>,
        limit: Option<i64>,
    ) -> Result<Vec<String>> {
        let state = lock(&self.state);
        let cutoff = days.map(|d| Utc::now() - chrono::Duration::days(d));

        let mut candidates: Vec<&StoredPost> = state
            .posts
            .iter()
            .filter(|p| p.is_scheduled && subreddits.contains(&p.post.subreddit))
            .filter(|p| cutoff.is_none_or(|cutoff| p.created_at > cutoff))
            .collect();
        candidates.sort_by_key(|p| std::cmp::Reverse(p.created_at));
        if let Some(limit) = limit {
            candidates.truncate(limit.max(0) as usize);
        }

        Ok(candidates.iter().map(|p| p.post.id.clone()).collect())
    }
}

// ---------------------------------------------------------------------------
// Scripted collaborators
// ---------------------------------------------------------------------------

/// Feed serving pre-programmed pages keyed by (subreddit, cursor).
#[derive(Default)]
pub struct ScriptedFeed {
    pages: Mutex<HashMap<(String, String), (Vec<Post>, Option<String>)>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_page(&self, subreddit: &str, cursor: &str, posts: Vec<Post>, next: Option<&str>) {
        lock(&self.pages).insert(
            (subreddit.to_string(), cursor.to_string()),
            (posts, next.map(str::to_string)),
        );
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl PostFeed for ScriptedFeed {
    async fn get_posts(
        &self,
        subreddit: &str,
        after: &str,
        _limit: usize,
    ) -> Result<(Vec<Post>, Option<String>)> {
        lock(&self.calls).push((subreddit.to_string(), after.to_string()));

        let pages = lock(&self.pages);
        Ok(pages
            .get(&(subreddit.to_string(), after.to_string()))
            .cloned()
            .unwrap_or((Vec::new(), None)))
    }
}

/// Thread fetcher with optional per-post transient failures.
#[derive(Default)]
pub struct ScriptedThreadFetcher {
    threads: Mutex<HashMap<String, Thread>>,
    failures: Mutex<HashMap<String, usize>>,
    calls: Mutex<usize>,
}

impl ScriptedThreadFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_thread(&self, thread: Thread) {
        lock(&self.threads).insert(thread.id().to_string(), thread);
    }

    /// The next `times` fetches of `post_id` fail before succeeding.
    pub fn fail_times(&self, post_id: &str, times: usize) {
        lock(&self.failures).insert(post_id.to_string(), times);
    }

    pub fn calls(&self) -> usize {
        *lock(&self.calls)
    }
}

#[async_trait]
impl ThreadFetcher for ScriptedThreadFetcher {
    async fn get_thread(&self, id: &str) -> Result<Thread> {
        *lock(&self.calls) += 1;

        {
            let mut failures = lock(&self.failures);
            if let Some(remaining) = failures.get_mut(id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ScoutError::Source(format!("scripted failure for {id}")));
                }
            }
        }

        lock(&self.threads)
            .get(id)
            .cloned()
            .ok_or_else(|| ScoutError::Source(format!("no thread scripted for {id}")))
    }
}

/// Analyzer returning a fixed detection, with optional leading failures.
pub struct ScriptedAnalyzer {
    detection: Mutex<Detection>,
    failures_remaining: Mutex<usize>,
    calls: Mutex<usize>,
    last_settings: Mutex<Option<ProfileSettings>>,
}

impl ScriptedAnalyzer {
    pub fn relevant() -> Self {
        Self::returning(Detection {
            is_relevant: true,
            properties: HashMap::new(),
        })
    }

    pub fn returning(detection: Detection) -> Self {
        Self {
            detection: Mutex::new(detection),
            failures_remaining: Mutex::new(0),
            calls: Mutex::new(0),
            last_settings: Mutex::new(None),
        }
    }

    /// The settings the most recent analyze call ran with.
    pub fn last_settings(&self) -> Option<ProfileSettings> {
        lock(&self.last_settings).clone()
    }

    /// The next `times` analyze calls fail with an unavailable-analyzer
    /// error.
    pub fn fail_times(&self, times: usize) {
        *lock(&self.failures_remaining) = times;
    }

    pub fn calls(&self) -> usize {
        *lock(&self.calls)
    }
}

#[async_trait]
impl ThreadAnalyzer for ScriptedAnalyzer {
    async fn analyze(&self, _thread: &Thread, settings: &ProfileSettings) -> Result<Detection> {
        *lock(&self.calls) += 1;
        *lock(&self.last_settings) = Some(settings.clone());

        {
            let mut remaining = lock(&self.failures_remaining);
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ScoutError::AnalyzerUnavailable(
                    "scripted analyzer failure".to_string(),
                ));
            }
        }

        Ok(lock(&self.detection).clone())
    }
}
