//! The Scout service: profile management, analysis, task scheduling and
//! jumpstart, fanning out to per-source toolkits.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use scout_common::{
    AnalysisParameters, Detection, DetectionQuery, DetectionRecord, DetectionTags,
    DetectionTagsUpdate, NewAnalysisTask, NewDetection, Profile, ProfileCreateInput,
    ProfileSettings, ProfileUpdate, Result, ScoutError, SourcePost, TaskType, VersionCreateInput,
    VersionUpdate,
};

/// Durable storage for profiles, detections and detection tags.
#[async_trait]
pub trait ScoutStorage: Send + Sync {
    async fn get_all_profiles(&self) -> Result<Vec<Profile>>;
    async fn get_profile(&self, id: i64) -> Result<Option<Profile>>;
    async fn create_profile(&self, input: ProfileCreateInput) -> Result<i64>;
    async fn create_profile_version(&self, profile_id: i64, input: VersionCreateInput)
        -> Result<i64>;
    async fn update_profile(&self, update: ProfileUpdate) -> Result<()>;
    async fn update_profile_version(
        &self,
        profile_id: i64,
        version: i64,
        update: VersionUpdate,
    ) -> Result<()>;
    async fn deploy_profile_version(&self, profile_id: i64, version: i64) -> Result<()>;
    async fn delete_profile(&self, id: i64) -> Result<()>;

    async fn save_detection(&self, record: NewDetection) -> Result<()>;
    async fn list_detections(&self, query: &DetectionQuery) -> Result<Vec<DetectionRecord>>;
    async fn get_detection_tags(&self, detection_ids: &[i64]) -> Result<Vec<DetectionTags>>;
    async fn update_tags(
        &self,
        detection_id: i64,
        update: DetectionTagsUpdate,
    ) -> Result<DetectionTags>;
    /// Source ids among `source_ids` that already have a detection for the
    /// profile. Used by jumpstart dedup.
    async fn present_source_ids_for_profile(
        &self,
        profile_id: i64,
        source: &str,
        source_ids: &[String],
    ) -> Result<Vec<String>>;
}

/// Enqueues analysis tasks.
#[async_trait]
pub trait TaskAdder: Send + Sync {
    async fn add(&self, tasks: Vec<NewAnalysisTask>) -> Result<()>;
}

/// Everything the core needs from a content source.
#[async_trait]
pub trait SourceToolkit: Send + Sync {
    /// Load the item and run the analyzer against it with `settings`.
    async fn analyze(&self, source_id: &str, settings: &ProfileSettings) -> Result<Detection>;

    /// Clear all board bindings referencing the profile.
    async fn delete_profile(&self, profile_id: i64) -> Result<()>;

    /// Raw stored posts by id, for attaching to detection listings.
    async fn get_source_posts(&self, source_ids: &[String]) -> Result<Vec<SourcePost>>;

    /// Historic item ids reachable through the profiles' board bindings,
    /// optionally windowed to the last `days` days and capped at `limit`.
    async fn scheduled_source_ids(
        &self,
        profile_ids: &[i64],
        days: Option<i64>,
        limit: Option<i64>,
    ) -> Result<Vec<String>>;
}

/// The operations the task processor needs from the Scout service.
/// Split out so the processor can run against a scripted fake in tests.
#[async_trait]
pub trait AnalysisService: Send + Sync {
    async fn get_all_profiles(&self) -> Result<Vec<Profile>>;
    async fn get_profile(&self, id: i64) -> Result<Option<Profile>>;
    async fn analyze(
        &self,
        source: &str,
        source_id: &str,
        settings: &ProfileSettings,
        test_mode: bool,
        should_save: bool,
    ) -> Result<Detection>;
}

pub struct Scout {
    toolkits: HashMap<String, Arc<dyn SourceToolkit>>,
    storage: Arc<dyn ScoutStorage>,
    task_adder: Arc<dyn TaskAdder>,
}

impl Scout {
    pub fn new(
        toolkits: HashMap<String, Arc<dyn SourceToolkit>>,
        storage: Arc<dyn ScoutStorage>,
        task_adder: Arc<dyn TaskAdder>,
    ) -> Self {
        Self {
            toolkits,
            storage,
            task_adder,
        }
    }

    fn toolkit(&self, source: &str) -> Result<&Arc<dyn SourceToolkit>> {
        self.toolkits
            .get(source)
            .ok_or_else(|| ScoutError::NotFound(format!("source toolkit: {source}")))
    }

    /// Analyze one item with the given settings, persisting the detection
    /// when `should_save` is set.
    pub async fn analyze(
        &self,
        source: &str,
        source_id: &str,
        settings: &ProfileSettings,
        test_mode: bool,
        should_save: bool,
    ) -> Result<Detection> {
        let toolkit = self.toolkit(source)?;

        let detection = toolkit.analyze(source_id, settings).await?;

        if should_save {
            let record = NewDetection {
                source: source.to_string(),
                source_id: source_id.to_string(),
                profile_id: settings.profile_id,
                version: settings.version,
                test_mode,
                is_relevant: detection.is_relevant,
                properties: detection.properties.clone(),
            };

            if let Err(err) = self.storage.save_detection(record).await {
                error!(source, source_id, error = %err, "failed to save detection");
                return Err(err);
            }
        }

        Ok(detection)
    }

    /// Enqueue analysis tasks.
    pub async fn schedule_analysis(&self, tasks: Vec<NewAnalysisTask>) -> Result<()> {
        let count = tasks.len();
        self.task_adder.add(tasks).await?;

        info!(tasks_count = count, "scheduled tasks");
        Ok(())
    }

    /// Delete a profile everywhere: storage (versions, settings, detections)
    /// plus every source's board bindings.
    pub async fn delete_profile(&self, id: i64) -> Result<()> {
        self.storage.delete_profile(id).await?;

        for (source, toolkit) in &self.toolkits {
            toolkit.delete_profile(id).await.map_err(|err| {
                ScoutError::Source(format!("delete profile from source {source}: {err}"))
            })?;
        }

        Ok(())
    }

    pub async fn get_all_profiles(&self) -> Result<Vec<Profile>> {
        self.storage.get_all_profiles().await
    }

    pub async fn get_profile(&self, id: i64) -> Result<Option<Profile>> {
        self.storage.get_profile(id).await
    }

    pub async fn create_profile(&self, input: ProfileCreateInput) -> Result<i64> {
        self.storage.create_profile(input).await
    }

    pub async fn create_profile_version(
        &self,
        profile_id: i64,
        input: VersionCreateInput,
    ) -> Result<i64> {
        self.storage.create_profile_version(profile_id, input).await
    }

    pub async fn update_profile(&self, update: ProfileUpdate) -> Result<()> {
        self.storage.update_profile(update).await
    }

    pub async fn update_profile_version(
        &self,
        profile_id: i64,
        version: i64,
        update: VersionUpdate,
    ) -> Result<()> {
        self.storage
            .update_profile_version(profile_id, version, update)
            .await
    }

    pub async fn deploy_profile_version(&self, profile_id: i64, version: i64) -> Result<()> {
        self.storage
            .deploy_profile_version(profile_id, version)
            .await
    }

    pub async fn update_tags(
        &self,
        detection_id: i64,
        update: DetectionTagsUpdate,
    ) -> Result<DetectionTags> {
        self.storage.update_tags(detection_id, update).await
    }

    pub async fn get_detection_tags(&self, detection_ids: &[i64]) -> Result<Vec<DetectionTags>> {
        self.storage.get_detection_tags(detection_ids).await
    }

    pub async fn get_source_posts(
        &self,
        source: &str,
        source_ids: &[String],
    ) -> Result<Vec<SourcePost>> {
        self.toolkit(source)?.get_source_posts(source_ids).await
    }

    pub async fn list_detections(&self, query: &DetectionQuery) -> Result<Vec<DetectionRecord>> {
        self.storage.list_detections(query).await
    }

    /// Enqueue manual analysis tasks over historic items for a profile.
    ///
    /// 1. Collect candidate item ids from every source's board bindings
    ///    (windowed by `period_days`, capped by `limit`).
    /// 2. Optionally drop ids that already have a detection for the profile.
    /// 3. Add the remainder as manual tasks.
    ///
    /// Typical use: after binding new boards or creating a new profile.
    pub async fn jumpstart_profile(
        &self,
        profile_id: i64,
        exclude_already_analyzed: bool,
        period_days: Option<i64>,
        limit: Option<i64>,
    ) -> Result<()> {
        let parameters = self
            .dry_jumpstart_profile(profile_id, exclude_already_analyzed, period_days, limit)
            .await?;

        let tasks: Vec<NewAnalysisTask> = parameters
            .into_iter()
            .map(|parameters| NewAnalysisTask {
                task_type: TaskType::Manual,
                parameters,
            })
            .collect();

        let count = tasks.len();
        self.task_adder.add(tasks).await?;

        info!(profile_id, tasks_count = count, "scheduled jumpstart tasks");
        Ok(())
    }

    /// The candidate-enumeration half of jumpstart, without enqueuing.
    pub async fn dry_jumpstart_profile(
        &self,
        profile_id: i64,
        exclude_already_analyzed: bool,
        period_days: Option<i64>,
        limit: Option<i64>,
    ) -> Result<Vec<AnalysisParameters>> {
        let mut result = Vec::new();

        for (source, toolkit) in &self.toolkits {
            let mut source_ids = toolkit
                .scheduled_source_ids(&[profile_id], period_days, limit)
                .await
                .map_err(|err| {
                    ScoutError::Source(format!("collect candidates from {source}: {err}"))
                })?;

            if exclude_already_analyzed {
                let present: HashSet<String> = self
                    .storage
                    .present_source_ids_for_profile(profile_id, source, &source_ids)
                    .await?
                    .into_iter()
                    .collect();

                source_ids.retain(|id| !present.contains(id));
            }

            result.extend(source_ids.into_iter().map(|source_id| AnalysisParameters {
                source: source.clone(),
                source_id,
                profile_id,
                should_save: true,
            }));
        }

        Ok(result)
    }
}

#[async_trait]
impl AnalysisService for Scout {
    async fn get_all_profiles(&self) -> Result<Vec<Profile>> {
        Scout::get_all_profiles(self).await
    }

    async fn get_profile(&self, id: i64) -> Result<Option<Profile>> {
        Scout::get_profile(self, id).await
    }

    async fn analyze(
        &self,
        source: &str,
        source_id: &str,
        settings: &ProfileSettings,
        test_mode: bool,
        should_save: bool,
    ) -> Result<Detection> {
        Scout::analyze(self, source, source_id, settings, test_mode, should_save).await
    }
}
