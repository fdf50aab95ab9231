//! Task processor: workers claim analysis tasks, resolve the profile
//! settings that apply, run the analyzer and commit the result.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};

use scout_common::config::TaskProcessorSettings;
use scout_common::{AnalysisTask, Result, ScoutError, TaskType};

use crate::scout::AnalysisService;

/// Claim-based task queue operations used by the processor.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Atomically claim one claimable task restricted to the given types and
    /// profiles. `None` is the normal empty-queue signal.
    async fn claim(
        &self,
        task_types: &[TaskType],
        profile_ids: &[i64],
    ) -> Result<Option<AnalysisTask>>;
    async fn unclaim(&self, task_id: i64) -> Result<()>;
    /// Record a failed attempt and push `claim_available_at` into the future.
    async fn add_error(&self, task_id: i64, message: &str) -> Result<()>;
    async fn fail(&self, task_id: i64) -> Result<()>;
    async fn commit(&self, task_id: i64) -> Result<()>;
}

const PROFILES_CACHE_TTL: Duration = Duration::from_secs(30);

struct ProfilesCache {
    active: Vec<i64>,
    inactive: Vec<i64>,
    valid_until: Instant,
}

/// Which slice of the profile population a claim loop serves.
#[derive(Debug, Clone, Copy)]
enum LoopMode {
    /// Profiles whose selected version is deployed: scheduled + manual tasks.
    ActiveProfiles,
    /// Test-mode or dangling profiles: manual tasks only.
    InactiveProfiles,
}

impl LoopMode {
    fn label(&self) -> &'static str {
        match self {
            LoopMode::ActiveProfiles => "active_profiles",
            LoopMode::InactiveProfiles => "inactive_profiles",
        }
    }

    fn task_types(&self) -> &'static [TaskType] {
        match self {
            LoopMode::ActiveProfiles => &[TaskType::Scheduled, TaskType::Manual],
            LoopMode::InactiveProfiles => &[TaskType::Manual],
        }
    }
}

/// What became of a claimed task inside one handling pass.
enum Handled {
    Committed,
    /// Released without an error mark (test-mode isolation path).
    Released,
}

pub struct TaskProcessor {
    queue: Arc<dyn TaskQueue>,
    scout: Arc<dyn AnalysisService>,
    cache: Mutex<Option<ProfilesCache>>,
    settings: TaskProcessorSettings,
}

impl TaskProcessor {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        scout: Arc<dyn AnalysisService>,
        settings: TaskProcessorSettings,
    ) -> Self {
        Self {
            queue,
            scout,
            cache: Mutex::new(None),
            settings,
        }
    }

    /// Run `workers` pairs of claim loops until shutdown flips.
    ///
    /// Each worker runs one loop over active profiles and one over inactive
    /// profiles. Scheduled traffic must never run against a test-mode
    /// profile, and manual test-mode traffic must not starve behind it.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!(workers = self.settings.workers, "starting task processor");

        let mut set = JoinSet::new();

        for _ in 0..self.settings.workers.max(1) {
            for mode in [LoopMode::ActiveProfiles, LoopMode::InactiveProfiles] {
                let processor = self.clone();
                let rx = shutdown.clone();
                set.spawn(async move { processor.task_loop(rx, mode).await });
            }
        }

        while set.join_next().await.is_some() {}
    }

    async fn task_loop(&self, mut shutdown: watch::Receiver<bool>, mode: LoopMode) {
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

            match self.process_one(mode).await {
                Err(err) => {
                    error!(label = mode.label(), error = %err, "process task");
                    timeout = self.settings.error_timeout();
                }
                Ok(false) => {
                    timeout = self.settings.no_tasks_timeout();
                }
                Ok(true) => {}
            }
        }
    }

    async fn process_one(&self, mode: LoopMode) -> Result<bool> {
        let profile_ids = match mode {
            LoopMode::ActiveProfiles => self.active_profiles().await?,
            LoopMode::InactiveProfiles => self.inactive_profiles().await?,
        };

        self.process_task(mode.task_types(), &profile_ids).await
    }

    /// Claim and handle one task. Returns whether any task was claimed.
    pub async fn process_task(
        &self,
        task_types: &[TaskType],
        profile_ids: &[i64],
    ) -> Result<bool> {
        let Some(task) = self.queue.claim(task_types, profile_ids).await? else {
            return Ok(false);
        };

        info!(task_id = task.id, "claimed task");

        if task.errors.len() >= self.settings.max_attempts {
            error!(task_id = task.id, "task failed max attempts");
            self.queue.fail(task.id).await?;
            return Ok(false);
        }

        match self.handle_task(&task).await {
            Ok(Handled::Committed) => {
                info!(task_id = task.id, "committed task");
                Ok(true)
            }
            Ok(Handled::Released) => {
                self.queue.unclaim(task.id).await?;
                Ok(false)
            }
            Err(err) => {
                // The error is recorded before the claim is released so the
                // back-off is in place by the time the task is claimable.
                if let Err(add_err) = self.queue.add_error(task.id, &err.to_string()).await {
                    error!(task_id = task.id, error = %add_err, "failed to add error to task");
                }
                if let Err(unclaim_err) = self.queue.unclaim(task.id).await {
                    error!(task_id = task.id, error = %unclaim_err, "failed to unclaim task");
                }
                Err(err)
            }
        }
    }

    async fn handle_task(&self, task: &AnalysisTask) -> Result<Handled> {
        let parameters = &task.parameters;

        let profile = self
            .scout
            .get_profile(parameters.profile_id)
            .await?
            .ok_or_else(|| ScoutError::NotFound(format!("profile {}", parameters.profile_id)))?;

        if !profile.is_active() && task.task_type != TaskType::Manual {
            warn!(
                profile_id = parameters.profile_id,
                "profile is not active but a scheduled task was claimed"
            );
            // Drop the cache so the claim filters stop handing these out.
            self.invalidate_profiles_cache().await;
            return Ok(Handled::Released);
        }

        let version = profile.selected().ok_or_else(|| {
            ScoutError::NotFound(format!(
                "selected version {} of profile {}",
                profile.selected_version, profile.id
            ))
        })?;

        let settings = version
            .settings_for(&parameters.source)
            .ok_or_else(|| {
                ScoutError::NotFound(format!(
                    "profile settings: source = {}, profile id = {}",
                    parameters.source, parameters.profile_id
                ))
            })?
            .clone();

        self.scout
            .analyze(
                &parameters.source,
                &parameters.source_id,
                &settings,
                version.test_mode,
                parameters.should_save,
            )
            .await?;

        self.queue.commit(task.id).await?;

        Ok(Handled::Committed)
    }

    pub async fn invalidate_profiles_cache(&self) {
        *self.cache.lock().await = None;
    }

    /// Load (or refresh) the cache and return the (active, inactive) profile
    /// id split the claim loops run with.
    pub async fn profile_sets(&self) -> Result<(Vec<i64>, Vec<i64>)> {
        Ok((self.active_profiles().await?, self.inactive_profiles().await?))
    }

    /// Whether the cache currently holds an entry. Exposed for tests.
    pub async fn profiles_cache_is_loaded(&self) -> bool {
        self.cache.lock().await.is_some()
    }

    async fn active_profiles(&self) -> Result<Vec<i64>> {
        let mut guard = self.cache.lock().await;
        self.ensure_cache(&mut guard).await?;
        Ok(guard.as_ref().map(|c| c.active.clone()).unwrap_or_default())
    }

    async fn inactive_profiles(&self) -> Result<Vec<i64>> {
        let mut guard = self.cache.lock().await;
        self.ensure_cache(&mut guard).await?;
        Ok(guard
            .as_ref()
            .map(|c| c.inactive.clone())
            .unwrap_or_default())
    }

    async fn ensure_cache(&self, guard: &mut Option<ProfilesCache>) -> Result<()> {
        if let Some(cache) = guard.as_ref() {
            if cache.valid_until > Instant::now() {
                return Ok(());
            }
        }

        let profiles = self.scout.get_all_profiles().await?;

        let mut cache = ProfilesCache {
            active: Vec::new(),
            inactive: Vec::new(),
            valid_until: Instant::now() + PROFILES_CACHE_TTL,
        };

        for profile in &profiles {
            if profile.is_active() {
                cache.active.push(profile.id);
            } else {
                cache.inactive.push(profile.id);
            }
        }

        *guard = Some(cache);
        Ok(())
    }
}
