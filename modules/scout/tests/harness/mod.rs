//! Shared assembly of the in-memory pipeline for integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use scout::processor::TaskProcessor;
use scout::reddit::toolkit::Toolkit;
use scout::scout::SourceToolkit;
use scout::testing::{
    settings_input, MemoryRedditStorage, MemoryScoutStorage, MemoryTaskQueue, ScriptedAnalyzer,
};
use scout::Scout;
use scout_common::config::TaskProcessorSettings;
use scout_common::ProfileCreateInput;

pub struct Env {
    pub queue: Arc<MemoryTaskQueue>,
    pub storage: Arc<MemoryScoutStorage>,
    pub reddit: Arc<MemoryRedditStorage>,
    pub analyzer: Arc<ScriptedAnalyzer>,
    pub scout: Arc<Scout>,
    pub processor: Arc<TaskProcessor>,
}

pub fn processor_settings(max_attempts: usize) -> TaskProcessorSettings {
    TaskProcessorSettings {
        workers: 1,
        max_attempts,
        error_backoff_seconds: 0,
        timeout_seconds: 0,
        error_timeout_seconds: 0,
        no_tasks_timeout_seconds: 0,
        disabled: false,
    }
}

pub fn build_env(error_backoff: Duration, max_attempts: usize) -> Env {
    let queue = Arc::new(MemoryTaskQueue::new(error_backoff));
    let storage = Arc::new(MemoryScoutStorage::new());
    let reddit = Arc::new(MemoryRedditStorage::new());
    let analyzer = Arc::new(ScriptedAnalyzer::relevant());

    let toolkit = Arc::new(Toolkit::new(reddit.clone(), analyzer.clone()));

    let mut toolkits: HashMap<String, Arc<dyn SourceToolkit>> = HashMap::new();
    toolkits.insert(scout::reddit::SOURCE.to_string(), toolkit);

    let scout = Arc::new(Scout::new(toolkits, storage.clone(), queue.clone()));

    let processor = Arc::new(TaskProcessor::new(
        queue.clone(),
        scout.clone(),
        processor_settings(max_attempts),
    ));

    Env {
        queue,
        storage,
        reddit,
        analyzer,
        scout,
        processor,
    }
}

pub fn env() -> Env {
    build_env(Duration::ZERO, 3)
}

/// Create a profile with default settings only and deploy version 1.
pub async fn deployed_profile(env: &Env, name: &str) -> i64 {
    let id = env
        .scout
        .create_profile(ProfileCreateInput {
            name: name.to_string(),
            default_settings: Some(settings_input("relevant to testing")),
            sources_settings: HashMap::new(),
        })
        .await
        .expect("create profile");

    env.scout
        .deploy_profile_version(id, 1)
        .await
        .expect("deploy version 1");

    id
}
