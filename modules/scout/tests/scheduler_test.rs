//! Scheduler fan-out and scheduled-marking behavior.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};

use scout::reddit::scheduler::{AnalysisSink, Scheduler};
use scout::testing::{make_post, make_thread, MemoryRedditStorage, MemoryTaskQueue};
use scout_common::config::SchedulerSettings;
use scout_common::{NewAnalysisTask, Result, ScoutError, TaskType};

fn scheduler_settings(min_score: i32) -> SchedulerSettings {
    SchedulerSettings {
        batch_size: 100,
        min_score,
        timeout_seconds: 0,
        error_timeout_seconds: 0,
        disabled: false,
    }
}

struct QueueSink(Arc<MemoryTaskQueue>);

#[async_trait]
impl AnalysisSink for QueueSink {
    async fn schedule_analysis(&self, tasks: Vec<NewAnalysisTask>) -> Result<()> {
        use scout::scout::TaskAdder;
        self.0.add(tasks).await
    }
}

struct FailingSink;

#[async_trait]
impl AnalysisSink for FailingSink {
    async fn schedule_analysis(&self, _tasks: Vec<NewAnalysisTask>) -> Result<()> {
        Err(ScoutError::Source("task store is down".to_string()))
    }
}

fn seed(storage: &MemoryRedditStorage, id: &str, subreddit: &str, score: i32) {
    let post = make_post(id, subreddit, score, Utc::now() - Duration::hours(3));
    storage.seed_enriched(make_thread(post, Vec::new()), false);
}

#[tokio::test]
async fn emits_one_task_per_post_and_profile() {
    let storage = Arc::new(MemoryRedditStorage::new());
    let queue = Arc::new(MemoryTaskQueue::new(std::time::Duration::ZERO));

    storage.bind("b1", &[7, 8]);
    seed(&storage, "x", "b1", 10);
    seed(&storage, "y", "b1", 10);

    let scheduler = Scheduler::new(
        storage.clone(),
        Arc::new(QueueSink(queue.clone())),
        scheduler_settings(0),
    );
    scheduler.schedule_batch().await.unwrap();

    let tasks = queue.snapshot();
    assert_eq!(tasks.len(), 4);
    assert!(tasks.iter().all(|t| t.task_type == TaskType::Scheduled));
    assert!(tasks.iter().all(|t| t.parameters.should_save));

    let pairs: Vec<(String, i64)> = tasks
        .iter()
        .map(|t| (t.parameters.source_id.clone(), t.parameters.profile_id))
        .collect();
    for expected in [("x", 7), ("x", 8), ("y", 7), ("y", 8)] {
        assert!(pairs.contains(&(expected.0.to_string(), expected.1)));
    }

    assert!(storage.stored_post("x").unwrap().is_scheduled);
    assert!(storage.stored_post("y").unwrap().is_scheduled);
}

#[tokio::test]
async fn low_score_posts_are_not_scheduled() {
    let storage = Arc::new(MemoryRedditStorage::new());
    let queue = Arc::new(MemoryTaskQueue::new(std::time::Duration::ZERO));

    storage.bind("b1", &[7]);
    seed(&storage, "low", "b1", 1);
    seed(&storage, "high", "b1", 50);

    let scheduler = Scheduler::new(
        storage.clone(),
        Arc::new(QueueSink(queue.clone())),
        scheduler_settings(10),
    );
    scheduler.schedule_batch().await.unwrap();

    let tasks = queue.snapshot();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].parameters.source_id, "high");

    assert!(!storage.stored_post("low").unwrap().is_scheduled);
}

#[tokio::test]
async fn unbound_board_posts_are_marked_without_tasks() {
    let storage = Arc::new(MemoryRedditStorage::new());
    let queue = Arc::new(MemoryTaskQueue::new(std::time::Duration::ZERO));

    // Bound board so the batch contains both posts; "stray" has no bindings.
    storage.bind("b1", &[7]);
    seed(&storage, "x", "b1", 10);
    seed(&storage, "s", "stray", 10);

    let scheduler = Scheduler::new(
        storage.clone(),
        Arc::new(QueueSink(queue.clone())),
        scheduler_settings(0),
    );
    scheduler.schedule_batch().await.unwrap();

    let tasks = queue.snapshot();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].parameters.source_id, "x");

    // Marked anyway: retrying an unbound post forever would storm the loop.
    assert!(storage.stored_post("s").unwrap().is_scheduled);
}

#[tokio::test]
async fn failed_task_add_leaves_posts_unscheduled() {
    let storage = Arc::new(MemoryRedditStorage::new());

    storage.bind("b1", &[7]);
    seed(&storage, "x", "b1", 10);

    let scheduler = Scheduler::new(storage.clone(), Arc::new(FailingSink), scheduler_settings(0));
    let result = scheduler.schedule_batch().await;

    assert!(result.is_err());
    // The batch is retried on the next tick.
    assert!(!storage.stored_post("x").unwrap().is_scheduled);
}
