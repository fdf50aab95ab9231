//! Task processor behavior: claim/commit, back-off and failure, test-mode
//! isolation, settings resolution, claim uniqueness under concurrency.

mod harness;

use std::collections::HashSet;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};

use harness::{build_env, deployed_profile, env};
use scout::processor::TaskQueue;
use scout::scout::TaskAdder;
use scout::testing::{make_post, make_thread, settings_input};
use scout_common::{
    AnalysisParameters, NewAnalysisTask, ProfileCreateInput, TaskType, VersionUpdate,
};

fn scheduled_task(source_id: &str, profile_id: i64) -> NewAnalysisTask {
    NewAnalysisTask {
        task_type: TaskType::Scheduled,
        parameters: AnalysisParameters {
            source: scout::reddit::SOURCE.to_string(),
            source_id: source_id.to_string(),
            profile_id,
            should_save: true,
        },
    }
}

fn seed_thread(env: &harness::Env, id: &str) {
    let post = make_post(id, "b1", 10, Utc::now() - ChronoDuration::hours(3));
    env.reddit.seed_enriched(make_thread(post, Vec::new()), true);
}

#[tokio::test]
async fn commits_task_and_saves_detection() {
    let env = env();
    let profile_id = deployed_profile(&env, "startup ideas").await;
    seed_thread(&env, "x");

    env.queue
        .add(vec![scheduled_task("x", profile_id)])
        .await
        .unwrap();

    let processed = env
        .processor
        .process_task(&[TaskType::Scheduled, TaskType::Manual], &[profile_id])
        .await
        .unwrap();
    assert!(processed);

    assert_eq!(env.queue.committed_ids().len(), 1);

    let detections = env.storage.detections();
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0].source_id, "x");
    assert_eq!(detections[0].profile_id, profile_id);
    assert_eq!(detections[0].version, 1);
    assert!(!detections[0].test_mode);
    assert!(detections[0].is_relevant);
}

#[tokio::test]
async fn analyzer_failures_record_errors_then_fail_task() {
    let env = env();
    let profile_id = deployed_profile(&env, "p").await;
    seed_thread(&env, "x");

    env.analyzer.fail_times(10);

    env.queue
        .add(vec![scheduled_task("x", profile_id)])
        .await
        .unwrap();
    let task_id = env.queue.snapshot()[0].id;

    let types = [TaskType::Scheduled, TaskType::Manual];

    // Three failing attempts, each recording an error and unclaiming.
    for attempt in 1..=3 {
        let result = env.processor.process_task(&types, &[profile_id]).await;
        assert!(result.is_err(), "attempt {attempt} should surface the error");

        let stored = env.queue.task(task_id).unwrap();
        assert_eq!(stored.errors.len(), attempt);
        assert!(!stored.is_claimed);
        assert!(stored.failed_at.is_none());
    }

    // Fourth claim sees max_attempts errors and fails the task.
    let processed = env.processor.process_task(&types, &[profile_id]).await.unwrap();
    assert!(!processed);

    let stored = env.queue.task(task_id).unwrap();
    assert!(stored.failed_at.is_some());
    assert!(stored.committed_at.is_none());
    assert_eq!(stored.errors.len(), 3);
}

#[tokio::test]
async fn error_backoff_blocks_reclaim_until_deadline() {
    let env = build_env(Duration::from_secs(3600), 3);
    let profile_id = deployed_profile(&env, "p").await;
    seed_thread(&env, "x");

    env.analyzer.fail_times(1);

    env.queue
        .add(vec![scheduled_task("x", profile_id)])
        .await
        .unwrap();
    let task_id = env.queue.snapshot()[0].id;

    let types = [TaskType::Scheduled, TaskType::Manual];
    let _ = env.processor.process_task(&types, &[profile_id]).await;

    let stored = env.queue.task(task_id).unwrap();
    assert!(stored.claim_available_at > Utc::now() + ChronoDuration::minutes(50));

    // The task exists but is not claimable before the back-off deadline.
    let claimed = env.queue.claim(&types, &[profile_id]).await.unwrap();
    assert!(claimed.is_none());
}

#[tokio::test]
async fn scheduled_task_for_undeployed_profile_is_released_untouched() {
    let env = env();

    // Version 1 stays in test mode: the profile is inactive.
    let profile_id = env
        .scout
        .create_profile(ProfileCreateInput {
            name: "test-mode profile".to_string(),
            default_settings: Some(settings_input("filter")),
            sources_settings: Default::default(),
        })
        .await
        .unwrap();
    seed_thread(&env, "x");

    env.queue
        .add(vec![scheduled_task("x", profile_id)])
        .await
        .unwrap();
    let task_id = env.queue.snapshot()[0].id;

    // Warm the cache: the undeployed profile belongs to the inactive set.
    let (active, inactive) = env.processor.profile_sets().await.unwrap();
    assert!(!active.contains(&profile_id));
    assert!(inactive.contains(&profile_id));
    assert!(env.processor.profiles_cache_is_loaded().await);

    let processed = env
        .processor
        .process_task(&[TaskType::Scheduled, TaskType::Manual], &[profile_id])
        .await
        .unwrap();
    assert!(!processed);

    let stored = env.queue.task(task_id).unwrap();
    assert!(!stored.is_claimed);
    assert!(stored.errors.is_empty());
    assert!(stored.committed_at.is_none());
    assert!(stored.failed_at.is_none());

    // The stale cache was dropped so the claim filters get rebuilt.
    assert!(!env.processor.profiles_cache_is_loaded().await);

    assert_eq!(env.analyzer.calls(), 0);
    assert!(env.storage.detections().is_empty());
}

#[tokio::test]
async fn manual_task_runs_against_test_mode_version() {
    let env = env();

    let profile_id = env
        .scout
        .create_profile(ProfileCreateInput {
            name: "p".to_string(),
            default_settings: Some(settings_input("filter")),
            sources_settings: Default::default(),
        })
        .await
        .unwrap();
    seed_thread(&env, "x");

    env.queue
        .add(vec![NewAnalysisTask {
            task_type: TaskType::Manual,
            parameters: AnalysisParameters {
                source: scout::reddit::SOURCE.to_string(),
                source_id: "x".to_string(),
                profile_id,
                should_save: true,
            },
        }])
        .await
        .unwrap();

    let processed = env
        .processor
        .process_task(&[TaskType::Manual], &[profile_id])
        .await
        .unwrap();
    assert!(processed);

    let detections = env.storage.detections();
    assert_eq!(detections.len(), 1);
    // The detection snapshots the version's test mode.
    assert!(detections[0].test_mode);
}

#[tokio::test]
async fn source_specific_settings_win_over_default() {
    let env = env();

    let mut sources_settings = std::collections::HashMap::new();
    sources_settings.insert(
        scout::reddit::SOURCE.to_string(),
        settings_input("reddit-specific"),
    );
    let profile_id = env
        .scout
        .create_profile(ProfileCreateInput {
            name: "p".to_string(),
            default_settings: Some(settings_input("default")),
            sources_settings,
        })
        .await
        .unwrap();
    env.scout.deploy_profile_version(profile_id, 1).await.unwrap();
    seed_thread(&env, "x");

    env.queue
        .add(vec![scheduled_task("x", profile_id)])
        .await
        .unwrap();

    env.processor
        .process_task(&[TaskType::Scheduled, TaskType::Manual], &[profile_id])
        .await
        .unwrap();

    let settings = env.analyzer.last_settings().unwrap();
    assert_eq!(settings.relevancy_filter, "reddit-specific");
    assert_eq!(settings.source.as_deref(), Some(scout::reddit::SOURCE));
}

#[tokio::test]
async fn missing_settings_is_a_task_error() {
    let env = env();

    // A version with neither a source-specific nor a default record.
    let profile_id = env
        .scout
        .create_profile(ProfileCreateInput {
            name: "p".to_string(),
            default_settings: Some(settings_input("temp")),
            sources_settings: Default::default(),
        })
        .await
        .unwrap();
    env.scout
        .update_profile_version(
            profile_id,
            1,
            VersionUpdate {
                default_settings: scout_common::Setting::Null,
                sources_settings: Default::default(),
            },
        )
        .await
        .unwrap();
    env.scout.deploy_profile_version(profile_id, 1).await.unwrap();
    seed_thread(&env, "x");

    env.queue
        .add(vec![scheduled_task("x", profile_id)])
        .await
        .unwrap();
    let task_id = env.queue.snapshot()[0].id;

    let result = env
        .processor
        .process_task(&[TaskType::Scheduled, TaskType::Manual], &[profile_id])
        .await;
    assert!(result.is_err());

    let stored = env.queue.task(task_id).unwrap();
    assert_eq!(stored.errors.len(), 1);
    assert!(stored.errors[0].contains("profile settings"));
    assert!(!stored.is_claimed);
}

#[tokio::test]
async fn concurrent_workers_never_claim_the_same_task() {
    let env = env();
    let profile_id = deployed_profile(&env, "p").await;

    let mut tasks = Vec::new();
    for i in 0..100 {
        let id = format!("post-{i}");
        seed_thread(&env, &id);
        tasks.push(scheduled_task(&id, profile_id));
    }
    env.queue.add(tasks).await.unwrap();

    let mut workers = Vec::new();
    for _ in 0..10 {
        let queue = env.queue.clone();
        workers.push(tokio::spawn(async move {
            let types = [TaskType::Scheduled, TaskType::Manual];
            let mut claimed = Vec::new();
            loop {
                match queue.claim(&types, &[7, profile_id]).await.unwrap() {
                    Some(task) => {
                        claimed.push(task.id);
                        queue.commit(task.id).await.unwrap();
                    }
                    None => break,
                }
            }
            claimed
        }));
    }

    let mut all_claimed = Vec::new();
    for worker in workers {
        all_claimed.extend(worker.await.unwrap());
    }

    // Every task claimed exactly once across all workers.
    let distinct: HashSet<i64> = all_claimed.iter().copied().collect();
    assert_eq!(all_claimed.len(), 100);
    assert_eq!(distinct.len(), 100);

    let committed: HashSet<i64> = env.queue.committed_ids().into_iter().collect();
    assert_eq!(committed, distinct);
}

#[tokio::test]
async fn stale_claims_are_reclaimable() {
    use scout::reclaim::StaleClaimStore;

    let env = env();
    let profile_id = deployed_profile(&env, "p").await;
    seed_thread(&env, "x");

    env.queue
        .add(vec![scheduled_task("x", profile_id)])
        .await
        .unwrap();

    let types = [TaskType::Scheduled];
    let task = env.queue.claim(&types, &[profile_id]).await.unwrap().unwrap();

    // Claimed and in flight: nobody else can take it.
    assert!(env.queue.claim(&types, &[profile_id]).await.unwrap().is_none());

    // The worker vanishes; the reclaimer releases the claim.
    env.queue.unclaim_stale(Duration::ZERO).await.unwrap();

    let reclaimed = env.queue.claim(&types, &[profile_id]).await.unwrap().unwrap();
    assert_eq!(reclaimed.id, task.id);
}
