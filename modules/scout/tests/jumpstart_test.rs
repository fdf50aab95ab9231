//! Jumpstart: historic item enumeration and already-analyzed dedup.

mod harness;

use chrono::{Duration, Utc};

use harness::{deployed_profile, env};
use scout::testing::{make_post, make_thread};
use scout_common::TaskType;

fn seed_scheduled(env: &harness::Env, id: &str, subreddit: &str, age_days: i64) {
    let post = make_post(id, subreddit, 10, Utc::now() - Duration::days(age_days));
    env.reddit.seed_enriched(make_thread(post, Vec::new()), true);
}

#[tokio::test]
async fn enqueues_manual_tasks_for_bound_boards() {
    let env = env();
    let profile_id = deployed_profile(&env, "p").await;

    env.reddit.bind("b1", &[profile_id]);
    seed_scheduled(&env, "x", "b1", 1);
    seed_scheduled(&env, "y", "b1", 2);
    // Bound to nobody: never part of a jumpstart for this profile.
    seed_scheduled(&env, "other", "b2", 1);

    env.scout
        .jumpstart_profile(profile_id, false, None, None)
        .await
        .unwrap();

    let tasks = env.queue.snapshot();
    assert_eq!(tasks.len(), 2);
    assert!(tasks.iter().all(|t| t.task_type == TaskType::Manual));
    assert!(tasks.iter().all(|t| t.parameters.should_save));

    let ids: Vec<&str> = tasks
        .iter()
        .map(|t| t.parameters.source_id.as_str())
        .collect();
    assert!(ids.contains(&"x"));
    assert!(ids.contains(&"y"));
}

#[tokio::test]
async fn excludes_already_analyzed_items() {
    let env = env();
    let profile_id = deployed_profile(&env, "p").await;

    env.reddit.bind("b1", &[profile_id]);
    seed_scheduled(&env, "x", "b1", 1);
    seed_scheduled(&env, "y", "b1", 2);

    // "x" already has a detection for this profile.
    use scout::scout::ScoutStorage;
    env.storage
        .save_detection(scout_common::NewDetection {
            source: scout::reddit::SOURCE.to_string(),
            source_id: "x".to_string(),
            profile_id,
            version: 1,
            test_mode: false,
            is_relevant: true,
            properties: Default::default(),
        })
        .await
        .unwrap();

    env.scout
        .jumpstart_profile(profile_id, true, None, None)
        .await
        .unwrap();

    let tasks = env.queue.snapshot();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].parameters.source_id, "y");
}

#[tokio::test]
async fn period_window_excludes_old_items() {
    let env = env();
    let profile_id = deployed_profile(&env, "p").await;

    env.reddit.bind("b1", &[profile_id]);
    seed_scheduled(&env, "recent", "b1", 2);
    seed_scheduled(&env, "ancient", "b1", 90);

    env.scout
        .jumpstart_profile(profile_id, false, Some(7), None)
        .await
        .unwrap();

    let tasks = env.queue.snapshot();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].parameters.source_id, "recent");
}

#[tokio::test]
async fn dry_jumpstart_enqueues_nothing() {
    let env = env();
    let profile_id = deployed_profile(&env, "p").await;

    env.reddit.bind("b1", &[profile_id]);
    seed_scheduled(&env, "x", "b1", 1);

    let parameters = env
        .scout
        .dry_jumpstart_profile(profile_id, false, None, None)
        .await
        .unwrap();

    assert_eq!(parameters.len(), 1);
    assert_eq!(parameters[0].source_id, "x");
    assert!(env.queue.snapshot().is_empty());
}
