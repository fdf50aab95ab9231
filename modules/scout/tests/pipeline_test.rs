//! End-to-end pipeline over the in-memory fixtures:
//! crawl → enrich → schedule → process → detection.

mod harness;

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::watch;

use harness::{deployed_profile, env};
use scout::reddit::crawler::{Crawler, Paginator};
use scout::reddit::enricher::Enricher;
use scout::reddit::scheduler::Scheduler;
use scout::reddit::Comment;
use scout::testing::{make_post, make_thread, ScriptedFeed, ScriptedThreadFetcher};
use scout_common::config::{EnricherSettings, ScraperSettings, SchedulerSettings};
use scout_common::{DetectionOrder, DetectionQuery, ProfileFilter, SourceVersionsFilter, TaskType};

#[tokio::test]
async fn crawled_post_ends_as_detection() {
    let env = env();
    let profile_id = deployed_profile(&env, "interesting launches").await;
    env.reddit.bind("b1", &[profile_id]);

    // The source serves one two-day-old post.
    let post = make_post("x", "b1", 42, Utc::now() - Duration::days(2));
    let feed = Arc::new(ScriptedFeed::new());
    feed.add_page("b1", "", vec![post.clone()], None);

    let fetcher = Arc::new(ScriptedThreadFetcher::new());
    fetcher.add_thread(make_thread(
        post,
        vec![Comment {
            id: "c1".to_string(),
            body: "great idea".to_string(),
            author: String::new(),
            score: 3,
            created_at: None,
            replies: Vec::new(),
        }],
    ));

    let crawler = Crawler::new(
        feed,
        env.reddit.clone(),
        ScraperSettings {
            timeout_seconds: 0,
            error_timeout_seconds: 0,
            timeout_after_full_scan_seconds: 3600,
            at_least_one_exhausting_scan: false,
            disabled: false,
        },
    );
    let enricher = Enricher::new(
        fetcher,
        env.reddit.clone(),
        EnricherSettings {
            batch_size: 10,
            min_post_age_seconds: 3600,
            workers: 2,
            retries: 1,
            timeout_seconds: 0,
            error_timeout_seconds: 0,
            disabled: false,
        },
    );
    let scheduler = Scheduler::new(
        env.reddit.clone(),
        env.scout.clone(),
        SchedulerSettings {
            batch_size: 10,
            min_score: 0,
            timeout_seconds: 0,
            error_timeout_seconds: 0,
            disabled: false,
        },
    );

    // Crawl
    let mut paginator = Paginator::new();
    crawler.scrape_tick(&mut paginator).await.unwrap();
    assert_eq!(env.reddit.post_ids(), vec!["x"]);

    // Enrich
    let (_tx, rx) = watch::channel(false);
    enricher.enrich_batch(&rx).await.unwrap();
    assert!(env.reddit.stored_post("x").unwrap().is_enriched);

    // Schedule
    scheduler.schedule_batch().await.unwrap();
    let tasks = env.queue.snapshot();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].task_type, TaskType::Scheduled);
    assert!(env.reddit.stored_post("x").unwrap().is_scheduled);

    // Process
    let processed = env
        .processor
        .process_task(&[TaskType::Scheduled, TaskType::Manual], &[profile_id])
        .await
        .unwrap();
    assert!(processed);
    assert_eq!(env.queue.committed_ids().len(), 1);
    assert_eq!(env.analyzer.calls(), 1);

    // Detection
    let detections = env.storage.detections();
    assert_eq!(detections.len(), 1);
    let detection = &detections[0];
    assert_eq!(detection.source, scout::reddit::SOURCE);
    assert_eq!(detection.source_id, "x");
    assert_eq!(detection.profile_id, profile_id);
    assert_eq!(detection.version, 1);
    assert!(!detection.test_mode);
    assert!(detection.is_relevant);
}

#[tokio::test]
async fn detection_is_listable_by_profile_source_and_version() {
    let env = env();
    let profile_id = deployed_profile(&env, "p").await;
    env.reddit.bind("b1", &[profile_id]);

    let post = make_post("x", "b1", 10, Utc::now() - Duration::days(1));
    env.reddit.seed_enriched(make_thread(post, Vec::new()), true);

    use scout::scout::TaskAdder;
    env.queue
        .add(vec![scout_common::NewAnalysisTask {
            task_type: TaskType::Scheduled,
            parameters: scout_common::AnalysisParameters {
                source: scout::reddit::SOURCE.to_string(),
                source_id: "x".to_string(),
                profile_id,
                should_save: true,
            },
        }])
        .await
        .unwrap();

    env.processor
        .process_task(&[TaskType::Scheduled], &[profile_id])
        .await
        .unwrap();

    let query = DetectionQuery {
        last_seen_id: None,
        limit: 10,
        order: DetectionOrder::Desc,
        filter: scout_common::DetectionFilter {
            profiles: Some(vec![ProfileFilter {
                profile_id,
                source_versions: vec![SourceVersionsFilter {
                    source: Some(scout::reddit::SOURCE.to_string()),
                    versions: vec![1],
                }],
            }]),
            sources: None,
            is_relevant: None,
            tags: Default::default(),
        },
    };

    let listed = env.scout.list_detections(&query).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].source_id, "x");

    // A different version filter excludes it.
    let mut other_version = query.clone();
    other_version.filter.profiles = Some(vec![ProfileFilter {
        profile_id,
        source_versions: vec![SourceVersionsFilter {
            source: Some(scout::reddit::SOURCE.to_string()),
            versions: vec![2],
        }],
    }]);
    assert!(env
        .scout
        .list_detections(&other_version)
        .await
        .unwrap()
        .is_empty());
}
