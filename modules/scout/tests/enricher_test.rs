//! Enricher batching, age gating and retry behavior.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::watch;

use scout::reddit::enricher::Enricher;
use scout::reddit::Comment;
use scout::testing::{make_post, make_thread, MemoryRedditStorage, ScriptedThreadFetcher};
use scout_common::config::EnricherSettings;

fn enricher_settings(retries: usize) -> EnricherSettings {
    EnricherSettings {
        batch_size: 50,
        min_post_age_seconds: 3600,
        workers: 4,
        retries,
        timeout_seconds: 0,
        error_timeout_seconds: 0,
        disabled: false,
    }
}

fn comment(id: &str, score: i32) -> Comment {
    Comment {
        id: id.to_string(),
        body: format!("comment {id}"),
        author: String::new(),
        score,
        created_at: None,
        replies: Vec::new(),
    }
}

#[tokio::test]
async fn enriches_only_posts_past_min_age() {
    let fetcher = Arc::new(ScriptedThreadFetcher::new());
    let storage = Arc::new(MemoryRedditStorage::new());
    let (_tx, rx) = watch::channel(false);

    let old_post = make_post("old", "b1", 5, Utc::now() - Duration::hours(2));
    let fresh_post = make_post("fresh", "b1", 5, Utc::now());

    use scout::reddit::crawler::CrawlerStorage;
    storage
        .insert_posts(&[old_post.clone(), fresh_post])
        .await
        .unwrap();

    fetcher.add_thread(make_thread(old_post, vec![comment("c1", 3)]));

    let enricher = Enricher::new(fetcher.clone(), storage.clone(), enricher_settings(1));
    enricher.enrich_batch(&rx).await.unwrap();

    let old = storage.stored_post("old").unwrap();
    assert!(old.is_enriched);
    assert_eq!(old.thread.unwrap().comments.len(), 1);

    // The fresh post is untouched: its comment section has not settled yet.
    let fresh = storage.stored_post("fresh").unwrap();
    assert!(!fresh.is_enriched);
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn retries_transient_thread_failures() {
    let fetcher = Arc::new(ScriptedThreadFetcher::new());
    let storage = Arc::new(MemoryRedditStorage::new());
    let (_tx, rx) = watch::channel(false);

    let post = make_post("flaky", "b1", 5, Utc::now() - Duration::hours(2));

    use scout::reddit::crawler::CrawlerStorage;
    storage.insert_posts(&[post.clone()]).await.unwrap();

    fetcher.add_thread(make_thread(post, Vec::new()));
    fetcher.fail_times("flaky", 2);

    let enricher = Enricher::new(fetcher.clone(), storage.clone(), enricher_settings(3));
    enricher.enrich_batch(&rx).await.unwrap();

    assert!(storage.stored_post("flaky").unwrap().is_enriched);
    assert_eq!(fetcher.calls(), 3);
}

#[tokio::test]
async fn failed_posts_are_skipped_and_left_unenriched() {
    let fetcher = Arc::new(ScriptedThreadFetcher::new());
    let storage = Arc::new(MemoryRedditStorage::new());
    let (_tx, rx) = watch::channel(false);

    let good = make_post("good", "b1", 5, Utc::now() - Duration::hours(2));
    let broken = make_post("broken", "b1", 5, Utc::now() - Duration::hours(2));

    use scout::reddit::crawler::CrawlerStorage;
    storage
        .insert_posts(&[good.clone(), broken])
        .await
        .unwrap();

    // No thread scripted for "broken": every fetch fails.
    fetcher.add_thread(make_thread(good, Vec::new()));

    let enricher = Enricher::new(fetcher, storage.clone(), enricher_settings(2));
    enricher.enrich_batch(&rx).await.unwrap();

    assert!(storage.stored_post("good").unwrap().is_enriched);
    // Still eligible next batch.
    assert!(!storage.stored_post("broken").unwrap().is_enriched);
}
