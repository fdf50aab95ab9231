//! Crawler pagination, dedup and cooldown behavior.

use std::sync::Arc;

use chrono::{Duration, Utc};

use scout::reddit::crawler::{Crawler, CrawlerStorage, Paginator};
use scout::reddit::Post;
use scout::testing::{make_post, MemoryRedditStorage, ScriptedFeed};
use scout_common::config::ScraperSettings;

fn scraper_settings(force_exhausting: bool) -> ScraperSettings {
    ScraperSettings {
        timeout_seconds: 0,
        error_timeout_seconds: 0,
        timeout_after_full_scan_seconds: 3600,
        at_least_one_exhausting_scan: force_exhausting,
        disabled: false,
    }
}

fn posts(ids: &[&str]) -> Vec<Post> {
    ids.iter()
        .map(|id| make_post(id, "b1", 10, Utc::now() - Duration::hours(1)))
        .collect()
}

fn crawler(
    feed: &Arc<ScriptedFeed>,
    storage: &Arc<MemoryRedditStorage>,
    force_exhausting: bool,
) -> Crawler {
    Crawler::new(
        feed.clone(),
        storage.clone(),
        scraper_settings(force_exhausting),
    )
}

#[tokio::test]
async fn inserts_new_posts_and_advances_cursor() {
    let feed = Arc::new(ScriptedFeed::new());
    let storage = Arc::new(MemoryRedditStorage::new());
    storage.bind("b1", &[7]);

    feed.add_page("b1", "", posts(&["a", "b"]), Some("cur1"));
    feed.add_page("b1", "cur1", posts(&["c"]), Some("cur2"));

    let crawler = crawler(&feed, &storage, false);
    let mut paginator = Paginator::new();

    crawler.scrape_tick(&mut paginator).await.unwrap();
    assert_eq!(storage.post_ids(), vec!["a", "b"]);
    assert_eq!(paginator.cursor("b1"), Some("cur1"));

    crawler.scrape_tick(&mut paginator).await.unwrap();
    assert_eq!(storage.post_ids(), vec!["a", "b", "c"]);
    assert_eq!(paginator.cursor("b1"), Some("cur2"));
}

#[tokio::test]
async fn empty_page_starts_cooldown_and_marks_fully_scanned() {
    let feed = Arc::new(ScriptedFeed::new());
    let storage = Arc::new(MemoryRedditStorage::new());
    storage.bind("b1", &[7]);

    feed.add_page("b1", "", Vec::new(), None);

    let crawler = crawler(&feed, &storage, true);
    let mut paginator = Paginator::new();

    crawler.scrape_tick(&mut paginator).await.unwrap();

    assert!(paginator.has_fully_scanned("b1"));
    assert_eq!(paginator.cursor("b1"), Some(""));
    assert!(!paginator.is_available("b1", Utc::now()));
}

#[tokio::test]
async fn overlap_page_short_circuits_without_exhausting_scan() {
    let feed = Arc::new(ScriptedFeed::new());
    let storage = Arc::new(MemoryRedditStorage::new());
    storage.bind("b1", &[7]);

    // Everything on the page is already present in the store.
    let page = posts(&["a", "b"]);
    storage.insert_posts(&page).await.unwrap();
    feed.add_page("b1", "", page, Some("cur1"));

    let crawler = crawler(&feed, &storage, false);
    let mut paginator = Paginator::new();

    crawler.scrape_tick(&mut paginator).await.unwrap();

    // Cooldown with a reset cursor: the next pass starts from the top.
    assert_eq!(paginator.cursor("b1"), Some(""));
    assert!(!paginator.is_available("b1", Utc::now()));
    assert_eq!(storage.post_ids().len(), 2);
}

#[tokio::test]
async fn forced_first_scan_continues_past_overlap() {
    let feed = Arc::new(ScriptedFeed::new());
    let storage = Arc::new(MemoryRedditStorage::new());
    storage.bind("b1", &[7]);

    let page = posts(&["a", "b"]);
    storage.insert_posts(&page).await.unwrap();
    feed.add_page("b1", "", page, Some("cur1"));
    feed.add_page("b1", "cur1", posts(&["old"]), Some("cur2"));

    let crawler = crawler(&feed, &storage, true);
    let mut paginator = Paginator::new();

    // Overlap page: the first pass has not exhausted the board yet, so the
    // crawler keeps paginating instead of cooling down.
    crawler.scrape_tick(&mut paginator).await.unwrap();
    assert_eq!(paginator.cursor("b1"), Some("cur1"));
    assert!(paginator.is_available("b1", Utc::now()));

    crawler.scrape_tick(&mut paginator).await.unwrap();
    assert!(storage.post_ids().contains(&"old".to_string()));
}

#[tokio::test]
async fn removed_boards_are_dropped_from_rotation() {
    let feed = Arc::new(ScriptedFeed::new());
    let storage = Arc::new(MemoryRedditStorage::new());
    storage.bind("b1", &[7]);

    feed.add_page("b1", "", posts(&["a"]), None);

    let crawler = crawler(&feed, &storage, false);
    let mut paginator = Paginator::new();
    crawler.scrape_tick(&mut paginator).await.unwrap();

    // Unbind the board: the next tick has nothing to crawl.
    storage.unbind("b1");

    let result = crawler.scrape_tick(&mut paginator).await;
    assert!(result.is_err());
    assert_eq!(paginator.cursor("b1"), None);
}
