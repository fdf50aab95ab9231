//! Client for the public Reddit JSON listing API.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};

use scout_common::{Result, ScoutError};

use super::{Comment, Post, Thread};
use crate::reddit::crawler::PostFeed;
use crate::reddit::enricher::ThreadFetcher;
use crate::store::RequestsLog;

/// Reddit caps listing pages at 100 entries.
pub const MAX_POSTS_PER_REQUEST: usize = 100;

pub struct Client {
    http: reqwest::Client,
    base_url: String,
    user_agent: String,
    requests_log: Arc<dyn RequestsLog>,
}

// ---------------------------------------------------------------------------
// Wire types (the listing envelope Reddit serves)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Listing {
    data: ListingData,
}

#[derive(Debug, Default, Deserialize)]
struct ListingData {
    #[serde(default)]
    after: Option<String>,
    #[serde(default)]
    children: Vec<Thing>,
}

/// A `kind`-tagged payload; `t3` is a post, `t1` a comment.
#[derive(Debug, Deserialize)]
struct Thing {
    kind: String,
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WirePost {
    id: String,
    /// Fullname, e.g. "t3_abc123".
    name: String,
    subreddit: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    selftext: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    permalink: String,
    #[serde(default)]
    score: i32,
    #[serde(default)]
    upvote_ratio: f32,
    #[serde(default)]
    num_comments: i32,
    #[serde(default)]
    author: String,
    created_utc: Option<f64>,
    #[serde(default, rename = "over_18")]
    nsfw: bool,
}

#[derive(Debug, Deserialize)]
struct WireComment {
    id: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    author: String,
    #[serde(default)]
    score: i32,
    created_utc: Option<f64>,
    /// Either an empty string or a nested listing.
    #[serde(default)]
    replies: serde_json::Value,
}

fn epoch_to_datetime(epoch: Option<f64>) -> Option<DateTime<Utc>> {
    epoch.and_then(|secs| DateTime::from_timestamp(secs as i64, 0))
}

impl WirePost {
    fn into_post(self) -> Post {
        Post {
            id: self.id,
            full_id: self.name,
            subreddit: self.subreddit,
            title: self.title,
            body: self.selftext,
            url: self.url,
            permalink: self.permalink,
            score: self.score,
            upvote_ratio: self.upvote_ratio,
            num_comments: self.num_comments,
            author: self.author,
            created_at: epoch_to_datetime(self.created_utc),
            nsfw: self.nsfw,
        }
    }
}

impl WireComment {
    fn into_comment(self) -> Comment {
        let replies = parse_comment_children(&self.replies);
        Comment {
            id: self.id,
            body: self.body,
            author: self.author,
            score: self.score,
            created_at: epoch_to_datetime(self.created_utc),
            replies,
        }
    }
}

/// Pull the `t1` children out of a listing value, ignoring `more` stubs and
/// the empty-string stand-in Reddit uses for childless reply sections.
fn parse_comment_children(value: &serde_json::Value) -> Vec<Comment> {
    let Ok(listing) = serde_json::from_value::<Listing>(value.clone()) else {
        return Vec::new();
    };

    listing
        .data
        .children
        .into_iter()
        .filter(|thing| thing.kind == "t1")
        .filter_map(|thing| serde_json::from_value::<WireComment>(thing.data).ok())
        .map(WireComment::into_comment)
        .collect()
}

impl Client {
    pub fn new(
        base_url: impl Into<String>,
        user_agent: impl Into<String>,
        requests_log: Arc<dyn RequestsLog>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user_agent: user_agent.into(),
            requests_log,
        }
    }

    async fn fetch_json(&self, url: &str) -> Result<serde_json::Value> {
        let response = self
            .http
            .get(url)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .send()
            .await
            .map_err(|err| ScoutError::Source(format!("reddit request: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ScoutError::Source(format!(
                "reddit returned {status} for {url}"
            )));
        }

        response
            .json()
            .await
            .map_err(|err| ScoutError::Source(format!("reddit response body: {err}")))
    }

    async fn audit(&self, request_type: &str, request: serde_json::Value, response: serde_json::Value) {
        if let Err(err) = self.requests_log.save(request_type, request, response).await {
            warn!(request_type, error = %err, "failed to save request log");
        }
    }

    /// One page of newest posts from a subreddit. Returns the posts and the
    /// cursor for the next page (None once exhausted).
    pub async fn get_posts(
        &self,
        subreddit: &str,
        after: &str,
        limit: usize,
    ) -> Result<(Vec<Post>, Option<String>)> {
        let limit = limit.min(MAX_POSTS_PER_REQUEST);

        debug!(subreddit, after, "retrieving posts");

        let mut url = format!(
            "{}/r/{}/new.json?raw_json=1&limit={}",
            self.base_url, subreddit, limit
        );
        if !after.is_empty() {
            url.push_str(&format!("&after={after}"));
        }

        let body = self.fetch_json(&url).await?;
        let listing: Listing = serde_json::from_value(body)
            .map_err(|err| ScoutError::Source(format!("reddit listing shape: {err}")))?;

        let next = listing.data.after;
        let posts: Vec<Post> = listing
            .data
            .children
            .into_iter()
            .filter(|thing| thing.kind == "t3")
            .filter_map(|thing| serde_json::from_value::<WirePost>(thing.data).ok())
            .map(WirePost::into_post)
            .collect();

        info!(subreddit, posts_count = posts.len(), "retrieved posts");

        self.audit(
            "get_posts",
            serde_json::json!({"subreddit": subreddit, "after": after, "limit": limit}),
            serde_json::to_value(&posts).unwrap_or_default(),
        )
        .await;

        Ok((posts, next))
    }

    /// A post with its full comment section.
    pub async fn get_thread(&self, id: &str) -> Result<Thread> {
        let url = format!("{}/comments/{}.json?raw_json=1", self.base_url, id);

        let body = self.fetch_json(&url).await?;
        let listings: Vec<Listing> = serde_json::from_value(body)
            .map_err(|err| ScoutError::Source(format!("reddit thread shape: {err}")))?;

        let post = listings
            .first()
            .and_then(|listing| {
                listing
                    .data
                    .children
                    .iter()
                    .find(|thing| thing.kind == "t3")
            })
            .and_then(|thing| serde_json::from_value::<WirePost>(thing.data.clone()).ok())
            .map(WirePost::into_post)
            .ok_or_else(|| ScoutError::Source(format!("thread {id} has no post")))?;

        let comments = listings
            .get(1)
            .map(|listing| {
                listing
                    .data
                    .children
                    .iter()
                    .filter(|thing| thing.kind == "t1")
                    .filter_map(|thing| {
                        serde_json::from_value::<WireComment>(thing.data.clone()).ok()
                    })
                    .map(WireComment::into_comment)
                    .collect()
            })
            .unwrap_or_default();

        let thread = Thread { post, comments };

        self.audit(
            "get_thread",
            serde_json::json!({"post_id": id}),
            serde_json::to_value(&thread).unwrap_or_default(),
        )
        .await;

        Ok(thread)
    }
}

#[async_trait]
impl PostFeed for Client {
    async fn get_posts(
        &self,
        subreddit: &str,
        after: &str,
        limit: usize,
    ) -> Result<(Vec<Post>, Option<String>)> {
        Client::get_posts(self, subreddit, after, limit).await
    }
}

#[async_trait]
impl ThreadFetcher for Client {
    async fn get_thread(&self, id: &str) -> Result<Thread> {
        Client::get_thread(self, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_parses_posts_and_cursor() {
        let body = serde_json::json!({
            "kind": "Listing",
            "data": {
                "after": "t3_next",
                "children": [
                    {"kind": "t3", "data": {
                        "id": "abc", "name": "t3_abc", "subreddit": "rust",
                        "title": "hello", "selftext": "body", "score": 12,
                        "num_comments": 3, "author": "someone",
                        "created_utc": 1700000000.0
                    }},
                    {"kind": "more", "data": {"count": 5}}
                ]
            }
        });

        let listing: Listing = serde_json::from_value(body).unwrap();
        assert_eq!(listing.data.after.as_deref(), Some("t3_next"));

        let posts: Vec<Post> = listing
            .data
            .children
            .into_iter()
            .filter(|t| t.kind == "t3")
            .filter_map(|t| serde_json::from_value::<WirePost>(t.data).ok())
            .map(WirePost::into_post)
            .collect();

        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].id, "abc");
        assert_eq!(posts[0].full_id, "t3_abc");
        assert!(posts[0].created_at.is_some());
    }

    #[test]
    fn comment_replies_parse_nested_listing() {
        let comment = serde_json::json!({
            "id": "c1", "body": "top", "score": 5, "created_utc": 1700000000.0,
            "replies": {
                "kind": "Listing",
                "data": {"children": [
                    {"kind": "t1", "data": {"id": "c2", "body": "nested", "score": 1, "replies": ""}}
                ]}
            }
        });

        let comment: WireComment = serde_json::from_value(comment).unwrap();
        let comment = comment.into_comment();
        assert_eq!(comment.replies.len(), 1);
        assert_eq!(comment.replies[0].id, "c2");
        assert!(comment.replies[0].replies.is_empty());
    }

    #[test]
    fn empty_string_replies_are_no_comments() {
        assert!(parse_comment_children(&serde_json::Value::String(String::new())).is_empty());
    }
}
