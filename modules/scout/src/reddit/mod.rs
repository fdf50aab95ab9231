//! Reddit content source: crawling, enrichment, scheduling and analysis of
//! subreddit posts. Subreddits play the role of boards for profile bindings.

pub mod analyzer;
pub mod client;
pub mod crawler;
pub mod enricher;
pub mod scheduler;
pub mod store;
pub mod toolkit;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Source name this module registers under.
pub const SOURCE: &str = "reddit";

/// A post as captured from a subreddit listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    /// Fullname ("t3_..."), used as the listing pagination cursor.
    pub full_id: String,
    pub subreddit: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub permalink: String,
    pub score: i32,
    #[serde(default)]
    pub upvote_ratio: f32,
    #[serde(default)]
    pub num_comments: i32,
    #[serde(default)]
    pub author: String,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub nsfw: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub body: String,
    #[serde(default)]
    pub author: String,
    pub score: i32,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub replies: Vec<Comment>,
}

/// A post together with its comment section; what enrichment produces and
/// the analyzer consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub post: Post,
    pub comments: Vec<Comment>,
}

impl Thread {
    pub fn id(&self) -> &str {
        &self.post.id
    }
}

/// Profile bindings of one subreddit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubredditSettings {
    pub subreddit: String,
    pub profiles: Vec<i64>,
}
