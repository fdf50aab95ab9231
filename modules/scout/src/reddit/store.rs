//! Postgres storage for crawled posts and subreddit profile bindings.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;

use scout_common::{Result, ScoutError};

use super::crawler::CrawlerStorage;
use super::enricher::EnricherStorage;
use super::scheduler::SchedulerStorage;
use super::toolkit::ToolkitStorage;
use super::{Post, SubredditSettings, Thread};

pub struct PgRedditStorage {
    pool: PgPool,
}

impl PgRedditStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CrawlerStorage for PgRedditStorage {
    async fn insert_posts(&self, posts: &[Post]) -> Result<()> {
        if posts.is_empty() {
            return Ok(());
        }

        let mut post_ids = Vec::with_capacity(posts.len());
        let mut subreddits = Vec::with_capacity(posts.len());
        let mut payloads = Vec::with_capacity(posts.len());
        let mut scores = Vec::with_capacity(posts.len());
        let mut created_ats = Vec::with_capacity(posts.len());

        for post in posts {
            post_ids.push(post.id.clone());
            subreddits.push(post.subreddit.clone());
            payloads.push(
                serde_json::to_value(post)
                    .map_err(|err| ScoutError::Other(anyhow::anyhow!("serialize post: {err}")))?,
            );
            scores.push(post.score);
            created_ats.push(post.created_at.unwrap_or_else(Utc::now));
        }

        sqlx::query(
            r#"
            INSERT INTO reddit.posts (post_id, subreddit, post_json, score, post_created_at)
            SELECT * FROM UNNEST($1::text[], $2::text[], $3::jsonb[], $4::int[], $5::timestamptz[])
            ON CONFLICT (post_id) DO NOTHING
            "#,
        )
        .bind(&post_ids)
        .bind(&subreddits)
        .bind(&payloads)
        .bind(&scores)
        .bind(&created_ats)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn check_presence(&self, post_ids: &[String]) -> Result<HashSet<String>> {
        let present: Vec<String> =
            sqlx::query_scalar("SELECT post_id FROM reddit.posts WHERE post_id = ANY($1)")
                .bind(post_ids)
                .fetch_all(&self.pool)
                .await?;

        Ok(present.into_iter().collect())
    }

    async fn subreddits_for_scraping(&self) -> Result<Vec<String>> {
        let subreddits: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT subreddit FROM reddit.subreddit_settings")
                .fetch_all(&self.pool)
                .await?;

        Ok(subreddits)
    }
}

#[async_trait]
impl EnricherStorage for PgRedditStorage {
    async fn posts_for_enrichment(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>> {
        let post_ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT post_id
            FROM reddit.posts
            WHERE NOT is_enriched AND post_created_at < $1
            ORDER BY post_created_at
            LIMIT $2
            "#,
        )
        .bind(created_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(post_ids)
    }

    async fn enrich_posts(&self, threads: &[Thread]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for thread in threads {
            let payload = serde_json::to_value(thread)
                .map_err(|err| ScoutError::Other(anyhow::anyhow!("serialize thread: {err}")))?;

            sqlx::query(
                r#"
                UPDATE reddit.posts
                SET enriched_post_json = $1,
                    score = $2,
                    is_enriched = true,
                    enriched_at = now()
                WHERE post_id = $3
                "#,
            )
            .bind(payload)
            .bind(thread.post.score)
            .bind(thread.id())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl SchedulerStorage for PgRedditStorage {
    async fn posts_for_scheduling(&self, limit: i64, min_score: i32) -> Result<Vec<Thread>> {
        let rows: Vec<Json<Thread>> = sqlx::query_scalar(
            r#"
            SELECT enriched_post_json
            FROM reddit.posts
            WHERE is_enriched AND NOT is_scheduled AND score >= $1
            ORDER BY post_created_at
            LIMIT $2
            "#,
        )
        .bind(min_score)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|row| row.0).collect())
    }

    async fn subreddits_settings(&self, subreddits: &[String]) -> Result<Vec<SubredditSettings>> {
        let rows: Vec<(String, Vec<i64>)> = sqlx::query_as(
            r#"
            SELECT subreddit, profiles
            FROM reddit.subreddit_settings
            WHERE subreddit = ANY($1)
            "#,
        )
        .bind(subreddits)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(subreddit, profiles)| SubredditSettings {
                subreddit,
                profiles,
            })
            .collect())
    }

    async fn mark_posts_scheduled(&self, post_ids: &[String]) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE reddit.posts
            SET is_scheduled = true, scheduled_at = now()
            WHERE post_id = ANY($1)
            "#,
        )
        .bind(post_ids)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ToolkitStorage for PgRedditStorage {
    async fn get_threads(&self, post_ids: &[String]) -> Result<Vec<Thread>> {
        let rows: Vec<Json<Thread>> = sqlx::query_scalar(
            r#"
            SELECT enriched_post_json
            FROM reddit.posts
            WHERE post_id = ANY($1) AND enriched_post_json IS NOT NULL
            "#,
        )
        .bind(post_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|row| row.0).collect())
    }

    async fn get_raw_posts(&self, post_ids: &[String]) -> Result<Vec<(String, serde_json::Value)>> {
        let rows: Vec<(String, serde_json::Value)> = sqlx::query_as(
            r#"
            SELECT post_id, post_json
            FROM reddit.posts
            WHERE post_id = ANY($1)
            "#,
        )
        .bind(post_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn all_subreddit_settings(&self) -> Result<Vec<SubredditSettings>> {
        let rows: Vec<(String, Vec<i64>)> =
            sqlx::query_as("SELECT subreddit, profiles FROM reddit.subreddit_settings")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .map(|(subreddit, profiles)| SubredditSettings {
                subreddit,
                profiles,
            })
            .collect())
    }

    async fn subreddit_settings_with_profile(
        &self,
        profile_id: i64,
    ) -> Result<Vec<SubredditSettings>> {
        let rows: Vec<(String, Vec<i64>)> = sqlx::query_as(
            r#"
            SELECT subreddit, profiles
            FROM reddit.subreddit_settings
            WHERE $1 = ANY(profiles)
            "#,
        )
        .bind(profile_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(subreddit, profiles)| SubredditSettings {
                subreddit,
                profiles,
            })
            .collect())
    }

    async fn add_profiles_to_subreddit(&self, subreddit: &str, profile_ids: &[i64]) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO reddit.subreddit_settings AS ss (subreddit, profiles)
            VALUES ($1, $2)
            ON CONFLICT (subreddit) DO UPDATE
            SET profiles = (
                SELECT array_agg(DISTINCT profile_id ORDER BY profile_id)
                FROM unnest(ss.profiles || EXCLUDED.profiles) AS profile_id
            )
            "#,
        )
        .bind(subreddit)
        .bind(profile_ids)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove_profiles_from_subreddit(
        &self,
        subreddit: &str,
        profile_ids: &[i64],
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE reddit.subreddit_settings
            SET profiles = (
                SELECT COALESCE(array_agg(profile_id ORDER BY profile_id), '{}')
                FROM unnest(profiles) AS profile_id
                WHERE NOT (profile_id = ANY($2))
            )
            WHERE subreddit = $1
            "#,
        )
        .bind(subreddit)
        .bind(profile_ids)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove_profile_from_all_subreddits(&self, profile_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE reddit.subreddit_settings
            SET profiles = array_remove(profiles, $1)
            WHERE $1 = ANY(profiles)
            "#,
        )
        .bind(profile_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn scheduled_post_ids_in_subreddits(
        &self,
        subreddits: &[String],
        days: Option<i64>,
        limit: Option<i64>,
    ) -> Result<Vec<String>> {
        let post_ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT post_id
            FROM reddit.posts
            WHERE subreddit = ANY($1)
              AND is_scheduled
              AND ($2::bigint IS NULL OR post_created_at > now() - $2 * interval '1 day')
            ORDER BY post_created_at DESC
            LIMIT $3
            "#,
        )
        .bind(subreddits)
        .bind(days)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(post_ids)
    }
}
