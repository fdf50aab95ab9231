//! Postgres storage for profiles (with versions and settings), detections
//! and detection tags.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};

use scout_common::{
    DetectionOrder, DetectionQuery, DetectionRecord, DetectionTags, DetectionTagsUpdate,
    NewDetection, Profile, ProfileCreateInput, ProfileSettings, ProfileSettingsInput,
    ProfileUpdate, ProfileVersion, Result, ScoutError, Setting, VersionCreateInput, VersionUpdate,
};

use crate::scout::ScoutStorage;

pub struct PgScoutStorage {
    pool: PgPool,
}

#[derive(Debug, sqlx::FromRow)]
struct ProfileRow {
    id: i64,
    name: String,
    selected_version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct VersionRow {
    profile_id: i64,
    version: i64,
    test_mode: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct SettingsRow {
    profile_id: i64,
    version: i64,
    source: Option<String>,
    relevancy_filter: String,
    extracted_properties: Json<HashMap<String, String>>,
}

impl SettingsRow {
    fn into_settings(self) -> ProfileSettings {
        ProfileSettings {
            profile_id: self.profile_id,
            version: self.version,
            source: self.source,
            relevancy_filter: self.relevancy_filter,
            extracted_properties: self.extracted_properties.0,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DetectionRow {
    id: i64,
    source: String,
    source_id: String,
    profile_id: i64,
    version: i64,
    test_mode: bool,
    is_relevant: bool,
    properties: Json<HashMap<String, Option<String>>>,
    created_at: DateTime<Utc>,
}

impl DetectionRow {
    fn into_record(self) -> DetectionRecord {
        DetectionRecord {
            id: self.id,
            source: self.source,
            source_id: self.source_id,
            profile_id: self.profile_id,
            version: self.version,
            test_mode: self.test_mode,
            is_relevant: self.is_relevant,
            properties: self.properties.0,
            created_at: self.created_at,
        }
    }
}

impl PgScoutStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Assemble profiles from their three tables.
    fn stitch(
        profiles: Vec<ProfileRow>,
        versions: Vec<VersionRow>,
        settings: Vec<SettingsRow>,
    ) -> Vec<Profile> {
        let mut result: HashMap<i64, Profile> = profiles
            .into_iter()
            .map(|row| {
                (
                    row.id,
                    Profile {
                        id: row.id,
                        name: row.name,
                        selected_version: row.selected_version,
                        versions: Vec::new(),
                        created_at: row.created_at,
                        updated_at: row.updated_at,
                    },
                )
            })
            .collect();

        for row in versions {
            if let Some(profile) = result.get_mut(&row.profile_id) {
                profile.versions.push(ProfileVersion {
                    version: row.version,
                    test_mode: row.test_mode,
                    default_settings: None,
                    sources_settings: HashMap::new(),
                    created_at: row.created_at,
                    updated_at: row.updated_at,
                });
            }
        }

        for row in settings {
            let Some(profile) = result.get_mut(&row.profile_id) else {
                continue;
            };
            let Some(version) = profile
                .versions
                .iter_mut()
                .find(|v| v.version == row.version)
            else {
                continue;
            };

            match row.source.clone() {
                None => version.default_settings = Some(row.into_settings()),
                Some(source) => {
                    version.sources_settings.insert(source, row.into_settings());
                }
            }
        }

        let mut profiles: Vec<Profile> = result.into_values().collect();
        for profile in &mut profiles {
            profile.versions.sort_by_key(|v| v.version);
        }
        profiles.sort_by_key(|p| p.id);
        profiles
    }

    async fn insert_version(
        tx: &mut Transaction<'_, Postgres>,
        profile_id: i64,
        version: i64,
        input: &VersionCreateInput,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scout.profile_versions (profile_id, version, test_mode)
            VALUES ($1, $2, true)
            "#,
        )
        .bind(profile_id)
        .bind(version)
        .execute(&mut **tx)
        .await?;

        let mut entries: Vec<(Option<&str>, &ProfileSettingsInput)> = Vec::new();
        if let Some(default) = &input.default_settings {
            entries.push((None, default));
        }
        for (source, settings) in &input.sources_settings {
            entries.push((Some(source.as_str()), settings));
        }

        for (source, settings) in entries {
            Self::upsert_settings(tx, profile_id, version, source, settings).await?;
        }

        Ok(())
    }

    async fn upsert_settings(
        tx: &mut Transaction<'_, Postgres>,
        profile_id: i64,
        version: i64,
        source: Option<&str>,
        settings: &ProfileSettingsInput,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scout.profile_settings
                (profile_id, version, source, relevancy_filter, extracted_properties)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (profile_id, version, source) DO UPDATE
            SET relevancy_filter = EXCLUDED.relevancy_filter,
                extracted_properties = EXCLUDED.extracted_properties,
                updated_at = now()
            "#,
        )
        .bind(profile_id)
        .bind(version)
        .bind(source)
        .bind(&settings.relevancy_filter)
        .bind(Json(&settings.extracted_properties))
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn delete_settings(
        tx: &mut Transaction<'_, Postgres>,
        profile_id: i64,
        version: i64,
        source: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM scout.profile_settings
            WHERE profile_id = $1 AND version = $2 AND source IS NOT DISTINCT FROM $3
            "#,
        )
        .bind(profile_id)
        .bind(version)
        .bind(source)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ScoutStorage for PgScoutStorage {
    async fn get_all_profiles(&self) -> Result<Vec<Profile>> {
        let profiles = sqlx::query_as::<_, ProfileRow>(
            "SELECT id, name, selected_version, created_at, updated_at FROM scout.profiles",
        )
        .fetch_all(&self.pool)
        .await?;

        let versions = sqlx::query_as::<_, VersionRow>(
            r#"
            SELECT profile_id, version, test_mode, created_at, updated_at
            FROM scout.profile_versions
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let settings = sqlx::query_as::<_, SettingsRow>(
            r#"
            SELECT profile_id, version, source, relevancy_filter, extracted_properties
            FROM scout.profile_settings
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(Self::stitch(profiles, versions, settings))
    }

    async fn get_profile(&self, id: i64) -> Result<Option<Profile>> {
        let profile = sqlx::query_as::<_, ProfileRow>(
            r#"
            SELECT id, name, selected_version, created_at, updated_at
            FROM scout.profiles
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(profile) = profile else {
            return Ok(None);
        };

        let versions = sqlx::query_as::<_, VersionRow>(
            r#"
            SELECT profile_id, version, test_mode, created_at, updated_at
            FROM scout.profile_versions
            WHERE profile_id = $1
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let settings = sqlx::query_as::<_, SettingsRow>(
            r#"
            SELECT profile_id, version, source, relevancy_filter, extracted_properties
            FROM scout.profile_settings
            WHERE profile_id = $1
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Self::stitch(vec![profile], versions, settings).pop())
    }

    async fn create_profile(&self, input: ProfileCreateInput) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let profile_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO scout.profiles (name, selected_version)
            VALUES ($1, 1)
            RETURNING id
            "#,
        )
        .bind(&input.name)
        .fetch_one(&mut *tx)
        .await?;

        let version_input = VersionCreateInput {
            default_settings: input.default_settings,
            sources_settings: input.sources_settings,
        };
        Self::insert_version(&mut tx, profile_id, 1, &version_input).await?;

        tx.commit().await?;
        Ok(profile_id)
    }

    async fn create_profile_version(
        &self,
        profile_id: i64,
        input: VersionCreateInput,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let max_version: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(version) FROM scout.profile_versions WHERE profile_id = $1",
        )
        .bind(profile_id)
        .fetch_one(&mut *tx)
        .await?;

        let Some(max_version) = max_version else {
            return Err(ScoutError::NotFound(format!("profile {profile_id}")));
        };

        let version = max_version + 1;
        Self::insert_version(&mut tx, profile_id, version, &input).await?;

        tx.commit().await?;
        Ok(version)
    }

    async fn update_profile(&self, update: ProfileUpdate) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scout.profiles
            SET name = COALESCE($2, name), updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(update.profile_id)
        .bind(update.name)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_profile_version(
        &self,
        profile_id: i64,
        version: i64,
        update: VersionUpdate,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let test_mode: Option<bool> = sqlx::query_scalar(
            r#"
            SELECT test_mode
            FROM scout.profile_versions
            WHERE profile_id = $1 AND version = $2
            FOR UPDATE
            "#,
        )
        .bind(profile_id)
        .bind(version)
        .fetch_optional(&mut *tx)
        .await?;

        match test_mode {
            None => {
                return Err(ScoutError::NotFound(format!(
                    "version {version} of profile {profile_id}"
                )))
            }
            Some(false) => {
                return Err(ScoutError::PreconditionViolated(
                    "version is not in test mode".to_string(),
                ))
            }
            Some(true) => {}
        }

        match &update.default_settings {
            Setting::Unset => {}
            Setting::Null => {
                Self::delete_settings(&mut tx, profile_id, version, None).await?;
            }
            Setting::Value(settings) => {
                Self::upsert_settings(&mut tx, profile_id, version, None, settings).await?;
            }
        }

        for (source, settings) in &update.sources_settings {
            match settings {
                None => {
                    Self::delete_settings(&mut tx, profile_id, version, Some(source)).await?;
                }
                Some(settings) => {
                    Self::upsert_settings(&mut tx, profile_id, version, Some(source), settings)
                        .await?;
                }
            }
        }

        sqlx::query(
            r#"
            UPDATE scout.profile_versions
            SET updated_at = now()
            WHERE profile_id = $1 AND version = $2
            "#,
        )
        .bind(profile_id)
        .bind(version)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn deploy_profile_version(&self, profile_id: i64, version: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE scout.profile_versions
            SET test_mode = false, updated_at = now()
            WHERE profile_id = $1 AND version = $2
            "#,
        )
        .bind(profile_id)
        .bind(version)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(ScoutError::NotFound(format!(
                "version {version} of profile {profile_id}"
            )));
        }

        sqlx::query(
            r#"
            UPDATE scout.profiles
            SET selected_version = $2, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(profile_id)
        .bind(version)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete_profile(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM scout.detection_tags
            WHERE detection_id IN (SELECT id FROM scout.detections WHERE profile_id = $1)
            "#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM scout.detections WHERE profile_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM scout.profile_settings WHERE profile_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM scout.profile_versions WHERE profile_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM scout.profiles WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn save_detection(&self, record: NewDetection) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scout.detections
                (source, source_id, profile_id, version, test_mode, is_relevant, properties)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&record.source)
        .bind(&record.source_id)
        .bind(record.profile_id)
        .bind(record.version)
        .bind(record.test_mode)
        .bind(record.is_relevant)
        .bind(Json(&record.properties))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_detections(&self, query: &DetectionQuery) -> Result<Vec<DetectionRecord>> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT d.id, d.source, d.source_id, d.profile_id, d.version, d.test_mode, \
             d.is_relevant, d.properties, d.created_at FROM scout.detections d ",
        );

        let tags_filter = query
            .filter
            .tags
            .relevancy_detected_correctly
            .as_ref();

        if tags_filter.is_some() {
            qb.push("LEFT JOIN scout.detection_tags dt ON dt.detection_id = d.id ");
        }

        qb.push("WHERE true ");

        if let Some(last_seen) = query.last_seen_id {
            match query.order {
                DetectionOrder::Desc => qb.push("AND d.id < ").push_bind(last_seen),
                DetectionOrder::Asc => qb.push("AND d.id > ").push_bind(last_seen),
            };
            qb.push(" ");
        }

        if let Some(is_relevant) = query.filter.is_relevant {
            qb.push("AND d.is_relevant = ").push_bind(is_relevant);
            qb.push(" ");
        }

        if let Some(sources) = &query.filter.sources {
            qb.push("AND d.source = ANY(").push_bind(sources.clone());
            qb.push(") ");
        }

        if let Some(profiles) = &query.filter.profiles {
            qb.push("AND (");
            if profiles.is_empty() {
                qb.push("false");
            }
            for (i, profile) in profiles.iter().enumerate() {
                if i > 0 {
                    qb.push(" OR ");
                }
                qb.push("(d.profile_id = ").push_bind(profile.profile_id);
                if !profile.source_versions.is_empty() {
                    qb.push(" AND (");
                    for (j, sv) in profile.source_versions.iter().enumerate() {
                        if j > 0 {
                            qb.push(" OR ");
                        }
                        qb.push("(");
                        if let Some(source) = &sv.source {
                            qb.push("d.source = ").push_bind(source.clone());
                            qb.push(" AND ");
                        }
                        qb.push("d.version = ANY(").push_bind(sv.versions.clone());
                        qb.push("))");
                    }
                    qb.push(")");
                }
                qb.push(")");
            }
            qb.push(") ");
        }

        if let Some(states) = tags_filter {
            qb.push("AND (");
            if states.is_empty() {
                qb.push("false");
            }
            for (i, state) in states.iter().enumerate() {
                if i > 0 {
                    qb.push(" OR ");
                }
                match state {
                    Some(value) => {
                        qb.push("dt.relevancy_detected_correctly = ").push_bind(*value);
                    }
                    None => {
                        qb.push("dt.relevancy_detected_correctly IS NULL");
                    }
                }
            }
            qb.push(") ");
        }

        match query.order {
            DetectionOrder::Asc => qb.push("ORDER BY d.id ASC "),
            DetectionOrder::Desc => qb.push("ORDER BY d.id DESC "),
        };

        qb.push("LIMIT ").push_bind(query.limit.max(0));

        let rows = qb
            .build_query_as::<DetectionRow>()
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(DetectionRow::into_record).collect())
    }

    async fn get_detection_tags(&self, detection_ids: &[i64]) -> Result<Vec<DetectionTags>> {
        let rows = sqlx::query_as::<_, (i64, Option<bool>)>(
            r#"
            SELECT detection_id, relevancy_detected_correctly
            FROM scout.detection_tags
            WHERE detection_id = ANY($1)
            "#,
        )
        .bind(detection_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(detection_id, relevancy_detected_correctly)| DetectionTags {
                detection_id,
                relevancy_detected_correctly,
            })
            .collect())
    }

    async fn update_tags(
        &self,
        detection_id: i64,
        update: DetectionTagsUpdate,
    ) -> Result<DetectionTags> {
        let value = match update.relevancy_detected_correctly {
            Setting::Unset => {
                // Nothing to change: report the tag state as stored.
                let existing: Option<Option<bool>> = sqlx::query_scalar(
                    r#"
                    SELECT relevancy_detected_correctly
                    FROM scout.detection_tags
                    WHERE detection_id = $1
                    "#,
                )
                .bind(detection_id)
                .fetch_optional(&self.pool)
                .await?;

                return Ok(DetectionTags {
                    detection_id,
                    relevancy_detected_correctly: existing.flatten(),
                });
            }
            Setting::Null => None,
            Setting::Value(value) => Some(value),
        };

        let stored: Option<bool> = sqlx::query_scalar(
            r#"
            INSERT INTO scout.detection_tags (detection_id, relevancy_detected_correctly)
            VALUES ($1, $2)
            ON CONFLICT (detection_id) DO UPDATE
            SET relevancy_detected_correctly = EXCLUDED.relevancy_detected_correctly
            RETURNING relevancy_detected_correctly
            "#,
        )
        .bind(detection_id)
        .bind(value)
        .fetch_one(&self.pool)
        .await?;

        Ok(DetectionTags {
            detection_id,
            relevancy_detected_correctly: stored,
        })
    }

    async fn present_source_ids_for_profile(
        &self,
        profile_id: i64,
        source: &str,
        source_ids: &[String],
    ) -> Result<Vec<String>> {
        let rows: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT source_id
            FROM scout.detections
            WHERE profile_id = $1 AND source = $2 AND source_id = ANY($3)
            "#,
        )
        .bind(profile_id)
        .bind(source)
        .bind(source_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
