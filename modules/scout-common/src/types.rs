//! Domain model shared by the pipeline, the stores, and the API layer.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Tri-state update field
// ---------------------------------------------------------------------------

/// A partial-update field that distinguishes "leave as is" (`Unset`),
/// "clear" (`Null`) and "set to value" (`Value`).
///
/// Deserializes from an optional JSON field: a missing field stays `Unset`
/// (via `#[serde(default)]` on the containing struct), an explicit `null`
/// becomes `Null`, anything else becomes `Value`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Setting<T> {
    #[default]
    Unset,
    Null,
    Value(T),
}

impl<T> Setting<T> {
    pub fn is_unset(&self) -> bool {
        matches!(self, Setting::Unset)
    }

    pub fn as_option(&self) -> Option<&T> {
        match self {
            Setting::Value(v) => Some(v),
            _ => None,
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Setting<T> {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(match Option::<T>::deserialize(deserializer)? {
            Some(value) => Setting::Value(value),
            None => Setting::Null,
        })
    }
}

// ---------------------------------------------------------------------------
// Analysis tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Scheduled,
    Manual,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Scheduled => "scheduled",
            TaskType::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<TaskType> {
        match s {
            "scheduled" => Some(TaskType::Scheduled),
            "manual" => Some(TaskType::Manual),
            _ => None,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisParameters {
    /// Content source the item came from, e.g. "reddit".
    pub source: String,
    /// Item id within the source.
    pub source_id: String,
    pub profile_id: i64,
    /// Whether the resulting detection is persisted.
    pub should_save: bool,
}

/// A task not yet persisted; the store assigns id, timestamps and claim state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAnalysisTask {
    pub task_type: TaskType,
    pub parameters: AnalysisParameters,
}

/// A claimed unit of analysis work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisTask {
    pub id: i64,
    pub task_type: TaskType,
    pub parameters: AnalysisParameters,
    /// Messages from previous failed attempts, oldest first.
    pub errors: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Terminal state of a task. The persisted schema keeps two booleans, but a
/// task ends in exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Committed(DateTime<Utc>),
    Failed(DateTime<Utc>),
}

// ---------------------------------------------------------------------------
// Profiles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: i64,
    pub name: String,
    /// The version the processor runs scheduled tasks against (when deployed).
    pub selected_version: i64,
    pub versions: Vec<ProfileVersion>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Profile {
    pub fn selected(&self) -> Option<&ProfileVersion> {
        self.versions
            .iter()
            .find(|v| v.version == self.selected_version)
    }

    /// A profile is active when its selected version is deployed.
    /// Inactive profiles only ever run manual tasks.
    pub fn is_active(&self) -> bool {
        self.selected().is_some_and(|v| !v.test_mode)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileVersion {
    pub version: i64,
    pub test_mode: bool,
    /// Fallback settings when no source-specific entry exists.
    pub default_settings: Option<ProfileSettings>,
    /// Source name → settings overriding the default for that source.
    #[serde(default)]
    pub sources_settings: HashMap<String, ProfileSettings>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProfileVersion {
    /// Resolve the settings used to analyze an item from `source`:
    /// the source-specific record if present, else the default.
    pub fn settings_for(&self, source: &str) -> Option<&ProfileSettings> {
        self.sources_settings
            .get(source)
            .or(self.default_settings.as_ref())
    }
}

/// Settings as loaded from the store, tied to a profile version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSettings {
    pub profile_id: i64,
    pub version: i64,
    /// None for the default record.
    pub source: Option<String>,
    pub relevancy_filter: String,
    /// Property name → definition the analyzer extracts.
    pub extracted_properties: HashMap<String, String>,
}

/// Settings as supplied by callers (no identity yet).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSettingsInput {
    pub relevancy_filter: String,
    #[serde(default)]
    pub extracted_properties: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfileCreateInput {
    pub name: String,
    #[serde(default)]
    pub default_settings: Option<ProfileSettingsInput>,
    #[serde(default)]
    pub sources_settings: HashMap<String, ProfileSettingsInput>,
}

/// Settings bundle for a newly created version (the version number is
/// assigned by the store).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VersionCreateInput {
    #[serde(default)]
    pub default_settings: Option<ProfileSettingsInput>,
    #[serde(default)]
    pub sources_settings: HashMap<String, ProfileSettingsInput>,
}

/// Metadata-only profile update.
#[derive(Debug, Clone, Deserialize)]
pub struct ProfileUpdate {
    #[serde(skip)]
    pub profile_id: i64,
    pub name: Option<String>,
}

/// Partial update of a test-mode version's settings.
/// `Null` / map-entry `None` delete the corresponding record.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VersionUpdate {
    #[serde(default)]
    pub default_settings: Setting<ProfileSettingsInput>,
    #[serde(default)]
    pub sources_settings: HashMap<String, Option<ProfileSettingsInput>>,
}

// ---------------------------------------------------------------------------
// Detections
// ---------------------------------------------------------------------------

/// One analysis outcome as returned by the analyzer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detection {
    pub is_relevant: bool,
    /// Requested property name → extracted value (null when absent from the item).
    pub properties: HashMap<String, Option<String>>,
}

/// A detection about to be appended; the store assigns id and created_at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDetection {
    pub source: String,
    pub source_id: String,
    pub profile_id: i64,
    pub version: i64,
    pub test_mode: bool,
    pub is_relevant: bool,
    pub properties: HashMap<String, Option<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub id: i64,
    pub source: String,
    pub source_id: String,
    pub profile_id: i64,
    /// Settings version the analysis ran with.
    pub version: i64,
    /// Snapshot of the version's test_mode at analysis time.
    pub test_mode: bool,
    pub is_relevant: bool,
    pub properties: HashMap<String, Option<String>>,
    pub created_at: DateTime<Utc>,
}

/// Operator feedback attached to a detection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectionTags {
    pub detection_id: i64,
    pub relevancy_detected_correctly: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DetectionTagsUpdate {
    #[serde(default)]
    pub relevancy_detected_correctly: Setting<bool>,
}

// ---------------------------------------------------------------------------
// Detection listing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone)]
pub struct DetectionQuery {
    /// Pagination cursor: for descending order the minimum id already seen,
    /// for ascending the maximum. Strictly exclusive.
    pub last_seen_id: Option<i64>,
    pub limit: i64,
    pub order: DetectionOrder,
    pub filter: DetectionFilter,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DetectionFilter {
    pub profiles: Option<Vec<ProfileFilter>>,
    pub sources: Option<Vec<String>>,
    pub is_relevant: Option<bool>,
    #[serde(default)]
    pub tags: DetectionTagsFilter,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfileFilter {
    pub profile_id: i64,
    /// When non-empty, further constrains this profile's detections to
    /// specific (source, versions) combinations.
    #[serde(default)]
    pub source_versions: Vec<SourceVersionsFilter>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceVersionsFilter {
    /// None matches any source.
    pub source: Option<String>,
    pub versions: Vec<i64>,
}

/// Tri-state tag filter: each entry is `true`, `false`, or `null`
/// (meaning "tag not set").
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DetectionTagsFilter {
    pub relevancy_detected_correctly: Option<Vec<Option<bool>>>,
}

// ---------------------------------------------------------------------------
// Source posts
// ---------------------------------------------------------------------------

/// A raw post as the source stored it, attached to detection listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcePost {
    pub source_id: String,
    pub post: serde_json::Value,
}
