//! Request and response bodies for the REST API.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use scout_common::{DetectionFilter, DetectionRecord, DetectionTags, DetectionTagsUpdate};

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct CreatedBody {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct UpdateProfileRequest {
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct JumpstartRequest {
    #[serde(default)]
    pub exclude_already_analyzed: bool,
    /// How many days back to reach; absent means all history.
    pub jumpstart_period: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    pub source: String,
    pub source_id: String,
    pub relevancy_filter: String,
    #[serde(default)]
    pub extracted_properties: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DetectionsListRequest {
    pub last_seen_id: Option<i64>,
    pub limit: Option<i64>,
    pub filter: Option<DetectionFilter>,
}

/// A detection joined with its raw source post and operator tags.
#[derive(Debug, Serialize)]
pub struct ListedDetection {
    #[serde(flatten)]
    pub detection: DetectionRecord,
    pub source_post: Option<serde_json::Value>,
    pub tags: Option<DetectionTags>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateTagsRequest {
    pub detection_id: i64,
    pub tags: DetectionTagsUpdate,
}

#[derive(Debug, Deserialize)]
pub struct BoardsQuery {
    pub profile_id: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct BoardSettingsBody {
    pub board: String,
    pub profiles: Vec<i64>,
}

#[derive(Debug, Deserialize)]
pub struct BoardProfilesRequest {
    pub profile_ids: Vec<i64>,
}
