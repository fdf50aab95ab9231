//! REST handlers. Unrecovered errors map to `500 {"error": ...}`;
//! missing profiles map to 404 where the route promises it.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::warn;

use scout_common::{
    DetectionOrder, DetectionQuery, ProfileCreateInput, ProfileSettings, ProfileUpdate,
    ScoutError, VersionCreateInput, VersionUpdate,
};

use crate::api_types::*;
use crate::AppState;

const DEFAULT_DETECTIONS_LIMIT: i64 = 10;

fn error_response(err: &ScoutError) -> Response {
    let status = match err {
        ScoutError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
        .into_response()
}

fn internal_error(err: &ScoutError) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Profiles
// ---------------------------------------------------------------------------

pub async fn list_profiles(State(state): State<Arc<AppState>>) -> Response {
    match state.scout.get_all_profiles().await {
        Ok(profiles) => Json(profiles).into_response(),
        Err(err) => internal_error(&err),
    }
}

pub async fn get_profile(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Response {
    match state.scout.get_profile(id).await {
        Ok(Some(profile)) => Json(profile).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => internal_error(&err),
    }
}

pub async fn create_profile(
    State(state): State<Arc<AppState>>,
    Json(input): Json<ProfileCreateInput>,
) -> Response {
    match state.scout.create_profile(input).await {
        Ok(id) => (StatusCode::CREATED, Json(CreatedBody { id })).into_response(),
        Err(err) => internal_error(&err),
    }
}

pub async fn update_profile(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(request): Json<UpdateProfileRequest>,
) -> Response {
    let update = ProfileUpdate {
        profile_id: id,
        name: request.name,
    };

    match state.scout.update_profile(update).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => internal_error(&err),
    }
}

pub async fn delete_profile(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Response {
    match state.scout.delete_profile(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => internal_error(&err),
    }
}

pub async fn create_version(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(input): Json<VersionCreateInput>,
) -> Response {
    match state.scout.create_profile_version(id, input).await {
        Ok(version) => Json(CreatedBody { id: version }).into_response(),
        Err(err) => internal_error(&err),
    }
}

pub async fn update_version(
    State(state): State<Arc<AppState>>,
    Path((id, version)): Path<(i64, i64)>,
    Json(update): Json<VersionUpdate>,
) -> Response {
    match state.scout.update_profile_version(id, version, update).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => internal_error(&err),
    }
}

pub async fn deploy_version(
    State(state): State<Arc<AppState>>,
    Path((id, version)): Path<(i64, i64)>,
) -> Response {
    match state.scout.deploy_profile_version(id, version).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => internal_error(&err),
    }
}

pub async fn jumpstart(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(request): Json<JumpstartRequest>,
) -> Response {
    match state
        .scout
        .jumpstart_profile(
            id,
            request.exclude_already_analyzed,
            request.jumpstart_period,
            request.limit,
        )
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => internal_error(&err),
    }
}

// ---------------------------------------------------------------------------
// Analysis & detections
// ---------------------------------------------------------------------------

pub async fn analyze(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AnalyzeRequest>,
) -> Response {
    // Ad-hoc settings: never persisted, so they carry sentinel identifiers.
    let settings = ProfileSettings {
        profile_id: -1,
        version: -1,
        source: None,
        relevancy_filter: request.relevancy_filter,
        extracted_properties: request.extracted_properties,
    };

    match state
        .scout
        .analyze(&request.source, &request.source_id, &settings, true, false)
        .await
    {
        Ok(detection) => Json(detection).into_response(),
        Err(err) => internal_error(&err),
    }
}

pub async fn list_detections(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DetectionsListRequest>,
) -> Response {
    let query = DetectionQuery {
        last_seen_id: request.last_seen_id,
        limit: request.limit.unwrap_or(DEFAULT_DETECTIONS_LIMIT),
        order: DetectionOrder::Desc,
        filter: request.filter.unwrap_or_default(),
    };

    let detections = match state.scout.list_detections(&query).await {
        Ok(detections) => detections,
        Err(err) => return internal_error(&err),
    };

    let mut source_to_ids: HashMap<String, Vec<String>> = HashMap::new();
    let mut detection_ids = Vec::with_capacity(detections.len());
    for detection in &detections {
        source_to_ids
            .entry(detection.source.clone())
            .or_default()
            .push(detection.source_id.clone());
        detection_ids.push(detection.id);
    }

    // source -> source_id -> raw post
    let mut posts: HashMap<String, HashMap<String, serde_json::Value>> = HashMap::new();
    for (source, source_ids) in &source_to_ids {
        match state.scout.get_source_posts(source, source_ids).await {
            Ok(source_posts) => {
                let by_id = posts.entry(source.clone()).or_default();
                for post in source_posts {
                    by_id.insert(post.source_id, post.post);
                }
            }
            Err(err) => {
                warn!(source = source.as_str(), error = %err, "failed to load source posts");
            }
        }
    }

    let tags = match state.scout.get_detection_tags(&detection_ids).await {
        Ok(tags) => tags,
        Err(err) => return internal_error(&err),
    };
    let tags_index: HashMap<i64, scout_common::DetectionTags> = tags
        .into_iter()
        .map(|tags| (tags.detection_id, tags))
        .collect();

    let result: Vec<ListedDetection> = detections
        .into_iter()
        .map(|detection| {
            let source_post = posts
                .get(&detection.source)
                .and_then(|by_id| by_id.get(&detection.source_id))
                .cloned();
            let tags = tags_index.get(&detection.id).cloned();
            ListedDetection {
                detection,
                source_post,
                tags,
            }
        })
        .collect();

    Json(result).into_response()
}

pub async fn update_detection_tags(
    State(state): State<Arc<AppState>>,
    Json(request): Json<UpdateTagsRequest>,
) -> Response {
    match state
        .scout
        .update_tags(request.detection_id, request.tags)
        .await
    {
        Ok(tags) => Json(tags).into_response(),
        Err(err) => internal_error(&err),
    }
}

// ---------------------------------------------------------------------------
// Board bindings
// ---------------------------------------------------------------------------

fn check_source(source: &str) -> Option<Response> {
    if source == scout::reddit::SOURCE {
        None
    } else {
        Some(error_response(&ScoutError::NotFound(format!(
            "source {source}"
        ))))
    }
}

pub async fn list_boards(
    State(state): State<Arc<AppState>>,
    Path(source): Path<String>,
    Query(query): Query<BoardsQuery>,
) -> Response {
    if let Some(response) = check_source(&source) {
        return response;
    }

    let settings = match query.profile_id {
        Some(profile_id) => state.reddit.subreddit_settings_with_profile(profile_id).await,
        None => state.reddit.all_subreddit_settings().await,
    };

    match settings {
        Ok(settings) => {
            let boards: Vec<BoardSettingsBody> = settings
                .into_iter()
                .map(|s| BoardSettingsBody {
                    board: s.subreddit,
                    profiles: s.profiles,
                })
                .collect();
            Json(boards).into_response()
        }
        Err(err) => internal_error(&err),
    }
}

pub async fn add_profiles_to_board(
    State(state): State<Arc<AppState>>,
    Path((source, board)): Path<(String, String)>,
    Json(request): Json<BoardProfilesRequest>,
) -> Response {
    if let Some(response) = check_source(&source) {
        return response;
    }

    match state
        .reddit
        .add_profiles_to_subreddit(&board, &request.profile_ids)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => internal_error(&err),
    }
}

pub async fn remove_profiles_from_board(
    State(state): State<Arc<AppState>>,
    Path((source, board)): Path<(String, String)>,
    Json(request): Json<BoardProfilesRequest>,
) -> Response {
    if let Some(response) = check_source(&source) {
        return response;
    }

    match state
        .reddit
        .remove_profiles_from_subreddit(&board, &request.profile_ids)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => internal_error(&err),
    }
}
