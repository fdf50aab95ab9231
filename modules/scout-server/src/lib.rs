//! REST API over the Scout core.

pub mod api_types;
pub mod handlers;

use std::sync::Arc;

use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::CorsLayer;

use scout::reddit::toolkit::Toolkit;
use scout::Scout;

pub struct AppState {
    pub scout: Arc<Scout>,
    pub reddit: Arc<Toolkit>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route(
            "/api/profiles",
            get(handlers::list_profiles).post(handlers::create_profile),
        )
        .route(
            "/api/profiles/{id}",
            get(handlers::get_profile)
                .put(handlers::update_profile)
                .delete(handlers::delete_profile),
        )
        .route("/api/profiles/{id}/version", post(handlers::create_version))
        .route(
            "/api/profiles/{id}/version/{version}",
            put(handlers::update_version),
        )
        .route(
            "/api/profiles/{id}/version/{version}/deploy",
            post(handlers::deploy_version),
        )
        .route("/api/profiles/{id}/jumpstart", post(handlers::jumpstart))
        .route("/api/analyze", post(handlers::analyze))
        .route("/api/detections/list", post(handlers::list_detections))
        .route("/api/detections/tags", put(handlers::update_detection_tags))
        .route("/api/sources/{source}/boards", get(handlers::list_boards))
        .route(
            "/api/sources/{source}/boards/{board}/add-profiles",
            post(handlers::add_profiles_to_board),
        )
        .route(
            "/api/sources/{source}/boards/{board}/remove-profiles",
            post(handlers::remove_profiles_from_board),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}
