//! pinshelf-web library - Image gallery service
//!
//! HTTP surface over the pinshelf stores: tag-filtered image listings, the
//! upload pipeline, and tag management.

use axum::routing::{delete, get, post};
use axum::Router;
use sqlx::SqlitePool;
use tower_http::trace::TraceLayer;

use crate::object_store::ObjectStore;

pub mod api;
pub mod config;
pub mod error;
pub mod object_store;
pub mod upload;

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: SqlitePool,
    /// Blob store the image bytes live in
    pub store: ObjectStore,
    /// Client for URL-sourced uploads
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(db: SqlitePool, store: ObjectStore) -> Self {
        Self {
            db,
            store,
            http: reqwest::Client::new(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(api::health::health))
        .route(
            "/api/images",
            get(api::images::list_images).post(api::images::upload_image),
        )
        .route("/api/images/tags/bulk", post(api::images::bulk_modify_tags))
        .route("/api/images/:slug", get(api::images::get_image))
        .route("/api/images/:slug/name", post(api::images::update_name))
        .route("/api/images/:slug/tags", post(api::images::set_user_tags))
        .route(
            "/api/tag-kinds",
            get(api::tags::list_tag_kinds).post(api::tags::upsert_tag_kind),
        )
        .route(
            "/api/tag-kinds/manage",
            get(api::tags::list_tag_kinds_for_management),
        )
        .route("/api/tag-kinds/:slug", delete(api::tags::delete_tag_kind))
        .route("/api/tags", post(api::tags::upsert_tag))
        .route("/api/tags/manage", get(api::tags::list_tags_for_management))
        .route("/api/tags/assignable", get(api::tags::list_assignable_tags))
        .route("/api/tags/reapply-system", post(api::tags::reapply_system_tags))
        .route("/api/tags/:kind/:value", delete(api::tags::delete_tag))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
