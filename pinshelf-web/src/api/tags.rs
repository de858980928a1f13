//! Tag and tag-kind management API handlers

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use pinshelf_common::db::{
    image_tags, tags, DbSession, SessionMode, TagKindRecord, TagKindTree, TagRecord,
};

use crate::error::ApiResult;
use crate::AppState;

use super::parse_tag_selection;

#[derive(Debug, Deserialize)]
pub struct ListTagKindsQuery {
    /// Comma-separated selected tag slugs
    pub tag: Option<String>,
}

/// GET /api/tag-kinds
///
/// The filter sidebar: every kind with its tags, counted inside the current
/// selection.
pub async fn list_tag_kinds(
    State(state): State<AppState>,
    Query(query): Query<ListTagKindsQuery>,
) -> ApiResult<Json<Vec<TagKindTree>>> {
    let selected = parse_tag_selection(query.tag.as_deref())?;

    let mut session = DbSession::begin(&state.db, SessionMode::Read).await?;
    let kinds = tags::list_tag_kinds_with_counts(&mut session, &selected, false).await?;

    Ok(Json(kinds))
}

/// GET /api/tag-kinds/manage
pub async fn list_tag_kinds_for_management(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<TagKindRecord>>> {
    let mut session = DbSession::begin(&state.db, SessionMode::Read).await?;
    let kinds = tags::list_tag_kinds_for_management(&mut session).await?;

    Ok(Json(kinds))
}

#[derive(Debug, Deserialize)]
pub struct UpsertTagKindRequest {
    pub slug: String,
    pub name: String,
}

/// POST /api/tag-kinds
pub async fn upsert_tag_kind(
    State(state): State<AppState>,
    Json(request): Json<UpsertTagKindRequest>,
) -> ApiResult<Json<TagKindRecord>> {
    let mut session = DbSession::begin(&state.db, SessionMode::Write).await?;
    let kind = tags::upsert_tag_kind(&mut session, &request.slug, &request.name).await?;
    session.commit().await?;

    Ok(Json(kind))
}

/// DELETE /api/tag-kinds/:slug
pub async fn delete_tag_kind(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> ApiResult<Json<Value>> {
    let mut session = DbSession::begin(&state.db, SessionMode::Write).await?;
    tags::delete_tag_kind(&mut session, &slug).await?;
    session.commit().await?;

    Ok(Json(json!({ "status": "deleted", "slug": slug })))
}

/// GET /api/tags/manage
pub async fn list_tags_for_management(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<TagRecord>>> {
    let mut session = DbSession::begin(&state.db, SessionMode::Read).await?;
    let all = tags::list_tags_for_management(&mut session).await?;

    Ok(Json(all))
}

/// GET /api/tags/assignable
pub async fn list_assignable_tags(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<TagRecord>>> {
    let mut session = DbSession::begin(&state.db, SessionMode::Read).await?;
    let assignable = tags::list_assignable_tags(&mut session).await?;

    Ok(Json(assignable))
}

#[derive(Debug, Deserialize)]
pub struct UpsertTagRequest {
    pub slug: String,
    pub name: String,
}

/// POST /api/tags
pub async fn upsert_tag(
    State(state): State<AppState>,
    Json(request): Json<UpsertTagRequest>,
) -> ApiResult<Json<TagRecord>> {
    let mut session = DbSession::begin(&state.db, SessionMode::Write).await?;
    let tag = tags::upsert_tag(&mut session, &request.slug, &request.name).await?;
    session.commit().await?;

    Ok(Json(tag))
}

/// DELETE /api/tags/:kind/:value
pub async fn delete_tag(
    State(state): State<AppState>,
    Path((kind, value)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let slug = format!("{kind}/{value}");

    let mut session = DbSession::begin(&state.db, SessionMode::Write).await?;
    tags::delete_tag(&mut session, &slug).await?;
    session.commit().await?;

    Ok(Json(json!({ "status": "deleted", "slug": slug })))
}

/// POST /api/tags/reapply-system
///
/// Full reconciliation pass; can run for a while on a large gallery.
pub async fn reapply_system_tags(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let mut session = DbSession::begin(&state.db, SessionMode::Write).await?;
    let image_count = image_tags::reapply_system_tags_for_all_images(&mut session).await?;
    session.commit().await?;

    info!(image_count, "System tag reconciliation requested via API");
    Ok(Json(json!({ "image_count": image_count })))
}
