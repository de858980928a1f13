//! Image API handlers: listing, upload, metadata and tag edits

use axum::extract::{Multipart, Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use pinshelf_common::db::{
    image_tags, images, DbSession, GroupedTagFilter, ImageCursor, ImageRecord, SessionMode,
    TagRecord,
};
use pinshelf_common::model::{ImageSlug, TagSlug};

use crate::error::{ApiError, ApiResult};
use crate::object_store::object_key;
use crate::upload::{self, UploadOutcome, UploadRequest, UploadSource};
use crate::AppState;

use super::parse_tag_selection;

const DEFAULT_PAGE_LIMIT: i64 = 20;

#[derive(Debug, Deserialize)]
pub struct ListImagesQuery {
    pub limit: Option<i64>,
    pub cursor_added_at: Option<i64>,
    pub cursor_slug: Option<String>,
    /// Comma-separated tag slugs; regrouped by kind into the filter
    pub tag: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListImagesItem {
    #[serde(flatten)]
    pub image: ImageRecord,
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct ListImagesResponse {
    pub data: Vec<ListImagesItem>,
    pub cursor: Option<ImageCursor>,
}

/// GET /api/images
pub async fn list_images(
    State(state): State<AppState>,
    Query(query): Query<ListImagesQuery>,
) -> ApiResult<Json<ListImagesResponse>> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT);

    let cursor = match (query.cursor_added_at, &query.cursor_slug) {
        (Some(added_at), Some(slug)) => Some(ImageCursor {
            added_at,
            slug: ImageSlug::parse(slug)?,
        }),
        (None, None) => None,
        _ => {
            return Err(ApiError::BadRequest(
                "Cursor requires both cursor_added_at and cursor_slug".to_string(),
            ))
        }
    };

    let mut filter = GroupedTagFilter::default();
    for raw in parse_tag_selection(query.tag.as_deref())? {
        filter.insert(TagSlug::parse(&raw)?);
    }

    let mut session = DbSession::begin(&state.db, SessionMode::Read).await?;
    let page =
        images::list_images_page(&mut session, cursor.as_ref(), limit, &filter, false).await?;

    let data = page
        .items
        .into_iter()
        .map(|image| {
            let url = state.store.public_url(&object_key(&image.slug, &image.ext));
            ListImagesItem { image, url }
        })
        .collect();

    Ok(Json(ListImagesResponse {
        data,
        cursor: page.next_cursor,
    }))
}

#[derive(Debug, Deserialize)]
pub struct GetImageQuery {
    #[serde(default)]
    pub include_not_ready: bool,
}

#[derive(Debug, Serialize)]
pub struct ImageDetailResponse {
    pub image: ImageRecord,
    pub tags: Vec<TagRecord>,
    pub url: String,
}

/// GET /api/images/:slug
pub async fn get_image(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Query(query): Query<GetImageQuery>,
) -> ApiResult<Json<ImageDetailResponse>> {
    let mut session = DbSession::begin(&state.db, SessionMode::Read).await?;
    let Some(found) =
        images::get_image_by_slug(&mut session, &slug, query.include_not_ready).await?
    else {
        return Err(ApiError::NotFound(format!("Image not found: {slug}")));
    };

    let url = state
        .store
        .public_url(&object_key(&found.image.slug, &found.image.ext));

    Ok(Json(ImageDetailResponse {
        image: found.image,
        tags: found.tags,
        url,
    }))
}

/// POST /api/images (multipart)
///
/// Fields: `source_type` (`file` | `url`), `slug`, `name`, repeated `tags`,
/// and either a `file` part or a `url` field.
pub async fn upload_image(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<UploadOutcome>> {
    let mut source_type: Option<String> = None;
    let mut slug: Option<String> = None;
    let mut name: Option<String> = None;
    let mut tags: Vec<String> = Vec::new();
    let mut url: Option<String> = None;
    let mut file: Option<(Option<String>, Option<String>, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Malformed multipart body: {e}")))?
    {
        match field.name() {
            Some("source_type") => {
                source_type = Some(read_text_field(field).await?);
            }
            Some("slug") => {
                slug = Some(read_text_field(field).await?);
            }
            Some("name") => {
                name = Some(read_text_field(field).await?);
            }
            Some("tags") => {
                tags.push(read_text_field(field).await?);
            }
            Some("url") => {
                url = Some(read_text_field(field).await?);
            }
            Some("file") => {
                let file_name = field.file_name().map(str::to_string);
                let content_type = field.content_type().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Malformed file field: {e}")))?
                    .to_vec();
                file = Some((file_name, content_type, bytes));
            }
            _ => {}
        }
    }

    let source_type =
        source_type.ok_or_else(|| ApiError::BadRequest("source_type is required".to_string()))?;
    let slug = slug.ok_or_else(|| ApiError::BadRequest("slug is required".to_string()))?;
    let name = name.ok_or_else(|| ApiError::BadRequest("name is required".to_string()))?;

    let source = match source_type.as_str() {
        "file" => {
            let (file_name, content_type, bytes) = file
                .ok_or_else(|| ApiError::BadRequest("file field is required".to_string()))?;
            UploadSource::File {
                file_name,
                content_type,
                bytes,
            }
        }
        "url" => {
            let url =
                url.ok_or_else(|| ApiError::BadRequest("url field is required".to_string()))?;
            UploadSource::Url { url }
        }
        other => {
            return Err(ApiError::BadRequest(format!(
                "source_type must be \"file\" or \"url\", got {other:?}"
            )))
        }
    };

    let outcome = upload::upload_image(
        &state,
        UploadRequest {
            slug,
            name,
            tags,
            source,
        },
    )
    .await?;

    Ok(Json(outcome))
}

async fn read_text_field(field: axum::extract::multipart::Field<'_>) -> ApiResult<String> {
    field
        .text()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Malformed multipart field: {e}")))
}

#[derive(Debug, Deserialize)]
pub struct UpdateImageNameRequest {
    pub name: String,
}

/// POST /api/images/:slug/name
pub async fn update_name(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Json(request): Json<UpdateImageNameRequest>,
) -> ApiResult<Json<ImageRecord>> {
    let mut session = DbSession::begin(&state.db, SessionMode::Write).await?;
    let updated = images::update_image_name(&mut session, &slug, &request.name).await?;
    session.commit().await?;

    Ok(Json(updated))
}

#[derive(Debug, Deserialize)]
pub struct SetImageUserTagsRequest {
    pub tag_slugs: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct SetImageUserTagsResponse {
    pub tags: Vec<TagRecord>,
}

/// POST /api/images/:slug/tags
pub async fn set_user_tags(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Json(request): Json<SetImageUserTagsRequest>,
) -> ApiResult<Json<SetImageUserTagsResponse>> {
    let mut session = DbSession::begin(&state.db, SessionMode::Write).await?;
    let tags = image_tags::set_image_user_tags(&mut session, &slug, &request.tag_slugs).await?;
    session.commit().await?;

    Ok(Json(SetImageUserTagsResponse { tags }))
}

#[derive(Debug, Deserialize)]
pub struct BulkModifyTagsRequest {
    pub image_slugs: Vec<String>,
    #[serde(default)]
    pub tag_slugs_to_add: Vec<String>,
    #[serde(default)]
    pub tag_slugs_to_remove: Vec<String>,
}

/// POST /api/images/tags/bulk
pub async fn bulk_modify_tags(
    State(state): State<AppState>,
    Json(request): Json<BulkModifyTagsRequest>,
) -> ApiResult<Json<pinshelf_common::db::BulkModifyResult>> {
    let mut session = DbSession::begin(&state.db, SessionMode::Write).await?;
    let result = image_tags::bulk_modify_images_tags(
        &mut session,
        &request.image_slugs,
        &request.tag_slugs_to_add,
        &request.tag_slugs_to_remove,
    )
    .await?;
    session.commit().await?;

    Ok(Json(result))
}
