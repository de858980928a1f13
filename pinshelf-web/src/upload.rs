//! Image upload orchestration
//!
//! The pipeline runs fetch → extension → dimensions → hash in memory, then
//! three externally visible steps: insert the row (not ready), put the
//! object, finalize (tags + ready). The two database steps use separate
//! write sessions so no transaction stays open across the blob round-trip;
//! a crash in between leaves a not-ready row that stays invisible to
//! listings. Failures after the insert run best-effort compensation in
//! reverse, and cleanup problems never mask the original error.

use std::fmt;
use std::io::Cursor;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use pinshelf_common::db::image_tags::set_image_tags;
use pinshelf_common::db::images::{
    delete_image_by_slug, insert_image, mark_image_ready, InsertImage,
};
use pinshelf_common::db::{DbSession, SessionMode};
use pinshelf_common::model::{valid_image_name, ImageExt, ImageSlug, TagSlug};
use pinshelf_common::system_tags::{resolve_system_tags, ImageProbe};

use crate::error::ApiError;
use crate::object_store::object_key;
use crate::AppState;

/// Where the image bytes come from.
pub enum UploadSource {
    File {
        file_name: Option<String>,
        content_type: Option<String>,
        bytes: Vec<u8>,
    },
    Url {
        url: String,
    },
}

/// Parsed upload request, as the API handler hands it over.
pub struct UploadRequest {
    pub slug: String,
    pub name: String,
    pub tags: Vec<String>,
    pub source: UploadSource,
}

#[derive(Debug, serde::Serialize)]
pub struct UploadOutcome {
    pub slug: ImageSlug,
    pub url: String,
}

#[derive(Debug, Clone, Copy)]
enum UploadStage {
    FetchSource,
    DetermineExt,
    ProbeDimensions,
    InsertImage,
    UploadObject,
    Finalize,
}

impl fmt::Display for UploadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadStage::FetchSource => "fetch_source",
            UploadStage::DetermineExt => "determine_ext",
            UploadStage::ProbeDimensions => "probe_dimensions",
            UploadStage::InsertImage => "insert_image",
            UploadStage::UploadObject => "upload_object",
            UploadStage::Finalize => "finalize",
        };
        f.write_str(name)
    }
}

struct FetchedSource {
    bytes: Vec<u8>,
    ext_hint: Option<String>,
    content_type: Option<String>,
}

fn ext_from_name(name: &str) -> Option<String> {
    let (_, ext) = name.rsplit_once('.')?;
    let ext = ext.to_lowercase();
    if ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext)
}

fn ext_from_mime(content_type: &str) -> Option<&'static str> {
    let mime = content_type.split(';').next()?.trim().to_lowercase();
    match mime.as_str() {
        "image/jpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        "image/gif" => Some("gif"),
        "image/avif" => Some("avif"),
        "image/bmp" => Some("bmp"),
        "image/tiff" => Some("tiff"),
        "image/svg+xml" => Some("svg"),
        _ => None,
    }
}

/// Extension from the filename/URL path, the declared MIME type, or a
/// content sniff, in that order.
fn determine_ext(
    ext_hint: Option<&str>,
    content_type: Option<&str>,
    bytes: &[u8],
) -> Option<String> {
    if let Some(hint) = ext_hint {
        return Some(hint.to_string());
    }
    if let Some(ext) = content_type.and_then(ext_from_mime) {
        return Some(ext.to_string());
    }
    infer::get(bytes).map(|kind| kind.extension().to_string())
}

/// Decode just enough of the image header to learn its dimensions.
fn probe_dimensions(bytes: &[u8]) -> Option<(i64, i64)> {
    let reader = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?;
    let (width, height) = reader.into_dimensions().ok()?;
    if width == 0 || height == 0 {
        return None;
    }
    Some((i64::from(width), i64::from(height)))
}

async fn fetch_source(
    http: &reqwest::Client,
    source: UploadSource,
) -> Result<FetchedSource, ApiError> {
    match source {
        UploadSource::File {
            file_name,
            content_type,
            bytes,
        } => Ok(FetchedSource {
            ext_hint: file_name.as_deref().and_then(ext_from_name),
            content_type,
            bytes,
        }),
        UploadSource::Url { url } => {
            let parsed = reqwest::Url::parse(url.trim())
                .map_err(|e| ApiError::BadRequest(format!("Invalid source URL: {e}")))?;

            let response = http.get(parsed.clone()).send().await.map_err(|e| {
                error!(url = %parsed, error = %e, "Remote image URL fetch failed");
                ApiError::SourceFetch(format!("Failed to fetch image URL: {e}"))
            })?;

            let status = response.status();
            if !status.is_success() {
                if status.is_client_error() {
                    warn!(url = %parsed, status = status.as_u16(), "Remote image URL rejected");
                    return Err(ApiError::SourceRejected {
                        status: status.as_u16(),
                    });
                }
                error!(url = %parsed, status = status.as_u16(), "Remote image URL fetch failed");
                return Err(ApiError::SourceFetch(format!(
                    "Failed to fetch image URL ({status})"
                )));
            }

            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let bytes = response
                .bytes()
                .await
                .map_err(|e| ApiError::SourceFetch(format!("Failed to read image URL body: {e}")))?
                .to_vec();

            Ok(FetchedSource {
                ext_hint: ext_from_name(parsed.path()),
                content_type,
                bytes,
            })
        }
    }
}

struct UploadProgress {
    stage: UploadStage,
    inserted: bool,
    uploaded_key: Option<String>,
}

/// Run the upload pipeline end to end.
pub async fn upload_image(
    state: &AppState,
    request: UploadRequest,
) -> Result<UploadOutcome, ApiError> {
    debug!(slug = %request.slug, "Received upload request");

    let slug = ImageSlug::parse(&request.slug.trim().to_lowercase())?;
    let name = valid_image_name(&request.name)?;

    let mut user_tags: Vec<String> = Vec::new();
    for raw in &request.tags {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            continue;
        }
        let tag = TagSlug::parse(trimmed)?;
        if !user_tags.iter().any(|t| t == tag.as_str()) {
            user_tags.push(tag.as_str().to_string());
        }
    }

    let mut progress = UploadProgress {
        stage: UploadStage::FetchSource,
        inserted: false,
        uploaded_key: None,
    };

    let result = run_pipeline(state, &slug, &name, &user_tags, request.source, &mut progress).await;

    match result {
        Ok(outcome) => {
            info!(
                slug = %outcome.slug,
                tag_count = user_tags.len(),
                "Image upload completed"
            );
            Ok(outcome)
        }
        Err(upload_error) => {
            compensate(state, &slug, &progress).await;

            match &upload_error {
                // a refused remote URL is the client's problem, not ours
                ApiError::SourceRejected { status } => {
                    warn!(slug = %slug, stage = %progress.stage, status, "Upload failed on client-side source error");
                }
                error => {
                    error!(
                        slug = %slug,
                        stage = %progress.stage,
                        inserted = progress.inserted,
                        uploaded_key = progress.uploaded_key.as_deref(),
                        error = %error,
                        "Upload failed"
                    );
                }
            }

            Err(upload_error)
        }
    }
}

async fn run_pipeline(
    state: &AppState,
    slug: &ImageSlug,
    name: &str,
    user_tags: &[String],
    source: UploadSource,
    progress: &mut UploadProgress,
) -> Result<UploadOutcome, ApiError> {
    progress.stage = UploadStage::FetchSource;
    let source = fetch_source(&state.http, source).await?;

    progress.stage = UploadStage::DetermineExt;
    let Some(raw_ext) = determine_ext(
        source.ext_hint.as_deref(),
        source.content_type.as_deref(),
        &source.bytes,
    ) else {
        warn!(slug = %slug, "Upload rejected: extension could not be determined");
        return Err(ApiError::BadRequest(
            "Could not determine image extension".to_string(),
        ));
    };
    let ext = ImageExt::parse(&raw_ext)?;

    progress.stage = UploadStage::ProbeDimensions;
    let Some((width_px, height_px)) = probe_dimensions(&source.bytes) else {
        warn!(slug = %slug, ext = %ext, "Upload rejected: dimensions could not be detected");
        return Err(ApiError::BadRequest(
            "Could not detect image dimensions".to_string(),
        ));
    };

    let size_bytes = source.bytes.len() as i64;
    let system_tags = resolve_system_tags(&ImageProbe {
        width_px,
        height_px,
        size_bytes,
    });
    let mut merged_tags: Vec<String> = user_tags.to_vec();
    for tag_slug in system_tags {
        if !merged_tags.iter().any(|t| t == tag_slug) {
            merged_tags.push(tag_slug.to_string());
        }
    }

    let sha256 = BASE64_STANDARD.encode(Sha256::digest(&source.bytes));
    let added_at = chrono::Utc::now().timestamp();

    progress.stage = UploadStage::InsertImage;
    let mut session = DbSession::begin(&state.db, SessionMode::Write).await?;
    insert_image(
        &mut session,
        &InsertImage {
            slug: slug.as_str(),
            ext: ext.as_str(),
            name,
            added_at,
            size_bytes,
            width_px,
            height_px,
            sha256: &sha256,
            ready: false,
        },
    )
    .await?;
    session.commit().await?;
    progress.inserted = true;

    progress.stage = UploadStage::UploadObject;
    let key = object_key(slug, &ext);
    progress.uploaded_key = Some(key.clone());
    state
        .store
        .put(&key, source.bytes, source.content_type.as_deref())
        .await?;

    progress.stage = UploadStage::Finalize;
    let mut session = DbSession::begin(&state.db, SessionMode::Write).await?;
    set_image_tags(&mut session, slug.as_str(), &merged_tags).await?;
    mark_image_ready(&mut session, slug.as_str()).await?;
    session.commit().await?;

    Ok(UploadOutcome {
        slug: slug.clone(),
        url: state.store.public_url(&key),
    })
}

/// Best-effort rollback of the externally visible steps, in reverse order.
/// Failures here are logged and swallowed so the original error survives.
async fn compensate(state: &AppState, slug: &ImageSlug, progress: &UploadProgress) {
    if let Some(key) = progress.uploaded_key.as_deref() {
        if let Err(e) = state.store.delete(key).await {
            warn!(slug = %slug, key, error = %e, "Upload cleanup failed to delete object");
        }
    }

    if progress.inserted {
        let cleanup = async {
            let mut session = DbSession::begin(&state.db, SessionMode::Write).await?;
            delete_image_by_slug(&mut session, slug.as_str()).await?;
            session.commit().await?;
            Ok::<(), pinshelf_common::Error>(())
        };
        match cleanup.await {
            Ok(()) => {
                debug!(slug = %slug, "Upload cleanup removed partial image row");
            }
            Err(e) => {
                warn!(slug = %slug, error = %e, "Upload cleanup failed to delete image row");
            }
        }
    }
}
