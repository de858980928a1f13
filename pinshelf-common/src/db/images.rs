//! Image store and listing queries
//!
//! The listing uses keyset pagination over the `(added_at DESC, slug DESC)`
//! total order: the slug tie-break guarantees no row is repeated or skipped
//! even when many images share a timestamp.

use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::model::{
    valid_image_name, valid_page_limit, valid_size_bytes, valid_unix_seconds, valid_width_px,
    valid_height_px, ImageExt, ImageSlug, Sha256Digest, TagKindSlug, TagSlug,
};
use crate::{Error, Result};

use super::models::{
    GroupedTagFilter, ImageCursor, ImagePage, ImageRecord, ImageWithTags, TagRecord,
};
use super::session::DbSession;

/// Raw input for a new image row; every field is validated on insert.
#[derive(Debug)]
pub struct InsertImage<'a> {
    pub slug: &'a str,
    pub ext: &'a str,
    pub name: &'a str,
    pub added_at: i64,
    pub size_bytes: i64,
    pub width_px: i64,
    pub height_px: i64,
    pub sha256: &'a str,
    pub ready: bool,
}

const IMAGE_COLUMNS: &str =
    "i.slug, i.ext, i.name, i.added_at, i.size_bytes, i.width_px, i.height_px, i.sha256, i.ready";

/// Decode one `images` row through the domain validators.
fn image_from_row(row: &SqliteRow) -> Result<ImageRecord> {
    Ok(ImageRecord {
        slug: ImageSlug::parse(&row.try_get::<String, _>("slug")?)?,
        ext: ImageExt::parse(&row.try_get::<String, _>("ext")?)?,
        name: valid_image_name(&row.try_get::<String, _>("name")?)?,
        added_at: valid_unix_seconds(row.try_get("added_at")?)?,
        size_bytes: valid_size_bytes(row.try_get("size_bytes")?)?,
        width_px: valid_width_px(row.try_get("width_px")?)?,
        height_px: valid_height_px(row.try_get("height_px")?)?,
        sha256: Sha256Digest::parse(&row.try_get::<String, _>("sha256")?)?,
        ready: row.try_get("ready")?,
    })
}

/// Decode one `tags` row.
pub(crate) fn tag_from_row(row: &SqliteRow) -> Result<TagRecord> {
    Ok(TagRecord {
        slug: TagSlug::parse(&row.try_get::<String, _>("slug")?)?,
        name: row.try_get("name")?,
        kind_slug: TagKindSlug::parse(&row.try_get::<String, _>("kind_slug")?)?,
        system: row.try_get("system")?,
    })
}

pub async fn insert_image(
    session: &mut DbSession,
    input: &InsertImage<'_>,
) -> Result<ImageRecord> {
    session.require_write("insert image")?;

    let slug = ImageSlug::parse(input.slug)?;
    let ext = ImageExt::parse(input.ext)?;
    let name = valid_image_name(input.name)?;
    let added_at = valid_unix_seconds(input.added_at)?;
    let size_bytes = valid_size_bytes(input.size_bytes)?;
    let width_px = valid_width_px(input.width_px)?;
    let height_px = valid_height_px(input.height_px)?;
    let sha256 = Sha256Digest::parse(input.sha256)?;

    sqlx::query(
        r#"
        INSERT INTO images (slug, ext, name, added_at, size_bytes, width_px, height_px, sha256, ready)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(slug.as_str())
    .bind(ext.as_str())
    .bind(&name)
    .bind(added_at)
    .bind(size_bytes)
    .bind(width_px)
    .bind(height_px)
    .bind(sha256.as_str())
    .bind(input.ready)
    .execute(session.conn("insert image")?)
    .await?;

    Ok(ImageRecord {
        slug,
        ext,
        name,
        added_at,
        size_bytes,
        width_px,
        height_px,
        sha256,
        ready: input.ready,
    })
}

async fn fetch_image(
    session: &mut DbSession,
    slug: &ImageSlug,
    include_not_ready: bool,
) -> Result<Option<ImageRecord>> {
    let ready_clause = if include_not_ready { "" } else { "AND i.ready = 1" };
    let sql = format!(
        "SELECT {IMAGE_COLUMNS} FROM images i WHERE i.slug = ? {ready_clause} LIMIT 1"
    );

    let row = sqlx::query(&sql)
        .bind(slug.as_str())
        .fetch_optional(session.conn("get image")?)
        .await?;

    row.as_ref().map(image_from_row).transpose()
}

/// All tags currently carried by an image, ordered by (kind, slug).
pub(crate) async fn tags_for_image(
    session: &mut DbSession,
    slug: &ImageSlug,
) -> Result<Vec<TagRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT t.slug, t.name, t.kind_slug, t.system
        FROM tags t
        INNER JOIN image_tags it ON it.tag_slug = t.slug
        WHERE it.image_slug = ?
        ORDER BY t.kind_slug ASC, t.slug ASC
        "#,
    )
    .bind(slug.as_str())
    .fetch_all(session.conn("list image tags")?)
    .await?;

    rows.iter().map(tag_from_row).collect()
}

/// Load an image and its tags. `None` when absent, or hidden because the
/// upload has not finished and `include_not_ready` was not requested.
pub async fn get_image_by_slug(
    session: &mut DbSession,
    slug: &str,
    include_not_ready: bool,
) -> Result<Option<ImageWithTags>> {
    let slug = ImageSlug::parse(slug)?;

    let Some(image) = fetch_image(session, &slug, include_not_ready).await? else {
        return Ok(None);
    };
    let tags = tags_for_image(session, &slug).await?;

    Ok(Some(ImageWithTags { image, tags }))
}

pub async fn update_image_name(
    session: &mut DbSession,
    slug: &str,
    name: &str,
) -> Result<ImageRecord> {
    session.require_write("update image name")?;

    let slug = ImageSlug::parse(slug)?;
    let name = valid_image_name(name)?;

    let result = sqlx::query("UPDATE images SET name = ? WHERE slug = ?")
        .bind(&name)
        .bind(slug.as_str())
        .execute(session.conn("update image name")?)
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("Image not found: {slug}")));
    }

    match fetch_image(session, &slug, true).await? {
        Some(image) => Ok(image),
        None => Err(Error::NotFound(format!("Image not found: {slug}"))),
    }
}

pub async fn mark_image_ready(session: &mut DbSession, slug: &str) -> Result<()> {
    session.require_write("mark image ready")?;

    let slug = ImageSlug::parse(slug)?;
    sqlx::query("UPDATE images SET ready = 1 WHERE slug = ?")
        .bind(slug.as_str())
        .execute(session.conn("mark image ready")?)
        .await?;

    Ok(())
}

/// Delete an image row. Idempotent; association rows go with it via the
/// cascading foreign key.
pub async fn delete_image_by_slug(session: &mut DbSession, slug: &str) -> Result<()> {
    session.require_write("delete image")?;

    let slug = ImageSlug::parse(slug)?;
    sqlx::query("DELETE FROM images WHERE slug = ?")
        .bind(slug.as_str())
        .execute(session.conn("delete image")?)
        .await?;

    Ok(())
}

/// List one page of images under a grouped tag filter.
///
/// Returns rows strictly before the cursor in the total order, and a
/// `next_cursor` only when more rows exist beyond the page.
pub async fn list_images_page(
    session: &mut DbSession,
    cursor: Option<&ImageCursor>,
    limit: i64,
    filter: &GroupedTagFilter,
    include_not_ready: bool,
) -> Result<ImagePage> {
    let limit = valid_page_limit(limit)?;

    // Derived set: images touching every filter group at least once. Tag
    // slugs carry their kind, so counting distinct kinds counts groups.
    let filter_join = if filter.is_empty() {
        String::new()
    } else {
        let placeholders = vec!["?"; filter.tag_count()].join(", ");
        format!(
            r#"
            JOIN (
                SELECT it.image_slug
                FROM image_tags it
                JOIN tags t ON t.slug = it.tag_slug
                WHERE it.tag_slug IN ({placeholders})
                GROUP BY it.image_slug
                HAVING COUNT(DISTINCT t.kind_slug) = ?
            ) matched ON matched.image_slug = i.slug
            "#
        )
    };

    let mut where_clauses: Vec<&str> = Vec::new();
    if !include_not_ready {
        where_clauses.push("i.ready = 1");
    }
    if cursor.is_some() {
        where_clauses.push("(i.added_at < ? OR (i.added_at = ? AND i.slug < ?))");
    }
    let where_sql = if where_clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", where_clauses.join(" AND "))
    };

    let sql = format!(
        r#"
        SELECT {IMAGE_COLUMNS}
        FROM images i
        {filter_join}
        {where_sql}
        ORDER BY i.added_at DESC, i.slug DESC
        LIMIT ?
        "#
    );

    let mut query = sqlx::query(&sql);
    for tag_slug in filter.flattened() {
        query = query.bind(tag_slug.as_str());
    }
    if !filter.is_empty() {
        query = query.bind(filter.group_count());
    }
    if let Some(cursor) = cursor {
        let added_at = valid_unix_seconds(cursor.added_at)?;
        query = query.bind(added_at).bind(added_at).bind(cursor.slug.as_str());
    }
    // One extra row decides whether another page exists
    query = query.bind(limit + 1);

    let rows = query.fetch_all(session.conn("list images")?).await?;

    let has_more = rows.len() as i64 > limit;
    let items = rows
        .iter()
        .take(limit as usize)
        .map(image_from_row)
        .collect::<Result<Vec<_>>>()?;

    let next_cursor = if has_more {
        items.last().map(|image| ImageCursor {
            added_at: image.added_at,
            slug: image.slug.clone(),
        })
    } else {
        None
    };

    Ok(ImagePage { items, next_cursor })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::image_tags::set_image_tags;
    use crate::db::init::init_schema;
    use crate::db::session::SessionMode;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use sqlx::SqlitePool;
    use std::str::FromStr;

    const TEST_SHA256: &str =
        "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa=";

    async fn test_pool() -> SqlitePool {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .unwrap()
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .expect("in-memory pool");
        init_schema(&pool).await.expect("schema");
        pool
    }

    fn test_image<'a>(slug: &'a str, added_at: i64, ready: bool) -> InsertImage<'a> {
        InsertImage {
            slug,
            ext: "jpg",
            name: slug,
            added_at,
            size_bytes: 1024,
            width_px: 3840,
            height_px: 2160,
            sha256: TEST_SHA256,
            ready,
        }
    }

    async fn ensure_tag(pool: &SqlitePool, tag_slug: &str) {
        let (kind, _) = tag_slug.split_once('/').expect("kind/value");
        sqlx::query("INSERT OR IGNORE INTO tag_kinds (slug, name) VALUES (?, ?)")
            .bind(kind)
            .bind(kind)
            .execute(pool)
            .await
            .unwrap();
        sqlx::query("INSERT OR IGNORE INTO tags (slug, name, kind_slug, system) VALUES (?, ?, ?, 0)")
            .bind(tag_slug)
            .bind(tag_slug)
            .bind(kind)
            .execute(pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn insert_and_get_round_trip() {
        let pool = test_pool().await;

        let mut session = DbSession::begin(&pool, SessionMode::Write).await.unwrap();
        insert_image(&mut session, &test_image("sunset", 100, true))
            .await
            .unwrap();
        session.commit().await.unwrap();

        let mut session = DbSession::begin(&pool, SessionMode::Read).await.unwrap();
        let found = get_image_by_slug(&mut session, "sunset", false)
            .await
            .unwrap()
            .expect("image visible");
        assert_eq!(found.image.slug.as_str(), "sunset");
        assert_eq!(found.image.width_px, 3840);
        assert_eq!(found.image.height_px, 2160);
        assert!(found.tags.is_empty());
    }

    #[tokio::test]
    async fn not_ready_images_are_hidden_by_default() {
        let pool = test_pool().await;

        let mut session = DbSession::begin(&pool, SessionMode::Write).await.unwrap();
        insert_image(&mut session, &test_image("pending", 1, false))
            .await
            .unwrap();
        session.commit().await.unwrap();

        let mut session = DbSession::begin(&pool, SessionMode::Read).await.unwrap();
        assert!(get_image_by_slug(&mut session, "pending", false)
            .await
            .unwrap()
            .is_none());
        assert!(get_image_by_slug(&mut session, "pending", true)
            .await
            .unwrap()
            .is_some());

        let page = list_images_page(&mut session, None, 10, &GroupedTagFilter::default(), false)
            .await
            .unwrap();
        assert!(page.items.is_empty());

        let page = list_images_page(&mut session, None, 10, &GroupedTagFilter::default(), true)
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
    }

    #[tokio::test]
    async fn pagination_visits_every_row_exactly_once() {
        let pool = test_pool().await;

        // Four images at added_at=10 and two at added_at=9: the slug
        // tie-break keeps the order total.
        let mut session = DbSession::begin(&pool, SessionMode::Write).await.unwrap();
        for (slug, added_at) in [
            ("delta", 10),
            ("charlie", 10),
            ("bravo", 10),
            ("alpha", 10),
            ("yankee", 9),
            ("xray", 9),
        ] {
            insert_image(&mut session, &test_image(slug, added_at, true))
                .await
                .unwrap();
        }
        session.commit().await.unwrap();

        let mut session = DbSession::begin(&pool, SessionMode::Read).await.unwrap();
        let filter = GroupedTagFilter::default();

        let mut seen: Vec<String> = Vec::new();
        let mut cursor: Option<ImageCursor> = None;
        for _ in 0..3 {
            let page = list_images_page(&mut session, cursor.as_ref(), 2, &filter, false)
                .await
                .unwrap();
            assert_eq!(page.items.len(), 2);
            seen.extend(page.items.iter().map(|i| i.slug.as_str().to_string()));
            cursor = page.next_cursor;
        }

        assert_eq!(seen, vec!["delta", "charlie", "bravo", "alpha", "yankee", "xray"]);
        assert!(cursor.is_none());
    }

    #[tokio::test]
    async fn grouped_filter_is_or_within_and_across_groups() {
        let pool = test_pool().await;
        ensure_tag(&pool, "resolution/4k").await;
        ensure_tag(&pool, "aspect-ratio/16-9").await;
        ensure_tag(&pool, "aspect-ratio/16-10").await;
        ensure_tag(&pool, "aspect-ratio/21-9").await;

        let mut session = DbSession::begin(&pool, SessionMode::Write).await.unwrap();
        insert_image(&mut session, &test_image("both", 3, true))
            .await
            .unwrap();
        insert_image(&mut session, &test_image("wrong-ratio", 2, true))
            .await
            .unwrap();
        insert_image(&mut session, &test_image("ratio-only", 1, true))
            .await
            .unwrap();

        set_image_tags(
            &mut session,
            "both",
            &["resolution/4k".to_string(), "aspect-ratio/16-9".to_string()],
        )
        .await
        .unwrap();
        set_image_tags(
            &mut session,
            "wrong-ratio",
            &["resolution/4k".to_string(), "aspect-ratio/21-9".to_string()],
        )
        .await
        .unwrap();
        set_image_tags(
            &mut session,
            "ratio-only",
            &["aspect-ratio/16-9".to_string()],
        )
        .await
        .unwrap();
        session.commit().await.unwrap();

        let filter = GroupedTagFilter::from_selected([
            TagSlug::parse("resolution/4k").unwrap(),
            TagSlug::parse("aspect-ratio/16-9").unwrap(),
            TagSlug::parse("aspect-ratio/16-10").unwrap(),
        ]);

        let mut session = DbSession::begin(&pool, SessionMode::Read).await.unwrap();
        let page = list_images_page(&mut session, None, 10, &filter, false)
            .await
            .unwrap();
        let slugs: Vec<&str> = page.items.iter().map(|i| i.slug.as_str()).collect();

        // "both" satisfies every group; "wrong-ratio" misses the
        // aspect-ratio group; "ratio-only" misses resolution entirely.
        assert_eq!(slugs, vec!["both"]);
    }

    #[tokio::test]
    async fn out_of_range_limit_is_rejected() {
        let pool = test_pool().await;
        let mut session = DbSession::begin(&pool, SessionMode::Read).await.unwrap();
        let filter = GroupedTagFilter::default();

        let err = list_images_page(&mut session, None, 0, &filter, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = list_images_page(&mut session, None, 201, &filter, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn rename_requires_existing_image() {
        let pool = test_pool().await;

        let mut session = DbSession::begin(&pool, SessionMode::Write).await.unwrap();
        let err = update_image_name(&mut session, "ghost", "Ghost")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        insert_image(&mut session, &test_image("real", 5, true))
            .await
            .unwrap();
        let renamed = update_image_name(&mut session, "real", "  Renamed  ")
            .await
            .unwrap();
        assert_eq!(renamed.name, "Renamed");
        session.commit().await.unwrap();
    }

    #[tokio::test]
    async fn writes_require_a_write_session() {
        let pool = test_pool().await;

        let mut session = DbSession::begin(&pool, SessionMode::Read).await.unwrap();
        let err = insert_image(&mut session, &test_image("nope", 1, true))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionState(_)));
    }
}
