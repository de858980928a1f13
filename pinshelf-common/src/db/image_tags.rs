//! Image-tag association store
//!
//! Manages the join table between images and tags. System-tag rows are owned
//! by the reconciliation pass and the upload flow; user rows are owned by
//! explicit edits. No operation here crosses that ownership line.

use std::collections::BTreeSet;

use sqlx::Row;
use tracing::info;

use crate::model::{ImageSlug, TagSlug};
use crate::system_tags::{resolve_system_tags, ImageProbe};
use crate::{Error, Result};

use super::models::{BulkModifyResult, TagRecord};
use super::session::DbSession;
use super::tags::get_tag;

/// Full replace of an image's associations, de-duplicated.
///
/// Trusted internal call (upload finalize, reconciliation): slugs are parsed
/// but tag existence is not checked here.
pub async fn set_image_tags(
    session: &mut DbSession,
    image_slug: &str,
    tag_slugs: &[String],
) -> Result<()> {
    session.require_write("set image tags")?;

    let image_slug = ImageSlug::parse(image_slug)?;
    let mut unique: BTreeSet<TagSlug> = BTreeSet::new();
    for raw in tag_slugs {
        unique.insert(TagSlug::parse(raw)?);
    }

    sqlx::query("DELETE FROM image_tags WHERE image_slug = ?")
        .bind(image_slug.as_str())
        .execute(session.conn("set image tags")?)
        .await?;

    for tag_slug in &unique {
        sqlx::query("INSERT INTO image_tags (image_slug, tag_slug) VALUES (?, ?)")
            .bind(image_slug.as_str())
            .bind(tag_slug.as_str())
            .execute(session.conn("set image tags")?)
            .await?;
    }

    Ok(())
}

/// User-facing replace of an image's tags, scoped to non-system tags.
///
/// System-tag associations are untouched. Every requested tag is validated
/// before any row changes, so a bad request leaves the image as it was.
pub async fn set_image_user_tags(
    session: &mut DbSession,
    image_slug: &str,
    tag_slugs: &[String],
) -> Result<Vec<TagRecord>> {
    session.require_write("set image user tags")?;

    let image_slug = ImageSlug::parse(image_slug)?;
    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM images WHERE slug = ?)")
        .bind(image_slug.as_str())
        .fetch_one(session.conn("set image user tags")?)
        .await?;
    if !exists {
        return Err(Error::NotFound(format!("Image not found: {image_slug}")));
    }

    let mut requested: BTreeSet<TagSlug> = BTreeSet::new();
    for raw in tag_slugs {
        requested.insert(TagSlug::parse(raw)?);
    }
    for tag_slug in &requested {
        let Some(tag) = get_tag(session, tag_slug.as_str()).await? else {
            return Err(Error::NotFound(format!("Tag not found: {tag_slug}")));
        };
        if tag.system {
            return Err(Error::Invariant(format!(
                "System tags cannot be assigned by users: {tag_slug}"
            )));
        }
    }

    sqlx::query(
        r#"
        DELETE FROM image_tags
        WHERE image_slug = ?
          AND tag_slug IN (SELECT slug FROM tags WHERE system = 0)
        "#,
    )
    .bind(image_slug.as_str())
    .execute(session.conn("set image user tags")?)
    .await?;

    for tag_slug in &requested {
        sqlx::query("INSERT INTO image_tags (image_slug, tag_slug) VALUES (?, ?)")
            .bind(image_slug.as_str())
            .bind(tag_slug.as_str())
            .execute(session.conn("set image user tags")?)
            .await?;
    }

    super::images::tags_for_image(session, &image_slug).await
}

/// Add and remove tags across many images in one call.
///
/// The whole batch is rejected up front if any requested tag is missing or
/// system-owned. Image slugs that don't exist are skipped, not errors.
pub async fn bulk_modify_images_tags(
    session: &mut DbSession,
    image_slugs: &[String],
    tag_slugs_to_add: &[String],
    tag_slugs_to_remove: &[String],
) -> Result<BulkModifyResult> {
    session.require_write("bulk modify image tags")?;

    let mut add: BTreeSet<TagSlug> = BTreeSet::new();
    for raw in tag_slugs_to_add {
        add.insert(TagSlug::parse(raw)?);
    }
    let mut remove: BTreeSet<TagSlug> = BTreeSet::new();
    for raw in tag_slugs_to_remove {
        remove.insert(TagSlug::parse(raw)?);
    }

    for tag_slug in add.iter().chain(remove.iter()) {
        let Some(tag) = get_tag(session, tag_slug.as_str()).await? else {
            return Err(Error::NotFound(format!("Tag not found: {tag_slug}")));
        };
        if tag.system {
            return Err(Error::Invariant(format!(
                "System tags cannot be modified by users: {tag_slug}"
            )));
        }
    }

    let mut requested_images: BTreeSet<ImageSlug> = BTreeSet::new();
    for raw in image_slugs {
        requested_images.insert(ImageSlug::parse(raw)?);
    }

    // Resolve the subset that actually exists; the rest are skipped
    let mut existing: Vec<ImageSlug> = Vec::new();
    if !requested_images.is_empty() {
        let placeholders = vec!["?"; requested_images.len()].join(", ");
        let sql = format!("SELECT slug FROM images WHERE slug IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for slug in &requested_images {
            query = query.bind(slug.as_str());
        }
        let rows = query
            .fetch_all(session.conn("bulk modify image tags")?)
            .await?;
        for row in rows {
            existing.push(ImageSlug::parse(&row.try_get::<String, _>("slug")?)?);
        }
    }

    let mut inserted_count = 0u64;
    for image_slug in &existing {
        for tag_slug in &add {
            let result =
                sqlx::query("INSERT OR IGNORE INTO image_tags (image_slug, tag_slug) VALUES (?, ?)")
                    .bind(image_slug.as_str())
                    .bind(tag_slug.as_str())
                    .execute(session.conn("bulk modify image tags")?)
                    .await?;
            inserted_count += result.rows_affected();
        }
    }

    let mut removed_count = 0u64;
    for image_slug in &existing {
        for tag_slug in &remove {
            let result = sqlx::query(
                "DELETE FROM image_tags WHERE image_slug = ? AND tag_slug = ?",
            )
            .bind(image_slug.as_str())
            .bind(tag_slug.as_str())
            .execute(session.conn("bulk modify image tags")?)
            .await?;
            removed_count += result.rows_affected();
        }
    }

    Ok(BulkModifyResult {
        image_count: existing.len() as u64,
        add_tag_count: add.len() as u64,
        remove_tag_count: remove.len() as u64,
        inserted_count,
        removed_count,
    })
}

/// Recompute every image's system tags from its stored dimensions.
///
/// For each image the existing system-tag rows are dropped and the rule
/// engine's output re-inserted; user rows are never touched. A rule emitting
/// a slug with no tag definition aborts the whole operation (the session is
/// not committed, so nothing partial survives). Running twice with no data
/// change yields the same association set.
pub async fn reapply_system_tags_for_all_images(session: &mut DbSession) -> Result<u64> {
    session.require_write("reapply system tags")?;

    let known: BTreeSet<String> = sqlx::query("SELECT slug FROM tags")
        .fetch_all(session.conn("reapply system tags")?)
        .await?
        .iter()
        .map(|row| row.try_get::<String, _>("slug"))
        .collect::<std::result::Result<_, _>>()?;

    let image_rows = sqlx::query("SELECT slug, width_px, height_px, size_bytes FROM images")
        .fetch_all(session.conn("reapply system tags")?)
        .await?;

    let mut images: Vec<(ImageSlug, ImageProbe)> = Vec::with_capacity(image_rows.len());
    for row in &image_rows {
        let slug = ImageSlug::parse(&row.try_get::<String, _>("slug")?)?;
        let probe = ImageProbe {
            width_px: row.try_get("width_px")?,
            height_px: row.try_get("height_px")?,
            size_bytes: row.try_get("size_bytes")?,
        };
        images.push((slug, probe));
    }

    let mut image_count = 0u64;
    for (image_slug, probe) in &images {
        let derived = resolve_system_tags(probe);
        for tag_slug in &derived {
            if !known.contains(*tag_slug) {
                return Err(Error::Invariant(format!(
                    "Missing system tag definition: {tag_slug}"
                )));
            }
        }

        sqlx::query(
            r#"
            DELETE FROM image_tags
            WHERE image_slug = ?
              AND tag_slug IN (SELECT slug FROM tags WHERE system = 1)
            "#,
        )
        .bind(image_slug.as_str())
        .execute(session.conn("reapply system tags")?)
        .await?;

        for tag_slug in &derived {
            sqlx::query("INSERT OR IGNORE INTO image_tags (image_slug, tag_slug) VALUES (?, ?)")
                .bind(image_slug.as_str())
                .bind(*tag_slug)
                .execute(session.conn("reapply system tags")?)
                .await?;
        }

        image_count += 1;
    }

    info!(image_count, "Reapplied system tags for all images");
    Ok(image_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::images::{delete_image_by_slug, insert_image, InsertImage};
    use crate::db::init::init_schema;
    use crate::db::session::SessionMode;
    use crate::db::tags::delete_tag;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use sqlx::SqlitePool;
    use std::str::FromStr;

    const TEST_SHA256: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa=";

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

    async fn ensure_user_tag(pool: &SqlitePool, tag_slug: &str) {
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

    async fn insert_test_image(
        session: &mut DbSession,
        slug: &str,
        width_px: i64,
        height_px: i64,
    ) {
        insert_image(
            session,
            &InsertImage {
                slug,
                ext: "jpg",
                name: slug,
                added_at: 1,
                size_bytes: 1024,
                width_px,
                height_px,
                sha256: TEST_SHA256,
                ready: true,
            },
        )
        .await
        .unwrap();
    }

    async fn association_rows(pool: &SqlitePool) -> Vec<(String, String)> {
        sqlx::query(
            "SELECT image_slug, tag_slug FROM image_tags ORDER BY image_slug ASC, tag_slug ASC",
        )
        .fetch_all(pool)
        .await
        .unwrap()
        .iter()
        .map(|row| (row.get("image_slug"), row.get("tag_slug")))
        .collect()
    }

    #[tokio::test]
    async fn set_image_tags_replaces_existing_joins() {
        let pool = test_pool().await;
        ensure_user_tag(&pool, "a/x").await;
        ensure_user_tag(&pool, "a/y").await;
        ensure_user_tag(&pool, "a/z").await;

        let mut session = DbSession::begin(&pool, SessionMode::Write).await.unwrap();
        insert_test_image(&mut session, "img-1", 100, 100).await;
        insert_test_image(&mut session, "img-2", 100, 100).await;

        set_image_tags(&mut session, "img-1", &["a/x".into(), "a/y".into(), "a/x".into()])
            .await
            .unwrap();
        set_image_tags(&mut session, "img-2", &["a/y".into()]).await.unwrap();
        set_image_tags(&mut session, "img-1", &["a/z".into()]).await.unwrap();
        session.commit().await.unwrap();

        assert_eq!(
            association_rows(&pool).await,
            vec![
                ("img-1".to_string(), "a/z".to_string()),
                ("img-2".to_string(), "a/y".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn association_rows_follow_image_and_tag_deletion() {
        let pool = test_pool().await;
        ensure_user_tag(&pool, "subject/nature").await;
        ensure_user_tag(&pool, "subject/city").await;

        let mut session = DbSession::begin(&pool, SessionMode::Write).await.unwrap();
        insert_test_image(&mut session, "doomed", 100, 100).await;
        insert_test_image(&mut session, "kept", 100, 100).await;
        set_image_tags(
            &mut session,
            "doomed",
            &["subject/nature".into(), "subject/city".into()],
        )
        .await
        .unwrap();
        set_image_tags(&mut session, "kept", &["subject/city".into()])
            .await
            .unwrap();

        // the cascading keys clear both images' rows: "doomed" goes with the
        // image, "kept" loses its only tag when the tag row goes
        delete_image_by_slug(&mut session, "doomed").await.unwrap();
        delete_tag(&mut session, "subject/city").await.unwrap();
        session.commit().await.unwrap();

        assert_eq!(association_rows(&pool).await, vec![]);
    }

    #[tokio::test]
    async fn user_tag_replace_preserves_system_rows() {
        let pool = test_pool().await;
        ensure_user_tag(&pool, "subject/nature").await;
        ensure_user_tag(&pool, "subject/city").await;

        let mut session = DbSession::begin(&pool, SessionMode::Write).await.unwrap();
        insert_test_image(&mut session, "shot", 3840, 2160).await;
        // system row as the upload flow would have written it
        set_image_tags(
            &mut session,
            "shot",
            &["resolution/4k".into(), "subject/nature".into()],
        )
        .await
        .unwrap();

        let tags = set_image_user_tags(&mut session, "shot", &["subject/city".into()])
            .await
            .unwrap();
        session.commit().await.unwrap();

        let slugs: Vec<&str> = tags.iter().map(|t| t.slug.as_str()).collect();
        assert_eq!(slugs, vec!["resolution/4k", "subject/city"]);
    }

    #[tokio::test]
    async fn user_tag_replace_rejects_system_tags_without_side_effects() {
        let pool = test_pool().await;
        ensure_user_tag(&pool, "subject/nature").await;

        let mut session = DbSession::begin(&pool, SessionMode::Write).await.unwrap();
        insert_test_image(&mut session, "shot", 3840, 2160).await;
        set_image_tags(
            &mut session,
            "shot",
            &["resolution/4k".into(), "subject/nature".into()],
        )
        .await
        .unwrap();
        session.commit().await.unwrap();

        let before = association_rows(&pool).await;

        let mut session = DbSession::begin(&pool, SessionMode::Write).await.unwrap();
        let err = set_image_user_tags(&mut session, "shot", &["resolution/4k".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
        drop(session);

        assert_eq!(association_rows(&pool).await, before);
    }

    #[tokio::test]
    async fn user_tag_replace_requires_existing_image_and_tags() {
        let pool = test_pool().await;
        ensure_user_tag(&pool, "subject/nature").await;

        let mut session = DbSession::begin(&pool, SessionMode::Write).await.unwrap();
        let err = set_image_user_tags(&mut session, "ghost", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        insert_test_image(&mut session, "shot", 100, 100).await;
        let err = set_image_user_tags(&mut session, "shot", &["subject/missing".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn bulk_modify_counts_only_changed_rows() {
        let pool = test_pool().await;
        ensure_user_tag(&pool, "subject/nature").await;
        ensure_user_tag(&pool, "subject/city").await;
        ensure_user_tag(&pool, "mood/calm").await;

        let mut session = DbSession::begin(&pool, SessionMode::Write).await.unwrap();
        insert_test_image(&mut session, "one", 100, 100).await;
        insert_test_image(&mut session, "two", 100, 100).await;
        // "one" already carries a tag we are about to add
        set_image_tags(&mut session, "one", &["subject/nature".into(), "mood/calm".into()])
            .await
            .unwrap();

        let result = bulk_modify_images_tags(
            &mut session,
            &["one".into(), "two".into(), "missing".into()],
            &["subject/nature".into(), "subject/city".into()],
            &["mood/calm".into()],
        )
        .await
        .unwrap();
        session.commit().await.unwrap();

        assert_eq!(
            result,
            BulkModifyResult {
                image_count: 2,
                add_tag_count: 2,
                remove_tag_count: 1,
                // 4 requested inserts, one pre-existing
                inserted_count: 3,
                // only "one" carried mood/calm
                removed_count: 1,
            }
        );
    }

    #[tokio::test]
    async fn bulk_modify_rejects_whole_batch_on_system_tag() {
        let pool = test_pool().await;
        ensure_user_tag(&pool, "subject/nature").await;

        let mut session = DbSession::begin(&pool, SessionMode::Write).await.unwrap();
        insert_test_image(&mut session, "one", 100, 100).await;
        session.commit().await.unwrap();

        let before = association_rows(&pool).await;

        let mut session = DbSession::begin(&pool, SessionMode::Write).await.unwrap();
        let err = bulk_modify_images_tags(
            &mut session,
            &["one".into()],
            &["subject/nature".into()],
            &["resolution/4k".into()],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
        drop(session);

        assert_eq!(association_rows(&pool).await, before);
    }

    #[tokio::test]
    async fn reconciliation_is_idempotent_and_preserves_user_tags() {
        let pool = test_pool().await;
        ensure_user_tag(&pool, "subject/nature").await;

        let mut session = DbSession::begin(&pool, SessionMode::Write).await.unwrap();
        insert_test_image(&mut session, "uhd", 3840, 2160).await;
        insert_test_image(&mut session, "square", 500, 500).await;
        set_image_user_tags(&mut session, "uhd", &["subject/nature".into()])
            .await
            .unwrap();
        // stale system row the reconciliation must clear: square is not 16:10
        sqlx::query("INSERT INTO image_tags (image_slug, tag_slug) VALUES ('square', 'aspect-ratio/16-10')")
            .execute(session.conn("test setup").unwrap())
            .await
            .unwrap();
        session.commit().await.unwrap();

        let mut session = DbSession::begin(&pool, SessionMode::Write).await.unwrap();
        let count = reapply_system_tags_for_all_images(&mut session).await.unwrap();
        session.commit().await.unwrap();
        assert_eq!(count, 2);

        let after_first = association_rows(&pool).await;
        assert_eq!(
            after_first,
            vec![
                ("uhd".to_string(), "aspect-ratio/16-9".to_string()),
                ("uhd".to_string(), "resolution/4k".to_string()),
                ("uhd".to_string(), "subject/nature".to_string()),
            ]
        );

        let mut session = DbSession::begin(&pool, SessionMode::Write).await.unwrap();
        reapply_system_tags_for_all_images(&mut session).await.unwrap();
        session.commit().await.unwrap();

        assert_eq!(association_rows(&pool).await, after_first);
    }

    #[tokio::test]
    async fn reconciliation_fails_fast_on_missing_definition() {
        let pool = test_pool().await;

        let mut session = DbSession::begin(&pool, SessionMode::Write).await.unwrap();
        insert_test_image(&mut session, "uhd", 3840, 2160).await;
        session.commit().await.unwrap();

        // simulate a configuration hole: drop a vocabulary row out-of-band
        sqlx::query("DELETE FROM tags WHERE slug = 'resolution/4k'")
            .execute(&pool)
            .await
            .unwrap();

        let mut session = DbSession::begin(&pool, SessionMode::Write).await.unwrap();
        let err = reapply_system_tags_for_all_images(&mut session)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
        assert!(err
            .to_string()
            .contains("Missing system tag definition: resolution/4k"));
    }
}
