//! Tag kind and tag definition store
//!
//! Enforces the system-ownership invariants: system-only kinds never hold
//! user tags, and system tags are never edited or deleted through this
//! surface. The aggregation query at the bottom feeds the filter sidebar.

use std::collections::BTreeSet;

use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::model::{
    valid_tag_kind_name, valid_tag_name, TagKindSlug, TagSlug,
};
use crate::{Error, Result};

use super::images::tag_from_row;
use super::models::{GroupedTagFilter, TagKindRecord, TagKindTree, TagRecord, TagWithCount};
use super::session::DbSession;

fn tag_kind_from_row(row: &SqliteRow) -> Result<TagKindRecord> {
    Ok(TagKindRecord {
        slug: TagKindSlug::parse(&row.try_get::<String, _>("slug")?)?,
        name: row.try_get("name")?,
        system_only: row.try_get("system_only")?,
    })
}

pub async fn get_tag_kind(
    session: &mut DbSession,
    slug: &str,
) -> Result<Option<TagKindRecord>> {
    let slug = TagKindSlug::parse(slug)?;
    let row = sqlx::query("SELECT slug, name, system_only FROM tag_kinds WHERE slug = ? LIMIT 1")
        .bind(slug.as_str())
        .fetch_optional(session.conn("get tag kind")?)
        .await?;

    row.as_ref().map(tag_kind_from_row).transpose()
}

pub async fn get_tag(session: &mut DbSession, slug: &str) -> Result<Option<TagRecord>> {
    let slug = TagSlug::parse(slug)?;
    let row = sqlx::query("SELECT slug, name, kind_slug, system FROM tags WHERE slug = ? LIMIT 1")
        .bind(slug.as_str())
        .fetch_optional(session.conn("get tag")?)
        .await?;

    row.as_ref().map(tag_from_row).transpose()
}

pub async fn create_tag_kind(
    session: &mut DbSession,
    slug: &str,
    name: &str,
) -> Result<TagKindRecord> {
    session.require_write("create tag kind")?;

    let slug = TagKindSlug::parse(slug)?;
    let name = valid_tag_kind_name(name)?;

    if get_tag_kind(session, slug.as_str()).await?.is_some() {
        return Err(Error::Invariant(format!("Tag kind already exists: {slug}")));
    }

    sqlx::query("INSERT INTO tag_kinds (slug, name, system_only) VALUES (?, ?, 0)")
        .bind(slug.as_str())
        .bind(&name)
        .execute(session.conn("create tag kind")?)
        .await?;

    Ok(TagKindRecord {
        slug,
        name,
        system_only: false,
    })
}

/// Insert-or-rename a tag kind. `system_only` is never touched here: it is
/// immutable through this surface once the kind exists.
pub async fn upsert_tag_kind(
    session: &mut DbSession,
    slug: &str,
    name: &str,
) -> Result<TagKindRecord> {
    session.require_write("upsert tag kind")?;

    let slug = TagKindSlug::parse(slug)?;
    let name = valid_tag_kind_name(name)?;

    sqlx::query(
        r#"
        INSERT INTO tag_kinds (slug, name, system_only)
        VALUES (?, ?, 0)
        ON CONFLICT(slug) DO UPDATE
        SET name = excluded.name
        "#,
    )
    .bind(slug.as_str())
    .bind(&name)
    .execute(session.conn("upsert tag kind")?)
    .await?;

    match get_tag_kind(session, slug.as_str()).await? {
        Some(kind) => Ok(kind),
        None => Err(Error::NotFound(format!("Tag kind not found: {slug}"))),
    }
}

pub async fn delete_tag_kind(session: &mut DbSession, slug: &str) -> Result<()> {
    session.require_write("delete tag kind")?;

    let slug = TagKindSlug::parse(slug)?;
    if get_tag_kind(session, slug.as_str()).await?.is_none() {
        return Err(Error::NotFound(format!("Tag kind not found: {slug}")));
    }

    let tag_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tags WHERE kind_slug = ?")
        .bind(slug.as_str())
        .fetch_one(session.conn("delete tag kind")?)
        .await?;
    if tag_count > 0 {
        return Err(Error::Invariant(format!(
            "Tag kind has tags and cannot be deleted: {slug}"
        )));
    }

    sqlx::query("DELETE FROM tag_kinds WHERE slug = ?")
        .bind(slug.as_str())
        .execute(session.conn("delete tag kind")?)
        .await?;

    Ok(())
}

async fn kind_allowing_user_tags(
    session: &mut DbSession,
    kind_slug: &str,
) -> Result<TagKindRecord> {
    let Some(kind) = get_tag_kind(session, kind_slug).await? else {
        return Err(Error::NotFound(format!("Tag kind not found: {kind_slug}")));
    };
    if kind.system_only {
        return Err(Error::Invariant(format!(
            "Tag kind is system-only: {kind_slug}"
        )));
    }
    Ok(kind)
}

pub async fn create_tag(session: &mut DbSession, slug: &str, name: &str) -> Result<TagRecord> {
    session.require_write("create tag")?;

    let slug = TagSlug::parse(slug)?;
    let name = valid_tag_name(name)?;
    let kind = kind_allowing_user_tags(session, slug.kind()).await?;

    if get_tag(session, slug.as_str()).await?.is_some() {
        return Err(Error::Invariant(format!("Tag already exists: {slug}")));
    }

    sqlx::query("INSERT INTO tags (slug, name, kind_slug, system) VALUES (?, ?, ?, 0)")
        .bind(slug.as_str())
        .bind(&name)
        .bind(kind.slug.as_str())
        .execute(session.conn("create tag")?)
        .await?;

    Ok(TagRecord {
        slug,
        name,
        kind_slug: kind.slug,
        system: false,
    })
}

/// Insert-or-rename a tag. The guarded statement only inserts when the kind
/// exists and allows user tags, and only renames non-system rows; the
/// re-read afterwards turns a silent no-op into the precise error.
pub async fn upsert_tag(session: &mut DbSession, slug: &str, name: &str) -> Result<TagRecord> {
    session.require_write("upsert tag")?;

    let slug = TagSlug::parse(slug)?;
    let name = valid_tag_name(name)?;

    sqlx::query(
        r#"
        INSERT INTO tags (slug, name, kind_slug, system)
        SELECT ?, ?, ?, 0
        WHERE EXISTS (
            SELECT 1
            FROM tag_kinds
            WHERE slug = ? AND system_only = 0
        )
        ON CONFLICT(slug) DO UPDATE
        SET name = excluded.name
        WHERE tags.system = 0
        "#,
    )
    .bind(slug.as_str())
    .bind(&name)
    .bind(slug.kind())
    .bind(slug.kind())
    .execute(session.conn("upsert tag")?)
    .await?;

    let Some(tag) = get_tag(session, slug.as_str()).await? else {
        // Nothing inserted: report why
        kind_allowing_user_tags(session, slug.kind()).await?;
        return Err(Error::NotFound(format!("Tag not found: {slug}")));
    };

    if tag.system {
        return Err(Error::Invariant(format!(
            "System tags are not editable: {slug}"
        )));
    }
    kind_allowing_user_tags(session, tag.kind_slug.as_str()).await?;

    Ok(tag)
}

pub async fn delete_tag(session: &mut DbSession, slug: &str) -> Result<()> {
    session.require_write("delete tag")?;

    let slug = TagSlug::parse(slug)?;
    let Some(tag) = get_tag(session, slug.as_str()).await? else {
        return Err(Error::NotFound(format!("Tag not found: {slug}")));
    };
    if tag.system {
        return Err(Error::Invariant(format!(
            "System tags are not editable: {slug}"
        )));
    }

    sqlx::query("DELETE FROM tags WHERE slug = ?")
        .bind(slug.as_str())
        .execute(session.conn("delete tag")?)
        .await?;

    Ok(())
}

/// The set users may pick from: all non-system tags, ordered by kind then
/// name.
pub async fn list_assignable_tags(session: &mut DbSession) -> Result<Vec<TagRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT slug, name, kind_slug, system
        FROM tags
        WHERE system = 0
        ORDER BY kind_slug ASC, name ASC
        "#,
    )
    .fetch_all(session.conn("list assignable tags")?)
    .await?;

    rows.iter().map(tag_from_row).collect()
}

pub async fn list_tag_kinds_for_management(
    session: &mut DbSession,
) -> Result<Vec<TagKindRecord>> {
    let rows = sqlx::query("SELECT slug, name, system_only FROM tag_kinds ORDER BY name ASC")
        .fetch_all(session.conn("list tag kinds")?)
        .await?;

    rows.iter().map(tag_kind_from_row).collect()
}

pub async fn list_tags_for_management(session: &mut DbSession) -> Result<Vec<TagRecord>> {
    let rows = sqlx::query(
        "SELECT slug, name, kind_slug, system FROM tags ORDER BY kind_slug ASC, name ASC",
    )
    .fetch_all(session.conn("list tags")?)
    .await?;

    rows.iter().map(tag_from_row).collect()
}

/// `filtered_images` CTE shared by both count queries: the images matching
/// the current selection (regrouped per kind, same semantics as the image
/// listing), so counts shrink consistently as filters are applied.
fn filtered_images_cte(filter: &GroupedTagFilter, include_not_ready: bool) -> String {
    if filter.is_empty() {
        if include_not_ready {
            return "filtered_images AS (SELECT i.slug FROM images i)".to_string();
        }
        return "filtered_images AS (SELECT i.slug FROM images i WHERE i.ready = 1)".to_string();
    }

    let placeholders = vec!["?"; filter.tag_count()].join(", ");
    let ready_clause = if include_not_ready { "" } else { "AND i.ready = 1" };
    format!(
        r#"
        filtered_images AS (
            SELECT it.image_slug AS slug
            FROM image_tags it
            JOIN tags t ON t.slug = it.tag_slug
            JOIN images i ON i.slug = it.image_slug
            WHERE it.tag_slug IN ({placeholders})
            {ready_clause}
            GROUP BY it.image_slug
            HAVING COUNT(DISTINCT t.kind_slug) = ?
        )
        "#
    )
}

fn bind_filter<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    filter: &'q GroupedTagFilter,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    for tag_slug in filter.flattened() {
        query = query.bind(tag_slug.as_str());
    }
    if !filter.is_empty() {
        query = query.bind(filter.group_count());
    }
    query
}

/// Every tag kind with its tags, each annotated with the distinct-image
/// count inside the currently selected filter and a `selected` flag.
pub async fn list_tag_kinds_with_counts(
    session: &mut DbSession,
    selected_tag_slugs: &[String],
    include_not_ready: bool,
) -> Result<Vec<TagKindTree>> {
    let mut selected: BTreeSet<TagSlug> = BTreeSet::new();
    for raw in selected_tag_slugs {
        selected.insert(TagSlug::parse(raw)?);
    }
    let filter = GroupedTagFilter::from_selected(selected.iter().cloned());
    let cte = filtered_images_cte(&filter, include_not_ready);

    let kinds_sql = format!(
        r#"
        WITH
        {cte},
        kind_counts AS (
            SELECT t.kind_slug, COUNT(DISTINCT it.image_slug) AS image_count
            FROM image_tags it
            JOIN tags t ON t.slug = it.tag_slug
            JOIN filtered_images fi ON fi.slug = it.image_slug
            GROUP BY t.kind_slug
        )
        SELECT
            k.slug,
            k.name,
            k.system_only,
            COALESCE(kc.image_count, 0) AS image_count
        FROM tag_kinds k
        LEFT JOIN kind_counts kc ON kc.kind_slug = k.slug
        ORDER BY k.name ASC
        "#
    );

    let kind_rows = bind_filter(sqlx::query(&kinds_sql), &filter)
        .fetch_all(session.conn("list tag kinds with counts")?)
        .await?;

    let tags_sql = format!(
        r#"
        WITH
        {cte},
        tag_counts AS (
            SELECT it.tag_slug, COUNT(DISTINCT it.image_slug) AS image_count
            FROM image_tags it
            JOIN filtered_images fi ON fi.slug = it.image_slug
            GROUP BY it.tag_slug
        )
        SELECT
            t.slug,
            t.name,
            t.kind_slug,
            t.system,
            COALESCE(tc.image_count, 0) AS image_count
        FROM tags t
        LEFT JOIN tag_counts tc ON tc.tag_slug = t.slug
        ORDER BY t.kind_slug ASC, t.name ASC
        "#
    );

    let tag_rows = bind_filter(sqlx::query(&tags_sql), &filter)
        .fetch_all(session.conn("list tag kinds with counts")?)
        .await?;

    let mut trees: Vec<TagKindTree> = Vec::with_capacity(kind_rows.len());
    for row in &kind_rows {
        let kind = tag_kind_from_row(row)?;
        trees.push(TagKindTree {
            slug: kind.slug,
            name: kind.name,
            system_only: kind.system_only,
            image_count: row.try_get("image_count")?,
            has_selected: false,
            tags: Vec::new(),
        });
    }

    for row in &tag_rows {
        let tag = tag_from_row(row)?;
        let image_count: i64 = row.try_get("image_count")?;
        let is_selected = selected.contains(&tag.slug);

        if let Some(tree) = trees.iter_mut().find(|t| t.slug == tag.kind_slug) {
            tree.has_selected = tree.has_selected || is_selected;
            tree.tags.push(TagWithCount {
                slug: tag.slug,
                name: tag.name,
                kind_slug: tag.kind_slug,
                system: tag.system,
                image_count,
                selected: is_selected,
            });
        }
    }

    Ok(trees)
}
