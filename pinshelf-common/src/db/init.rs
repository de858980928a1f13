//! Database initialization
//!
//! Creates the database on first run, applies the connection settings the
//! services rely on, creates tables idempotently and seeds the system-tag
//! vocabulary.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::model::TagSlug;
use crate::system_tags::{SYSTEM_TAG_KINDS, SYSTEM_TAG_RULES};
use crate::Result;

/// Connect options every pooled connection is opened with.
///
/// `foreign_keys` and `busy_timeout` are per-connection settings in SQLite,
/// so they must ride on the connect options rather than a one-shot PRAGMA:
/// association cleanup on image/tag deletion relies on the cascading keys
/// firing on whichever connection the pool hands out, and competing writers
/// wait out the lock instead of failing with SQLITE_BUSY.
pub fn connect_options(db_path: &Path) -> Result<SqliteConnectOptions> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))?
        .create_if_missing(true)
        // WAL allows concurrent readers alongside the single writer
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));
    Ok(options)
}

/// Initialize the database connection pool and create tables if needed.
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .connect_with(connect_options(db_path)?)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    init_schema(&pool).await?;

    Ok(pool)
}

/// Create tables, indexes and the seed vocabulary (idempotent).
///
/// Split out from [`init_database`] so tests can apply the schema to an
/// in-memory pool. Callers must open the pool with foreign keys enabled
/// (see [`connect_options`]); the cascade behavior below depends on it.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    create_images_table(pool).await?;
    create_tag_kinds_table(pool).await?;
    create_tags_table(pool).await?;
    create_image_tags_table(pool).await?;

    seed_system_tag_vocabulary(pool).await?;

    Ok(())
}

/// Create the images table
///
/// `ready` stays 0 while an upload is mid-flight; listings exclude such rows
/// unless explicitly asked for them.
pub async fn create_images_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS images (
            slug TEXT PRIMARY KEY,
            ext TEXT NOT NULL,
            name TEXT NOT NULL,
            added_at INTEGER NOT NULL,
            size_bytes INTEGER NOT NULL,
            width_px INTEGER NOT NULL,
            height_px INTEGER NOT NULL,
            sha256 TEXT NOT NULL,
            ready INTEGER NOT NULL DEFAULT 0,
            CHECK (added_at >= 0),
            CHECK (size_bytes >= 0),
            CHECK (width_px > 0),
            CHECK (height_px > 0),
            CHECK (length(sha256) = 44),
            CHECK (ready IN (0, 1))
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Listing order is (added_at DESC, slug DESC)
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_images_added_at ON images(added_at DESC, slug DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_images_ready ON images(ready)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the tag_kinds table
pub async fn create_tag_kinds_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tag_kinds (
            slug TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            system_only INTEGER NOT NULL DEFAULT 0,
            CHECK (system_only IN (0, 1))
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the tags table
pub async fn create_tags_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tags (
            slug TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            kind_slug TEXT NOT NULL REFERENCES tag_kinds(slug),
            system INTEGER NOT NULL DEFAULT 0,
            CHECK (system IN (0, 1))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tags_kind ON tags(kind_slug)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the image_tags association table
pub async fn create_image_tags_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS image_tags (
            image_slug TEXT NOT NULL REFERENCES images(slug) ON DELETE CASCADE,
            tag_slug TEXT NOT NULL REFERENCES tags(slug) ON DELETE CASCADE,
            PRIMARY KEY (image_slug, tag_slug)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_image_tags_tag ON image_tags(tag_slug)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Ensure the rule engine's kinds and tags exist.
///
/// Kinds are seeded writable (`system_only = 0`) so users may add their own
/// values next to the derived ones; the tags themselves are marked system
/// and stay out of user hands.
async fn seed_system_tag_vocabulary(pool: &SqlitePool) -> Result<()> {
    for (slug, name) in SYSTEM_TAG_KINDS {
        sqlx::query("INSERT OR IGNORE INTO tag_kinds (slug, name, system_only) VALUES (?, ?, 0)")
            .bind(slug)
            .bind(name)
            .execute(pool)
            .await?;
    }

    for rule in SYSTEM_TAG_RULES {
        let slug = TagSlug::parse(rule.slug)?;
        sqlx::query("INSERT OR IGNORE INTO tags (slug, name, kind_slug, system) VALUES (?, ?, ?, 1)")
            .bind(slug.as_str())
            .bind(rule.name)
            .bind(slug.kind())
            .execute(pool)
            .await?;
    }

    info!("System tag vocabulary seeded");
    Ok(())
}
