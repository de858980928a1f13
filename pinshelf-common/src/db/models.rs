//! Typed records returned by the stores

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::model::{ImageExt, ImageSlug, Sha256Digest, TagKindSlug, TagSlug};

#[derive(Debug, Clone, Serialize)]
pub struct ImageRecord {
    pub slug: ImageSlug,
    pub ext: ImageExt,
    pub name: String,
    pub added_at: i64,
    pub size_bytes: i64,
    pub width_px: i64,
    pub height_px: i64,
    pub sha256: Sha256Digest,
    pub ready: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TagKindRecord {
    pub slug: TagKindSlug,
    pub name: String,
    pub system_only: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TagRecord {
    pub slug: TagSlug,
    pub name: String,
    pub kind_slug: TagKindSlug,
    pub system: bool,
}

/// Tag annotated with its image count inside the currently filtered set.
#[derive(Debug, Clone, Serialize)]
pub struct TagWithCount {
    pub slug: TagSlug,
    pub name: String,
    pub kind_slug: TagKindSlug,
    pub system: bool,
    pub image_count: i64,
    pub selected: bool,
}

/// A tag kind with its tags, aggregated under the active filter.
#[derive(Debug, Clone, Serialize)]
pub struct TagKindTree {
    pub slug: TagKindSlug,
    pub name: String,
    pub system_only: bool,
    pub image_count: i64,
    pub has_selected: bool,
    pub tags: Vec<TagWithCount>,
}

/// Position in the newest-first image ordering.
///
/// The slug breaks ties between images sharing `added_at`, so pagination
/// resumes deterministically.
#[derive(Debug, Clone, Serialize)]
pub struct ImageCursor {
    pub added_at: i64,
    pub slug: ImageSlug,
}

#[derive(Debug, Serialize)]
pub struct ImagePage {
    pub items: Vec<ImageRecord>,
    pub next_cursor: Option<ImageCursor>,
}

#[derive(Debug, Serialize)]
pub struct ImageWithTags {
    pub image: ImageRecord,
    pub tags: Vec<TagRecord>,
}

/// Outcome counts for a bulk tag edit across many images.
///
/// `inserted_count`/`removed_count` only reflect rows that changed state;
/// pre-existing associations are not double-counted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkModifyResult {
    pub image_count: u64,
    pub add_tag_count: u64,
    pub remove_tag_count: u64,
    pub inserted_count: u64,
    pub removed_count: u64,
}

/// Tag filter grouped by kind: OR within a group, AND across groups.
///
/// An image matches when, for every group present, it carries at least one
/// of that group's tags. An empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct GroupedTagFilter {
    groups: BTreeMap<TagKindSlug, BTreeSet<TagSlug>>,
}

impl GroupedTagFilter {
    /// Regroup a flat selection of tag slugs by their kind.
    pub fn from_selected<I>(slugs: I) -> Self
    where
        I: IntoIterator<Item = TagSlug>,
    {
        let mut filter = Self::default();
        for slug in slugs {
            filter.insert(slug);
        }
        filter
    }

    pub fn insert(&mut self, slug: TagSlug) {
        self.groups.entry(slug.kind_slug()).or_default().insert(slug);
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn group_count(&self) -> i64 {
        self.groups.len() as i64
    }

    pub fn tag_count(&self) -> usize {
        self.groups.values().map(BTreeSet::len).sum()
    }

    /// All selected slugs in deterministic (kind, value) order.
    pub fn flattened(&self) -> impl Iterator<Item = &TagSlug> {
        self.groups.values().flatten()
    }
}
