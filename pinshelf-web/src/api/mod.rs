//! HTTP API handlers

pub mod health;
pub mod images;
pub mod tags;

use pinshelf_common::model::TagSlug;
use pinshelf_common::Result;

/// Parse a comma-separated `tag` query parameter into validated slugs.
pub(crate) fn parse_tag_selection(raw: Option<&str>) -> Result<Vec<String>> {
    let mut selected = Vec::new();
    let Some(raw) = raw else {
        return Ok(selected);
    };
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let slug = TagSlug::parse(part)?;
        if !selected.iter().any(|s| s == slug.as_str()) {
            selected.push(slug.as_str().to_string());
        }
    }
    Ok(selected)
}
