//! Domain value types and validators
//!
//! Every raw identifier or scalar entering the system passes through exactly
//! one of these constructors before it reaches SQL or the object store. The
//! stores re-run these at the query boundary, so the contracts here are the
//! single source of truth for each field.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::{Error, Result};

static SLUG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[a-z][a-z0-9]*(?:-[a-z0-9]+)*$").unwrap());
static TAG_VALUE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[a-z0-9]+(?:-[a-z0-9]+)*$").unwrap());
static EXT_RE: Lazy<Regex> = Lazy::new(|| Regex::new("^[a-z0-9]+$").unwrap());
static SHA256_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[A-Za-z0-9+/]{43}=$").unwrap());

/// Namespace identifier for a group of tags (e.g. `resolution`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TagKindSlug(String);

impl TagKindSlug {
    pub fn parse(raw: &str) -> Result<Self> {
        if !SLUG_RE.is_match(raw) {
            return Err(Error::Validation(format!(
                "Tag kind slug must be a lowercase hyphenated token: {raw}"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TagKindSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Composite tag identifier of the form `kind/value`.
///
/// Input is trimmed and lowercased before validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TagSlug(String);

impl TagSlug {
    pub fn parse(raw: &str) -> Result<Self> {
        let normalized = raw.trim().to_lowercase();

        let Some((kind, value)) = normalized.split_once('/') else {
            return Err(Error::Validation(format!(
                "Tag slug must match the `kind/value` format: {raw}"
            )));
        };
        if value.contains('/') || !SLUG_RE.is_match(kind) || !TAG_VALUE_RE.is_match(value) {
            return Err(Error::Validation(format!(
                "Tag slug must match the `kind/value` format: {raw}"
            )));
        }

        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Kind segment of the slug (before the `/`).
    pub fn kind(&self) -> &str {
        self.0.split_once('/').map_or("", |(kind, _)| kind)
    }

    /// Value segment of the slug (after the `/`).
    pub fn value(&self) -> &str {
        self.0.split_once('/').map_or("", |(_, value)| value)
    }

    pub fn kind_slug(&self) -> TagKindSlug {
        TagKindSlug(self.kind().to_string())
    }
}

impl fmt::Display for TagSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for a stored image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ImageSlug(String);

impl ImageSlug {
    pub fn parse(raw: &str) -> Result<Self> {
        if !SLUG_RE.is_match(raw) {
            return Err(Error::Validation(format!(
                "Image slug must be a lowercase hyphenated token: {raw}"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalized file extension: lowercase, no leading dot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ImageExt(String);

impl ImageExt {
    pub fn parse(raw: &str) -> Result<Self> {
        let normalized = raw.trim().to_lowercase();
        let normalized = normalized.trim_start_matches('.');
        if !EXT_RE.is_match(normalized) {
            return Err(Error::Validation(format!(
                "Image extension must be alphanumeric: {raw}"
            )));
        }
        Ok(Self(normalized.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageExt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Base64-encoded SHA-256 digest (43 characters plus `=` padding).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Sha256Digest(String);

impl Sha256Digest {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if !SHA256_RE.is_match(trimmed) {
            return Err(Error::Validation(
                "sha256 must be a base64-encoded SHA-256 digest".to_string(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn valid_unix_seconds(value: i64) -> Result<i64> {
    if value < 0 {
        return Err(Error::Validation(
            "Unix timestamp seconds must be a non-negative integer".to_string(),
        ));
    }
    Ok(value)
}

pub fn valid_size_bytes(value: i64) -> Result<i64> {
    if value < 0 {
        return Err(Error::Validation(
            "Image size bytes must be a non-negative integer".to_string(),
        ));
    }
    Ok(value)
}

pub fn valid_width_px(value: i64) -> Result<i64> {
    if value <= 0 {
        return Err(Error::Validation(
            "Image width must be a positive integer".to_string(),
        ));
    }
    Ok(value)
}

pub fn valid_height_px(value: i64) -> Result<i64> {
    if value <= 0 {
        return Err(Error::Validation(
            "Image height must be a positive integer".to_string(),
        ));
    }
    Ok(value)
}

/// Page limits are bounded to keep listing queries cheap.
pub fn valid_page_limit(value: i64) -> Result<i64> {
    if !(1..=200).contains(&value) {
        return Err(Error::Validation(
            "Page limit must be an integer between 1 and 200".to_string(),
        ));
    }
    Ok(value)
}

fn non_empty_name(raw: &str, what: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation(format!("{what} must not be empty")));
    }
    Ok(trimmed.to_string())
}

pub fn valid_image_name(raw: &str) -> Result<String> {
    non_empty_name(raw, "Image name")
}

pub fn valid_tag_name(raw: &str) -> Result<String> {
    non_empty_name(raw, "Tag name")
}

pub fn valid_tag_kind_name(raw: &str) -> Result<String> {
    non_empty_name(raw, "Tag kind name")
}
