//! System-tag derivation rules
//!
//! A system tag is derived from image properties rather than chosen by a
//! user. Rules are plain records evaluated in declaration order; adding a
//! rule is a table edit, callers never change. Ratio checks use integer
//! cross-multiplication so near-miss dimensions are never rounded into a
//! match.

/// Image properties the rules may inspect.
///
/// `size_bytes` is unused by the shipped rules but part of the contract so
/// future rules can match on it.
#[derive(Debug, Clone, Copy)]
pub struct ImageProbe {
    pub width_px: i64,
    pub height_px: i64,
    pub size_bytes: i64,
}

/// A single derivation rule: the tag it emits and its predicate.
pub struct SystemTagRule {
    /// Tag slug emitted when the rule applies.
    pub slug: &'static str,
    /// Display name used when seeding the tag definition.
    pub name: &'static str,
    pub applies: fn(&ImageProbe) -> bool,
}

const UHD_MIN_WIDTH: i64 = 3840;
const UHD_MIN_HEIGHT: i64 = 2160;

fn matches_ratio(probe: &ImageProbe, width_part: i64, height_part: i64) -> bool {
    probe.width_px * height_part == probe.height_px * width_part
}

fn is_4k(probe: &ImageProbe) -> bool {
    probe.width_px >= UHD_MIN_WIDTH
        && probe.height_px >= UHD_MIN_HEIGHT
        && matches_ratio(probe, 16, 9)
}

fn is_16_9(probe: &ImageProbe) -> bool {
    matches_ratio(probe, 16, 9)
}

fn is_16_10(probe: &ImageProbe) -> bool {
    matches_ratio(probe, 16, 10)
}

/// Ordered rule table. Output order of [`resolve_system_tags`] follows this
/// declaration order.
pub const SYSTEM_TAG_RULES: &[SystemTagRule] = &[
    SystemTagRule {
        slug: "resolution/4k",
        name: "4K",
        applies: is_4k,
    },
    SystemTagRule {
        slug: "aspect-ratio/16-9",
        name: "16:9",
        applies: is_16_9,
    },
    SystemTagRule {
        slug: "aspect-ratio/16-10",
        name: "16:10",
        applies: is_16_10,
    },
];

/// Tag kinds the rule vocabulary lives in, seeded at database init.
pub const SYSTEM_TAG_KINDS: &[(&str, &str)] = &[
    ("resolution", "Resolution"),
    ("aspect-ratio", "Aspect ratio"),
];

/// Resolve the system tags for an image.
///
/// Pure and deterministic: invoked at upload time and again during full
/// reconciliation, and must produce the same output for the same input.
pub fn resolve_system_tags(probe: &ImageProbe) -> Vec<&'static str> {
    SYSTEM_TAG_RULES
        .iter()
        .filter(|rule| (rule.applies)(probe))
        .map(|rule| rule.slug)
        .collect()
}
