//! Filename heuristics
//!
//! Peers frequently omit file attributes, so bitrate and format fall back to
//! whatever the filename itself encodes.

use once_cell::sync::Lazy;
use regex::Regex;

static BITRATE_HINT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)\s*k").unwrap());

static PAREN_VARIANT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\([^)]*(?:remix|feat|ft|featuring|edit|version|mix|live|acoustic|instrumental)[^)]*\)")
        .unwrap()
});

static BRACKET_VARIANT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[[^\]]*(?:remix|feat|ft|featuring|edit|version|mix|live|acoustic|instrumental)[^\]]*\]")
        .unwrap()
});

/// Markers of remixes and alternate versions. `mix)` is deliberate: bare
/// `mix` would also hit words like "mixtape" in folder names.
pub const VARIANT_KEYWORDS: &[&str] = &[
    "remix",
    "mix)",
    "rmx",
    "edit",
    "version",
    "feat.",
    "ft.",
    "featuring",
    "live",
    "acoustic",
    "instrumental",
    "cover",
    "karaoke",
    "radio edit",
    "extended",
    "club",
    "dub",
    "vip",
];

/// Lowercased file extension, without the dot. Empty when there is none.
pub fn file_format(filename: &str) -> String {
    let lower = filename.to_lowercase();
    match lower.rsplit_once('.') {
        Some((_, ext)) => ext.to_string(),
        None => String::new(),
    }
}

/// Best-effort bitrate from the filename: explicit `NNNk`/`NNN kbps` tokens,
/// then the usual VBR preset averages. Zero when nothing matches.
pub fn extract_bitrate(filename: &str) -> u32 {
    let lower = filename.to_lowercase();
    if let Some(caps) = BITRATE_HINT.captures(&lower)
        && let Ok(rate) = caps[1].parse::<u32>()
    {
        return rate;
    }
    if lower.contains("v0") {
        return 245;
    }
    if lower.contains("v2") {
        return 190;
    }
    0
}

/// Whether the text names a remix or alternate version outright.
pub fn contains_variant_keyword(text_lower: &str) -> bool {
    VARIANT_KEYWORDS.iter().any(|k| text_lower.contains(k))
}

/// Whether the filename carries a parenthesized or bracketed variant group,
/// e.g. "Track (Other Artist Remix)" or "Track [feat. Someone]".
pub fn has_grouped_variant(filename_lower: &str) -> bool {
    PAREN_VARIANT.is_match(filename_lower) || BRACKET_VARIANT.is_match(filename_lower)
}
