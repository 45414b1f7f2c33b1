//! Text normalization and word-overlap matching
//!
//! Shared filenames arrive with every separator convention imaginable
//! (underscores, dots, dashes, bracket noise), so matching always runs over
//! a normalized form.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

static PUNCT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s']").unwrap());
static SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Normalize text for flexible matching: separators become spaces,
/// punctuation other than apostrophes is stripped, whitespace collapses,
/// everything lowercased.
pub fn normalize(text: &str) -> String {
    let spaced = text.replace(['_', '.', '-'], " ");
    let spaced = spaced.replace(['(', ')', '[', ']', '{', '}'], " ");
    let stripped = PUNCT.replace_all(&spaced, " ");
    let collapsed = SPACES.replace_all(&stripped, " ");
    collapsed.trim().to_lowercase()
}

/// Fraction of `needle`'s words that appear in `haystack`, in 0.0..=1.0.
/// Zero when `needle` has no words.
pub fn word_overlap(needle: &str, haystack: &str) -> f64 {
    let needle_words: HashSet<&str> = needle.split_whitespace().collect();
    if needle_words.is_empty() {
        return 0.0;
    }
    let haystack_words: HashSet<&str> = haystack.split_whitespace().collect();
    let matches = needle_words.intersection(&haystack_words).count();
    matches as f64 / needle_words.len() as f64
}

/// Substring-first match score scaled to `max_points`: full points when
/// `needle` appears verbatim in `haystack`, otherwise proportional to word
/// overlap.
pub fn containment_score(needle: &str, haystack: &str, max_points: f64) -> f64 {
    if needle.is_empty() {
        return 0.0;
    }
    if haystack.contains(needle) {
        max_points
    } else {
        word_overlap(needle, haystack) * max_points
    }
}
