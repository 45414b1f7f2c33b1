//! Folder-to-tracklist matching
//!
//! Maps the expected tracks of an album onto the files of a winning folder.
//! Matching is per expected track: every mp3 in the folder is scored against
//! it and the best file above the confidence gate is taken.

use regex::Regex;
use tracing::debug;

use crate::services::text_match;
use crate::session::{AlbumTrack, FolderCandidate, TrackMatch};

/// Minimum per-track score for a file to count as a match.
const MATCH_GATE: i64 = 30;

/// Trailing text after the matched track name costs this much per character.
const TRAILING_PENALTY_PER_CHAR: f64 = 2.0;
const TRAILING_PENALTY_CAP: f64 = 50.0;
const TRAILING_VARIANT_PENALTY: f64 = 30.0;

/// Variant markers checked in trailing text. Broader than the search-side
/// list: inside a known-good folder, "remaster" or "demo" after the title is
/// still a worse pick than the clean file.
const TRAILING_VARIANT_MARKERS: &[&str] = &[
    "remix",
    "mix",
    "rmx",
    "edit",
    "version",
    "feat",
    "ft",
    "featuring",
    "live",
    "acoustic",
    "instrumental",
    "cover",
    "karaoke",
    "radio",
    "extended",
    "club",
    "dub",
    "vip",
    "remaster",
    "deluxe",
    "bonus",
    "explicit",
    "clean",
    "original",
    "alternate",
    "demo",
];

/// Match every expected track against the folder's files. Tracks with no
/// confident match are simply absent from the result; callers decide whether
/// a partial album is worth downloading.
pub fn match_album_tracks(
    expected_tracks: &[AlbumTrack],
    folder: &FolderCandidate,
) -> Vec<TrackMatch> {
    let mut matched = Vec::new();

    for track in expected_tracks {
        let track_normalized = text_match::normalize(&track.track);
        let artist_normalized = text_match::normalize(&track.artist);
        let number_patterns = track_number_patterns(track.track_number);

        let mut best: Option<(&crate::session::FolderFile, i64)> = None;

        for file in &folder.files {
            let file_name = file
                .path
                .replace('\\', "/")
                .rsplit_once('/')
                .map(|(_, name)| name.to_string())
                .unwrap_or_else(|| file.path.clone());
            let file_name_lower = file_name.to_lowercase();

            if !file_name_lower.ends_with(".mp3") {
                continue;
            }

            let score = score_track_match(
                &track_normalized,
                &artist_normalized,
                &number_patterns,
                &file_name_lower,
            );

            if best.is_none_or(|(_, s)| score > s) {
                best = Some((file, score));
            }
        }

        if let Some((file, score)) = best
            && score > MATCH_GATE
        {
            matched.push(TrackMatch {
                expected: track.clone(),
                file: file.clone(),
                match_score: score,
            });
        } else {
            debug!(track = %track.track, "No confident file match in folder");
        }
    }

    matched
}

/// Score one folder file against one expected track. `file_name_lower` is
/// the bare filename, lowercased, with its original separators intact so the
/// track-number patterns still see "01." and "01 -".
fn score_track_match(
    track_normalized: &str,
    artist_normalized: &str,
    number_patterns: &[Regex],
    file_name_lower: &str,
) -> i64 {
    let stem = file_name_lower.trim_end_matches(".mp3");
    let file_normalized = text_match::normalize(stem);

    let mut score = 0.0_f64;
    let mut track_name_position = None;

    if !track_normalized.is_empty() {
        if let Some(pos) = file_normalized.find(track_normalized) {
            score += 50.0;
            track_name_position = Some(pos);
        } else {
            score += text_match::word_overlap(track_normalized, &file_normalized) * 50.0;
        }
    }

    if !artist_normalized.is_empty() && file_normalized.contains(artist_normalized) {
        score += 30.0;
    }

    if number_patterns.iter().any(|re| re.is_match(file_name_lower)) {
        score += 20.0;
    }

    // Clean files beat decorated ones: anything after the track name is a
    // liability, and a variant marker there doubly so.
    if let Some(pos) = track_name_position {
        let after = file_normalized[pos + track_normalized.len()..].trim_start();
        if !after.is_empty() {
            let mut penalty =
                (after.len() as f64 * TRAILING_PENALTY_PER_CHAR).min(TRAILING_PENALTY_CAP);
            if TRAILING_VARIANT_MARKERS.iter().any(|m| after.contains(m)) {
                penalty += TRAILING_VARIANT_PENALTY;
            }
            score -= penalty;
        }
    }

    score.round() as i64
}

/// Patterns matching the track number as "01", "1.", "01 -" etc. Compiled
/// once per expected track, then reused across every file in the folder.
/// Empty when the number is unknown.
fn track_number_patterns(track_number: u32) -> Vec<Regex> {
    if track_number == 0 {
        return Vec::new();
    }
    [
        format!(r"\b0?{track_number}\b"),
        format!(r"\b0?{track_number}\."),
        format!(r"\b0?{track_number}\s*-"),
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
}
