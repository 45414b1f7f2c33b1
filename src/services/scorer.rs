//! Candidate scoring
//!
//! Pure additive scoring for shared files and shared folders. Higher is
//! better; scores are never clamped, so a strong format match can outweigh a
//! weak duration match and vice versa. Both functions are deterministic on
//! their inputs, which keeps ranking stable across re-scores.

use serde::Deserialize;

use crate::services::filename;
use crate::services::text_match;
use crate::session::{AlbumTarget, FolderFile};
use crate::soulseek::FileAttributes;

/// Preferred audio format for a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatPreference {
    #[default]
    Mp3,
    Flac,
}

impl FormatPreference {
    /// Lenient parse; anything unrecognized falls back to mp3.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "flac" => FormatPreference::Flac,
            _ => FormatPreference::Mp3,
        }
    }
}

impl std::fmt::Display for FormatPreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FormatPreference::Mp3 => write!(f, "mp3"),
            FormatPreference::Flac => write!(f, "flac"),
        }
    }
}

/// Score one shared file against a track search.
///
/// Components: bitrate (max 100), duration proximity (max 100, skipped when
/// either duration is unknown), file size (max 50), query match (max 50),
/// format preference (up to 200, or a penalty for unwanted formats), and a
/// variant penalty when the file looks like a remix the query did not ask
/// for.
pub fn score_file(
    file_name: &str,
    file_size: u64,
    attributes: FileAttributes,
    target_duration_secs: u32,
    query: &str,
    preference: FormatPreference,
) -> i64 {
    let mut score = 0.0_f64;
    let filename_lower = file_name.to_lowercase();

    // Attribute bitrate wins; filename hints are the fallback.
    let bitrate = match attributes.bitrate {
        Some(b) if b > 0 => b,
        _ => filename::extract_bitrate(&filename_lower),
    };
    score += match bitrate {
        b if b >= 320 => 100.0,
        b if b >= 256 => 80.0,
        b if b >= 192 => 60.0,
        b if b >= 128 => 40.0,
        _ => 0.0,
    };

    let file_duration = attributes.duration_secs.unwrap_or(0);
    if target_duration_secs > 0 && file_duration > 0 {
        let diff = file_duration.abs_diff(target_duration_secs);
        score += match diff {
            0..=2 => 100.0,
            3..=5 => 80.0,
            6..=10 => 50.0,
            11..=20 => 25.0,
            _ => 0.0,
        };
    }

    // A 3-minute 320 kbps MP3 runs about 7-8 MB.
    score += match file_size {
        s if s > 8_000_000 => 50.0,
        s if s > 5_000_000 => 40.0,
        s if s > 3_000_000 => 30.0,
        s if s > 1_000_000 => 20.0,
        _ => 0.0,
    };

    let query_lower = query.to_lowercase();
    score += text_match::containment_score(&query_lower, &filename_lower, 50.0);

    let format = filename::file_format(file_name);
    score += match preference {
        FormatPreference::Mp3 => match format.as_str() {
            "mp3" => 200.0,
            "flac" | "alac" | "wav" => 100.0,
            _ => -50.0,
        },
        FormatPreference::Flac => match format.as_str() {
            "flac" => 200.0,
            "alac" | "wav" => 180.0,
            "mp3" => 100.0,
            _ => -50.0,
        },
    };

    // Penalize remixes and alternate versions, but only when the query
    // itself is not asking for one.
    if !filename::contains_variant_keyword(&query_lower) {
        if filename::contains_variant_keyword(&filename_lower) {
            score -= 50.0;
        } else if filename::has_grouped_variant(&filename_lower) {
            score -= 30.0;
        }
    }

    score.round() as i64
}

/// Score one shared folder against an album search.
///
/// Components: mp3 track-count coverage (max 100), album name in the folder
/// path (max 50), artist name (30), quality markers in the path (max 50),
/// release year (20), average reported bitrate (max 50), and the peer's
/// upload speed (max 100). Fast uploaders matter a lot for multi-file
/// downloads, hence the heavy speed weighting.
pub fn score_folder(
    folder_path: &str,
    files: &[FolderFile],
    target: &AlbumTarget,
    upload_speed: u64,
) -> i64 {
    let mut score = 0.0_f64;
    let folder_lower = folder_path.to_lowercase();
    let album_lower = target.album_name.to_lowercase();
    let artist_lower = target.album_artist.to_lowercase();

    let expected = target.tracks.len();
    let mp3_count = files
        .iter()
        .filter(|f| f.path.to_lowercase().ends_with(".mp3"))
        .count();
    if expected > 0 {
        let expected_f = expected as f64;
        if mp3_count >= expected {
            score += 100.0;
        } else if mp3_count as f64 >= expected_f * 0.8 {
            score += 70.0;
        } else if mp3_count as f64 >= expected_f * 0.5 {
            score += 40.0;
        }
    }

    if !album_lower.is_empty() {
        if folder_lower.contains(&album_lower) {
            score += 50.0;
        } else {
            let album_words: std::collections::HashSet<&str> =
                album_lower.split_whitespace().collect();
            let folder_segments: std::collections::HashSet<&str> =
                folder_lower.split('/').collect();
            let matches = album_words.intersection(&folder_segments).count();
            if matches > 0 {
                score += (matches as f64 / album_words.len() as f64) * 50.0;
            }
        }
    }

    if !artist_lower.is_empty() && folder_lower.contains(&artist_lower) {
        score += 30.0;
    }

    if folder_lower.contains("320") {
        score += 50.0;
    } else if folder_lower.contains("flac") {
        score += 50.0;
    } else if folder_lower.contains("256") {
        score += 30.0;
    } else if folder_lower.contains("v0") {
        score += 25.0;
    }

    if let Some(year) = &target.year
        && !year.is_empty()
        && folder_lower.contains(&year.to_lowercase())
    {
        score += 20.0;
    }

    let mut total_bitrate = 0u64;
    let mut bitrate_count = 0u64;
    for file in files {
        if let Some(b) = file.attributes.bitrate
            && b > 0
        {
            total_bitrate += u64::from(b);
            bitrate_count += 1;
        }
    }
    if bitrate_count > 0 {
        let avg = total_bitrate as f64 / bitrate_count as f64;
        if avg >= 320.0 {
            score += 50.0;
        } else if avg >= 256.0 {
            score += 35.0;
        } else if avg >= 192.0 {
            score += 20.0;
        }
    }

    if upload_speed > 0 {
        let speed_kbps = upload_speed as f64 / 1024.0;
        score += if speed_kbps >= 1000.0 {
            100.0
        } else if speed_kbps >= 500.0 {
            75.0
        } else if speed_kbps >= 250.0 {
            50.0
        } else if speed_kbps >= 100.0 {
            25.0
        } else if speed_kbps >= 50.0 {
            10.0
        } else {
            0.0
        };
    }

    score.round() as i64
}
