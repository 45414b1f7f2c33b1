//! Per-search session state
//!
//! One [`SearchSession`] exists for every outstanding search token, from
//! dispatch until finalization. The candidate collector fills its ranked
//! lists, the acquisition engine drives mode transitions and winner
//! arbitration, and the registry sweeps it away when it goes stale.

pub mod registry;

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Instant;

use serde::Deserialize;

use crate::services::scorer::FormatPreference;
use crate::soulseek::{FileAttributes, SearchToken, TransferKey};

/// Ranked candidate lists never grow beyond this many entries.
pub const MAX_CANDIDATES: usize = 5;

/// How a session is attempting its download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptMode {
    /// Best candidate only, with retry-by-next-rank on failure.
    Single,
    /// Staggered backup heads launched when the leader looks slow.
    Cascade,
    /// All viable candidates launched up front (legacy).
    Race,
}

impl std::fmt::Display for AttemptMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptMode::Single => write!(f, "single"),
            AttemptMode::Cascade => write!(f, "cascade"),
            AttemptMode::Race => write!(f, "race"),
        }
    }
}

/// Target metadata for a single-track search.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrackTarget {
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub track: String,
    #[serde(default)]
    pub album: String,
    #[serde(default)]
    pub track_id: String,
    /// Expected duration in seconds; zero means unknown.
    #[serde(default)]
    pub duration_secs: u32,
}

/// One expected track of an album search.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlbumTrack {
    #[serde(default)]
    pub track_number: u32,
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub track: String,
    #[serde(default)]
    pub album: String,
    #[serde(default)]
    pub track_id: String,
    #[serde(default)]
    pub duration_secs: u32,
}

/// Target metadata for an album search.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlbumTarget {
    #[serde(default)]
    pub album_id: String,
    #[serde(default)]
    pub album_name: String,
    #[serde(default)]
    pub album_artist: String,
    #[serde(default)]
    pub year: Option<String>,
    #[serde(default)]
    pub tracks: Vec<AlbumTrack>,
}

/// A scored file offered by a peer for a track search.
#[derive(Debug, Clone)]
pub struct FileCandidate {
    pub filename: String,
    pub peer: String,
    pub size: u64,
    pub attributes: FileAttributes,
    pub score: i64,
}

impl FileCandidate {
    pub fn transfer_key(&self) -> TransferKey {
        TransferKey::new(self.peer.clone(), self.filename.clone())
    }
}

/// One file inside a candidate folder.
#[derive(Debug, Clone)]
pub struct FolderFile {
    pub path: String,
    pub size: u64,
    pub attributes: FileAttributes,
}

/// A scored shared folder offered by a peer for an album search.
#[derive(Debug, Clone)]
pub struct FolderCandidate {
    pub peer: String,
    pub folder_path: String,
    pub files: Vec<FolderFile>,
    pub score: i64,
    pub upload_speed: u64,
}

/// An expected track mapped onto a file in the chosen folder.
#[derive(Debug, Clone)]
pub struct TrackMatch {
    pub expected: AlbumTrack,
    pub file: FolderFile,
    pub match_score: i64,
}

/// One in-flight download attempt. `rank` is the candidate's position in the
/// ranked list at launch time (0 = best).
#[derive(Debug, Clone)]
pub struct DownloadHead {
    pub rank: usize,
    pub key: TransferKey,
    pub size: u64,
    pub attributes: FileAttributes,
    pub score: i64,
    pub started_at: Instant,
}

/// Track-specific session state.
#[derive(Debug)]
pub struct TrackState {
    pub target: TrackTarget,
    /// Ranked descending by score, at most [`MAX_CANDIDATES`] entries.
    pub candidates: Vec<FileCandidate>,
    pub mode: Option<AttemptMode>,
    /// Currently in-flight heads; emptied as heads fail or lose.
    pub active_heads: Vec<DownloadHead>,
    /// Set exactly once; all later completions are losers.
    pub winner_head: Option<usize>,
    /// Number of candidate ranks consumed so far.
    pub ranks_launched: usize,
}

impl TrackState {
    pub fn new(target: TrackTarget) -> Self {
        Self {
            target,
            candidates: Vec::new(),
            mode: None,
            active_heads: Vec::new(),
            winner_head: None,
            ranks_launched: 0,
        }
    }
}

/// Album-specific session state.
#[derive(Debug)]
pub struct AlbumState {
    pub target: AlbumTarget,
    /// Ranked descending by score, at most [`MAX_CANDIDATES`] entries.
    pub folder_candidates: Vec<FolderCandidate>,
    pub chosen_folder: Option<FolderCandidate>,
    /// Folders already attempted and abandoned, by (peer, path).
    pub tried_folders: HashSet<(String, String)>,
    /// Ordered matches for the chosen folder, downloaded sequentially.
    pub track_matches: Vec<TrackMatch>,
    pub current_track: usize,
    /// Start of the current track's transfer, reset per track.
    pub track_started_at: Option<Instant>,
    pub downloaded_count: usize,
    /// Track numbers skipped after a stall.
    pub skipped_tracks: Vec<u32>,
    pub album_folder: Option<PathBuf>,
}

impl AlbumState {
    pub fn new(target: AlbumTarget) -> Self {
        Self {
            target,
            folder_candidates: Vec::new(),
            chosen_folder: None,
            tried_folders: HashSet::new(),
            track_matches: Vec::new(),
            current_track: 0,
            track_started_at: None,
            downloaded_count: 0,
            skipped_tracks: Vec::new(),
            album_folder: None,
        }
    }

    /// The transfer key of the track currently being downloaded, if any.
    pub fn current_transfer_key(&self) -> Option<TransferKey> {
        let folder = self.chosen_folder.as_ref()?;
        let matched = self.track_matches.get(self.current_track)?;
        Some(TransferKey::new(folder.peer.clone(), matched.file.path.clone()))
    }
}

/// Track- or album-specific detail of a session.
#[derive(Debug)]
pub enum SessionDetail {
    Track(TrackState),
    Album(AlbumState),
}

/// Complete tracked state for one search token.
#[derive(Debug)]
pub struct SearchSession {
    pub token: SearchToken,
    pub query: String,
    pub format_preference: FormatPreference,
    pub metadata_override: bool,
    pub created_at: Instant,
    pub download_started_at: Option<Instant>,
    /// Files/folders observed so far; drives first-results logging only.
    pub result_count: u64,
    pub detail: SessionDetail,
}

impl SearchSession {
    pub fn new_track(
        token: SearchToken,
        query: String,
        target: TrackTarget,
        format_preference: FormatPreference,
        metadata_override: bool,
        now: Instant,
    ) -> Self {
        Self {
            token,
            query,
            format_preference,
            metadata_override,
            created_at: now,
            download_started_at: None,
            result_count: 0,
            detail: SessionDetail::Track(TrackState::new(target)),
        }
    }

    pub fn new_album(
        token: SearchToken,
        query: String,
        target: AlbumTarget,
        format_preference: FormatPreference,
        metadata_override: bool,
        now: Instant,
    ) -> Self {
        Self {
            token,
            query,
            format_preference,
            metadata_override,
            created_at: now,
            download_started_at: None,
            result_count: 0,
            detail: SessionDetail::Album(AlbumState::new(target)),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self.detail {
            SessionDetail::Track(_) => "track",
            SessionDetail::Album(_) => "album",
        }
    }

    /// Whether any download is currently in flight for this session.
    pub fn has_active_download(&self) -> bool {
        match &self.detail {
            SessionDetail::Track(t) => !t.active_heads.is_empty(),
            SessionDetail::Album(a) => a.track_started_at.is_some(),
        }
    }

    /// First-writer-wins winner claim. Returns true exactly once per
    /// session; every later call reports the completing head as a loser.
    /// Callers must hold the session lock, which makes the check-and-set
    /// atomic with respect to concurrent completion callbacks.
    pub fn claim_winner(&mut self, head_rank: usize) -> bool {
        match &mut self.detail {
            SessionDetail::Track(t) => {
                if t.winner_head.is_none() {
                    t.winner_head = Some(head_rank);
                    true
                } else {
                    false
                }
            }
            SessionDetail::Album(_) => false,
        }
    }
}
