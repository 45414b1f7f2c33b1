//! Search-result ingestion
//!
//! Folds raw peer responses into each session's bounded, ranked candidate
//! lists. Runs under the session lock and does no I/O.

use tracing::{debug, info};

use crate::services::scorer;
use crate::session::{
    FileCandidate, FolderCandidate, FolderFile, SearchSession, SessionDetail, MAX_CANDIDATES,
};
use crate::soulseek::SearchResponseEvent;

/// Fold one peer's response batch into the session's candidate lists.
/// Dispatches on the session kind; unknown tokens never reach this point.
pub fn ingest_response(session: &mut SearchSession, event: &SearchResponseEvent) {
    if event.files.is_empty() {
        return;
    }
    match session.detail {
        SessionDetail::Track(_) => ingest_track_results(session, event),
        SessionDetail::Album(_) => ingest_album_results(session, event),
    }
}

fn ingest_track_results(session: &mut SearchSession, event: &SearchResponseEvent) {
    if session.result_count == 0 {
        info!(token = %session.token, query = %session.query, "Receiving track results");
    }

    let query = session.query.clone();
    let preference = session.format_preference;
    let SessionDetail::Track(state) = &mut session.detail else {
        return;
    };
    let target_duration = state.target.duration_secs;

    for file in &event.files {
        let score = scorer::score_file(
            &file.name,
            file.size,
            file.attributes,
            target_duration,
            &query,
            preference,
        );

        let candidate = FileCandidate {
            filename: file.name.clone(),
            peer: event.peer.clone(),
            size: file.size,
            attributes: file.attributes,
            score,
        };

        let candidates = &mut state.candidates;
        let was_best = candidates.first().map(|c| c.score).unwrap_or(i64::MIN);
        candidates.push(candidate);
        // Stable sort keeps earlier arrivals ahead on ties.
        candidates.sort_by(|a, b| b.score.cmp(&a.score));
        candidates.truncate(MAX_CANDIDATES);

        if score > 100 && score > was_best {
            info!(
                token = %session.token,
                file = %file.name,
                score,
                bitrate = file.attributes.bitrate.unwrap_or(0),
                "New best track candidate"
            );
        }
    }

    session.result_count += event.files.len() as u64;
}

fn ingest_album_results(session: &mut SearchSession, event: &SearchResponseEvent) {
    if session.result_count == 0 {
        info!(token = %session.token, query = %session.query, "Receiving folder results");
    }
    debug!(
        token = %session.token,
        peer = %event.peer,
        files = event.files.len(),
        "Album response batch"
    );

    let SessionDetail::Album(state) = &mut session.detail else {
        return;
    };

    // Group this peer's files by containing folder.
    let mut folders: Vec<(String, Vec<FolderFile>)> = Vec::new();
    for file in &event.files {
        let normalized = file.name.replace('\\', "/");
        let Some((folder_path, _)) = normalized.rsplit_once('/') else {
            continue;
        };
        let folder_file = FolderFile {
            path: file.name.clone(),
            size: file.size,
            attributes: file.attributes,
        };
        match folders.iter_mut().find(|(p, _)| p == folder_path) {
            Some((_, files)) => files.push(folder_file),
            None => folders.push((folder_path.to_string(), vec![folder_file])),
        }
    }

    for (folder_path, files) in folders {
        let score = scorer::score_folder(&folder_path, &files, &state.target, event.upload_speed);
        debug!(token = %session.token, folder = %folder_path, score, files = files.len(), "Folder scored");

        // Weak folders are not worth tracking at all.
        if score < 50 {
            continue;
        }

        let candidates = &mut state.folder_candidates;
        match candidates
            .iter_mut()
            .find(|c| c.folder_path == folder_path && c.peer == event.peer)
        {
            Some(existing) => {
                if score > existing.score {
                    existing.score = score;
                    existing.files = files;
                    existing.upload_speed = event.upload_speed;
                }
            }
            None => candidates.push(FolderCandidate {
                peer: event.peer.clone(),
                folder_path,
                files,
                score,
                upload_speed: event.upload_speed,
            }),
        }

        candidates.sort_by(|a, b| b.score.cmp(&a.score));
        candidates.truncate(MAX_CANDIDATES);
    }

    if session.result_count == 0
        && let SessionDetail::Album(state) = &session.detail
        && let Some(best) = state.folder_candidates.first()
    {
        info!(
            token = %session.token,
            folder = %best.folder_path,
            score = best.score,
            files = best.files.len(),
            "Best folder so far"
        );
    }

    session.result_count += event.files.len() as u64;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::scorer::FormatPreference;
    use crate::session::{AlbumTarget, AlbumTrack, TrackTarget};
    use crate::soulseek::{FileAttributes, SearchToken, SharedFile};
    use std::time::Instant;

    fn track_session(query: &str) -> SearchSession {
        SearchSession::new_track(
            SearchToken("t1".into()),
            query.into(),
            TrackTarget {
                duration_secs: 240,
                ..Default::default()
            },
            FormatPreference::Mp3,
            true,
            Instant::now(),
        )
    }

    fn shared(name: &str, size: u64, bitrate: u32) -> SharedFile {
        SharedFile {
            name: name.into(),
            size,
            attributes: FileAttributes {
                bitrate: (bitrate > 0).then_some(bitrate),
                duration_secs: None,
            },
        }
    }

    fn response(peer: &str, files: Vec<SharedFile>) -> SearchResponseEvent {
        SearchResponseEvent {
            token: SearchToken("t1".into()),
            peer: peer.into(),
            files,
            upload_speed: 0,
        }
    }

    // ===== Track ingestion =====

    #[test]
    fn test_candidates_ranked_and_bounded() {
        let mut session = track_session("artist - song");
        let files: Vec<SharedFile> = (0..8)
            .map(|i| shared(&format!("Artist - Song {i}.mp3"), 9_000_000, 128 + i * 32))
            .collect();
        ingest_response(&mut session, &response("alice", files));

        let SessionDetail::Track(state) = &session.detail else {
            unreachable!()
        };
        assert_eq!(state.candidates.len(), MAX_CANDIDATES);
        for pair in state.candidates.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        assert_eq!(session.result_count, 8);
    }

    #[test]
    fn test_equal_scores_keep_arrival_order() {
        let mut session = track_session("artist - song");
        ingest_response(
            &mut session,
            &response(
                "alice",
                vec![shared("Artist - Song A.mp3", 9_000_000, 320)],
            ),
        );
        ingest_response(
            &mut session,
            &response("bob", vec![shared("Artist - Song B.mp3", 9_000_000, 320)]),
        );

        let SessionDetail::Track(state) = &session.detail else {
            unreachable!()
        };
        assert_eq!(state.candidates[0].peer, "alice");
        assert_eq!(state.candidates[1].peer, "bob");
    }

    // ===== Album ingestion =====

    fn album_session() -> SearchSession {
        SearchSession::new_album(
            SearchToken("t1".into()),
            "eagles hotel california".into(),
            AlbumTarget {
                album_id: "a1".into(),
                album_name: "Hotel California".into(),
                album_artist: "Eagles".into(),
                year: Some("1976".into()),
                tracks: (1..=9)
                    .map(|n| AlbumTrack {
                        track_number: n,
                        track: format!("Track {n}"),
                        ..Default::default()
                    })
                    .collect(),
            },
            FormatPreference::Mp3,
            true,
            Instant::now(),
        )
    }

    #[test]
    fn test_folders_grouped_and_weak_ones_dropped() {
        let mut session = album_session();
        let mut files: Vec<SharedFile> = (1..=9)
            .map(|n| {
                shared(
                    &format!("Music\\Eagles\\Hotel California (1976)\\{n:02} Track.mp3"),
                    9_000_000,
                    320,
                )
            })
            .collect();
        // A lone unrelated file in another folder scores below 50.
        files.push(shared("Music\\Other\\random.mp3", 1_000, 0));

        ingest_response(&mut session, &response("alice", files));

        let SessionDetail::Album(state) = &session.detail else {
            unreachable!()
        };
        assert_eq!(state.folder_candidates.len(), 1);
        let best = &state.folder_candidates[0];
        assert_eq!(best.folder_path, "Music/Eagles/Hotel California (1976)");
        assert_eq!(best.files.len(), 9);
        assert!(best.score > 150);
    }

    #[test]
    fn test_folder_rescore_keeps_higher_score() {
        let mut session = album_session();
        let partial: Vec<SharedFile> = (1..=5)
            .map(|n| {
                shared(
                    &format!("Eagles\\Hotel California\\{n:02} Track.mp3"),
                    9_000_000,
                    320,
                )
            })
            .collect();
        ingest_response(&mut session, &response("alice", partial));

        let first_score = {
            let SessionDetail::Album(state) = &session.detail else {
                unreachable!()
            };
            state.folder_candidates[0].score
        };

        let full: Vec<SharedFile> = (1..=9)
            .map(|n| {
                shared(
                    &format!("Eagles\\Hotel California\\{n:02} Track.mp3"),
                    9_000_000,
                    320,
                )
            })
            .collect();
        ingest_response(&mut session, &response("alice", full));

        let SessionDetail::Album(state) = &session.detail else {
            unreachable!()
        };
        assert_eq!(state.folder_candidates.len(), 1);
        assert!(state.folder_candidates[0].score > first_score);
        assert_eq!(state.folder_candidates[0].files.len(), 9);
    }
}
