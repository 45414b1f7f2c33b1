//! Integration tests for the acquisition engine
//!
//! These tests drive the engine through complete scenarios over a mock
//! network client:
//! - Collection windows and attempt-mode selection
//! - Cascade escalation and single-mode fallback
//! - Winner arbitration and loser cleanup
//! - Album folder selection, sequential downloads, and folder bail-out

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use hydra::engine::{AcquisitionEngine, EngineConfig};
use hydra::services::metadata::MetadataClient;
use hydra::services::metadata_cache::MetadataCache;
use hydra::services::scorer::FormatPreference;
use hydra::session::registry::SessionRegistry;
use hydra::session::{AlbumTarget, AlbumTrack, AttemptMode, SessionDetail, TrackTarget};
use hydra::soulseek::{
    ClientError, DownloadCompleteEvent, FileAttributes, NetworkEvent, SearchResponseEvent,
    SearchToken, SharedFile, SoulseekClient, TransferKey, TransferSnapshot, TransferStatus,
};

// ============================================================================
// Mock network client
// ============================================================================

#[derive(Default)]
struct MockClient {
    enqueued: Mutex<Vec<TransferKey>>,
    aborted: Mutex<Vec<TransferKey>>,
    cleared: Mutex<Vec<TransferKey>>,
    snapshots: Mutex<Vec<TransferSnapshot>>,
}

impl MockClient {
    fn set_snapshot(&self, key: TransferKey, bytes: u64, status: TransferStatus) {
        let mut snaps = self.snapshots.lock();
        snaps.retain(|s| s.key != key);
        snaps.push(TransferSnapshot {
            key,
            bytes_transferred: bytes,
            total_size: 9_000_000,
            status,
        });
    }

    fn enqueued(&self) -> Vec<TransferKey> {
        self.enqueued.lock().clone()
    }
}

#[async_trait]
impl SoulseekClient for MockClient {
    async fn submit_search(&self, _query: &str) -> Result<Option<SearchToken>, ClientError> {
        Ok(Some(SearchToken("tok1".into())))
    }

    async fn recent_search_tokens(&self) -> Result<Vec<SearchToken>, ClientError> {
        Ok(vec![])
    }

    async fn enqueue_download(
        &self,
        peer: &str,
        virtual_path: &str,
        _size: u64,
        _attributes: FileAttributes,
    ) -> Result<(), ClientError> {
        self.enqueued
            .lock()
            .push(TransferKey::new(peer, virtual_path));
        Ok(())
    }

    async fn abort_transfer(&self, key: &TransferKey) -> Result<(), ClientError> {
        self.aborted.lock().push(key.clone());
        Ok(())
    }

    async fn clear_transfer(&self, key: &TransferKey) -> Result<(), ClientError> {
        self.cleared.lock().push(key.clone());
        Ok(())
    }

    async fn transfer_snapshots(&self) -> Result<Vec<TransferSnapshot>, ClientError> {
        Ok(self.snapshots.lock().clone())
    }
}

// ============================================================================
// Harness
// ============================================================================

fn build_engine(race_mode: bool) -> (Arc<AcquisitionEngine>, Arc<MockClient>) {
    let client = Arc::new(MockClient::default());
    // Unreachable bridge: every metadata call fails fast and is tolerated.
    let metadata = Arc::new(MetadataClient::new("http://127.0.0.1:9".into()));
    let cache = Arc::new(MetadataCache::new(Duration::from_secs(3600), 10));
    let registry = Arc::new(SessionRegistry::new(Duration::from_secs(600)));
    let engine = Arc::new(AcquisitionEngine::new(
        client.clone(),
        metadata,
        cache,
        registry,
        EngineConfig {
            downloads_path: PathBuf::from("/tmp/downloads"),
            race_mode,
        },
    ));
    (engine, client)
}

fn token() -> SearchToken {
    SearchToken("tok1".into())
}

fn file(name: &str, size: u64, bitrate: u32) -> SharedFile {
    SharedFile {
        name: name.into(),
        size,
        attributes: FileAttributes {
            bitrate: (bitrate > 0).then_some(bitrate),
            duration_secs: None,
        },
    }
}

fn response(peer: &str, files: Vec<SharedFile>) -> NetworkEvent {
    NetworkEvent::SearchResponse(SearchResponseEvent {
        token: token(),
        peer: peer.into(),
        files,
        upload_speed: 0,
    })
}

fn completion(peer: &str, virtual_path: &str, local_path: PathBuf) -> NetworkEvent {
    NetworkEvent::DownloadComplete(DownloadCompleteEvent {
        peer: peer.into(),
        virtual_path: virtual_path.into(),
        local_path,
    })
}

const QUERY: &str = "the band - song";
const BEST: &str = "Music\\The Band - Song.mp3";
const SECOND: &str = "Music\\The Band - Song [192].mp3";
const WEAK: &str = "Music\\other.ogg";

async fn dispatch_track(engine: &AcquisitionEngine) {
    engine
        .dispatch_track_search(
            QUERY,
            TrackTarget {
                artist: "The Band".into(),
                track: "Song".into(),
                album: "Great Album".into(),
                track_id: "tid1".into(),
                duration_secs: 0,
            },
            FormatPreference::Mp3,
            true,
            false,
        )
        .await
        .unwrap();
}

fn track_mode(engine: &AcquisitionEngine) -> Option<AttemptMode> {
    let shared = engine.registry().get(&token())?;
    let session = shared.lock();
    match &session.detail {
        SessionDetail::Track(t) => t.mode,
        _ => None,
    }
}

// ============================================================================
// Track launch and cascade
// ============================================================================

#[tokio::test]
async fn test_cascade_starts_with_one_head() {
    let (engine, client) = build_engine(false);
    dispatch_track(&engine).await;
    let t0 = Instant::now();

    engine
        .handle_event(response(
            "alice",
            vec![
                file(BEST, 9_000_000, 320),
                file(SECOND, 9_000_000, 192),
            ],
        ))
        .await;

    // Inside the collection window nothing launches.
    engine.tick(t0 + Duration::from_secs(5)).await;
    assert!(client.enqueued().is_empty());

    engine.tick(t0 + Duration::from_secs(16)).await;
    assert_eq!(client.enqueued(), vec![TransferKey::new("alice", BEST)]);
    assert_eq!(track_mode(&engine), Some(AttemptMode::Cascade));
}

#[tokio::test]
async fn test_cascade_escalates_when_leader_never_starts() {
    let (engine, client) = build_engine(false);
    dispatch_track(&engine).await;
    let t0 = Instant::now();

    engine
        .handle_event(response(
            "alice",
            vec![
                file(BEST, 9_000_000, 320),
                file(SECOND, 9_000_000, 192),
            ],
        ))
        .await;
    engine.tick(t0 + Duration::from_secs(16)).await;

    // Leader queued but zero bytes ten seconds after launch.
    client.set_snapshot(TransferKey::new("alice", BEST), 0, TransferStatus::Queued);
    engine.tick(t0 + Duration::from_secs(26)).await;

    assert_eq!(
        client.enqueued(),
        vec![
            TransferKey::new("alice", BEST),
            TransferKey::new("alice", SECOND),
        ]
    );
}

#[tokio::test]
async fn test_cascade_escalates_when_leader_is_slow_to_finish() {
    let (engine, client) = build_engine(false);
    dispatch_track(&engine).await;
    let t0 = Instant::now();

    engine
        .handle_event(response(
            "alice",
            vec![
                file(BEST, 9_000_000, 320),
                file(SECOND, 9_000_000, 192),
            ],
        ))
        .await;
    engine.tick(t0 + Duration::from_secs(16)).await;

    // Leader is moving, so the no-start trigger never fires.
    client.set_snapshot(
        TransferKey::new("alice", BEST),
        5_000_000,
        TransferStatus::InProgress,
    );
    engine.tick(t0 + Duration::from_secs(40)).await;
    assert_eq!(client.enqueued().len(), 1);

    // A full minute without finishing brings out the backup anyway.
    engine.tick(t0 + Duration::from_secs(76)).await;
    assert_eq!(
        client.enqueued(),
        vec![
            TransferKey::new("alice", BEST),
            TransferKey::new("alice", SECOND),
        ]
    );
}

#[tokio::test]
async fn test_cascade_survives_leader_terminal_failure() {
    let (engine, client) = build_engine(false);
    dispatch_track(&engine).await;
    let t0 = Instant::now();

    engine
        .handle_event(response(
            "alice",
            vec![
                file(BEST, 9_000_000, 320),
                file(SECOND, 9_000_000, 192),
            ],
        ))
        .await;
    engine.tick(t0 + Duration::from_secs(16)).await;

    // The leader dies before the backup's scheduled launch.
    client.set_snapshot(
        TransferKey::new("alice", BEST),
        0,
        TransferStatus::UserLoggedOff,
    );
    engine.tick(t0 + Duration::from_secs(18)).await;

    // The session stays alive and moves straight to the backup candidate.
    assert!(engine.registry().get(&token()).is_some());
    assert!(client.aborted.lock().contains(&TransferKey::new("alice", BEST)));
    assert_eq!(
        client.enqueued(),
        vec![
            TransferKey::new("alice", BEST),
            TransferKey::new("alice", SECOND),
        ]
    );
}

#[tokio::test]
async fn test_weak_runner_up_selects_single_mode() {
    let (engine, client) = build_engine(false);
    dispatch_track(&engine).await;
    let t0 = Instant::now();

    engine
        .handle_event(response(
            "alice",
            vec![file(BEST, 9_000_000, 320), file(WEAK, 0, 0)],
        ))
        .await;
    engine.tick(t0 + Duration::from_secs(16)).await;
    assert_eq!(track_mode(&engine), Some(AttemptMode::Single));

    // No backup head, even with the leader stuck at zero bytes.
    client.set_snapshot(TransferKey::new("alice", BEST), 0, TransferStatus::Queued);
    engine.tick(t0 + Duration::from_secs(26)).await;
    assert_eq!(client.enqueued().len(), 1);

    // A full minute of zero bytes advances to the next rank instead.
    engine.tick(t0 + Duration::from_secs(76)).await;
    assert_eq!(
        client.enqueued(),
        vec![
            TransferKey::new("alice", BEST),
            TransferKey::new("alice", WEAK),
        ]
    );
    assert!(client.aborted.lock().contains(&TransferKey::new("alice", BEST)));
}

#[tokio::test]
async fn test_terminal_status_advances_to_next_candidate() {
    let (engine, client) = build_engine(false);
    dispatch_track(&engine).await;
    let t0 = Instant::now();

    engine
        .handle_event(response(
            "alice",
            vec![file(BEST, 9_000_000, 320), file(WEAK, 0, 0)],
        ))
        .await;
    engine.tick(t0 + Duration::from_secs(16)).await;

    client.set_snapshot(
        TransferKey::new("alice", BEST),
        0,
        TransferStatus::UserLoggedOff,
    );
    engine.tick(t0 + Duration::from_secs(18)).await;

    assert_eq!(
        client.enqueued(),
        vec![
            TransferKey::new("alice", BEST),
            TransferKey::new("alice", WEAK),
        ]
    );
}

#[tokio::test]
async fn test_no_candidates_times_out() {
    let (engine, client) = build_engine(false);
    dispatch_track(&engine).await;
    let t0 = Instant::now();

    engine.tick(t0 + Duration::from_secs(32)).await;
    assert!(client.enqueued().is_empty());
    assert!(engine.registry().get(&token()).is_none());
}

#[tokio::test]
async fn test_race_mode_launches_all_viable() {
    let (engine, client) = build_engine(true);
    dispatch_track(&engine).await;
    let t0 = Instant::now();

    engine
        .handle_event(response(
            "alice",
            vec![
                file(BEST, 9_000_000, 320),
                file(SECOND, 9_000_000, 192),
                file(WEAK, 0, 0),
            ],
        ))
        .await;
    engine.tick(t0 + Duration::from_secs(16)).await;

    // Both strong candidates launch at once; the junk one never does.
    assert_eq!(
        client.enqueued(),
        vec![
            TransferKey::new("alice", BEST),
            TransferKey::new("alice", SECOND),
        ]
    );
    assert_eq!(track_mode(&engine), Some(AttemptMode::Race));
}

// ============================================================================
// Winner arbitration
// ============================================================================

#[tokio::test]
async fn test_first_completion_wins_and_loser_file_is_deleted() {
    let (engine, client) = build_engine(false);
    dispatch_track(&engine).await;
    let t0 = Instant::now();

    engine
        .handle_event(response(
            "alice",
            vec![
                file(BEST, 9_000_000, 320),
                file(SECOND, 9_000_000, 192),
            ],
        ))
        .await;
    engine.tick(t0 + Duration::from_secs(16)).await;
    client.set_snapshot(TransferKey::new("alice", BEST), 0, TransferStatus::Queued);
    engine.tick(t0 + Duration::from_secs(26)).await;
    assert_eq!(client.enqueued().len(), 2);

    let dir = tempfile::tempdir().unwrap();
    let winner_path = dir.path().join("song_192.mp3");
    let loser_path = dir.path().join("song_320.mp3");
    std::fs::write(&winner_path, b"winner").unwrap();
    std::fs::write(&loser_path, b"loser").unwrap();

    // The backup head finishes first and claims the session.
    engine
        .handle_event(completion("alice", SECOND, winner_path.clone()))
        .await;
    assert!(engine.registry().get(&token()).is_none());
    assert!(client.aborted.lock().contains(&TransferKey::new("alice", BEST)));
    assert!(winner_path.exists());

    // The aborted leader completes anyway; its file must go.
    engine
        .handle_event(completion("alice", BEST, loser_path.clone()))
        .await;
    assert!(!loser_path.exists());
    assert!(winner_path.exists());
}

// ============================================================================
// Album flow
// ============================================================================

const ALBUM_QUERY: &str = "the band great album";
const FOLDER_A_T1: &str = "A\\The Band - Great Album (320)\\01 Song One.mp3";
const FOLDER_A_T2: &str = "A\\The Band - Great Album (320)\\02 Song Two.mp3";
const FOLDER_B_T1: &str = "B\\Great Album\\01 Song One.mp3";
const FOLDER_B_T2: &str = "B\\Great Album\\02 Song Two.mp3";

async fn dispatch_album(engine: &AcquisitionEngine) {
    let tracks = vec![
        AlbumTrack {
            track_number: 1,
            artist: "The Band".into(),
            track: "Song One".into(),
            album: "Great Album".into(),
            track_id: "t1".into(),
            duration_secs: 200,
        },
        AlbumTrack {
            track_number: 2,
            artist: "The Band".into(),
            track: "Song Two".into(),
            album: "Great Album".into(),
            track_id: "t2".into(),
            duration_secs: 210,
        },
    ];
    engine
        .dispatch_album_search(
            ALBUM_QUERY,
            AlbumTarget {
                album_id: "alb1".into(),
                album_name: "Great Album".into(),
                album_artist: "The Band".into(),
                year: Some("1999".into()),
                tracks,
            },
            FormatPreference::Mp3,
            true,
            false,
        )
        .await
        .unwrap();
}

async fn send_album_results(engine: &AcquisitionEngine) {
    engine
        .handle_event(response(
            "alice",
            vec![
                file(FOLDER_A_T1, 9_000_000, 0),
                file(FOLDER_A_T2, 9_000_000, 0),
            ],
        ))
        .await;
    engine
        .handle_event(response(
            "bob",
            vec![
                file(FOLDER_B_T1, 9_000_000, 0),
                file(FOLDER_B_T2, 9_000_000, 0),
            ],
        ))
        .await;
}

#[tokio::test]
async fn test_album_downloads_tracks_sequentially() {
    let (engine, client) = build_engine(false);
    dispatch_album(&engine).await;
    let t0 = Instant::now();
    send_album_results(&engine).await;

    engine.tick(t0 + Duration::from_secs(21)).await;
    // Best folder wins and only its first track is queued.
    assert_eq!(
        client.enqueued(),
        vec![TransferKey::new("alice", FOLDER_A_T1)]
    );

    let dir = tempfile::tempdir().unwrap();
    let t1_path = dir.path().join("01 Song One.mp3");
    std::fs::write(&t1_path, b"x").unwrap();
    engine.handle_event(completion("alice", FOLDER_A_T1, t1_path)).await;

    assert_eq!(
        client.enqueued(),
        vec![
            TransferKey::new("alice", FOLDER_A_T1),
            TransferKey::new("alice", FOLDER_A_T2),
        ]
    );

    let t2_path = dir.path().join("02 Song Two.mp3");
    std::fs::write(&t2_path, b"x").unwrap();
    engine.handle_event(completion("alice", FOLDER_A_T2, t2_path)).await;

    // Both tracks done: the session finalizes.
    assert!(engine.registry().get(&token()).is_none());
}

#[tokio::test]
async fn test_progressing_album_track_survives_stall_deadline() {
    let (engine, client) = build_engine(false);
    dispatch_album(&engine).await;
    let t0 = Instant::now();
    send_album_results(&engine).await;

    engine.tick(t0 + Duration::from_secs(21)).await;
    assert_eq!(
        client.enqueued(),
        vec![TransferKey::new("alice", FOLDER_A_T1)]
    );

    // Slow but transferring: well past the stall deadline, still not skipped.
    client.set_snapshot(
        TransferKey::new("alice", FOLDER_A_T1),
        5_000_000,
        TransferStatus::InProgress,
    );
    engine.tick(t0 + Duration::from_secs(115)).await;

    assert!(client.aborted.lock().is_empty());
    assert_eq!(client.enqueued().len(), 1);
    assert!(engine.registry().get(&token()).is_some());
}

#[tokio::test]
async fn test_album_track_with_zero_bytes_skipped_after_stall() {
    let (engine, client) = build_engine(false);
    dispatch_album(&engine).await;
    let t0 = Instant::now();
    send_album_results(&engine).await;

    engine.tick(t0 + Duration::from_secs(21)).await;
    let dir = tempfile::tempdir().unwrap();
    let t1_path = dir.path().join("01 Song One.mp3");
    std::fs::write(&t1_path, b"x").unwrap();
    engine.handle_event(completion("alice", FOLDER_A_T1, t1_path)).await;
    assert_eq!(client.enqueued().len(), 2);

    // The second track never moves a byte: skipped, and with no tracks left
    // the album finalizes.
    engine.tick(t0 + Duration::from_secs(130)).await;

    assert!(client.aborted.lock().contains(&TransferKey::new("alice", FOLDER_A_T2)));
    assert!(engine.registry().get(&token()).is_none());
}

#[tokio::test]
async fn test_album_first_track_bailout_switches_folder() {
    let (engine, client) = build_engine(false);
    dispatch_album(&engine).await;
    let t0 = Instant::now();
    send_album_results(&engine).await;

    engine.tick(t0 + Duration::from_secs(21)).await;
    assert_eq!(
        client.enqueued(),
        vec![TransferKey::new("alice", FOLDER_A_T1)]
    );

    // Sixteen seconds with zero bytes on the very first track: the folder is
    // dead, switch to the runner-up.
    engine.tick(t0 + Duration::from_secs(37)).await;

    assert!(client.aborted.lock().contains(&TransferKey::new("alice", FOLDER_A_T1)));
    assert_eq!(
        client.enqueued(),
        vec![
            TransferKey::new("alice", FOLDER_A_T1),
            TransferKey::new("bob", FOLDER_B_T1),
        ]
    );
    // Session is still alive, now working the second folder.
    assert!(engine.registry().get(&token()).is_some());
}
