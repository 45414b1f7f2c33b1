//! Acquisition engine
//!
//! Drives every search session from dispatch to finalization: waits out the
//! collection window, picks an attempt mode, launches download heads,
//! escalates slow downloads with backup heads, arbitrates the winner when
//! heads race, and walks album folders track by track.
//!
//! Locking is strict: decisions are made under the session lock and emitted
//! as commands; all network and filesystem work runs after the lock is
//! released. Each session is processed in isolation so one failure never
//! stalls the tick loop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::services::album_matcher;
use crate::services::collector;
use crate::services::filename;
use crate::services::metadata::{MetadataClient, ProcessRequest};
use crate::services::metadata_cache::MetadataCache;
use crate::services::scorer::FormatPreference;
use crate::session::registry::SessionRegistry;
use crate::session::{
    AlbumState, AlbumTarget, AttemptMode, DownloadHead, FolderCandidate, SearchSession,
    SessionDetail, TrackState, TrackTarget,
};
use crate::soulseek::{
    FileAttributes, NetworkEvent, SearchToken, SoulseekClient, TransferKey, TransferSnapshot,
};

// Track collection window and score gates.
const TRACK_DECIDE_AFTER: Duration = Duration::from_secs(15);
const TRACK_FALLBACK_AFTER: Duration = Duration::from_secs(30);
const TRACK_SCORE_GATE: i64 = 100;
const TRACK_FALLBACK_GATE: i64 = 50;

// Album collection window and score gates.
const ALBUM_DECIDE_AFTER: Duration = Duration::from_secs(20);
const ALBUM_FALLBACK_AFTER: Duration = Duration::from_secs(40);
const ALBUM_SCORE_GATE: i64 = 150;
const ALBUM_FALLBACK_GATE: i64 = 100;

// A backup candidate must clear this to ever be launched.
const BACKUP_SCORE_GATE: i64 = 50;

// Cascade escalation points, relative to the leading head's launch.
const CASCADE_NO_START: Duration = Duration::from_secs(10);
const CASCADE_NO_FINISH: Duration = Duration::from_secs(60);
const CASCADE_THIRD_HEAD_AT: Duration = Duration::from_secs(120);

// Single-mode queue stall with zero bytes before advancing to the next rank.
const SINGLE_STALL: Duration = Duration::from_secs(60);

// Absolute ceilings.
const TRACK_SESSION_CEILING: Duration = Duration::from_secs(300);
const ALBUM_SESSION_CEILING: Duration = Duration::from_secs(1800);

// Album-specific liveness windows.
const ALBUM_FIRST_TRACK_BAILOUT: Duration = Duration::from_secs(15);
const ALBUM_TRACK_STALL: Duration = Duration::from_secs(90);

pub struct EngineConfig {
    pub downloads_path: PathBuf,
    pub race_mode: bool,
}

pub struct AcquisitionEngine {
    client: Arc<dyn SoulseekClient>,
    metadata: Arc<MetadataClient>,
    cache: Arc<MetadataCache>,
    registry: Arc<SessionRegistry>,
    config: EngineConfig,
    /// Reverse map from in-flight transfers to their owning session.
    active_downloads: RwLock<HashMap<TransferKey, SearchToken>>,
    /// Aborted losers that may still complete; their files get deleted.
    doomed_transfers: RwLock<std::collections::HashSet<TransferKey>>,
}

/// Deferred side effects computed under a session lock.
enum Command {
    Enqueue {
        token: SearchToken,
        key: TransferKey,
        size: u64,
        attributes: FileAttributes,
        label: String,
    },
    /// Abort and clear a transfer. `doom` marks it for file deletion if it
    /// completes despite the abort.
    Cancel { key: TransferKey, doom: bool },
    RemoveSession { token: SearchToken },
    EnsureAlbumFolder { token: SearchToken },
    PrefetchAlbumMetadata { token: SearchToken, track_id: String },
}

impl AcquisitionEngine {
    pub fn new(
        client: Arc<dyn SoulseekClient>,
        metadata: Arc<MetadataClient>,
        cache: Arc<MetadataCache>,
        registry: Arc<SessionRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            client,
            metadata,
            cache,
            registry,
            config,
            active_downloads: RwLock::new(HashMap::new()),
            doomed_transfers: RwLock::new(std::collections::HashSet::new()),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    // ===== Dispatch =====

    /// Submit a track search and start tracking it. Searches without
    /// auto-download are submitted but never tracked.
    pub async fn dispatch_track_search(
        &self,
        query: &str,
        target: TrackTarget,
        preference: FormatPreference,
        auto_download: bool,
        metadata_override: bool,
    ) -> Result<()> {
        info!(query, auto_download, format = %preference, "New track search");
        let Some(token) = self.submit_with_recovery(query).await? else {
            if auto_download {
                warn!(query, "No search token available, auto-download disabled for this search");
            }
            return Ok(());
        };
        if !auto_download {
            return Ok(());
        }

        let session = SearchSession::new_track(
            token.clone(),
            query.to_string(),
            target,
            preference,
            metadata_override,
            Instant::now(),
        );
        self.registry.insert(session);
        info!(token = %token, query, "Tracking track search");
        Ok(())
    }

    /// Submit an album search and start tracking it.
    pub async fn dispatch_album_search(
        &self,
        query: &str,
        target: AlbumTarget,
        preference: FormatPreference,
        auto_download: bool,
        metadata_override: bool,
    ) -> Result<()> {
        info!(
            query,
            album = %target.album_name,
            artist = %target.album_artist,
            tracks = target.tracks.len(),
            "New album search"
        );
        let Some(token) = self.submit_with_recovery(query).await? else {
            anyhow::bail!("no search token available for album search '{query}'");
        };
        if !auto_download {
            return Ok(());
        }

        let session = SearchSession::new_album(
            token.clone(),
            query.to_string(),
            target,
            preference,
            metadata_override,
            Instant::now(),
        );
        self.registry.insert(session);
        info!(token = %token, query, "Tracking album search");
        Ok(())
    }

    /// The daemon sometimes accepts a search without returning its token;
    /// recover it by diffing the daemon's search list before and after.
    async fn submit_with_recovery(&self, query: &str) -> Result<Option<SearchToken>> {
        let before = self
            .client
            .recent_search_tokens()
            .await
            .unwrap_or_default();
        if let Some(token) = self
            .client
            .submit_search(query)
            .await
            .context("search submission failed")?
        {
            return Ok(Some(token));
        }

        let after = self
            .client
            .recent_search_tokens()
            .await
            .context("token recovery failed")?;
        let fresh = after.iter().find(|t| !before.contains(t)).cloned();
        Ok(fresh.or_else(|| after.last().cloned()))
    }

    // ===== Event handling =====

    pub async fn handle_event(&self, event: NetworkEvent) {
        match event {
            NetworkEvent::SearchResponse(response) => {
                let Some(session) = self.registry.get(&response.token) else {
                    return;
                };
                let mut session = session.lock();
                collector::ingest_response(&mut session, &response);
            }
            NetworkEvent::DownloadComplete(complete) => {
                let key = TransferKey::new(complete.peer.clone(), complete.virtual_path.clone());
                if let Err(e) = self.handle_download_complete(&key, complete.local_path).await {
                    error!(transfer = %key, error = %e, "Error handling download completion");
                }
            }
        }
    }

    async fn handle_download_complete(&self, key: &TransferKey, local_path: PathBuf) -> Result<()> {
        // A doomed loser finishing after its session closed: delete the file.
        if self.doomed_transfers.write().remove(key) {
            info!(transfer = %key, "Late loser completed, deleting file");
            self.delete_file(&local_path).await;
            let _ = self.client.clear_transfer(key).await;
            return Ok(());
        }

        let token = self.active_downloads.read().get(key).cloned();
        let Some(token) = token else {
            debug!(transfer = %key, "Completion for untracked transfer");
            return Ok(());
        };
        let Some(shared) = self.registry.get(&token) else {
            return Ok(());
        };

        let mut commands = Vec::new();
        let mut post_process: Option<PostProcessJob> = None;

        {
            let mut session = shared.lock();
            match &mut session.detail {
                SessionDetail::Track(_) => {
                    self.complete_track_head(&mut session, key, &local_path, &mut commands, &mut post_process);
                }
                SessionDetail::Album(_) => {
                    self.complete_album_track(&mut session, key, &local_path, &mut commands, &mut post_process);
                }
            }
        }

        self.execute_commands(commands).await;
        if let Some(job) = post_process {
            self.spawn_post_process(job);
        }
        Ok(())
    }

    /// Winner arbitration for track sessions. The first head to complete
    /// claims the session under its lock; everyone else is a loser.
    fn complete_track_head(
        &self,
        session: &mut SearchSession,
        key: &TransferKey,
        local_path: &std::path::Path,
        commands: &mut Vec<Command>,
        post_process: &mut Option<PostProcessJob>,
    ) {
        let token = session.token.clone();
        let metadata_override = session.metadata_override;
        let found = match &session.detail {
            SessionDetail::Track(state) => state
                .active_heads
                .iter()
                .position(|h| &h.key == key)
                .map(|i| (i, state.active_heads[i].rank)),
            SessionDetail::Album(_) => return,
        };
        let Some((idx, head_rank)) = found else {
            return;
        };

        if !session.claim_winner(head_rank) {
            // Lost the race after the abort failed to land in time.
            info!(token = %token, transfer = %key, "Loser head completed, deleting file");
            let SessionDetail::Track(state) = &mut session.detail else {
                return;
            };
            state.active_heads.remove(idx);
            self.active_downloads.write().remove(key);
            commands.push(Command::Cancel { key: key.clone(), doom: false });
            let path = local_path.to_path_buf();
            tokio::spawn(async move {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    debug!(path = %path.display(), error = %e, "Loser file already gone");
                }
            });
            return;
        }

        let SessionDetail::Track(state) = &mut session.detail else {
            return;
        };
        let winner = state.active_heads.remove(idx);
        info!(
            token = %token,
            transfer = %key,
            rank = winner.rank,
            score = winner.score,
            "Download complete, head won"
        );

        // Everything still in flight is now a loser.
        for loser in state.active_heads.drain(..) {
            info!(token = %token, transfer = %loser.key, rank = loser.rank, "Aborting losing head");
            self.active_downloads.write().remove(&loser.key);
            commands.push(Command::Cancel { key: loser.key, doom: true });
        }
        self.active_downloads.write().remove(key);
        commands.push(Command::RemoveSession { token: token.clone() });

        if metadata_override && is_processable(local_path) {
            *post_process = Some(PostProcessJob {
                token,
                local_path: local_path.to_path_buf(),
                artist: state.target.artist.clone(),
                track: state.target.track.clone(),
                album: state.target.album.clone(),
                track_id: state.target.track_id.clone(),
                track_number: None,
                target_folder: None,
                use_album_cache: false,
            });
        }
    }

    /// One album track finished: post-process it and move to the next.
    fn complete_album_track(
        &self,
        session: &mut SearchSession,
        key: &TransferKey,
        local_path: &std::path::Path,
        commands: &mut Vec<Command>,
        post_process: &mut Option<PostProcessJob>,
    ) {
        let token = session.token.clone();
        let metadata_override = session.metadata_override;
        let SessionDetail::Album(state) = &mut session.detail else {
            return;
        };
        if state.current_transfer_key().as_ref() != Some(key) {
            debug!(token = %token, transfer = %key, "Completion for a non-current album track");
            return;
        }

        let matched = &state.track_matches[state.current_track];
        info!(
            token = %token,
            track = %matched.expected.track,
            number = state.current_track + 1,
            total = state.track_matches.len(),
            "Album track complete"
        );

        if metadata_override && is_processable(local_path) {
            *post_process = Some(PostProcessJob {
                token: token.clone(),
                local_path: local_path.to_path_buf(),
                artist: matched.expected.artist.clone(),
                track: matched.expected.track.clone(),
                album: matched.expected.album.clone(),
                track_id: matched.expected.track_id.clone(),
                track_number: Some(matched.expected.track_number),
                target_folder: state.album_folder.clone(),
                use_album_cache: true,
            });
        }

        self.active_downloads.write().remove(key);
        state.downloaded_count += 1;
        state.current_track += 1;
        self.advance_album(&token, state, commands);
    }

    /// Queue the next matched track, or finalize when the list is done.
    fn advance_album(&self, token: &SearchToken, state: &mut AlbumState, commands: &mut Vec<Command>) {
        if state.current_track >= state.track_matches.len() {
            info!(
                token = %token,
                downloaded = state.downloaded_count,
                skipped = state.skipped_tracks.len(),
                total = state.track_matches.len(),
                "Album download complete"
            );
            self.cache.remove(&token.0);
            commands.push(Command::RemoveSession { token: token.clone() });
            return;
        }

        let Some(folder) = state.chosen_folder.clone() else {
            commands.push(Command::RemoveSession { token: token.clone() });
            return;
        };
        let matched = &state.track_matches[state.current_track];
        let key = TransferKey::new(folder.peer.clone(), matched.file.path.clone());
        info!(
            token = %token,
            track = %matched.expected.track,
            number = state.current_track + 1,
            total = state.track_matches.len(),
            "Starting album track"
        );
        state.track_started_at = Some(Instant::now());
        self.active_downloads.write().insert(key.clone(), token.clone());
        commands.push(Command::Enqueue {
            token: token.clone(),
            key,
            size: matched.file.size,
            attributes: matched.file.attributes,
            label: format!("track {}/{}", state.current_track + 1, state.track_matches.len()),
        });
    }

    // ===== Periodic tick =====

    /// One pass over every session: launch downloads whose collection window
    /// closed, escalate or fail stalled heads, enforce ceilings.
    pub async fn tick(&self, now: Instant) {
        let snapshots: HashMap<TransferKey, TransferSnapshot> = match self
            .client
            .transfer_snapshots()
            .await
        {
            Ok(list) => list.into_iter().map(|s| (s.key.clone(), s)).collect(),
            Err(e) => {
                warn!(job = "engine_tick", error = %e, "Could not fetch transfer snapshots");
                HashMap::new()
            }
        };

        for (token, shared) in self.registry.snapshot() {
            let commands = {
                let mut session = shared.lock();
                self.tick_session(&mut session, now, &snapshots)
            };
            if let Err(e) = self.try_execute(commands).await {
                error!(job = "engine_tick", token = %token, error = %e, "Session processing failed, abandoning");
                self.abandon_session(&token).await;
            }
        }
    }

    fn tick_session(
        &self,
        session: &mut SearchSession,
        now: Instant,
        snapshots: &HashMap<TransferKey, TransferSnapshot>,
    ) -> Vec<Command> {
        let mut commands = Vec::new();
        let token = session.token.clone();
        let query = session.query.clone();
        let created_at = session.created_at;
        let download_started_at = session.download_started_at;

        match &mut session.detail {
            SessionDetail::Track(state) => {
                match download_started_at {
                    None => {
                        if self.maybe_start_track(&token, &query, state, created_at, now, &mut commands)
                        {
                            session.download_started_at = Some(now);
                        }
                    }
                    Some(started_at) => {
                        if now.saturating_duration_since(started_at) > TRACK_SESSION_CEILING {
                            warn!(token = %token, query = %query, "Track session exceeded 5 minute ceiling, abandoning");
                            self.fail_track_session(&token, state, &mut commands);
                        } else {
                            self.monitor_track_heads(&token, state, now, snapshots, &mut commands);
                        }
                    }
                }
            }
            SessionDetail::Album(state) => {
                if now.saturating_duration_since(created_at) > ALBUM_SESSION_CEILING {
                    warn!(
                        token = %token,
                        downloaded = state.downloaded_count,
                        "Album exceeded 30 minute ceiling, finalizing with what completed"
                    );
                    if let Some(key) = state.current_transfer_key() {
                        self.active_downloads.write().remove(&key);
                        commands.push(Command::Cancel { key, doom: false });
                    }
                    self.cache.remove(&token.0);
                    commands.push(Command::RemoveSession { token: token.clone() });
                } else if download_started_at.is_none() {
                    if self.maybe_start_album(&token, &query, state, created_at, now, &mut commands) {
                        session.download_started_at = Some(now);
                    }
                } else {
                    self.monitor_album_track(&token, state, now, snapshots, &mut commands);
                }
            }
        }
        commands
    }

    // ===== Track launch and monitoring =====

    /// Returns true when a download was launched this tick.
    fn maybe_start_track(
        &self,
        token: &SearchToken,
        query: &str,
        state: &mut TrackState,
        created_at: Instant,
        now: Instant,
        commands: &mut Vec<Command>,
    ) -> bool {
        let elapsed = now.saturating_duration_since(created_at);
        let Some(best_score) = state.candidates.first().map(|c| c.score) else {
            if elapsed > TRACK_FALLBACK_AFTER {
                info!(token = %token, query, "No results at all, giving up");
                commands.push(Command::RemoveSession { token: token.clone() });
            }
            return false;
        };

        let launch = if elapsed >= TRACK_DECIDE_AFTER && best_score > TRACK_SCORE_GATE {
            true
        } else if elapsed > TRACK_FALLBACK_AFTER {
            if best_score > TRACK_FALLBACK_GATE {
                info!(token = %token, query, best_score, "Window expired, taking best available candidate");
                true
            } else {
                info!(token = %token, query, best_score, "No viable candidates, giving up");
                commands.push(Command::RemoveSession { token: token.clone() });
                return false;
            }
        } else {
            false
        };
        if !launch {
            return false;
        }

        let mode = select_mode(&state.candidates, self.config.race_mode);
        state.mode = Some(mode);
        info!(token = %token, query, mode = %mode, best_score, "Starting download");

        match mode {
            AttemptMode::Race => {
                let viable: Vec<usize> = state
                    .candidates
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| c.score > BACKUP_SCORE_GATE)
                    .map(|(i, _)| i)
                    .collect();
                for rank in viable {
                    self.launch_rank(token, state, rank, now, commands);
                }
            }
            AttemptMode::Single | AttemptMode::Cascade => {
                self.launch_rank(token, state, 0, now, commands);
            }
        }
        true
    }

    /// Enqueue the candidate at `rank` as a new download head.
    fn launch_rank(
        &self,
        token: &SearchToken,
        state: &mut TrackState,
        rank: usize,
        now: Instant,
        commands: &mut Vec<Command>,
    ) -> bool {
        let Some(candidate) = state.candidates.get(rank) else {
            return false;
        };
        let key = candidate.transfer_key();
        info!(
            token = %token,
            head = rank + 1,
            file = %candidate.filename,
            score = candidate.score,
            "Launching download head"
        );
        state.active_heads.push(DownloadHead {
            rank,
            key: key.clone(),
            size: candidate.size,
            attributes: candidate.attributes,
            score: candidate.score,
            started_at: now,
        });
        state.ranks_launched = state.ranks_launched.max(rank + 1);
        self.active_downloads.write().insert(key.clone(), token.clone());
        commands.push(Command::Enqueue {
            token: token.clone(),
            key,
            size: candidate.size,
            attributes: candidate.attributes,
            label: format!("head {}", rank + 1),
        });
        true
    }

    fn monitor_track_heads(
        &self,
        token: &SearchToken,
        state: &mut TrackState,
        now: Instant,
        snapshots: &HashMap<TransferKey, TransferSnapshot>,
        commands: &mut Vec<Command>,
    ) {
        if state.winner_head.is_some() {
            return;
        }
        let mode = state.mode.unwrap_or(AttemptMode::Single);

        // Collect failures first; mutating while iterating invites bugs.
        let mut failed: Vec<usize> = Vec::new();
        for (i, head) in state.active_heads.iter().enumerate() {
            let head_elapsed = now.saturating_duration_since(head.started_at);
            match snapshots.get(&head.key) {
                None => {
                    // Give the daemon a tick or two to register the enqueue.
                    if head_elapsed > Duration::from_secs(5) {
                        warn!(token = %token, transfer = %head.key, "Transfer vanished from daemon");
                        failed.push(i);
                    }
                }
                Some(snap) if snap.status.is_terminal_failure() => {
                    warn!(token = %token, transfer = %head.key, status = %snap.status, "Head failed");
                    failed.push(i);
                }
                Some(snap) => {
                    if mode == AttemptMode::Single
                        && snap.bytes_transferred == 0
                        && head_elapsed >= SINGLE_STALL
                    {
                        warn!(token = %token, transfer = %head.key, "Head stalled with zero bytes");
                        failed.push(i);
                    }
                }
            }
        }
        for i in failed.into_iter().rev() {
            let head = state.active_heads.remove(i);
            self.active_downloads.write().remove(&head.key);
            commands.push(Command::Cancel { key: head.key, doom: false });
            if mode == AttemptMode::Single {
                let next = state.ranks_launched;
                if !self.launch_rank(token, state, next, now, commands) {
                    info!(token = %token, "All candidates exhausted");
                }
            }
        }

        if state.active_heads.is_empty() {
            match mode {
                AttemptMode::Single => {
                    // A replacement head was launched above unless the
                    // candidate list ran out.
                    if state.ranks_launched >= state.candidates.len() {
                        self.fail_track_session(token, state, commands);
                    }
                }
                AttemptMode::Cascade | AttemptMode::Race => {
                    // A dead head is not a dead session while viable
                    // backups remain unlaunched.
                    let next = state.ranks_launched;
                    if candidate_viable(state, next) {
                        info!(token = %token, head = next + 1, "All heads gone, launching next candidate");
                        self.launch_rank(token, state, next, now, commands);
                    } else {
                        self.fail_track_session(token, state, commands);
                    }
                }
            }
            return;
        }

        if mode == AttemptMode::Cascade {
            self.maybe_escalate_cascade(token, state, now, snapshots, commands);
        }
    }

    /// Launch backup heads when the leader looks slow. The second head goes
    /// out if the leader hasn't moved a byte shortly after launch, or is
    /// still unfinished a minute in; the third after two minutes.
    fn maybe_escalate_cascade(
        &self,
        token: &SearchToken,
        state: &mut TrackState,
        now: Instant,
        snapshots: &HashMap<TransferKey, TransferSnapshot>,
        commands: &mut Vec<Command>,
    ) {
        let first_started = state
            .active_heads
            .iter()
            .map(|h| h.started_at)
            .min()
            .unwrap_or(now);
        let leader_elapsed = now.saturating_duration_since(first_started);

        if state.ranks_launched == 1 {
            let leader = &state.active_heads[0];
            let leader_bytes = snapshots
                .get(&leader.key)
                .map(|s| s.bytes_transferred)
                .unwrap_or(0);
            let no_start = leader_bytes == 0 && leader_elapsed >= CASCADE_NO_START;
            let no_finish = leader_elapsed >= CASCADE_NO_FINISH;
            if (no_start || no_finish) && candidate_viable(state, 1) {
                info!(
                    token = %token,
                    reason = if no_start { "no bytes yet" } else { "still unfinished" },
                    "Escalating to second head"
                );
                self.launch_rank(token, state, 1, now, commands);
            }
        } else if state.ranks_launched == 2
            && leader_elapsed >= CASCADE_THIRD_HEAD_AT
            && candidate_viable(state, 2)
        {
            info!(token = %token, "Escalating to third head");
            self.launch_rank(token, state, 2, now, commands);
        }
    }

    fn fail_track_session(
        &self,
        token: &SearchToken,
        state: &mut TrackState,
        commands: &mut Vec<Command>,
    ) {
        for head in state.active_heads.drain(..) {
            self.active_downloads.write().remove(&head.key);
            commands.push(Command::Cancel { key: head.key, doom: false });
        }
        commands.push(Command::RemoveSession { token: token.clone() });
    }

    // ===== Album launch and monitoring =====

    fn maybe_start_album(
        &self,
        token: &SearchToken,
        query: &str,
        state: &mut AlbumState,
        created_at: Instant,
        now: Instant,
        commands: &mut Vec<Command>,
    ) -> bool {
        let elapsed = now.saturating_duration_since(created_at);
        let Some(best_score) = state.folder_candidates.first().map(|c| c.score) else {
            if elapsed > ALBUM_FALLBACK_AFTER {
                info!(token = %token, query, "No folder candidates, giving up");
                commands.push(Command::RemoveSession { token: token.clone() });
            }
            return false;
        };

        let launch = if elapsed >= ALBUM_DECIDE_AFTER && best_score > ALBUM_SCORE_GATE {
            true
        } else if elapsed > ALBUM_FALLBACK_AFTER {
            if best_score > ALBUM_FALLBACK_GATE {
                info!(token = %token, query, best_score, "Window expired, taking best folder");
                true
            } else {
                info!(token = %token, query, best_score, "No viable folders, giving up");
                commands.push(Command::RemoveSession { token: token.clone() });
                return false;
            }
        } else {
            false
        };
        if !launch {
            return false;
        }

        self.start_album_folder(token, state, None, commands)
    }

    /// Select a folder (the given one, or the best untried), match its files
    /// against the expected tracks, and queue the first download. Falls
    /// through untried folders until one matches.
    fn start_album_folder(
        &self,
        token: &SearchToken,
        state: &mut AlbumState,
        folder: Option<FolderCandidate>,
        commands: &mut Vec<Command>,
    ) -> bool {
        let mut next = folder.or_else(|| next_untried_folder(state));
        while let Some(candidate) = next {
            state
                .tried_folders
                .insert((candidate.peer.clone(), candidate.folder_path.clone()));

            let matches = album_matcher::match_album_tracks(&state.target.tracks, &candidate);
            if matches.is_empty() {
                warn!(token = %token, folder = %candidate.folder_path, "No tracks matched in folder, trying next");
                next = next_untried_folder(state);
                continue;
            }

            info!(
                token = %token,
                folder = %candidate.folder_path,
                peer = %candidate.peer,
                score = candidate.score,
                matched = matches.len(),
                expected = state.target.tracks.len(),
                "Album folder selected"
            );
            state.chosen_folder = Some(candidate);
            state.track_matches = matches;
            state.current_track = 0;

            commands.push(Command::EnsureAlbumFolder { token: token.clone() });
            if let Some(first) = state.track_matches.first()
                && !first.expected.track_id.is_empty()
            {
                commands.push(Command::PrefetchAlbumMetadata {
                    token: token.clone(),
                    track_id: first.expected.track_id.clone(),
                });
            }
            self.advance_album(token, state, commands);
            return true;
        }

        info!(token = %token, "No usable folders remain, giving up");
        commands.push(Command::RemoveSession { token: token.clone() });
        false
    }

    fn monitor_album_track(
        &self,
        token: &SearchToken,
        state: &mut AlbumState,
        now: Instant,
        snapshots: &HashMap<TransferKey, TransferSnapshot>,
        commands: &mut Vec<Command>,
    ) {
        let Some(key) = state.current_transfer_key() else {
            return;
        };
        let Some(started_at) = state.track_started_at else {
            return;
        };
        let elapsed = now.saturating_duration_since(started_at);
        let snap = snapshots.get(&key);
        let bytes = snap.map(|s| s.bytes_transferred).unwrap_or(0);
        let terminal = snap.map(|s| s.status.is_terminal_failure()).unwrap_or(false);

        // A folder that cannot serve its very first byte is a dead folder,
        // not a slow track. Swap folders instead of grinding through it.
        if state.downloaded_count == 0
            && state.current_track == 0
            && bytes == 0
            && (elapsed >= ALBUM_FIRST_TRACK_BAILOUT || terminal)
        {
            warn!(token = %token, folder = ?state.chosen_folder.as_ref().map(|f| &f.folder_path), "First track never started, abandoning folder");
            self.active_downloads.write().remove(&key);
            commands.push(Command::Cancel { key, doom: false });
            state.chosen_folder = None;
            state.track_matches.clear();
            state.track_started_at = None;
            self.start_album_folder(token, state, None, commands);
            return;
        }

        // Only a transfer still sitting at zero bytes counts as stalled; a
        // slow but moving track keeps its slot until the album ceiling.
        if (bytes == 0 && elapsed >= ALBUM_TRACK_STALL) || terminal {
            let matched = &state.track_matches[state.current_track];
            warn!(
                token = %token,
                track = %matched.expected.track,
                number = state.current_track + 1,
                terminal,
                "Album track stalled, skipping"
            );
            state.skipped_tracks.push(matched.expected.track_number);
            self.active_downloads.write().remove(&key);
            commands.push(Command::Cancel { key, doom: false });
            state.current_track += 1;
            self.advance_album(token, state, commands);
        }
    }

    // ===== Command execution =====

    async fn execute_commands(&self, commands: Vec<Command>) {
        if let Err(e) = self.try_execute(commands).await {
            error!(error = %e, "Command execution failed");
        }
    }

    async fn try_execute(&self, commands: Vec<Command>) -> Result<()> {
        for command in commands {
            match command {
                Command::Enqueue { token, key, size, attributes, label } => {
                    if let Err(e) = self
                        .client
                        .enqueue_download(&key.peer, &key.virtual_path, size, attributes)
                        .await
                    {
                        // The head will show up as vanished on the next tick
                        // and go through the normal failure path.
                        warn!(token = %token, transfer = %key, label = %label, error = %e, "Enqueue failed");
                    }
                }
                Command::Cancel { key, doom } => {
                    if doom {
                        self.doomed_transfers.write().insert(key.clone());
                    }
                    if let Err(e) = self.client.abort_transfer(&key).await {
                        debug!(transfer = %key, error = %e, "Abort failed");
                    }
                    if let Err(e) = self.client.clear_transfer(&key).await {
                        debug!(transfer = %key, error = %e, "Clear failed");
                    }
                }
                Command::RemoveSession { token } => {
                    self.registry.remove(&token);
                }
                Command::EnsureAlbumFolder { token } => {
                    self.ensure_album_folder(&token).await;
                }
                Command::PrefetchAlbumMetadata { token, track_id } => {
                    self.spawn_metadata_prefetch(token, track_id);
                }
            }
        }
        Ok(())
    }

    async fn ensure_album_folder(&self, token: &SearchToken) {
        let Some(shared) = self.registry.get(token) else {
            return;
        };
        let (artist, album, year) = {
            let session = shared.lock();
            let SessionDetail::Album(state) = &session.detail else {
                return;
            };
            (
                state.target.album_artist.clone(),
                state.target.album_name.clone(),
                state.target.year.clone().unwrap_or_default(),
            )
        };
        if artist.is_empty() || album.is_empty() {
            return;
        }

        match self
            .metadata
            .ensure_album_folder(&artist, &album, &year, &self.config.downloads_path)
            .await
        {
            Ok(Some(path)) => {
                info!(token = %token, path = %path.display(), "Album folder ready");
                let mut session = shared.lock();
                if let SessionDetail::Album(state) = &mut session.detail {
                    state.album_folder = Some(path);
                }
            }
            Ok(None) => {
                warn!(token = %token, "Album folder not created, tracks stay in download root");
            }
            Err(e) => {
                warn!(token = %token, error = %e, "Album folder request failed, continuing anyway");
            }
        }
    }

    /// Album-level year and cover art, fetched once in the background so the
    /// first track's post-processing finds it in the cache.
    fn spawn_metadata_prefetch(&self, token: SearchToken, track_id: String) {
        let metadata = self.metadata.clone();
        let cache = self.cache.clone();
        tokio::spawn(async move {
            match metadata.fetch_album_metadata(&track_id).await {
                Ok(album_meta) => {
                    debug!(token = %token, year = %album_meta.year, "Album metadata prefetched");
                    cache.insert(token.0, album_meta);
                }
                Err(e) => {
                    debug!(token = %token, error = %e, "Album metadata prefetch failed");
                }
            }
        });
    }

    fn spawn_post_process(&self, job: PostProcessJob) {
        let metadata = self.metadata.clone();
        let cache = self.cache.clone();
        tokio::spawn(async move {
            let prefetched = if job.use_album_cache {
                cache.get(&job.token.0)
            } else {
                None
            };
            let request = ProcessRequest {
                local_path: &job.local_path,
                artist: &job.artist,
                track: &job.track,
                album: &job.album,
                track_id: &job.track_id,
                track_number: job.track_number,
                prefetched: prefetched.as_ref(),
                target_folder: job.target_folder.as_deref(),
            };
            match metadata.process_file(&request).await {
                Ok(outcome) if outcome.success => {
                    info!(token = %job.token, file = %outcome.final_path.display(), "Post-processing done");
                }
                Ok(_) => {
                    warn!(token = %job.token, file = %job.local_path.display(), "Post-processing reported failure");
                }
                Err(e) => {
                    warn!(token = %job.token, file = %job.local_path.display(), error = %e, "Post-processing failed");
                }
            }
        });
    }

    async fn delete_file(&self, path: &std::path::Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            debug!(path = %path.display(), error = %e, "File delete failed (may already be gone)");
        }
    }

    /// Drop a session after an unrecoverable processing error, cancelling
    /// anything it still has in flight.
    async fn abandon_session(&self, token: &SearchToken) {
        let Some(shared) = self.registry.remove(token) else {
            return;
        };
        let keys: Vec<TransferKey> = {
            let session = shared.lock();
            match &session.detail {
                SessionDetail::Track(t) => t.active_heads.iter().map(|h| h.key.clone()).collect(),
                SessionDetail::Album(a) => a.current_transfer_key().into_iter().collect(),
            }
        };
        for key in keys {
            self.active_downloads.write().remove(&key);
            let _ = self.client.abort_transfer(&key).await;
            let _ = self.client.clear_transfer(&key).await;
        }
    }

    // ===== Progress sampling =====

    /// Push transfer progress for everything in flight to the bridge.
    pub async fn sample_progress(&self) {
        let tracked: Vec<(TransferKey, SearchToken)> = self
            .active_downloads
            .read()
            .iter()
            .map(|(k, t)| (k.clone(), t.clone()))
            .collect();
        if tracked.is_empty() {
            return;
        }
        let snapshots = match self.client.transfer_snapshots().await {
            Ok(list) => list,
            Err(_) => return,
        };
        for snap in snapshots {
            if let Some((_, token)) = tracked.iter().find(|(k, _)| k == &snap.key) {
                self.metadata
                    .report_progress(
                        &token.0,
                        &snap.key.virtual_path,
                        snap.bytes_transferred,
                        snap.total_size,
                    )
                    .await;
            }
        }
    }
}

struct PostProcessJob {
    token: SearchToken,
    local_path: PathBuf,
    artist: String,
    track: String,
    album: String,
    track_id: String,
    track_number: Option<u32>,
    target_folder: Option<PathBuf>,
    use_album_cache: bool,
}

/// Cascade needs a viable runner-up; otherwise a single head with
/// rank-advance retries is the right shape. Race is opt-in legacy behavior.
fn select_mode(candidates: &[crate::session::FileCandidate], race_mode: bool) -> AttemptMode {
    if race_mode {
        return AttemptMode::Race;
    }
    match candidates.get(1) {
        Some(second) if second.score > BACKUP_SCORE_GATE => AttemptMode::Cascade,
        _ => AttemptMode::Single,
    }
}

fn candidate_viable(state: &TrackState, rank: usize) -> bool {
    state
        .candidates
        .get(rank)
        .is_some_and(|c| c.score > BACKUP_SCORE_GATE)
}

fn next_untried_folder(state: &AlbumState) -> Option<FolderCandidate> {
    state
        .folder_candidates
        .iter()
        .find(|c| !state.tried_folders.contains(&(c.peer.clone(), c.folder_path.clone())))
        .cloned()
}

fn is_processable(path: &std::path::Path) -> bool {
    matches!(
        filename::file_format(&path.to_string_lossy()).as_str(),
        "mp3" | "flac"
    )
}

/// Consume daemon events until the channel closes. Runs as its own task;
/// event-handling errors are logged per event and never stop the loop.
pub fn spawn_event_consumer(
    engine: Arc<AcquisitionEngine>,
    mut rx: mpsc::Receiver<NetworkEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            engine.handle_event(event).await;
        }
        info!("Event channel closed, consumer stopping");
    })
}
