//! Post-processing bridge client
//!
//! The bridge is a companion HTTP service that tags, renames, and relocates
//! finished downloads, and that queues the searches this engine should run.
//! It restarts itself after crashes, so the metadata call path waits for it
//! to come back instead of failing the track outright.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::session::{AlbumTarget, TrackTarget};

/// Attempts per metadata request, counting the first try. Each retry is
/// preceded by a full bridge-recovery wait.
const MAX_PROCESS_ATTEMPTS: u32 = 3;

/// How long to wait for a crashed bridge to come back, polling once a second.
const RECOVERY_WAIT_SECS: u64 = 30;

pub struct MetadataClient {
    base_url: String,
    client: Client,
}

/// Cached album-level metadata, fetched once and shared across tracks.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlbumMetadata {
    #[serde(default)]
    pub year: String,
    #[serde(default)]
    pub image_url: String,
}

/// Outcome of a process-metadata call.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub success: bool,
    /// Path after any rename/move the bridge performed.
    pub final_path: PathBuf,
}

#[derive(Serialize)]
struct ProcessMetadataDto<'a> {
    file_path: &'a str,
    artist: &'a str,
    track: &'a str,
    album: &'a str,
    track_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    track_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prefetched_year: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prefetched_image_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_folder: Option<&'a str>,
}

#[derive(Deserialize)]
struct ProcessResultDto {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    renamed: bool,
    #[serde(default)]
    new_path: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Serialize)]
struct EnsureFolderDto<'a> {
    album_artist: &'a str,
    album_name: &'a str,
    year: &'a str,
    download_dir: &'a str,
}

#[derive(Deserialize)]
struct EnsureFolderResultDto {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    folder_path: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct PendingResponseDto {
    #[serde(default)]
    searches: Vec<PendingSearch>,
}

/// One search queued on the bridge for this engine to run.
#[derive(Debug, Clone, Deserialize)]
pub struct PendingSearch {
    /// Wall-clock id assigned by the bridge; also the dedupe key.
    pub timestamp: Option<f64>,
    #[serde(rename = "type", default)]
    pub search_type: String,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub auto_download: bool,
    #[serde(default = "default_true")]
    pub metadata_override: bool,
    #[serde(default)]
    pub format_preference: String,
    // Track fields
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub track: String,
    #[serde(default)]
    pub album: String,
    #[serde(default)]
    pub track_id: String,
    #[serde(default)]
    pub duration: u32,
    // Album fields
    #[serde(default)]
    pub album_id: String,
    #[serde(default)]
    pub album_name: String,
    #[serde(default)]
    pub album_artist: String,
    #[serde(default)]
    pub year: Option<String>,
    #[serde(default)]
    pub tracks: Vec<crate::session::AlbumTrack>,
}

fn default_true() -> bool {
    true
}

impl PendingSearch {
    pub fn is_album(&self) -> bool {
        self.search_type == "album"
    }

    pub fn track_target(&self) -> TrackTarget {
        TrackTarget {
            artist: self.artist.clone(),
            track: self.track.clone(),
            album: self.album.clone(),
            track_id: self.track_id.clone(),
            duration_secs: self.duration,
        }
    }

    pub fn album_target(&self) -> AlbumTarget {
        AlbumTarget {
            album_id: self.album_id.clone(),
            album_name: self.album_name.clone(),
            album_artist: self.album_artist.clone(),
            year: self.year.clone(),
            tracks: self.tracks.clone(),
        }
    }
}

/// Metadata handed to one process-metadata call.
pub struct ProcessRequest<'a> {
    pub local_path: &'a Path,
    pub artist: &'a str,
    pub track: &'a str,
    pub album: &'a str,
    pub track_id: &'a str,
    pub track_number: Option<u32>,
    pub prefetched: Option<&'a AlbumMetadata>,
    pub target_folder: Option<&'a Path>,
}

impl MetadataClient {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Whether the bridge answers its health probe.
    pub async fn is_alive(&self) -> bool {
        let Ok(resp) = self
            .client
            .get(self.url("/ping"))
            .timeout(Duration::from_secs(2))
            .send()
            .await
        else {
            return false;
        };
        resp.status().is_success()
    }

    /// Send one finished download through tagging/renaming. Connection
    /// refused/reset means the bridge crashed mid-request; in that case wait
    /// for it to come back and retry, up to [`MAX_PROCESS_ATTEMPTS`] tries
    /// overall.
    pub async fn process_file(&self, req: &ProcessRequest<'_>) -> Result<ProcessOutcome> {
        let path_str = req.local_path.to_string_lossy();
        let target_str = req.target_folder.map(|p| p.to_string_lossy().into_owned());
        let dto = ProcessMetadataDto {
            file_path: &path_str,
            artist: req.artist,
            track: req.track,
            album: req.album,
            track_id: req.track_id,
            track_number: req.track_number,
            prefetched_year: req.prefetched.map(|m| m.year.as_str()),
            prefetched_image_url: req.prefetched.map(|m| m.image_url.as_str()),
            target_folder: target_str.as_deref(),
        };

        let mut attempt = 1;
        loop {
            let sent = self
                .client
                .post(self.url("/process-metadata"))
                .timeout(Duration::from_secs(15))
                .json(&dto)
                .send()
                .await;

            match sent {
                Ok(resp) => {
                    let result: ProcessResultDto = resp
                        .json()
                        .await
                        .context("invalid process-metadata response")?;
                    if !result.success {
                        warn!(
                            file = %path_str,
                            error = result.error.as_deref().unwrap_or("unknown"),
                            "Metadata processing failed"
                        );
                    } else if result.renamed {
                        debug!(file = %path_str, new_path = ?result.new_path, "File renamed by bridge");
                    }
                    let final_path = result
                        .new_path
                        .map(PathBuf::from)
                        .unwrap_or_else(|| req.local_path.to_path_buf());
                    return Ok(ProcessOutcome {
                        success: result.success,
                        final_path,
                    });
                }
                Err(e) if is_connection_drop(&e) && attempt < MAX_PROCESS_ATTEMPTS => {
                    warn!(
                        file = %path_str,
                        attempt,
                        error = %e,
                        "Bridge crashed during metadata processing, waiting for restart"
                    );
                    if !self.wait_for_recovery().await {
                        anyhow::bail!(
                            "bridge did not recover within {RECOVERY_WAIT_SECS}s after crash"
                        );
                    }
                    attempt += 1;
                }
                Err(e) => {
                    return Err(e).context("process-metadata request failed");
                }
            }
        }
    }

    /// Poll the health probe once per second until the bridge answers or the
    /// recovery window runs out.
    async fn wait_for_recovery(&self) -> bool {
        for waited in 1..=RECOVERY_WAIT_SECS {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if self.is_alive().await {
                info!(waited_secs = waited, "Bridge back online");
                // Give it a moment to finish initializing.
                tokio::time::sleep(Duration::from_secs(2)).await;
                return true;
            }
        }
        false
    }

    /// Create the album's destination folder before the first track download,
    /// so a mid-album crash never strands files in the download root.
    pub async fn ensure_album_folder(
        &self,
        album_artist: &str,
        album_name: &str,
        year: &str,
        download_dir: &Path,
    ) -> Result<Option<PathBuf>> {
        let dir_str = download_dir.to_string_lossy();
        let resp = self
            .client
            .post(self.url("/ensure-album-folder"))
            .timeout(Duration::from_secs(10))
            .json(&EnsureFolderDto {
                album_artist,
                album_name,
                year,
                download_dir: &dir_str,
            })
            .send()
            .await
            .context("ensure-album-folder request failed")?;
        let result: EnsureFolderResultDto = resp
            .json()
            .await
            .context("invalid ensure-album-folder response")?;

        if result.success {
            Ok(result.folder_path.map(PathBuf::from))
        } else {
            warn!(
                album = %album_name,
                error = result.error.as_deref().unwrap_or("unknown"),
                "Could not create album folder"
            );
            Ok(None)
        }
    }

    /// Album-level metadata (year, cover art) shared by every track.
    pub async fn fetch_album_metadata(&self, track_id: &str) -> Result<AlbumMetadata> {
        let resp = self
            .client
            .get(self.url(&format!("/album-metadata/{track_id}")))
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .context("album-metadata request failed")?;
        resp.json().await.context("invalid album-metadata response")
    }

    /// Searches queued on the bridge, oldest first.
    pub async fn fetch_pending(&self) -> Result<Vec<PendingSearch>> {
        let resp = self
            .client
            .get(self.url("/pending"))
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .context("pending request failed")?;
        let body: PendingResponseDto = resp.json().await.context("invalid pending response")?;
        Ok(body.searches)
    }

    /// Acknowledge a pending search so the bridge stops re-serving it.
    pub async fn mark_processed(&self, timestamp: f64) -> Result<bool> {
        let resp = self
            .client
            .post(self.url("/mark-processed"))
            .timeout(Duration::from_secs(30))
            .json(&serde_json::json!({ "timestamp": timestamp }))
            .send()
            .await
            .context("mark-processed request failed")?;
        let body: serde_json::Value = resp.json().await.unwrap_or_default();
        Ok(body
            .get("success")
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    /// Fire-and-forget per-transfer progress push. Failures are expected
    /// whenever the bridge is busy processing; they only get a debug line.
    pub async fn report_progress(
        &self,
        token: &str,
        file: &str,
        bytes_transferred: u64,
        total_size: u64,
    ) {
        let result = self
            .client
            .post(self.url("/progress"))
            .timeout(Duration::from_secs(2))
            .json(&serde_json::json!({
                "token": token,
                "file": file,
                "bytes_transferred": bytes_transferred,
                "total_size": total_size,
            }))
            .send()
            .await;
        if let Err(e) = result {
            debug!(token, error = %e, "Progress push dropped");
        }
    }
}

/// Connection refused/reset/aborted: the bridge process died. Timeouts and
/// HTTP-level failures are not crashes.
fn is_connection_drop(err: &reqwest::Error) -> bool {
    if err.is_timeout() {
        return false;
    }
    if err.is_connect() {
        return true;
    }
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            );
        }
        source = std::error::Error::source(inner);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_search_parsing() {
        let json = r#"{
            "searches": [
                {
                    "timestamp": 1724668800.5,
                    "type": "track",
                    "query": "eagles hotel california",
                    "artist": "Eagles",
                    "track": "Hotel California",
                    "album": "Hotel California",
                    "track_id": "abc123",
                    "duration": 391,
                    "auto_download": true,
                    "format_preference": "mp3"
                },
                {
                    "timestamp": 1724668900.0,
                    "type": "album",
                    "query": "eagles hotel california",
                    "album_id": "alb1",
                    "album_name": "Hotel California",
                    "album_artist": "Eagles",
                    "year": "1976",
                    "auto_download": true,
                    "tracks": [
                        {"track_number": 1, "artist": "Eagles", "track": "Hotel California",
                         "album": "Hotel California", "track_id": "t1", "duration_secs": 391}
                    ]
                }
            ]
        }"#;

        let parsed: PendingResponseDto = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.searches.len(), 2);

        let track = &parsed.searches[0];
        assert!(!track.is_album());
        assert!(track.auto_download);
        assert!(track.metadata_override);
        assert_eq!(track.track_target().duration_secs, 391);

        let album = &parsed.searches[1];
        assert!(album.is_album());
        let target = album.album_target();
        assert_eq!(target.tracks.len(), 1);
        assert_eq!(target.year.as_deref(), Some("1976"));
    }

    #[test]
    fn test_process_dto_omits_absent_fields() {
        let dto = ProcessMetadataDto {
            file_path: "/downloads/song.mp3",
            artist: "Eagles",
            track: "Hotel California",
            album: "Hotel California",
            track_id: "abc",
            track_number: None,
            prefetched_year: None,
            prefetched_image_url: None,
            target_folder: None,
        };
        let json = serde_json::to_string(&dto).unwrap();
        assert!(!json.contains("track_number"));
        assert!(!json.contains("target_folder"));
        assert!(json.contains("file_path"));
    }
}
