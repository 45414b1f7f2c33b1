//! HTTP client for a slskd-style Soulseek daemon
//!
//! Thin REST wrapper plus an event pump that adapts the daemon's polled
//! search-response and transfer lists into the engine's event stream.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    ClientError, DownloadCompleteEvent, FileAttributes, NetworkEvent, SearchResponseEvent,
    SearchToken, SharedFile, SoulseekClient, TransferKey, TransferSnapshot, TransferStatus,
};

/// REST client for the daemon's API.
pub struct SlskdClient {
    base_url: String,
    api_key: String,
    client: Client,
}

impl SlskdClient {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            base_url,
            api_key,
            client: Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v0{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        if resp.status().is_success() {
            Ok(resp)
        } else {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            Err(ClientError::Api { status, message })
        }
    }

    /// Fetch every peer response the daemon has collected for a search.
    pub async fn search_responses(
        &self,
        token: &SearchToken,
    ) -> Result<Vec<SearchResponseEvent>, ClientError> {
        let url = self.url(&format!("/searches/{}/responses", token));
        let resp = self
            .client
            .get(&url)
            .header("X-API-Key", &self.api_key)
            .send()
            .await?;
        let responses: Vec<SearchResponseDto> = Self::check(resp).await?.json().await?;

        Ok(responses
            .into_iter()
            .map(|r| SearchResponseEvent {
                token: token.clone(),
                peer: r.username,
                upload_speed: r.upload_speed,
                files: r
                    .files
                    .into_iter()
                    .map(|f| SharedFile {
                        name: f.filename,
                        size: f.size,
                        attributes: FileAttributes {
                            bitrate: f.bit_rate.filter(|b| *b > 0),
                            duration_secs: f.length.filter(|l| *l > 0),
                        },
                    })
                    .collect(),
            })
            .collect())
    }

    async fn list_downloads(&self) -> Result<Vec<DownloadDto>, ClientError> {
        let url = self.url("/transfers/downloads");
        let resp = self
            .client
            .get(&url)
            .header("X-API-Key", &self.api_key)
            .send()
            .await?;
        Self::check(resp).await?.json().await.map_err(Into::into)
    }

    /// Find the daemon-side id for a transfer, needed by cancel endpoints.
    async fn find_download_id(&self, key: &TransferKey) -> Result<Option<String>, ClientError> {
        let downloads = self.list_downloads().await?;
        Ok(downloads
            .into_iter()
            .find(|d| d.username == key.peer && d.filename == key.virtual_path)
            .map(|d| d.id))
    }

    async fn cancel(&self, key: &TransferKey, remove: bool) -> Result<(), ClientError> {
        let Some(id) = self.find_download_id(key).await? else {
            // Already gone from the daemon's queue; nothing to do.
            debug!(transfer = %key, "Transfer not found in daemon queue, skipping cancel");
            return Ok(());
        };
        let url = self.url(&format!(
            "/transfers/downloads/{}/{}?remove={}",
            key.peer, id, remove
        ));
        let resp = self
            .client
            .delete(&url)
            .header("X-API-Key", &self.api_key)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl SoulseekClient for SlskdClient {
    async fn submit_search(&self, query: &str) -> Result<Option<SearchToken>, ClientError> {
        let url = self.url("/searches");
        let resp = self
            .client
            .post(&url)
            .header("X-API-Key", &self.api_key)
            .json(&SubmitSearchDto {
                search_text: query.to_string(),
            })
            .send()
            .await?;
        let resp = Self::check(resp).await?;

        // The daemon may accept the search without a body and allocate the
        // token asynchronously.
        match resp.json::<SearchCreatedDto>().await {
            Ok(created) => Ok(Some(SearchToken(created.id))),
            Err(_) => Ok(None),
        }
    }

    async fn recent_search_tokens(&self) -> Result<Vec<SearchToken>, ClientError> {
        let url = self.url("/searches");
        let resp = self
            .client
            .get(&url)
            .header("X-API-Key", &self.api_key)
            .send()
            .await?;
        let searches: Vec<SearchCreatedDto> = Self::check(resp).await?.json().await?;
        Ok(searches.into_iter().map(|s| SearchToken(s.id)).collect())
    }

    async fn enqueue_download(
        &self,
        peer: &str,
        virtual_path: &str,
        size: u64,
        _attributes: FileAttributes,
    ) -> Result<(), ClientError> {
        let url = self.url(&format!("/transfers/downloads/{}", peer));
        let resp = self
            .client
            .post(&url)
            .header("X-API-Key", &self.api_key)
            .json(&vec![EnqueueDto {
                filename: virtual_path.to_string(),
                size,
            }])
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn abort_transfer(&self, key: &TransferKey) -> Result<(), ClientError> {
        self.cancel(key, false).await
    }

    async fn clear_transfer(&self, key: &TransferKey) -> Result<(), ClientError> {
        self.cancel(key, true).await
    }

    async fn transfer_snapshots(&self) -> Result<Vec<TransferSnapshot>, ClientError> {
        let downloads = self.list_downloads().await?;
        Ok(downloads
            .into_iter()
            .map(|d| TransferSnapshot {
                key: TransferKey::new(d.username, d.filename),
                bytes_transferred: d.bytes_transferred,
                total_size: d.size,
                status: parse_state(&d.state),
            })
            .collect())
    }
}

fn parse_state(state: &str) -> TransferStatus {
    // Daemon states are comma-qualified, e.g. "Completed, Succeeded" or
    // "Completed, Errored, ConnectionClosed".
    let lower = state.to_lowercase();
    if lower.contains("succeeded") {
        TransferStatus::Completed
    } else if lower.contains("cancelled") {
        TransferStatus::Cancelled
    } else if lower.contains("loggedoff") || lower.contains("logged_off") {
        TransferStatus::UserLoggedOff
    } else if lower.contains("timedout") || lower.contains("timeout") {
        TransferStatus::ConnectionTimeout
    } else if lower.contains("connectionclosed") || lower.contains("errored") {
        TransferStatus::ConnectionClosed
    } else if lower.contains("filtered") || lower.contains("rejected") {
        TransferStatus::Filtered
    } else if lower.contains("inprogress") || lower.contains("transferring") {
        TransferStatus::InProgress
    } else {
        TransferStatus::Queued
    }
}

/// Poll the daemon and forward new search responses and freshly completed
/// downloads as events. Responses are deduplicated per (token, peer) and
/// completions per transfer key; the engine drops events for tokens it no
/// longer tracks.
pub fn spawn_event_pump(
    client: Arc<SlskdClient>,
    tx: mpsc::Sender<NetworkEvent>,
    poll_interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut seen_responses: HashMap<SearchToken, HashSet<String>> = HashMap::new();
        let mut seen_completions: HashSet<TransferKey> = HashSet::new();
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;

            let tokens = match client.recent_search_tokens().await {
                Ok(t) => t,
                Err(e) => {
                    warn!(job = "event_pump", error = %e, "Failed to list searches");
                    continue;
                }
            };
            // Drop dedupe state for searches the daemon has forgotten.
            seen_responses.retain(|t, _| tokens.contains(t));

            for token in &tokens {
                let responses = match client.search_responses(token).await {
                    Ok(r) => r,
                    Err(e) => {
                        debug!(job = "event_pump", token = %token, error = %e, "Failed to fetch responses");
                        continue;
                    }
                };
                let seen = seen_responses.entry(token.clone()).or_default();
                for response in responses {
                    if !seen.insert(response.peer.clone()) {
                        continue;
                    }
                    if tx
                        .send(NetworkEvent::SearchResponse(response))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }

            let downloads = match client.list_downloads().await {
                Ok(d) => d,
                Err(e) => {
                    warn!(job = "event_pump", error = %e, "Failed to list downloads");
                    continue;
                }
            };
            for download in downloads {
                if parse_state(&download.state) != TransferStatus::Completed {
                    continue;
                }
                let key = TransferKey::new(download.username.clone(), download.filename.clone());
                if !seen_completions.insert(key) {
                    continue;
                }
                let Some(local) = download.local_filename else {
                    continue;
                };
                let event = DownloadCompleteEvent {
                    peer: download.username,
                    virtual_path: download.filename,
                    local_path: PathBuf::from(local),
                };
                if tx
                    .send(NetworkEvent::DownloadComplete(event))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitSearchDto {
    search_text: String,
}

#[derive(Deserialize)]
struct SearchCreatedDto {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponseDto {
    username: String,
    #[serde(default)]
    upload_speed: u64,
    #[serde(default)]
    files: Vec<SearchFileDto>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchFileDto {
    filename: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    bit_rate: Option<u32>,
    #[serde(default)]
    length: Option<u32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EnqueueDto {
    filename: String,
    size: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadDto {
    id: String,
    username: String,
    filename: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    bytes_transferred: u64,
    #[serde(default)]
    state: String,
    #[serde(default)]
    local_filename: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_state_variants() {
        assert_eq!(parse_state("Completed, Succeeded"), TransferStatus::Completed);
        assert_eq!(parse_state("Completed, Cancelled"), TransferStatus::Cancelled);
        assert_eq!(
            parse_state("Completed, Errored, ConnectionClosed"),
            TransferStatus::ConnectionClosed
        );
        assert_eq!(parse_state("InProgress"), TransferStatus::InProgress);
        assert_eq!(parse_state("Queued, Remotely"), TransferStatus::Queued);
        assert_eq!(parse_state("Completed, TimedOut"), TransferStatus::ConnectionTimeout);
    }
}
