//! Peer-network client abstraction
//!
//! The engine never speaks the Soulseek protocol itself; it drives a client
//! daemon through this trait and consumes the daemon's search-response and
//! download-completion events. The concrete implementation lives in
//! [`slskd`]; tests substitute a mock.

pub mod slskd;

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Opaque token identifying one outstanding network search.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchToken(pub String);

impl fmt::Display for SearchToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Attributes a peer reports alongside a shared file. Both fields are
/// frequently absent or zero; scoring falls back to filename heuristics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttributes {
    pub bitrate: Option<u32>,
    pub duration_secs: Option<u32>,
}

/// One file offered by a peer in a search response. `name` is the full
/// virtual path on the peer's share.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedFile {
    pub name: String,
    pub size: u64,
    #[serde(default)]
    pub attributes: FileAttributes,
}

/// Identity of one transfer, stable across queue/abort/completion.
///
/// Peer and virtual path together are the daemon's natural key; keeping them
/// as a typed pair avoids the collision bugs of string concatenation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferKey {
    pub peer: String,
    pub virtual_path: String,
}

impl TransferKey {
    pub fn new(peer: impl Into<String>, virtual_path: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            virtual_path: virtual_path.into(),
        }
    }
}

impl fmt::Display for TransferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.peer, self.virtual_path)
    }
}

/// Daemon-reported state of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    Queued,
    InProgress,
    Completed,
    UserLoggedOff,
    ConnectionClosed,
    ConnectionTimeout,
    Filtered,
    Cancelled,
}

impl TransferStatus {
    /// Terminal failure states: the transfer will never make progress again.
    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self,
            TransferStatus::UserLoggedOff
                | TransferStatus::ConnectionClosed
                | TransferStatus::ConnectionTimeout
                | TransferStatus::Filtered
                | TransferStatus::Cancelled
        )
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStatus::Queued => write!(f, "queued"),
            TransferStatus::InProgress => write!(f, "in_progress"),
            TransferStatus::Completed => write!(f, "completed"),
            TransferStatus::UserLoggedOff => write!(f, "user_logged_off"),
            TransferStatus::ConnectionClosed => write!(f, "connection_closed"),
            TransferStatus::ConnectionTimeout => write!(f, "connection_timeout"),
            TransferStatus::Filtered => write!(f, "filtered"),
            TransferStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Point-in-time view of one transfer, polled by the liveness monitor.
#[derive(Debug, Clone)]
pub struct TransferSnapshot {
    pub key: TransferKey,
    pub bytes_transferred: u64,
    pub total_size: u64,
    pub status: TransferStatus,
}

/// A peer's batch of results for one search token.
#[derive(Debug, Clone)]
pub struct SearchResponseEvent {
    pub token: SearchToken,
    pub peer: String,
    pub files: Vec<SharedFile>,
    /// Peer upload speed in bytes/sec, zero when unknown.
    pub upload_speed: u64,
}

/// Fired once by the daemon when a transfer fully completes on disk.
#[derive(Debug, Clone)]
pub struct DownloadCompleteEvent {
    pub peer: String,
    pub virtual_path: String,
    pub local_path: PathBuf,
}

/// Inbound events consumed by the acquisition engine.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    SearchResponse(SearchResponseEvent),
    DownloadComplete(DownloadCompleteEvent),
}

/// Errors from the client daemon.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("daemon rejected request: {status} {message}")]
    Api { status: u16, message: String },
}

/// Operations the engine needs from the peer-network daemon.
///
/// Network calls happen outside session locks; implementations must be safe
/// to call concurrently. Cancellation is advisory: aborting a transfer may
/// race with its natural completion, which the engine's winner arbitration
/// tolerates.
#[async_trait]
pub trait SoulseekClient: Send + Sync {
    /// Submit a network-wide search. The daemon may allocate the token
    /// asynchronously and return nothing; callers recover it through
    /// [`recent_search_tokens`](Self::recent_search_tokens).
    async fn submit_search(&self, query: &str) -> Result<Option<SearchToken>, ClientError>;

    /// Tokens of searches the daemon currently knows, newest last.
    async fn recent_search_tokens(&self) -> Result<Vec<SearchToken>, ClientError>;

    async fn enqueue_download(
        &self,
        peer: &str,
        virtual_path: &str,
        size: u64,
        attributes: FileAttributes,
    ) -> Result<(), ClientError>;

    /// Stop a transfer, leaving it visible in the daemon's queue.
    async fn abort_transfer(&self, key: &TransferKey) -> Result<(), ClientError>;

    /// Remove a transfer from the daemon's queue entirely. Preferred over
    /// [`abort_transfer`](Self::abort_transfer) when available.
    async fn clear_transfer(&self, key: &TransferKey) -> Result<(), ClientError>;

    async fn transfer_snapshots(&self) -> Result<Vec<TransferSnapshot>, ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_failure_statuses() {
        assert!(TransferStatus::UserLoggedOff.is_terminal_failure());
        assert!(TransferStatus::ConnectionClosed.is_terminal_failure());
        assert!(TransferStatus::ConnectionTimeout.is_terminal_failure());
        assert!(TransferStatus::Filtered.is_terminal_failure());
        assert!(TransferStatus::Cancelled.is_terminal_failure());

        assert!(!TransferStatus::Queued.is_terminal_failure());
        assert!(!TransferStatus::InProgress.is_terminal_failure());
        assert!(!TransferStatus::Completed.is_terminal_failure());
    }

    #[test]
    fn test_transfer_key_identity() {
        let a = TransferKey::new("alice", "Music\\song.mp3");
        let b = TransferKey::new("alice", "Music\\song.mp3");
        let c = TransferKey::new("bob", "Music\\song.mp3");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string(), "alice:Music\\song.mp3");
    }
}
