// src/models.rs

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Browser-like User-Agent sent with every request. Some origins refuse
/// requests without one.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/108.0.0.0 Safari/537.36";

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Everything the engine needs to know about one transfer.
///
/// A request is immutable once handed to the engine. A pre-existing file at
/// `output_path` is overwritten, so the caller must confirm that with the
/// user before starting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    pub output_path: PathBuf,
    pub thread_count: usize,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub user_agent: String,
    /// Bytes per second across all chunks. 0 disables the limiter.
    pub speed_limit: u64,
    /// Skip TLS peer verification. Off by default; only enable for origins
    /// with broken certificates.
    pub insecure_tls: bool,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, output_path: impl Into<PathBuf>, thread_count: usize) -> Self {
        Self {
            url: url.into(),
            output_path: output_path.into(),
            thread_count: thread_count.max(1),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            speed_limit: 0,
            insecure_tls: false,
        }
    }

    /// Path of the part file holding chunk `id`,
    /// e.g. "/path/to/file.zip" becomes "/path/to/file.zip.part0".
    pub fn part_path(&self, id: usize) -> PathBuf {
        part_path_for(&self.output_path, id)
    }
}

pub(crate) fn part_path_for(output: &Path, id: usize) -> PathBuf {
    PathBuf::from(format!("{}.part{}", output.to_string_lossy(), id))
}

/// What the probe learned about the origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginCapability {
    /// Total size of the resource, if the origin reported a usable one.
    pub content_length: Option<u64>,
    /// True iff the origin answered the range test with 206 Partial Content.
    pub supports_ranges: bool,
    /// Effective URL after redirects.
    pub final_url: String,
    pub content_type: Option<String>,
}

impl OriginCapability {
    /// The content length, but only when the origin can actually serve
    /// ranges, i.e. when a multi-chunk download is possible.
    pub fn rangeable_length(&self) -> Option<u64> {
        match (self.content_length, self.supports_ranges) {
            (Some(len), true) => Some(len),
            _ => None,
        }
    }
}

/// One contiguous byte range `[start, end]` (inclusive) of the remote
/// resource, assigned to a single fetcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: usize,
    pub start: u64,
    pub end: u64,
}

impl Chunk {
    /// Number of bytes this chunk spans. Always at least one.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// A point-in-time view of the transfer, emitted to the observer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub downloaded: u64,
    /// None while streaming from an origin that did not report a length.
    pub total: Option<u64>,
    pub speed_bps: f64,
    /// 0..100, or None when the total is unknown.
    pub percentage: Option<f64>,
    pub elapsed: Duration,
}

/// Lifecycle of a single transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    Idle,
    Probing,
    Planning,
    Fetching,
    Merging,
    Done,
    Failed,
    Cancelled,
}

impl EngineState {
    /// States from which a new transfer may begin.
    pub fn can_begin(&self) -> bool {
        matches!(
            self,
            EngineState::Idle | EngineState::Done | EngineState::Failed | EngineState::Cancelled
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineState::Done | EngineState::Failed | EngineState::Cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_path_appends_id_to_full_name() {
        let req = DownloadRequest::new("http://example.com/f.zip", "/tmp/f.zip", 4);
        assert_eq!(req.part_path(0), PathBuf::from("/tmp/f.zip.part0"));
        assert_eq!(req.part_path(3), PathBuf::from("/tmp/f.zip.part3"));
    }

    #[test]
    fn thread_count_is_at_least_one() {
        let req = DownloadRequest::new("http://example.com/f", "/tmp/f", 0);
        assert_eq!(req.thread_count, 1);
    }

    #[test]
    fn rangeable_length_requires_both() {
        let mut cap = OriginCapability {
            content_length: Some(100),
            supports_ranges: true,
            final_url: "http://example.com/f".into(),
            content_type: None,
        };
        assert_eq!(cap.rangeable_length(), Some(100));
        cap.supports_ranges = false;
        assert_eq!(cap.rangeable_length(), None);
        cap.supports_ranges = true;
        cap.content_length = None;
        assert_eq!(cap.rangeable_length(), None);
    }

    #[test]
    fn state_machine_edges() {
        assert!(EngineState::Idle.can_begin());
        assert!(EngineState::Done.can_begin());
        assert!(EngineState::Failed.can_begin());
        assert!(!EngineState::Fetching.can_begin());
        assert!(!EngineState::Probing.can_begin());
        assert!(EngineState::Cancelled.is_terminal());
        assert!(!EngineState::Merging.is_terminal());
    }

    #[test]
    fn chunk_len_is_inclusive() {
        let c = Chunk { id: 0, start: 0, end: 0 };
        assert_eq!(c.len(), 1);
        let c = Chunk { id: 1, start: 10, end: 19 };
        assert_eq!(c.len(), 10);
    }
}
