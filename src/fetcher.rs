// src/fetcher.rs

use crate::client::{ClientError, HttpClient};
use crate::limiter::SpeedLimiter;
use crate::models::Chunk;
use crate::progress::{DownloadObserver, ProgressAggregator};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs::File;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(8);

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("origin ignored the range request (http {status})")]
    RangeIgnored { status: u16 },
    #[error("length mismatch: expected {expected} bytes, wrote {actual}")]
    LengthMismatch { expected: u64, actual: u64 },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("chunk cancelled")]
    Cancelled,
}

impl ChunkError {
    /// Transient failures earn another attempt; everything else is
    /// permanent for this transfer. An origin answering 200 to a range
    /// request will keep doing so, hence `RangeIgnored` is permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            ChunkError::Client(ClientError::Timeout) => true,
            ChunkError::Client(ClientError::Network(_)) => true,
            ChunkError::Client(ClientError::Status(code)) => {
                matches!(code, 408 | 429) || (500..600).contains(code)
            }
            _ => false,
        }
    }
}

/// Outcome of one chunk, reported to the engine regardless of success.
#[derive(Debug)]
pub struct ChunkResult {
    pub id: usize,
    pub bytes_written: u64,
    pub part_path: PathBuf,
    pub outcome: Result<(), ChunkError>,
}

/// Shared state handed to every fetcher of one transfer. The engine owns
/// the original for the lifetime of the worker pool; each worker gets a
/// clone, so nothing here outlives the pool.
#[derive(Clone)]
pub struct FetchContext {
    pub client: HttpClient,
    pub url: String,
    pub aggregator: Arc<ProgressAggregator>,
    pub observer: Arc<dyn DownloadObserver>,
    pub limiter: Option<SpeedLimiter>,
    pub cancel: CancellationToken,
    pub max_attempts: u32,
}

/// Downloads one chunk into its part file, retrying transient failures
/// with exponential backoff. Every attempt truncates the part file and
/// retracts the previous attempt's bytes from the aggregator, so the
/// global counter is exact when the transfer completes.
pub async fn fetch_chunk(ctx: &FetchContext, chunk: Chunk, part_path: PathBuf) -> ChunkResult {
    let mut attempt = 1;
    loop {
        if ctx.cancel.is_cancelled() {
            return result(chunk.id, part_path, 0, Err(ChunkError::Cancelled));
        }

        match fetch_once(ctx, chunk, &part_path).await {
            Ok(bytes) => return result(chunk.id, part_path, bytes, Ok(())),
            Err(ChunkError::Cancelled) => {
                return result(chunk.id, part_path, 0, Err(ChunkError::Cancelled));
            }
            Err(err) if err.is_transient() && attempt < ctx.max_attempts => {
                let delay = backoff(attempt);
                warn!(chunk = chunk.id, attempt, error = %err, "chunk attempt failed, retrying");
                ctx.observer.log(&format!(
                    "chunk {}: attempt {} failed ({}), retrying in {:.1}s",
                    chunk.id,
                    attempt,
                    err,
                    delay.as_secs_f64()
                ));
                attempt += 1;
                tokio::select! {
                    _ = ctx.cancel.cancelled() => {
                        return result(chunk.id, part_path, 0, Err(ChunkError::Cancelled));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(err) => return result(chunk.id, part_path, 0, Err(err)),
        }
    }
}

fn result(id: usize, part_path: PathBuf, bytes_written: u64, outcome: Result<(), ChunkError>) -> ChunkResult {
    ChunkResult {
        id,
        bytes_written,
        part_path,
        outcome,
    }
}

async fn fetch_once(ctx: &FetchContext, chunk: Chunk, part_path: &Path) -> Result<u64, ChunkError> {
    let expected = chunk.len();
    let mut file = File::create(part_path).await?;

    let mut seen = 0u64;
    let outcome = {
        let aggregator = &ctx.aggregator;
        let cancel = &ctx.cancel;
        let on_bytes = |running: u64| {
            aggregator.add(running - seen);
            seen = running;
            !cancel.is_cancelled()
        };
        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(ClientError::Aborted),
            res = ctx.client.get(
                &ctx.url,
                Some((chunk.start, chunk.end)),
                206,
                &mut file,
                ctx.limiter.as_ref(),
                on_bytes,
            ) => res,
        }
    };

    match outcome {
        Ok(got) if got.status != 206 => {
            // Nothing was streamed for a mismatched status.
            Err(ChunkError::RangeIgnored { status: got.status })
        }
        Ok(got) if got.bytes_written != expected => {
            ctx.aggregator.retract(seen);
            Err(ChunkError::LengthMismatch {
                expected,
                actual: got.bytes_written,
            })
        }
        Ok(got) => Ok(got.bytes_written),
        Err(ClientError::Aborted) => {
            ctx.aggregator.retract(seen);
            Err(ChunkError::Cancelled)
        }
        Err(err) => {
            ctx.aggregator.retract(seen);
            Err(ChunkError::Client(err))
        }
    }
}

fn backoff(attempt: u32) -> Duration {
    let factor = 1u32 << (attempt - 1).min(6);
    (BACKOFF_BASE * factor).min(BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff(1), Duration::from_millis(500));
        assert_eq!(backoff(2), Duration::from_secs(1));
        assert_eq!(backoff(3), Duration::from_secs(2));
        assert_eq!(backoff(10), BACKOFF_CAP);
    }

    #[test]
    fn transient_classification() {
        assert!(ChunkError::Client(ClientError::Timeout).is_transient());
        assert!(ChunkError::Client(ClientError::Status(503)).is_transient());
        assert!(ChunkError::Client(ClientError::Status(429)).is_transient());
        assert!(ChunkError::Client(ClientError::Status(408)).is_transient());
        assert!(!ChunkError::Client(ClientError::Status(404)).is_transient());
        assert!(!ChunkError::Client(ClientError::Status(403)).is_transient());
        assert!(!ChunkError::RangeIgnored { status: 200 }.is_transient());
        assert!(!ChunkError::LengthMismatch { expected: 10, actual: 5 }.is_transient());
        assert!(!ChunkError::Cancelled.is_transient());
    }
}
