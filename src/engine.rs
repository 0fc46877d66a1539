// src/engine.rs

use crate::client::{ClientError, HttpClient};
use crate::fetcher::{self, ChunkError, ChunkResult, FetchContext, DEFAULT_MAX_ATTEMPTS};
use crate::limiter::SpeedLimiter;
use crate::merge::{self, MergeError};
use crate::models::{DownloadRequest, EngineState};
use crate::plan::plan_chunks;
use crate::probe;
use crate::progress::{DownloadObserver, ProgressAggregator, DEFAULT_TICK};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::fs::File;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    #[error("another transfer is already running")]
    Busy,
    #[error("chunk {id} failed: {source}")]
    ChunkFailed {
        id: usize,
        #[source]
        source: ChunkError,
    },
    #[error("length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: u64, actual: u64 },
    #[error("merge failed: {0}")]
    Merge(#[from] MergeError),
    #[error("download cancelled")]
    Cancelled,
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A poisoned lock only means another thread panicked mid-update; the
/// engine state is a single enum, so the value is still usable.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Orchestrates one transfer at a time: probe, plan, fetch, merge, with a
/// single-stream fallback for origins that cannot serve ranges.
///
/// All outcomes reach the observer: throttled `progress` snapshots during
/// the fetch, `log` lines for the interesting transitions and a single
/// `finished` event at the end.
pub struct DownloadEngine {
    observer: Arc<dyn DownloadObserver>,
    state: Mutex<EngineState>,
    cancel: Mutex<CancellationToken>,
    tick: Duration,
    max_attempts: u32,
}

impl DownloadEngine {
    pub fn new(observer: Arc<dyn DownloadObserver>) -> Self {
        Self {
            observer,
            state: Mutex::new(EngineState::Idle),
            cancel: Mutex::new(CancellationToken::new()),
            tick: DEFAULT_TICK,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Overrides the progress emission interval.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn state(&self) -> EngineState {
        *lock(&self.state)
    }

    /// Requests cancellation of the active transfer. Idempotent; safe to
    /// call from any thread at any time.
    pub fn cancel(&self) {
        lock(&self.cancel).cancel();
    }

    /// Begins a transfer in the background and returns immediately.
    ///
    /// Fails fast with `Busy` while another transfer is active and with
    /// `InvalidRequest` for an unusable request; every later outcome is
    /// reported through the observer's `finished` event.
    pub fn start(self: &Arc<Self>, request: DownloadRequest) -> Result<JoinHandle<()>, EngineError> {
        validate(&request)?;
        let token = self.try_begin()?;
        let engine = self.clone();
        Ok(tokio::spawn(async move {
            let _ = engine.run_claimed(request, token).await;
        }))
    }

    /// Runs a transfer to completion on the caller's task. Same contract
    /// as `start`, but the result is also returned.
    pub async fn download(&self, request: DownloadRequest) -> Result<(), EngineError> {
        validate(&request)?;
        let token = self.try_begin()?;
        self.run_claimed(request, token).await
    }

    /// Claims the engine for a new transfer, atomically with respect to
    /// concurrent starts, and arms a fresh cancellation token so an old
    /// `cancel()` cannot leak into this run.
    fn try_begin(&self) -> Result<CancellationToken, EngineError> {
        let mut state = lock(&self.state);
        if !state.can_begin() {
            return Err(EngineError::Busy);
        }
        *state = EngineState::Probing;
        let token = CancellationToken::new();
        *lock(&self.cancel) = token.clone();
        Ok(token)
    }

    fn set_state(&self, next: EngineState) {
        let mut state = lock(&self.state);
        debug!(from = ?*state, to = ?next, "engine state");
        *state = next;
    }

    async fn run_claimed(
        &self,
        request: DownloadRequest,
        token: CancellationToken,
    ) -> Result<(), EngineError> {
        let started = Instant::now();
        match self.drive(&request, token).await {
            Ok(bytes) => {
                self.set_state(EngineState::Done);
                let message = format!(
                    "downloaded {} bytes in {:.1}s",
                    bytes,
                    started.elapsed().as_secs_f64()
                );
                info!(bytes, url = %request.url, "transfer complete");
                self.observer.finished(true, &message);
                Ok(())
            }
            Err(err) => {
                let cancelled = matches!(err, EngineError::Cancelled);
                self.cleanup(&request).await;
                self.set_state(if cancelled {
                    EngineState::Cancelled
                } else {
                    EngineState::Failed
                });
                warn!(error = %err, url = %request.url, "transfer did not complete");
                self.observer.finished(false, &err.to_string());
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        request: &DownloadRequest,
        token: CancellationToken,
    ) -> Result<u64, EngineError> {
        let client = HttpClient::new(request)?;
        self.observer.log(&format!("probing {}", request.url));

        let capability = match probe::probe_origin(&client, &request.url).await {
            Ok(cap) => Some(cap),
            Err(err) => {
                warn!(error = %err, "probe failed, using single-stream fallback");
                self.observer
                    .log(&format!("probe failed ({err}), falling back to a single stream"));
                None
            }
        };

        if token.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        match capability {
            Some(cap) => match cap.rangeable_length() {
                Some(length) if request.thread_count > 1 => {
                    self.observer.log(&format!(
                        "origin supports ranges, {} bytes, fetching with {} chunks",
                        length,
                        request.thread_count.min(length.max(1) as usize)
                    ));
                    self.multi_fetch(request, &client, &cap.final_url, length, token)
                        .await
                }
                Some(_) => {
                    self.observer.log("single stream requested");
                    self.single_fetch(request, &client, &cap.final_url, cap.content_length, token)
                        .await
                }
                None => {
                    self.observer
                        .log("origin cannot serve ranges, using a single stream");
                    self.single_fetch(request, &client, &cap.final_url, cap.content_length, token)
                        .await
                }
            },
            None => {
                self.single_fetch(request, &client, &request.url, None, token)
                    .await
            }
        }
    }

    async fn multi_fetch(
        &self,
        request: &DownloadRequest,
        client: &HttpClient,
        url: &str,
        length: u64,
        token: CancellationToken,
    ) -> Result<u64, EngineError> {
        self.set_state(EngineState::Planning);
        // The probe never reports a rangeable length of zero, so the plan
        // holds at least one chunk.
        let plan = plan_chunks(length, request.thread_count);
        let chunk_count = plan.len();
        for chunk in &plan {
            debug!(id = chunk.id, start = chunk.start, end = chunk.end, "planned chunk");
            self.observer.log(&format!(
                "chunk {}: bytes {}-{} ({} bytes)",
                chunk.id,
                chunk.start,
                chunk.end,
                chunk.len()
            ));
        }

        self.set_state(EngineState::Fetching);
        let aggregator = Arc::new(ProgressAggregator::new(
            self.observer.clone(),
            Some(length),
            self.tick,
        ));
        let ctx = FetchContext {
            client: client.clone(),
            url: url.to_string(),
            aggregator: aggregator.clone(),
            observer: self.observer.clone(),
            limiter: (request.speed_limit > 0).then(|| SpeedLimiter::new(request.speed_limit)),
            cancel: token.clone(),
            max_attempts: self.max_attempts,
        };

        let mut handles = Vec::with_capacity(chunk_count);
        for chunk in plan {
            let ctx = ctx.clone();
            let part_path = request.part_path(chunk.id);
            handles.push(tokio::spawn(async move {
                let result = fetcher::fetch_chunk(&ctx, chunk, part_path).await;
                if let Err(err) = &result.outcome {
                    // The first real failure tears the whole pool down;
                    // peers notice on their next stream item.
                    if !matches!(err, ChunkError::Cancelled) {
                        ctx.observer
                            .log(&format!("chunk {} failed: {err}", result.id));
                        ctx.cancel.cancel();
                    }
                }
                result
            }));
        }

        // Collect every worker before looking at any outcome, so no fetcher
        // survives beyond this call.
        let mut results: Vec<ChunkResult> = Vec::with_capacity(chunk_count);
        let mut join_failure: Option<std::io::Error> = None;
        for handle in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(err) => {
                    token.cancel();
                    join_failure = Some(std::io::Error::other(err));
                }
            }
        }
        if let Some(err) = join_failure {
            return Err(EngineError::Io(err));
        }

        let mut failures: Vec<(usize, ChunkError)> = Vec::new();
        let mut saw_cancelled = false;
        for result in results {
            match result.outcome {
                Ok(()) => {}
                Err(ChunkError::Cancelled) => saw_cancelled = true,
                Err(err) => failures.push((result.id, err)),
            }
        }
        if let Some((id, source)) = failures.into_iter().min_by_key(|(id, _)| *id) {
            return Err(EngineError::ChunkFailed { id, source });
        }
        if saw_cancelled || token.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        aggregator.emit_now();
        debug_assert_eq!(aggregator.downloaded(), length);

        self.set_state(EngineState::Merging);
        self.observer.log("all chunks complete, merging part files");
        let parts: Vec<PathBuf> = (0..chunk_count).map(|id| request.part_path(id)).collect();
        let total = merge::merge_parts(&request.output_path, &parts).await?;
        Ok(total)
    }

    async fn single_fetch(
        &self,
        request: &DownloadRequest,
        client: &HttpClient,
        url: &str,
        total: Option<u64>,
        token: CancellationToken,
    ) -> Result<u64, EngineError> {
        self.set_state(EngineState::Fetching);
        let aggregator = ProgressAggregator::new(self.observer.clone(), total, self.tick);
        let limiter = (request.speed_limit > 0).then(|| SpeedLimiter::new(request.speed_limit));

        let mut file = File::create(&request.output_path).await?;
        let mut seen = 0u64;
        let outcome = {
            let cancel = &token;
            let on_bytes = |running: u64| {
                aggregator.add(running - seen);
                seen = running;
                !cancel.is_cancelled()
            };
            tokio::select! {
                _ = token.cancelled() => Err(ClientError::Aborted),
                res = client.get(url, None, 200, &mut file, limiter.as_ref(), on_bytes) => res,
            }
        };

        match outcome {
            Ok(got) if got.status != 200 => {
                Err(EngineError::Client(ClientError::Status(got.status)))
            }
            Ok(got) => {
                if let Some(expected) = total {
                    if got.bytes_written != expected {
                        return Err(EngineError::LengthMismatch {
                            expected,
                            actual: got.bytes_written,
                        });
                    }
                }
                aggregator.emit_now();
                Ok(got.bytes_written)
            }
            Err(ClientError::Aborted) => Err(EngineError::Cancelled),
            Err(err) => Err(EngineError::Client(err)),
        }
    }

    /// Best-effort removal of part files and the incomplete artifact after
    /// a failed or cancelled run. Errors here are logged, never raised.
    async fn cleanup(&self, request: &DownloadRequest) {
        for id in 0..request.thread_count {
            remove_quietly(&request.part_path(id)).await;
        }
        remove_quietly(&request.output_path).await;
    }
}

async fn remove_quietly(path: &std::path::Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed leftover file"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "cleanup failed"),
    }
}

fn validate(request: &DownloadRequest) -> Result<(), EngineError> {
    if request.url.trim().is_empty() {
        return Err(EngineError::InvalidRequest("url is empty"));
    }
    if request.output_path.as_os_str().is_empty() {
        return Err(EngineError::InvalidRequest("output path is empty"));
    }
    Ok(())
}
