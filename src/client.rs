// src/client.rs

use crate::limiter::SpeedLimiter;
use crate::models::DownloadRequest;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, RANGE};
use reqwest::redirect::Policy;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Redirect chains longer than this abort the request.
pub const MAX_REDIRECTS: usize = 10;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request timed out")]
    Timeout,
    #[error("tls error: {0}")]
    Tls(String),
    #[error("network error: {0}")]
    Network(reqwest::Error),
    #[error("http status {0}")]
    Status(u16),
    #[error("write error: {0}")]
    Write(#[from] std::io::Error),
    #[error("transfer aborted by caller")]
    Aborted,
}

/// Sorts a reqwest failure into the engine's error taxonomy.
fn classify(err: reqwest::Error) -> ClientError {
    if err.is_timeout() {
        return ClientError::Timeout;
    }
    if let Some(status) = err.status() {
        return ClientError::Status(status.as_u16());
    }
    if tls_in_chain(&err) {
        return ClientError::Tls(err.to_string());
    }
    ClientError::Network(err)
}

/// reqwest does not expose TLS failures as a distinct kind, so walk the
/// source chain and look for the usual vocabulary.
fn tls_in_chain(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(cause) = source {
        let text = cause.to_string().to_ascii_lowercase();
        if text.contains("certificate") || text.contains("tls") || text.contains("ssl") {
            return true;
        }
        source = cause.source();
    }
    false
}

/// Status line and headers of a response, without the body.
#[derive(Debug, Clone)]
pub struct ResponseInfo {
    pub status: u16,
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    /// Effective URL after redirects.
    pub final_url: String,
}

/// Result of a completed `get`.
#[derive(Debug, Clone, Copy)]
pub struct GetOutcome {
    pub status: u16,
    pub bytes_written: u64,
}

/// Thin wrapper around a shared `reqwest::Client`, configured once per
/// transfer from the request's timeouts and TLS settings.
#[derive(Clone)]
pub struct HttpClient {
    inner: reqwest::Client,
}

impl HttpClient {
    pub fn new(request: &DownloadRequest) -> Result<Self, ClientError> {
        let inner = reqwest::Client::builder()
            .user_agent(request.user_agent.clone())
            .connect_timeout(request.connect_timeout)
            .timeout(request.request_timeout)
            .redirect(Policy::limited(MAX_REDIRECTS))
            .danger_accept_invalid_certs(request.insecure_tls)
            .build()
            .map_err(classify)?;
        Ok(Self { inner })
    }

    /// Issues a HEAD request, optionally with a `Range` header for the
    /// capability probe. The status is reported as-is; callers decide what
    /// a non-2xx answer means.
    pub async fn head(&self, url: &str, range: Option<(u64, u64)>) -> Result<ResponseInfo, ClientError> {
        let mut req = self.inner.head(url);
        if let Some((start, end)) = range {
            req = req.header(RANGE, format!("bytes={start}-{end}"));
        }
        let resp = req.send().await.map_err(classify)?;
        Ok(ResponseInfo {
            status: resp.status().as_u16(),
            // reqwest reports the body size, which is empty for HEAD, so
            // read the header directly.
            content_length: resp
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok()),
            content_type: resp
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned),
            final_url: resp.url().to_string(),
        })
    }

    /// Issues a GET and streams the body into `sink`.
    ///
    /// `on_bytes` is called with the running byte count after every write;
    /// returning `false` aborts the transfer with `ClientError::Aborted`.
    /// Statuses >= 400 are errors. When the status differs from
    /// `expect_status` the body is not consumed and the outcome carries zero
    /// bytes; the caller decides what the mismatch means.
    pub async fn get<W, F>(
        &self,
        url: &str,
        range: Option<(u64, u64)>,
        expect_status: u16,
        sink: &mut W,
        limiter: Option<&SpeedLimiter>,
        mut on_bytes: F,
    ) -> Result<GetOutcome, ClientError>
    where
        W: AsyncWrite + Unpin,
        F: FnMut(u64) -> bool,
    {
        let mut req = self.inner.get(url);
        if let Some((start, end)) = range {
            req = req.header(RANGE, format!("bytes={start}-{end}"));
        }
        let resp = req.send().await.map_err(classify)?;
        let status = resp.status().as_u16();
        if status >= 400 {
            return Err(ClientError::Status(status));
        }
        if status != expect_status {
            return Ok(GetOutcome { status, bytes_written: 0 });
        }

        let mut written = 0u64;
        let mut stream = resp.bytes_stream();
        while let Some(item) = stream.next().await {
            let bytes = item.map_err(classify)?;
            if let Some(limiter) = limiter {
                limiter.take(bytes.len() as u64).await;
            }
            sink.write_all(&bytes).await?;
            written += bytes.len() as u64;
            if !on_bytes(written) {
                return Err(ClientError::Aborted);
            }
        }
        sink.flush().await?;
        Ok(GetOutcome { status, bytes_written: written })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct FakeError {
        message: String,
        cause: Option<Box<FakeError>>,
    }

    impl fmt::Display for FakeError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.message)
        }
    }

    impl std::error::Error for FakeError {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            self.cause.as_deref().map(|c| c as &(dyn std::error::Error + 'static))
        }
    }

    #[test]
    fn tls_detected_anywhere_in_chain() {
        let err = FakeError {
            message: "error sending request".into(),
            cause: Some(Box::new(FakeError {
                message: "invalid peer certificate".into(),
                cause: None,
            })),
        };
        assert!(tls_in_chain(&err));
    }

    #[test]
    fn plain_connection_error_is_not_tls() {
        let err = FakeError {
            message: "connection refused".into(),
            cause: None,
        };
        assert!(!tls_in_chain(&err));
    }
}
