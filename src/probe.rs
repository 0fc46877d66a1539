// src/probe.rs

use crate::client::{ClientError, HttpClient};
use crate::models::OriginCapability;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe request failed: {0}")]
    Request(#[from] ClientError),
}

/// Byte range used by the range test. Small enough to be free, large
/// enough that an origin ignoring it is unambiguous.
const PROBE_RANGE: (u64, u64) = (0, 1023);

/// Asks the origin two questions: how large is the resource, and will it
/// serve byte ranges.
///
/// The content length only counts when the plain HEAD answers 2xx with a
/// non-zero value. Range support requires the test request to answer
/// exactly 206 Partial Content; anything else, including a friendly 200,
/// means the origin will not serve partial content.
pub async fn probe_origin(client: &HttpClient, url: &str) -> Result<OriginCapability, ProbeError> {
    let head = client.head(url, None).await?;
    let content_length = if (200..300).contains(&head.status) {
        head.content_length.filter(|len| *len > 0)
    } else {
        None
    };

    // Probe against the effective URL so chunk fetches skip the redirects.
    let range_test = client.head(&head.final_url, Some(PROBE_RANGE)).await?;
    let supports_ranges = range_test.status == 206;

    debug!(
        status = head.status,
        content_length, supports_ranges, "origin probed"
    );

    Ok(OriginCapability {
        content_length,
        supports_ranges,
        final_url: head.final_url,
        content_type: head.content_type,
    })
}
