// src/merge.rs

use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{self, AsyncWriteExt};
use tracing::debug;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("merge io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Concatenates the part files into `output` in the given order, deleting
/// each part once its bytes are in place. Returns the total byte count.
///
/// The caller guarantees every part exists; a missing or unreadable part
/// aborts the merge mid-way and the engine cleans up what remains.
pub async fn merge_parts(output: &Path, parts: &[PathBuf]) -> Result<u64, MergeError> {
    let mut final_file = File::create(output).await?;
    let mut total = 0u64;
    for part in parts {
        let mut part_file = File::open(part).await?;
        total += io::copy(&mut part_file, &mut final_file).await?;
        drop(part_file);
        fs::remove_file(part).await?;
        debug!(part = %part.display(), "merged and removed part file");
    }
    final_file.flush().await?;
    Ok(total)
}
