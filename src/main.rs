// src/main.rs

use anyhow::{bail, Context, Result};
use multiget::prelude::*;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Console observer: a progress line rewritten in place, log lines and the
/// final verdict on their own lines.
struct ConsoleObserver;

impl DownloadObserver for ConsoleObserver {
    fn progress(&self, snapshot: &ProgressSnapshot) {
        match (snapshot.percentage, snapshot.total) {
            (Some(pct), Some(total)) => print!(
                "\rProgress: {:.1}% ({}/{} bytes) Speed: {}   ",
                pct,
                snapshot.downloaded,
                total,
                format_speed(snapshot.speed_bps)
            ),
            _ => print!(
                "\rDownloaded: {} Speed: {}   ",
                format_bytes(snapshot.downloaded),
                format_speed(snapshot.speed_bps)
            ),
        }
        let _ = io::stdout().flush();
    }

    fn log(&self, message: &str) {
        println!("{message}");
    }

    fn finished(&self, success: bool, message: &str) {
        println!();
        if success {
            println!("Download completed successfully!");
            println!("{message}");
        } else {
            eprintln!("Download failed: {message}");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    println!("=== multiget: parallel file downloader ===");
    println!();

    let url = prompt("Enter URL to download: ")?;
    if url.is_empty() {
        bail!("no URL given");
    }

    let output = prompt("Enter output filename: ")?;
    if output.is_empty() {
        bail!("no output filename given");
    }
    let output = PathBuf::from(output);

    // The engine overwrites unconditionally, so confirm here.
    if output.exists() {
        let answer = prompt(&format!("{} already exists. Overwrite? [y/N] ", output.display()))?;
        if !answer.eq_ignore_ascii_case("y") {
            bail!("not overwriting existing file");
        }
    }

    println!();
    println!("Choose download method:");
    println!("1. Single-stream download");
    println!("2. Multi-chunk download");
    let choice = prompt("Enter choice (1 or 2): ")?;

    let threads = if choice == "2" {
        let raw = prompt("Enter number of chunks (default 4): ")?;
        raw.parse::<usize>().ok().filter(|n| *n > 0).unwrap_or(4)
    } else {
        1
    };

    let request = DownloadRequest::new(url, output, threads);
    let engine = Arc::new(DownloadEngine::new(Arc::new(ConsoleObserver)));

    {
        let engine = engine.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                engine.cancel();
            }
        });
    }

    let started = std::time::Instant::now();
    if let Err(err) = engine.download(request).await {
        bail!("download failed: {err}");
    }
    println!("Total time: {} ms", started.elapsed().as_millis());
    Ok(())
}

fn prompt(message: &str) -> Result<String> {
    print!("{message}");
    io::stdout().flush().context("flush stdout")?;
    let mut line = String::new();
    io::stdin().read_line(&mut line).context("read stdin")?;
    Ok(line.trim().to_string())
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec as u64))
}
