//! Streaming archive assembly.
//!
//! Archives are produced by the system `zip`/`tar` tools running with the
//! caller's real root as their working directory, stdout piped straight
//! into the HTTP response. Nothing is materialized in memory or on disk.
//! For zip, a pre-flight byte-sum probe decides between deflate and store
//! mode: once the probed total reaches the configured threshold the
//! archive is stored uncompressed. tar.gz always gzips.
//!
//! The child is killed when the response stream drops, so a client
//! disconnect terminates the producer promptly. Tool stderr is logged and
//! never retried.

use futures_util::Stream;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio_util::io::ReaderStream;
use tracing::{error, warn};

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw {
            "zip" => Ok(ArchiveFormat::Zip),
            "targz" | "tar.gz" => Ok(ArchiveFormat::TarGz),
            other => Err(AppError::invalid_request(format!("Unknown archive format: {other}"))),
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::TarGz => "tar.gz",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "application/zip",
            ArchiveFormat::TarGz => "application/gzip",
        }
    }
}

/// Store mode kicks in at the threshold, not past it.
pub fn use_store_mode(probed_total: u64, large_bytes: u64) -> bool {
    probed_total >= large_bytes
}

/// Program and argument list for one archive run over root-relative paths.
fn command_line(format: ArchiveFormat, store_mode: bool, rel_paths: &[String]) -> (&'static str, Vec<String>) {
    match format {
        ArchiveFormat::Zip => {
            let mut args = vec!["-r".to_string(), "-q".to_string()];
            if store_mode {
                args.push("-0".to_string());
            }
            args.push("-".to_string());
            args.push("--".to_string());
            args.extend(rel_paths.iter().cloned());
            ("zip", args)
        }
        ArchiveFormat::TarGz => {
            let mut args = vec!["-czf".to_string(), "-".to_string(), "--".to_string()];
            args.extend(rel_paths.iter().cloned());
            ("tar", args)
        }
    }
}

/// The response body: owns the child so that dropping the stream (client
/// disconnect) kills the producing process.
pub struct ArchiveStream {
    _child: Child,
    stdout: ReaderStream<ChildStdout>,
}

impl Stream for ArchiveStream {
    type Item = std::io::Result<bytes::Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.stdout).poll_next(cx)
    }
}

/// Spawn the archive tool over already-resolved root-relative paths and
/// return its stdout as a byte stream.
pub fn spawn_archive(
    root_real: &Path,
    rel_paths: &[String],
    format: ArchiveFormat,
    store_mode: bool,
) -> AppResult<ArchiveStream> {
    if rel_paths.is_empty() {
        return Err(AppError::invalid_request("Nothing to archive."));
    }
    let (program, args) = command_line(format, store_mode, rel_paths);
    let mut child = Command::new(program)
        .args(&args)
        .current_dir(root_real)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| AppError::upstream(format!("spawning {program}: {e}")))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::upstream("archive tool produced no stdout"))?;

    if let Some(mut stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut buf = String::new();
            if stderr.read_to_string(&mut buf).await.is_ok() {
                let trimmed = buf.trim();
                if !trimmed.is_empty() {
                    error!("archive tool stderr: {trimmed}");
                }
            }
        });
    } else {
        warn!("archive tool spawned without stderr pipe");
    }

    Ok(ArchiveStream { _child: child, stdout: ReaderStream::new(stdout) })
}

/// `<basename>.<ext>` for a single entry, otherwise a timestamped bundle
/// name.
pub fn archive_filename(rel_paths: &[String], format: ArchiveFormat, now: chrono::DateTime<chrono::Utc>) -> String {
    if let [only] = rel_paths {
        let base = only.rsplit('/').next().unwrap_or(only);
        if !base.is_empty() && base != "." {
            return format!("{base}.{}", format.extension());
        }
    }
    format!("bundle-{}.{}", now.format("%Y%m%d-%H%M%S"), format.extension())
}

/// Content-Disposition with an ASCII fallback and the RFC 5987 UTF-8 form
/// for non-ASCII names.
pub fn content_disposition(filename: &str) -> String {
    let ascii: String = filename
        .chars()
        .map(|c| if c.is_ascii() && c != '"' && c != '\\' { c } else { '_' })
        .collect();
    format!(
        "attachment; filename=\"{ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}
