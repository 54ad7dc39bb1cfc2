use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use super::error::DownloadError;
use super::integrity::IntegrityChecker;
use crate::api::{ByteStream, DownloadInfo, DownloadSession};

/// Bytes of an error response body kept for diagnostics.
const ERROR_BODY_LIMIT: usize = 4096;

/// Single download attempt: stream the file to its final path, verify it,
/// and stamp its timestamp.
///
/// The whole transfer runs under `timeout`. Any failure after the target
/// file was created removes it, so a failed attempt never leaves a partial
/// file behind. `progress` tracks bytes written for introspection.
pub(super) async fn attempt_download(
    session: &dyn DownloadSession,
    info: &DownloadInfo,
    timeout: Duration,
    integrity: &IntegrityChecker,
    stop: &CancellationToken,
    progress: &AtomicU64,
) -> Result<u64, DownloadError> {
    progress.store(0, Ordering::Relaxed);
    let mut created = false;
    let transfer = stream_to_file(session, info, timeout, stop, progress, &mut created);
    let result = match tokio::time::timeout(timeout, transfer).await {
        Ok(r) => r,
        Err(_) => Err(DownloadError::Timeout(format!(
            "transfer did not finish within {}s",
            timeout.as_secs()
        ))),
    };

    let bytes = match result {
        Ok(bytes) => bytes,
        Err(e) => {
            if created {
                remove_partial(&info.local_path).await;
            }
            return Err(e);
        }
    };

    let checker = *integrity;
    let checked = info.clone();
    let report = tokio::task::spawn_blocking(move || {
        let report = checker
            .verify_enabled()
            .then(|| checker.verify_download_integrity(&checked));
        if !report.as_ref().is_some_and(|r| r.has_serious_errors()) {
            checker.preserve_file_timestamp(&checked.local_path, &checked.file);
        }
        report
    })
    .await
    .map_err(|e| DownloadError::Disk(std::io::Error::other(e)))?;

    if let Some(report) = report {
        if report.has_serious_errors() {
            tracing::debug!(
                "File integrity check failed for {}: {:?}",
                info.local_path.display(),
                report.errors
            );
            remove_partial(&info.local_path).await;
            return Err(DownloadError::Integrity {
                path: info.local_path.display().to_string(),
                reasons: report.errors.join(", "),
            });
        }
        if !report.errors.is_empty() {
            tracing::debug!(
                "Minor integrity issues for {}: {:?}",
                info.local_path.display(),
                report.errors
            );
        }
    }

    Ok(bytes)
}

async fn stream_to_file(
    session: &dyn DownloadSession,
    info: &DownloadInfo,
    timeout: Duration,
    stop: &CancellationToken,
    progress: &AtomicU64,
    created: &mut bool,
) -> Result<u64, DownloadError> {
    if let Some(parent) = info.local_path.parent() {
        fs::create_dir_all(parent).await?;
    }

    tracing::debug!(
        size_bytes = info.expected_size,
        path = %info.local_path.display(),
        "downloading",
    );
    let response = session.get(&info.url, timeout).await?;
    if response.status != 200 {
        let body = read_body_snippet(response.body).await;
        tracing::debug!(
            "HTTP {} for {}: {}",
            response.status,
            info.url,
            body.chars().take(500).collect::<String>()
        );
        return Err(DownloadError::from_status(
            response.status,
            response.retry_after,
            &body,
        ));
    }

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&info.local_path)
        .await?;
    *created = true;

    let mut body = response.body;
    let mut written: u64 = 0;
    while let Some(chunk) = body.next().await {
        if stop.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
        progress.store(written, Ordering::Relaxed);
    }
    file.flush().await?;
    Ok(written)
}

async fn read_body_snippet(mut body: ByteStream) -> String {
    let mut buf = Vec::new();
    while let Some(Ok(chunk)) = body.next().await {
        buf.extend_from_slice(&chunk);
        if buf.len() >= ERROR_BODY_LIMIT {
            buf.truncate(ERROR_BODY_LIMIT);
            break;
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn remove_partial(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => tracing::debug!("Cleaned up partial download: {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::debug!("Failed to clean up partial download {}: {}", path.display(), e),
    }
}
