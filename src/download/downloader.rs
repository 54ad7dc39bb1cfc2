//! Bounded pool of concurrent file transfers.
//!
//! Every file goes through the retry engine, and the retry loop of every
//! file goes through one circuit breaker shared by the pool, so a run of
//! failures across files makes the pool fail fast until the service
//! recovers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::error::DownloadError;
use super::file::attempt_download;
use super::integrity::IntegrityChecker;
use super::{DownloadResult, DownloadTask};
use crate::api::DownloadSession;
use crate::retry::{self, CircuitBreaker, CircuitState, RetryConfig};
use crate::stats::StatisticsTracker;

pub const DEFAULT_CONCURRENCY: usize = 8;
pub const MAX_CONCURRENCY: usize = 20;

#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    pub concurrency: usize,
    /// Ceiling for one whole transfer attempt, body included.
    pub download_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            download_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

/// A transfer currently holding a pool slot.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveDownload {
    pub local_path: PathBuf,
    pub gallery_name: String,
    pub bytes_downloaded: u64,
    pub expected_size: Option<u64>,
    pub elapsed: Duration,
}

struct ActiveEntry {
    gallery_name: String,
    expected_size: Option<u64>,
    started: Instant,
    bytes: Arc<AtomicU64>,
}

#[derive(Debug, Default)]
struct Totals {
    total: u64,
    successful: u64,
    bytes: u64,
    duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadStatistics {
    pub total_downloads: u64,
    pub successful_downloads: u64,
    pub failed_downloads: u64,
    pub active_downloads: usize,
    pub total_bytes_downloaded: u64,
    pub total_duration_seconds: f64,
    pub average_speed_mbps: f64,
    pub success_rate: f64,
}

pub struct ConcurrentDownloader {
    session: Arc<dyn DownloadSession>,
    integrity: IntegrityChecker,
    config: DownloaderConfig,
    slots: Semaphore,
    breaker: CircuitBreaker,
    stop: CancellationToken,
    active: Mutex<HashMap<PathBuf, ActiveEntry>>,
    totals: Mutex<Totals>,
}

impl std::fmt::Debug for ConcurrentDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentDownloader")
            .field("config", &self.config)
            .field("breaker", &self.breaker.state())
            .field("stopped", &self.stop.is_cancelled())
            .finish_non_exhaustive()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl ConcurrentDownloader {
    pub fn new(
        session: Arc<dyn DownloadSession>,
        integrity: IntegrityChecker,
        config: DownloaderConfig,
        breaker: CircuitBreaker,
        stop: CancellationToken,
    ) -> Self {
        let concurrency = config.concurrency.clamp(1, MAX_CONCURRENCY);
        Self {
            session,
            integrity,
            slots: Semaphore::new(concurrency),
            config: DownloaderConfig {
                concurrency,
                ..config
            },
            breaker,
            stop,
            active: Mutex::new(HashMap::new()),
            totals: Mutex::new(Totals::default()),
        }
    }

    pub fn integrity(&self) -> &IntegrityChecker {
        &self.integrity
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Download a batch and return one result per task, in completion order.
    ///
    /// `on_complete` runs after every file that was not stopped before it
    /// started, successful or not.
    pub async fn download_files<F>(
        &self,
        tasks: Vec<DownloadTask>,
        stats: &StatisticsTracker,
        on_complete: F,
    ) -> Vec<DownloadResult>
    where
        F: Fn(&DownloadResult),
    {
        if tasks.is_empty() {
            return Vec::new();
        }
        tracing::debug!("Starting concurrent download of {} files", tasks.len());
        let on_complete = &on_complete;
        stream::iter(tasks)
            .map(|task| async move {
                let result = self.download_single_file(&task, stats).await;
                if !matches!(result.error, Some(DownloadError::Stopped)) {
                    on_complete(&result);
                }
                result
            })
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await
    }

    /// Fetch one file under a pool slot. Never fails; the outcome is in the
    /// returned record.
    pub async fn download_single_file(
        &self,
        task: &DownloadTask,
        stats: &StatisticsTracker,
    ) -> DownloadResult {
        let mut result = DownloadResult::new(task);
        let Ok(_slot) = self.slots.acquire().await else {
            result.error = Some(DownloadError::Stopped);
            return result;
        };
        if self.stop.is_cancelled() {
            result.error = Some(DownloadError::Stopped);
            return result;
        }

        let info = &task.info;
        let bytes = Arc::new(AtomicU64::new(0));
        lock(&self.active).insert(
            info.local_path.clone(),
            ActiveEntry {
                gallery_name: task.gallery_name.clone(),
                expected_size: info.expected_size,
                started: Instant::now(),
                bytes: Arc::clone(&bytes),
            },
        );

        let started = Instant::now();
        let mut tracked = (0u32, false);
        let outcome = {
            let tracked = &mut tracked;
            let bytes = &bytes;
            self.breaker
                .call(move || async move {
                    let attempted = retry::retry_with_backoff(
                        &self.config.retry,
                        DownloadError::class,
                        || {
                            attempt_download(
                                self.session.as_ref(),
                                info,
                                self.config.download_timeout,
                                &self.integrity,
                                &self.stop,
                                bytes,
                            )
                        },
                    )
                    .await;
                    *tracked = (attempted.attempts, attempted.escalated);
                    attempted.result
                })
                .await
        };
        lock(&self.active).remove(&info.local_path);

        result.duration = started.elapsed();
        // Stays at zero when an open circuit rejected the call.
        (result.attempts, result.escalated) = tracked;

        match outcome {
            Ok(n) => {
                result.bytes_downloaded = n;
                stats.record_file_completed(&task.gallery_name, n);
                tracing::debug!(
                    "Downloaded {} ({} bytes in {:.1}s, {:.2} MB/s)",
                    info.local_path.display(),
                    n,
                    result.duration.as_secs_f64(),
                    result.download_speed_mbps()
                );
            }
            Err(e) => {
                result.bytes_downloaded = bytes.load(Ordering::Relaxed);
                stats.record_file_failed(&task.gallery_name);
                tracing::debug!(
                    "Download failed after {} attempt(s): {}: {}",
                    result.attempts,
                    info.local_path.display(),
                    e
                );
                result.error = Some(e);
            }
        }

        let mut totals = lock(&self.totals);
        totals.total += 1;
        totals.successful += u64::from(result.success());
        totals.bytes += result.bytes_downloaded;
        totals.duration += result.duration;
        drop(totals);

        result
    }

    pub fn get_active_downloads(&self) -> Vec<ActiveDownload> {
        lock(&self.active)
            .iter()
            .map(|(path, entry)| ActiveDownload {
                local_path: path.clone(),
                gallery_name: entry.gallery_name.clone(),
                bytes_downloaded: entry.bytes.load(Ordering::Relaxed),
                expected_size: entry.expected_size,
                elapsed: entry.started.elapsed(),
            })
            .collect()
    }

    pub fn get_download_statistics(&self) -> DownloadStatistics {
        let totals = lock(&self.totals);
        let secs = totals.duration.as_secs_f64();
        DownloadStatistics {
            total_downloads: totals.total,
            successful_downloads: totals.successful,
            failed_downloads: totals.total - totals.successful,
            active_downloads: lock(&self.active).len(),
            total_bytes_downloaded: totals.bytes,
            total_duration_seconds: secs,
            average_speed_mbps: if secs > 0.0 {
                totals.bytes as f64 / (1024.0 * 1024.0) / secs
            } else {
                0.0
            },
            success_rate: if totals.total > 0 {
                totals.successful as f64 / totals.total as f64 * 100.0
            } else {
                0.0
            },
        }
    }

    /// Queued tasks return "Download stopped"; in-flight transfers abort at
    /// the next chunk.
    pub fn stop(&self) {
        self.stop.cancel();
        tracing::debug!("Concurrent downloader stop requested");
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}
