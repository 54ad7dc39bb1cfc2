//! Per-gallery orchestration.
//!
//! Galleries are processed one after another; the files of one gallery go
//! to the concurrent downloader as a single batch. For each gallery the
//! manager asks the completeness oracle first, then lists the photos (from
//! the metadata cache when possible), filters them through the checkpoint
//! and the integrity checker, downloads the rest and routes persistent
//! service-side failures to the retrieval queue.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use regex::{Regex, RegexBuilder};
use serde::Serialize;

use super::downloader::ConcurrentDownloader;
use super::error::DownloadError;
use super::integrity::IntegrityChecker;
use super::oracle;
use super::paths::{self, is_hidden, UniquePaths};
use super::{DownloadResult, DownloadTask};
use crate::api::{ApiError, DownloadInfo, Gallery, Group, InformationLevel, PhotoApi, RemoteFile};
use crate::cache::MetadataCache;
use crate::progress::ProgressSink;
use crate::state::checkpoint::GalleryProgress;
use crate::state::{CheckpointStore, RetrievalItem, RetrievalQueue};
use crate::stats::{FinalSummary, StatisticsTracker};

/// Ceiling for loading one gallery's photo listing.
pub const GALLERY_LOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Queue entries older than this are dropped after each replay.
const QUEUE_MAX_AGE_DAYS: u64 = 30;

/// Size assumed per photo when only hierarchy counts are known.
const ESTIMATED_MB_PER_PHOTO: f64 = 5.0;
const ESTIMATED_SPEED_MBPS: f64 = 5.0;
const OVERHEAD_SECS_PER_FILE: f64 = 2.0;

const TIMEOUT_REASON: &str = "Zenfolio retrieval timeout - image may be in processing queue";
const SERVER_REASON: &str = "Server temporarily unavailable";
const GATEWAY_REASON: &str = "Server gateway error";
const UNAVAILABLE_REASON: &str = "Service temporarily unavailable";

/// Case-insensitive gallery title filter.
pub fn gallery_filter(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}

/// A gallery and its directory relative to the output root.
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryTarget {
    pub gallery: Gallery,
    pub local_path: PathBuf,
}

/// Every gallery below `root` whose title matches `filter`, in hierarchy
/// order, with paths under `base_path`.
pub fn collect_galleries(root: &Group, filter: Option<&Regex>, base_path: &Path) -> Vec<GalleryTarget> {
    root.walk_galleries()
        .into_iter()
        .filter(|e| filter.map_or(true, |re| re.is_match(&e.gallery.title)))
        .map(|e| GalleryTarget {
            gallery: e.gallery.clone(),
            local_path: base_path.join(e.relative_path),
        })
        .collect()
}

/// Human-readable estimate for fetching `total_bytes` in `file_count` files.
pub fn estimate_download_time(total_bytes: u64, file_count: u64) -> String {
    let transfer = total_bytes as f64 / (1024.0 * 1024.0) / ESTIMATED_SPEED_MBPS;
    let total = transfer + file_count as f64 * OVERHEAD_SECS_PER_FILE;
    if total < 60.0 {
        format!("{total:.0} seconds")
    } else if total < 3600.0 {
        format!("{:.1} minutes", total / 60.0)
    } else {
        format!("{:.1} hours", total / 3600.0)
    }
}

/// Queue reason for a failure the service is likely to recover from on its
/// own, or `None` if the failure is terminal for this session.
fn retrieval_reason(result: &DownloadResult) -> Option<&'static str> {
    let error = result.error.as_ref()?;
    match error {
        DownloadError::Timeout(_) if result.attempts >= 3 => Some(TIMEOUT_REASON),
        DownloadError::Server { status: 502, .. } => Some(GATEWAY_REASON),
        DownloadError::Server { status: 503, .. } => Some(UNAVAILABLE_REASON),
        DownloadError::Server { .. } => Some(SERVER_REASON),
        DownloadError::Timeout(_) | DownloadError::Stopped | DownloadError::Cancelled => None,
        other => {
            let text = other.to_string().to_ascii_lowercase();
            if text.contains("server temporarily unavailable") || text.contains("server error 5") {
                Some(SERVER_REASON)
            } else if text.contains("bad gateway") {
                Some(GATEWAY_REASON)
            } else if text.contains("service unavailable") {
                Some(UNAVAILABLE_REASON)
            } else {
                None
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GalleryResult {
    pub gallery_name: String,
    pub success: bool,
    /// The gallery was left alone this run, without counting as a failure.
    pub skipped: bool,
    pub error: Option<String>,
    pub total_files: u64,
    pub downloaded: u64,
    pub failed: u64,
    pub already_existed: u64,
    /// Failed files handed to the retrieval queue; included in `failed`.
    pub queued: u64,
    pub duration_seconds: f64,
    pub local_path: PathBuf,
    /// The whole gallery was deferred to the retrieval queue.
    pub added_to_retry_queue: bool,
    /// The run was stopped while this gallery was downloading.
    pub interrupted: bool,
}

impl GalleryResult {
    fn new(target: &GalleryTarget) -> Self {
        Self {
            gallery_name: target.gallery.title.clone(),
            local_path: target.local_path.clone(),
            ..Self::default()
        }
    }

    fn with_error(mut self, error: String) -> Self {
        self.success = false;
        self.error = Some(error);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub galleries_processed: usize,
    pub successful_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    pub interrupted: bool,
    pub gallery_results: Vec<GalleryResult>,
    pub summary: FinalSummary,
}

impl SessionSummary {
    pub fn downloaded(&self) -> u64 {
        self.gallery_results.iter().map(|g| g.downloaded).sum()
    }

    pub fn already_existed(&self) -> u64 {
        self.gallery_results.iter().map(|g| g.already_existed).sum()
    }

    pub fn failed_files(&self) -> u64 {
        self.gallery_results.iter().map(|g| g.failed).sum()
    }

    /// Nothing failed, nothing was deferred and the run was not stopped.
    pub fn fully_successful(&self) -> bool {
        !self.interrupted
            && self.failed_count == 0
            && self
                .gallery_results
                .iter()
                .all(|g| g.failed == 0 && !g.added_to_retry_queue)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueRunResult {
    pub total_items: usize,
    pub processed: usize,
    pub successful: usize,
    pub failed: usize,
    pub still_pending: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DryRunGallery {
    pub name: String,
    pub file_count: u64,
    pub skip_count: u64,
    pub size_mb: f64,
    pub photo_count: u64,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DryRunReport {
    pub galleries_count: usize,
    pub files_to_download: u64,
    pub files_to_skip: u64,
    pub total_size_mb: f64,
    pub galleries: Vec<DryRunGallery>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GalleryAnalysis {
    pub total_galleries: usize,
    pub total_photos: u64,
    pub total_videos: u64,
    pub total_size_mb: f64,
    pub estimated_time: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvalidFile {
    pub path: PathBuf,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VerifyReport {
    pub total_checked: u64,
    pub valid_files: u64,
    pub invalid_files: Vec<InvalidFile>,
}

/// Outcome of listing a gallery's photos.
enum Listing {
    Photos(Vec<RemoteFile>),
    /// Listing failed in a way worth retrying later; carries the queue text.
    Deferred(String),
    /// The service returned no photos for a gallery that should have some.
    Empty(u64),
}

pub struct DownloadManager {
    api: Arc<dyn PhotoApi>,
    cache: Option<Arc<dyn MetadataCache>>,
    downloader: ConcurrentDownloader,
    checkpoint: CheckpointStore,
    queue: RetrievalQueue,
    stats: StatisticsTracker,
    progress: Arc<dyn ProgressSink>,
    overwrite: bool,
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("downloader", &self.downloader)
            .field("checkpoint", &self.checkpoint.path())
            .field("queue", &self.queue.path())
            .field("cache", &self.cache.is_some())
            .field("overwrite", &self.overwrite)
            .finish_non_exhaustive()
    }
}

impl DownloadManager {
    pub fn new(
        api: Arc<dyn PhotoApi>,
        downloader: ConcurrentDownloader,
        checkpoint: CheckpointStore,
        queue: RetrievalQueue,
        stats: StatisticsTracker,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        // Persisted off the async workers at gallery boundaries instead.
        checkpoint.set_auto_save(false);
        Self {
            api,
            cache: None,
            downloader,
            checkpoint,
            queue,
            stats,
            progress,
            overwrite: false,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn MetadataCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Re-fetch files even when they exist locally or the checkpoint has
    /// settled them.
    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn checkpoint(&self) -> &CheckpointStore {
        &self.checkpoint
    }

    pub fn queue(&self) -> &RetrievalQueue {
        &self.queue
    }

    pub fn stats(&self) -> &StatisticsTracker {
        &self.stats
    }

    pub fn downloader(&self) -> &ConcurrentDownloader {
        &self.downloader
    }

    /// Stop the run: no new gallery starts, queued files return "stopped"
    /// and in-flight transfers abort at the next chunk.
    pub fn stop(&self) {
        let active = self.downloader.get_active_downloads();
        self.downloader.stop();
        if active.is_empty() {
            return;
        }
        self.progress.suspend(&|| {
            tracing::info!("Stopping, aborting {} in-flight download(s)", active.len());
            for a in &active {
                tracing::debug!(
                    "  {} ({}): {} bytes after {:.1}s",
                    a.local_path.display(),
                    a.gallery_name,
                    a.bytes_downloaded,
                    a.elapsed.as_secs_f64()
                );
            }
        });
    }

    pub fn is_stopped(&self) -> bool {
        self.downloader.is_stopped()
    }

    async fn save_checkpoint(&self) {
        if let Err(e) = self.checkpoint.persist().await {
            self.progress
                .suspend(&|| tracing::warn!("Failed to save checkpoint: {}", e));
        }
    }

    /// Download every gallery below `root` into `output_dir`.
    pub async fn download_all_galleries(
        &self,
        root: &Group,
        output_dir: &Path,
        filter: Option<&Regex>,
        base_path: &Path,
    ) -> anyhow::Result<SessionSummary> {
        tokio::fs::create_dir_all(output_dir)
            .await
            .with_context(|| format!("Failed to create output directory {}", output_dir.display()))?;

        self.stats.start_session();
        if let Err(e) = self.checkpoint.start_session().await {
            tracing::warn!("Failed to record session start: {}", e);
        }

        let targets = collect_galleries(root, filter, base_path);
        tracing::info!("Found {} galleries to process", targets.len());

        let mut results = Vec::with_capacity(targets.len());
        let (mut successful, mut failed, mut skipped) = (0, 0, 0);
        for target in &targets {
            if self.is_stopped() {
                tracing::info!("Shutdown requested, not starting further galleries");
                break;
            }
            let result = self.process_gallery(target, output_dir).await;
            if result.success {
                successful += 1;
            } else if result.skipped {
                skipped += 1;
            } else {
                failed += 1;
            }
            results.push(result);
        }

        self.stats.end_session();
        self.checkpoint
            .update_total_progress(&self.stats.get_current_progress());

        let interrupted = self.is_stopped() || results.iter().any(|r| r.interrupted);
        let summary = SessionSummary {
            galleries_processed: results.len(),
            successful_count: successful,
            failed_count: failed,
            skipped_count: skipped,
            interrupted,
            gallery_results: results,
            summary: self.stats.get_final_summary(),
        };

        if summary.fully_successful() {
            match self.checkpoint.clear() {
                Ok(()) => tracing::debug!("All galleries complete, checkpoint cleared"),
                Err(e) => tracing::warn!("Failed to clear checkpoint: {}", e),
            }
        } else {
            self.save_checkpoint().await;
        }
        Ok(summary)
    }

    /// Bring one gallery up to date. Never fails; the outcome is in the
    /// returned record.
    pub async fn process_gallery(&self, target: &GalleryTarget, output_dir: &Path) -> GalleryResult {
        let started = Instant::now();
        let gallery = &target.gallery;
        let title = gallery.title.as_str();
        let dir = paths::gallery_dir(output_dir, &target.local_path);
        let mut result = GalleryResult::new(target);

        let completion = if self.overwrite {
            oracle::GalleryCompletion {
                complete: false,
                cached: self.cached_listing(gallery).await,
            }
        } else {
            oracle::check_gallery_completion(gallery, &dir, self.cache.as_deref()).await
        };

        if completion.complete {
            let count = completion
                .cached
                .map_or(gallery.photo_count, |photos| photos.len() as u64);
            tracing::debug!("Skipping {} - already complete with {} files", title, count);
            self.stats.start_gallery(title, count, 0);
            self.stats.record_files_skipped(title, count);
            self.stats.end_gallery(title);
            self.progress.start_gallery(title, count);
            self.progress.advance(count);
            self.progress.finish_gallery(title, 0, count, 0);
            result.success = true;
            result.total_files = count;
            result.already_existed = count;
            result.duration_seconds = started.elapsed().as_secs_f64();
            return result;
        }

        let photos = match completion.cached {
            Some(photos) => {
                tracing::debug!(
                    "Using cached photo metadata for {} ({} photos)",
                    title,
                    photos.len()
                );
                photos
            }
            None => match self.load_listing(gallery).await {
                Ok(Listing::Photos(photos)) => photos,
                Ok(Listing::Deferred(reason)) => {
                    self.defer_gallery(gallery, &reason);
                    result.success = true;
                    result.added_to_retry_queue = true;
                    return result;
                }
                Ok(Listing::Empty(expected)) => {
                    tracing::debug!(
                        "API returned 0 photos for {} but the hierarchy shows {}",
                        title,
                        expected
                    );
                    result.skipped = true;
                    result.duration_seconds = started.elapsed().as_secs_f64();
                    return result.with_error(format!(
                        "API returned empty gallery (expected {expected} photos)"
                    ));
                }
                Err(e) => {
                    self.progress
                        .suspend(&|| tracing::error!("Failed to process gallery {}: {}", title, e));
                    result.duration_seconds = started.elapsed().as_secs_f64();
                    return result.with_error(e.to_string());
                }
            },
        };

        let total = photos.len() as u64;
        let total_bytes = photos.iter().map(|p| p.size).sum();
        self.stats.start_gallery(title, total, total_bytes);
        self.progress.start_gallery(title, total);

        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            self.stats.end_gallery(title);
            self.progress.finish_gallery(title, 0, total, 0);
            result.duration_seconds = started.elapsed().as_secs_f64();
            return result.with_error(format!("Failed to create directory {}: {e}", dir.display()));
        }

        let tasks = match self.plan_downloads(gallery, &photos, &dir).await {
            Ok(tasks) => tasks,
            Err(e) => {
                self.progress
                    .suspend(&|| tracing::error!("Failed to process gallery {}: {}", title, e));
                self.stats.end_gallery(title);
                self.progress.finish_gallery(title, 0, total, 0);
                result.total_files = total;
                result.duration_seconds = started.elapsed().as_secs_f64();
                return result.with_error(e);
            }
        };
        let to_download = tasks.len() as u64;
        result.total_files = total;
        result.already_existed = total - to_download;
        self.progress.advance(result.already_existed);
        tracing::debug!(
            "Gallery {}: {} files to download, {} files already exist",
            title,
            to_download,
            result.already_existed
        );

        let infos: HashMap<PathBuf, DownloadInfo> = tasks
            .iter()
            .map(|t| (t.info.local_path.clone(), t.info.clone()))
            .collect();
        let results = self
            .downloader
            .download_files(tasks, &self.stats, |_| self.progress.advance(1))
            .await;

        for r in &results {
            match &r.error {
                None => {
                    result.downloaded += 1;
                    self.checkpoint.mark_completed(&r.local_path);
                    if let Err(e) = self.queue.remove_completed_item(r.photo_id) {
                        tracing::warn!("Failed to update retrieval queue: {}", e);
                    }
                }
                Some(e) if e.is_stop() => result.interrupted = true,
                Some(e) => {
                    result.failed += 1;
                    match (retrieval_reason(r), infos.get(&r.local_path)) {
                        (Some(reason), Some(info)) => {
                            let message = format!("{reason}: {e}");
                            match self.queue.add_item(info, gallery.id, title, &message) {
                                Ok(_) => result.queued += 1,
                                Err(qe) => {
                                    tracing::warn!("Failed to add item to retrieval queue: {}", qe);
                                    self.checkpoint.mark_failed(&r.local_path);
                                }
                            }
                        }
                        _ => self.checkpoint.mark_failed(&r.local_path),
                    }
                    self.progress.suspend(&|| {
                        tracing::debug!(
                            "Failed {} (photo {}, {} attempt(s)): {}",
                            r.file_name,
                            r.photo_id,
                            r.attempts,
                            e
                        )
                    });
                }
            }
        }

        if result.queued > 0 {
            self.progress.suspend(&|| {
                tracing::info!(
                    "{}: {} file(s) added to retrieval queue",
                    title,
                    result.queued
                )
            });
        }

        self.progress
            .finish_gallery(title, result.downloaded, total, result.failed);
        self.stats.end_gallery(title);
        result.duration_seconds = started.elapsed().as_secs_f64();
        result.success = true;

        if result.downloaded > 0 || result.failed > 0 {
            let speed = self
                .stats
                .get_gallery_stats(title)
                .map_or(0.0, |g| g.download_speed_mbps());
            tracing::info!(
                "Completed {}: {} downloaded, {} already existed, {} failed in {} ({:.1} MB/s)",
                title,
                result.downloaded,
                result.already_existed,
                result.failed,
                super::format_duration(started.elapsed()),
                speed
            );
        }
        if let Some(g) = self.stats.get_gallery_stats(title) {
            tracing::debug!(
                "{}: {:.0}% of listed files fetched this run",
                title,
                g.completion_percentage()
            );
        }
        self.checkpoint.update_gallery_progress(
            title,
            GalleryProgress {
                total_files: total,
                downloaded: result.downloaded,
                failed: result.failed,
                already_existed: result.already_existed,
                success: result.failed == 0,
                last_updated: None,
            },
        );
        self.save_checkpoint().await;
        result
    }

    async fn cached_listing(&self, gallery: &Gallery) -> Option<Vec<RemoteFile>> {
        let cache = self.cache.as_ref()?;
        match cache.load_photo_metadata(gallery.id).await {
            Ok(photos) => photos,
            Err(e) => {
                tracing::debug!("Metadata cache unavailable for {}: {}", gallery.title, e);
                None
            }
        }
    }

    /// Fetch the gallery's photos from the service under the load ceiling and
    /// refresh the metadata cache.
    async fn load_listing(&self, gallery: &Gallery) -> Result<Listing, ApiError> {
        tracing::debug!("Loading gallery data from API: {} (ID: {})", gallery.title, gallery.id);
        let load = self
            .api
            .load_photo_set(gallery.id, InformationLevel::Level2, true);
        let set = match tokio::time::timeout(GALLERY_LOAD_TIMEOUT, load).await {
            Ok(Ok(set)) => set,
            Ok(Err(ApiError::Timeout(_))) | Err(_) => {
                return Ok(Listing::Deferred(format!(
                    "API timeout loading gallery metadata after {} seconds",
                    GALLERY_LOAD_TIMEOUT.as_secs()
                )));
            }
            Ok(Err(e)) if e.is_deferrable() => return Ok(Listing::Deferred(e.to_string())),
            Ok(Err(e)) => return Err(e),
        };

        if set.photos.is_empty() && gallery.photo_count > 0 {
            return Ok(Listing::Empty(gallery.photo_count));
        }
        if let (Some(cache), false) = (&self.cache, set.photos.is_empty()) {
            match cache.save_photo_metadata(gallery.id, &set.photos).await {
                Ok(()) => tracing::debug!("Saved photo metadata to cache for {}", gallery.title),
                Err(e) => tracing::debug!("Failed to cache photo metadata for {}: {}", gallery.title, e),
            }
        }
        Ok(Listing::Photos(set.photos))
    }

    fn defer_gallery(&self, gallery: &Gallery, reason: &str) {
        if let Err(e) = self.queue.add_gallery_retry(gallery, reason) {
            tracing::warn!("Failed to add gallery to retry queue: {}", e);
        }
        self.progress.suspend(&|| {
            tracing::warn!("Deferred {} (added to retry queue): {}", gallery.title, reason)
        });
    }

    /// Download tasks for the photos that still need fetching. The rest are
    /// recorded as skipped. Every task gets its own local path, even when
    /// the gallery holds several photos with the same file name.
    async fn plan_downloads(
        &self,
        gallery: &Gallery,
        photos: &[RemoteFile],
        dir: &Path,
    ) -> Result<Vec<DownloadTask>, String> {
        let mut claimed = UniquePaths::default();
        let mut candidates = Vec::with_capacity(photos.len());
        for photo in photos {
            if !photo.is_downloadable() {
                tracing::debug!("Photo not downloadable: {} ({})", photo.file_name, photo.id);
                continue;
            }
            match self.api.get_download_info(photo, dir) {
                Ok(mut info) => {
                    let path = claimed.claim(info.local_path.clone(), photo.id);
                    if path != info.local_path {
                        tracing::debug!(
                            "Duplicate file name {} in {}, saving photo {} as {}",
                            photo.file_name,
                            gallery.title,
                            photo.id,
                            path.display()
                        );
                        info.local_path = path;
                    }
                    candidates.push(info);
                }
                Err(e) => self.progress.suspend(&|| {
                    tracing::error!(
                        "Failed to create download info for photo {} ({}): {}",
                        photo.id,
                        photo.file_name,
                        e
                    )
                }),
            }
        }

        // Checkpoint first, then the on-disk state, which may hash files.
        let force = self.overwrite;
        let (pending, settled) = if force {
            (candidates, Vec::new())
        } else {
            self.checkpoint.filter_downloads_for_resume(candidates)
        };
        for info in &pending {
            if self.checkpoint.is_file_failed(&info.local_path) {
                tracing::debug!("Retrying previously failed file: {}", info.local_path.display());
            }
        }
        let integrity = *self.downloader.integrity();
        let checked = run_blocking(move || {
            pending
                .into_iter()
                .map(|info| {
                    let fetch = integrity.should_redownload(&info, force);
                    (info, fetch)
                })
                .collect::<Vec<_>>()
        })
        .await?;

        let mut tasks = Vec::new();
        let decided = settled
            .into_iter()
            .map(|info| (info, false))
            .chain(checked);
        for (info, fetch) in decided {
            if fetch {
                tasks.push(DownloadTask::new(info, gallery.title.clone()));
            } else {
                tracing::debug!(
                    "File already exists: {} - {}",
                    info.local_path.display(),
                    self.skip_reason(&info)
                );
                self.stats.record_file_skipped(&gallery.title, info.file.size);
                self.checkpoint.mark_skipped(&info.local_path);
            }
        }
        Ok(tasks)
    }

    fn skip_reason(&self, info: &DownloadInfo) -> &'static str {
        if self.checkpoint.is_file_completed(&info.local_path) {
            "previously downloaded successfully"
        } else if self.checkpoint.is_file_skipped(&info.local_path) {
            "marked as skipped in previous session"
        } else if info.local_path.exists() {
            "file already exists and appears complete"
        } else {
            "unknown reason"
        }
    }

    /// Replay retrieval queue entries whose last attempt is older than
    /// `max_age_hours`, then prune entries older than thirty days. With a
    /// hierarchy at hand, galleries renamed since queuing are retried under
    /// their current title.
    pub async fn process_retrieval_queue(
        &self,
        max_age_hours: u64,
        root: Option<&Group>,
    ) -> QueueRunResult {
        let ready = self.queue.get_items_for_retry(max_age_hours);
        let mut run = QueueRunResult {
            total_items: ready.len(),
            ..QueueRunResult::default()
        };
        if ready.is_empty() {
            return run;
        }
        tracing::info!("Processing {} items from retrieval queue", ready.len());
        self.stats.start_session();

        let mut groups: Vec<(u64, String, Vec<RetrievalItem>)> = Vec::new();
        for item in ready {
            match groups.iter_mut().find(|(id, _, _)| *id == item.gallery_id) {
                Some((_, _, items)) => items.push(item),
                None => groups.push((item.gallery_id, item.gallery_title.clone(), vec![item])),
            }
        }

        for (gallery_id, queued_title, items) in groups {
            if self.is_stopped() {
                break;
            }
            let title = match root.map(|r| r.find_gallery(gallery_id)) {
                Some(Some(g)) if g.title != queued_title => {
                    tracing::debug!("Gallery {} is now titled {}", queued_title, g.title);
                    g.title.clone()
                }
                Some(None) => {
                    tracing::warn!(
                        "Gallery {} ({}) is not in the current hierarchy",
                        queued_title,
                        gallery_id
                    );
                    queued_title
                }
                _ => queued_title,
            };
            tracing::info!("Processing {} retrieval items from gallery: {}", items.len(), title);
            let (gallery_items, photo_items): (Vec<_>, Vec<_>) =
                items.into_iter().partition(RetrievalItem::is_gallery_retry);

            if !gallery_items.is_empty() {
                self.retry_gallery_listing(gallery_id, &title, &mut run).await;
            }
            if !photo_items.is_empty() {
                self.retry_photos(gallery_id, &title, photo_items, &mut run).await;
            }
        }

        match self.queue.clear_old_items(QUEUE_MAX_AGE_DAYS) {
            Ok(0) => {}
            Ok(n) => tracing::info!("Dropped {} retrieval queue items older than {} days", n, QUEUE_MAX_AGE_DAYS),
            Err(e) => tracing::warn!("Failed to prune retrieval queue: {}", e),
        }
        self.stats.end_session();
        self.save_checkpoint().await;
        run
    }

    /// Reload a deferred gallery's listing. Success only confirms the
    /// gallery is reachable again; the next download run fetches its files.
    async fn retry_gallery_listing(&self, gallery_id: u64, title: &str, run: &mut QueueRunResult) {
        run.processed += 1;
        let load = self
            .api
            .load_photo_set(gallery_id, InformationLevel::Level2, true);
        match tokio::time::timeout(GALLERY_LOAD_TIMEOUT, load).await {
            Ok(Ok(set)) => {
                if let Err(e) = self.queue.remove_gallery_retry_items(gallery_id) {
                    tracing::warn!("Failed to update retrieval queue: {}", e);
                }
                if let (Some(cache), false) = (&self.cache, set.photos.is_empty()) {
                    if let Err(e) = cache.save_photo_metadata(gallery_id, &set.photos).await {
                        tracing::debug!("Failed to cache photo metadata for {}: {}", title, e);
                    }
                }
                run.successful += 1;
                tracing::info!("Gallery {} metadata loaded successfully", title);
            }
            Ok(Err(ApiError::Timeout(_))) | Err(_) => {
                run.still_pending += 1;
                tracing::info!("Gallery {} still timing out (kept in retry queue)", title);
            }
            Ok(Err(e)) => {
                run.failed += 1;
                tracing::warn!("Gallery {} failed with error: {}", title, e);
            }
        }
    }

    async fn retry_photos(
        &self,
        gallery_id: u64,
        title: &str,
        items: Vec<RetrievalItem>,
        run: &mut QueueRunResult,
    ) {
        let batch_name = format!("Retrieval Queue - {title}");
        let mut claimed = UniquePaths::default();
        let tasks: Vec<DownloadTask> = items
            .iter()
            .map(|item| {
                let mut info = item.download_info();
                info.local_path = claimed.claim(info.local_path, item.photo_id);
                DownloadTask::new(info, batch_name.clone())
            })
            .collect();
        let total_bytes = items.iter().map(|i| i.file_size).sum();
        self.stats.start_gallery(&batch_name, tasks.len() as u64, total_bytes);
        self.progress.start_gallery(&batch_name, tasks.len() as u64);

        let results = self
            .downloader
            .download_files(tasks, &self.stats, |_| self.progress.advance(1))
            .await;

        let (mut downloaded, mut failed) = (0, 0);
        for r in &results {
            let Some(item) = items.iter().find(|i| i.photo_id == r.photo_id) else {
                continue;
            };
            match &r.error {
                Some(e) if e.is_stop() => continue,
                None => {
                    run.successful += 1;
                    downloaded += 1;
                    self.checkpoint.mark_completed(&r.local_path);
                    if let Err(e) = self.queue.remove_completed_item(r.photo_id) {
                        tracing::warn!("Failed to update retrieval queue: {}", e);
                    }
                    tracing::info!("Successfully downloaded retrieval item: {}", item.file_name);
                }
                Some(e) => {
                    failed += 1;
                    if e.is_timeout() {
                        run.still_pending += 1;
                        tracing::debug!("Retrieval item still pending: {}", item.file_name);
                    } else {
                        run.failed += 1;
                        tracing::warn!(
                            "Retrieval item failed with new error: {} - {}",
                            item.file_name,
                            e
                        );
                    }
                    let message = match retrieval_reason(r) {
                        Some(reason) => format!("{reason}: {e}"),
                        None => e.to_string(),
                    };
                    let info = item.download_info();
                    if let Err(qe) = self.queue.add_item(&info, gallery_id, title, &message) {
                        tracing::warn!("Failed to update retrieval queue: {}", qe);
                    }
                }
            }
            run.processed += 1;
        }

        self.progress
            .finish_gallery(&batch_name, downloaded, results.len() as u64, failed);
        self.stats.end_gallery(&batch_name);
    }

    /// Estimate the work for a download run from hierarchy counts alone.
    pub fn dry_run_analysis(
        &self,
        root: &Group,
        filter: Option<&Regex>,
        base_path: &Path,
    ) -> DryRunReport {
        let targets = collect_galleries(root, filter, base_path);
        let galleries: Vec<DryRunGallery> = targets
            .iter()
            .map(|t| {
                let photo_count = t.gallery.photo_count;
                tracing::debug!(
                    "Gallery '{}': {} photos -> {} estimated downloads",
                    t.gallery.title,
                    photo_count,
                    photo_count
                );
                DryRunGallery {
                    name: t.gallery.title.clone(),
                    file_count: photo_count,
                    skip_count: 0,
                    size_mb: photo_count as f64 * ESTIMATED_MB_PER_PHOTO,
                    photo_count,
                    path: t.local_path.clone(),
                }
            })
            .collect();
        DryRunReport {
            galleries_count: galleries.len(),
            files_to_download: galleries.iter().map(|g| g.file_count).sum(),
            files_to_skip: 0,
            total_size_mb: galleries.iter().map(|g| g.size_mb).sum(),
            galleries,
        }
    }

    /// Count photos, videos and bytes by listing every gallery remotely.
    pub async fn analyze_galleries(&self, root: &Group) -> GalleryAnalysis {
        let targets = collect_galleries(root, None, Path::new(""));
        let (mut photos, mut videos, mut bytes) = (0u64, 0u64, 0u64);
        for target in &targets {
            let gallery = &target.gallery;
            match self
                .api
                .load_photo_set(gallery.id, InformationLevel::Level2, true)
                .await
            {
                Ok(set) => {
                    for photo in &set.photos {
                        if photo.is_video {
                            videos += 1;
                        } else {
                            photos += 1;
                        }
                        bytes += photo.size;
                    }
                }
                Err(e) => tracing::debug!("Failed to analyze gallery {}: {}", gallery.title, e),
            }
        }
        GalleryAnalysis {
            total_galleries: targets.len(),
            total_photos: photos,
            total_videos: videos,
            total_size_mb: bytes as f64 / (1024.0 * 1024.0),
            estimated_time: estimate_download_time(bytes, photos + videos),
        }
    }
}

/// Run blocking file checks on the blocking pool. A check that panicked
/// is an error, never an empty plan.
async fn run_blocking<T, F>(f: F) -> Result<T, String>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| format!("Failed to check existing files: {e}"))
}

/// Check every file under `output_dir` for emptiness and readability.
/// Hidden files and the retrieval queue file are not counted.
pub async fn verify_existing_files(
    integrity: IntegrityChecker,
    output_dir: &Path,
) -> anyhow::Result<VerifyReport> {
    let root = output_dir.to_path_buf();
    tokio::task::spawn_blocking(move || verify_tree(&integrity, &root))
        .await
        .context("Verification task failed")?
}

fn verify_tree(integrity: &IntegrityChecker, root: &Path) -> anyhow::Result<VerifyReport> {
    let mut report = VerifyReport::default();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("Failed to read directory {}", dir.display()))?;
        for entry in entries {
            let path = entry
                .with_context(|| format!("Failed to read directory {}", dir.display()))?
                .path();
            if is_hidden(&path) {
                continue;
            }
            if path.is_dir() {
                pending.push(path);
                continue;
            }
            if path.file_name().is_some_and(|n| n == crate::state::retrieval_queue::QUEUE_FILE_NAME) {
                continue;
            }
            report.total_checked += 1;
            let reasons = integrity.check_existing_file(&path);
            if reasons.is_empty() {
                report.valid_files += 1;
            } else {
                report.invalid_files.push(InvalidFile { path, reasons });
            }
        }
    }
    report.invalid_files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::{GroupElement, PhotoSetType};
    use crate::api::{PhotoSet, User};
    use crate::cache::SqliteMetadataCache;
    use crate::download::downloader::tests::{fast_config, Scripted, ScriptedSession};
    use crate::progress::tests::{ProgressEvent, RecordingProgress};
    use crate::retry::CircuitBreaker;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    #[derive(Clone)]
    enum FakeSet {
        Photos(Vec<RemoteFile>),
        Hang,
        Fail(u16),
    }

    /// Photo API answering from canned listings and counting every call.
    #[derive(Default)]
    struct FakeApi {
        sets: Mutex<HashMap<u64, FakeSet>>,
        calls: AtomicUsize,
    }

    impl FakeApi {
        fn set(&self, id: u64, set: FakeSet) {
            self.sets.lock().unwrap().insert(id, set);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl PhotoApi for FakeApi {
        async fn authenticate(&self, _u: &str, _p: &str) -> Result<(), ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn load_private_profile(&self) -> Result<User, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ApiError::NotAuthenticated)
        }

        async fn load_group_hierarchy(&self, _login: &str, _force: bool) -> Result<Group, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ApiError::NotAuthenticated)
        }

        async fn load_photo_set(
            &self,
            id: u64,
            _level: InformationLevel,
            _include_photos: bool,
        ) -> Result<PhotoSet, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let set = self.sets.lock().unwrap().get(&id).cloned();
            match set {
                Some(FakeSet::Photos(photos)) => Ok(PhotoSet {
                    id,
                    title: format!("Set {id}"),
                    kind: PhotoSetType::Gallery,
                    photo_count: photos.len() as u64,
                    photos,
                }),
                Some(FakeSet::Hang) => std::future::pending().await,
                Some(FakeSet::Fail(status)) => Err(ApiError::Server {
                    status,
                    message: "Internal Server Error".into(),
                }),
                None => Err(ApiError::NotFound(format!("photo set {id}"))),
            }
        }
    }

    fn photo(id: u64, name: &str) -> RemoteFile {
        let url = format!("https://files.example.com/{name}");
        RemoteFile::from_queue_entry(id, name, &url, 4, "image/jpeg")
    }

    fn photos(gallery_id: u64, n: u64) -> Vec<RemoteFile> {
        (0..n)
            .map(|i| photo(gallery_id * 100 + i + 1, &format!("g{gallery_id}_{i:02}.jpg")))
            .collect()
    }

    fn gallery(id: u64, title: &str, photo_count: u64) -> Gallery {
        Gallery {
            id,
            title: title.into(),
            photo_count,
            kind: PhotoSetType::Gallery,
        }
    }

    fn root(galleries: Vec<Gallery>) -> Group {
        Group {
            id: 1,
            title: "Root".into(),
            elements: galleries.into_iter().map(GroupElement::Gallery).collect(),
        }
    }

    fn target(g: &Gallery) -> GalleryTarget {
        GalleryTarget {
            gallery: g.clone(),
            local_path: PathBuf::from(&g.title),
        }
    }

    struct Harness {
        dir: tempfile::TempDir,
        api: Arc<FakeApi>,
        session: Arc<ScriptedSession>,
        cache: Arc<SqliteMetadataCache>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                api: Arc::new(FakeApi::default()),
                session: Arc::new(ScriptedSession::default()),
                cache: Arc::new(
                    SqliteMetadataCache::open_in_memory(Duration::from_secs(3600)).unwrap(),
                ),
            }
        }

        fn out(&self) -> &Path {
            self.dir.path()
        }

        /// A fresh manager over the same disk state, as a new run would see.
        fn manager(&self, progress: Arc<dyn ProgressSink>) -> DownloadManager {
            let downloader = ConcurrentDownloader::new(
                Arc::clone(&self.session) as Arc<dyn crate::api::DownloadSession>,
                IntegrityChecker::new(false, false, 1024),
                fast_config(),
                CircuitBreaker::default(),
                CancellationToken::new(),
            );
            DownloadManager::new(
                Arc::clone(&self.api) as Arc<dyn PhotoApi>,
                downloader,
                CheckpointStore::for_output_dir(self.out()),
                RetrievalQueue::for_output_dir(self.out()),
                StatisticsTracker::new(),
                progress,
            )
            .with_cache(Arc::clone(&self.cache) as Arc<dyn MetadataCache>)
        }

        fn serve(&self, files: &[RemoteFile]) {
            for f in files {
                self.session
                    .script(f.original_url.as_deref().unwrap(), vec![Scripted::Body(b"data")]);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_gallery_makes_no_network_calls() {
        let h = Harness::new();
        let g = gallery(7, "Portraits", 10);
        let listing = photos(7, 10);
        h.cache.save_photo_metadata(7, &listing).await.unwrap();
        let dir = h.out().join("Portraits");
        std::fs::create_dir_all(&dir).unwrap();
        for p in &listing {
            std::fs::write(dir.join(&p.file_name), b"data").unwrap();
        }

        let progress = Arc::new(RecordingProgress::default());
        let m = h.manager(progress.clone());
        let summary = m
            .download_all_galleries(&root(vec![g]), h.out(), None, Path::new(""))
            .await
            .unwrap();

        assert_eq!(h.api.calls(), 0);
        assert_eq!(h.session.calls(), 0);
        assert_eq!(summary.already_existed(), 10);
        assert_eq!(summary.downloaded(), 0);
        assert_eq!(summary.summary.report.files_previously_downloaded, 10);
        assert_eq!(summary.summary.report.files_completed, 0);
        assert_eq!(progress.advanced_for("Portraits"), 10);
        assert!(progress.events().contains(&ProgressEvent::Finish {
            name: "Portraits".into(),
            downloaded: 0,
            total: 10,
            failed: 0,
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_run_downloads_nothing() {
        let h = Harness::new();
        let g = gallery(3, "Weddings", 3);
        let listing = photos(3, 3);
        h.api.set(3, FakeSet::Photos(listing.clone()));
        h.serve(&listing);
        let tree = root(vec![g]);

        let first = h.manager(Arc::new(crate::progress::NoProgress));
        let summary = first
            .download_all_galleries(&tree, h.out(), None, Path::new(""))
            .await
            .unwrap();
        assert_eq!(summary.downloaded(), 3);
        assert!(summary.fully_successful());
        assert!(h.out().join("Weddings").join("g3_00.jpg").exists());
        let (api_calls, downloads) = (h.api.calls(), h.session.calls());
        assert_eq!(downloads, 3);

        let second = h.manager(Arc::new(crate::progress::NoProgress));
        let summary = second
            .download_all_galleries(&tree, h.out(), None, Path::new(""))
            .await
            .unwrap();
        assert_eq!(summary.downloaded(), 0);
        assert_eq!(summary.already_existed(), 3);
        assert_eq!(h.api.calls(), api_calls);
        assert_eq!(h.session.calls(), downloads);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_timeout_queued_not_failed() {
        let h = Harness::new();
        let g = gallery(4, "Events", 2);
        let listing = photos(4, 2);
        h.api.set(4, FakeSet::Photos(listing.clone()));
        h.serve(&listing[..1]);
        let slow = &listing[1];
        h.session
            .script(slow.original_url.as_deref().unwrap(), vec![Scripted::Timeout]);

        let m = h.manager(Arc::new(crate::progress::NoProgress));
        let result = m.process_gallery(&target(&g), h.out()).await;

        assert!(result.success);
        assert_eq!(result.downloaded, 1);
        assert_eq!(result.failed, 1);
        assert_eq!(result.queued, 1);

        let items = m.queue().items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].photo_id, slow.id);
        assert_eq!(items[0].gallery_id, 4);
        assert!(items[0].error_message.starts_with(TIMEOUT_REASON));

        let slow_path = h.out().join("Events").join(&slow.file_name);
        assert!(!m.checkpoint().is_file_failed(&slow_path));
        assert!(m.checkpoint().should_download(&slow_path));
        assert!(!slow_path.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_marked_failed_not_queued() {
        let h = Harness::new();
        let g = gallery(5, "Misc", 1);
        let listing = photos(5, 1);
        h.api.set(5, FakeSet::Photos(listing.clone()));
        h.session
            .script(listing[0].original_url.as_deref().unwrap(), vec![Scripted::Status(404)]);

        let m = h.manager(Arc::new(crate::progress::NoProgress));
        let result = m.process_gallery(&target(&g), h.out()).await;
        assert_eq!(result.failed, 1);
        assert_eq!(result.queued, 0);
        assert!(m.queue().is_empty());
        assert!(m
            .checkpoint()
            .is_file_failed(&h.out().join("Misc").join(&listing[0].file_name)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gallery_metadata_timeout_deferred() {
        let h = Harness::new();
        let g = gallery(8, "Slow", 12);
        h.api.set(8, FakeSet::Hang);

        let m = h.manager(Arc::new(crate::progress::NoProgress));
        let result = m.process_gallery(&target(&g), h.out()).await;

        assert!(result.success);
        assert!(result.added_to_retry_queue);
        assert_eq!(result.total_files, 0);
        let items = m.queue().items();
        assert_eq!(items.len(), 1);
        assert!(items[0].is_gallery_retry());
        assert_eq!(items[0].gallery_id, 8);
        assert_eq!(
            items[0].error_message,
            "API timeout loading gallery metadata after 120 seconds"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_gallery_server_error_deferred() {
        let h = Harness::new();
        let g = gallery(9, "Broken", 3);
        h.api.set(9, FakeSet::Fail(500));

        let m = h.manager(Arc::new(crate::progress::NoProgress));
        let summary = m
            .download_all_galleries(&root(vec![g]), h.out(), None, Path::new(""))
            .await
            .unwrap();
        assert_eq!(summary.successful_count, 1);
        assert!(summary.gallery_results[0].added_to_retry_queue);
        assert!(!summary.fully_successful());
        assert!(m.queue().items()[0].error_message.contains("Server error 500"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_listing_skips_gallery() {
        let h = Harness::new();
        let g = gallery(6, "Ghost", 5);
        h.api.set(6, FakeSet::Photos(Vec::new()));

        let m = h.manager(Arc::new(crate::progress::NoProgress));
        let result = m.process_gallery(&target(&g), h.out()).await;
        assert!(!result.success);
        assert!(result.skipped);
        assert_eq!(
            result.error.as_deref(),
            Some("API returned empty gallery (expected 5 photos)")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_gallery_fails() {
        let h = Harness::new();
        let g = gallery(404, "Gone", 5);
        let m = h.manager(Arc::new(crate::progress::NoProgress));
        let summary = m
            .download_all_galleries(&root(vec![g]), h.out(), None, Path::new(""))
            .await
            .unwrap();
        assert_eq!(summary.failed_count, 1);
        assert!(summary.gallery_results[0].error.as_deref().unwrap().contains("Not found"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_gallery_uses_cached_listing() {
        let h = Harness::new();
        let g = gallery(2, "Family", 4);
        let listing = photos(2, 4);
        h.cache.save_photo_metadata(2, &listing).await.unwrap();
        h.serve(&listing);
        let dir = h.out().join("Family");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(&listing[0].file_name), b"data").unwrap();

        let m = h.manager(Arc::new(crate::progress::NoProgress));
        let result = m.process_gallery(&target(&g), h.out()).await;
        assert_eq!(h.api.calls(), 0);
        assert_eq!(result.already_existed, 1);
        assert_eq!(result.downloaded, 3);
        assert_eq!(h.session.calls(), 3);
        assert!(m.checkpoint().is_file_skipped(&dir.join(&listing[0].file_name)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_refetches_complete_gallery() {
        let h = Harness::new();
        let g = gallery(2, "Family", 2);
        let listing = photos(2, 2);
        h.cache.save_photo_metadata(2, &listing).await.unwrap();
        h.serve(&listing);
        let dir = h.out().join("Family");
        std::fs::create_dir_all(&dir).unwrap();
        for p in &listing {
            std::fs::write(dir.join(&p.file_name), b"old!").unwrap();
        }

        let m = h
            .manager(Arc::new(crate::progress::NoProgress))
            .with_overwrite(true);
        let result = m.process_gallery(&target(&g), h.out()).await;
        assert_eq!(result.downloaded, 2);
        assert_eq!(h.session.calls(), 2);
        assert_eq!(std::fs::read(dir.join(&listing[0].file_name)).unwrap(), b"data");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_manager_starts_no_gallery() {
        let h = Harness::new();
        let g = gallery(3, "Weddings", 3);
        h.api.set(3, FakeSet::Photos(photos(3, 3)));
        let m = h.manager(Arc::new(crate::progress::NoProgress));
        m.stop();
        let summary = m
            .download_all_galleries(&root(vec![g]), h.out(), None, Path::new(""))
            .await
            .unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.galleries_processed, 0);
        assert_eq!(h.api.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_retrieval_queue() {
        let h = Harness::new();
        let m = h.manager(Arc::new(crate::progress::NoProgress));
        let dir = h.out().join("Events");
        std::fs::create_dir_all(&dir).unwrap();

        let ready = photo(401, "late.jpg");
        let pending = photo(402, "later.jpg");
        for p in [&ready, &pending] {
            let info = DownloadInfo::for_file(p, &dir).unwrap();
            m.queue().add_item(&info, 4, "Events", "timeout").unwrap();
        }
        m.queue()
            .add_gallery_retry(&gallery(8, "Slow", 2), "API timeout")
            .unwrap();
        m.queue().backdate(25);

        h.serve(&[ready.clone()]);
        h.session
            .script(pending.original_url.as_deref().unwrap(), vec![Scripted::Timeout]);
        h.api.set(8, FakeSet::Photos(photos(8, 2)));

        let tree = root(vec![gallery(4, "Events 2024", 2), gallery(8, "Slow", 2)]);
        let run = m.process_retrieval_queue(24, Some(&tree)).await;
        assert_eq!(
            run,
            QueueRunResult {
                total_items: 3,
                processed: 3,
                successful: 2,
                failed: 0,
                still_pending: 1,
            }
        );
        assert!(dir.join("late.jpg").exists());

        let left = m.queue().items();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].photo_id, 402);
        assert_eq!(left[0].attempt_count, 2);
        assert_eq!(left[0].gallery_title, "Events 2024");
        assert_eq!(h.cache.load_photo_metadata(8).await.unwrap().map(|p| p.len()), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_retrieval_queue_respects_cooldown() {
        let h = Harness::new();
        let m = h.manager(Arc::new(crate::progress::NoProgress));
        let info = DownloadInfo::for_file(&photo(1, "a.jpg"), h.out()).unwrap();
        m.queue().add_item(&info, 4, "Events", "timeout").unwrap();

        let run = m.process_retrieval_queue(24, None).await;
        assert_eq!(run, QueueRunResult::default());
        assert_eq!(h.session.calls(), 0);
        assert_eq!(m.queue().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_file_names_get_separate_paths() {
        let h = Harness::new();
        let g = gallery(11, "Two Cameras", 2);
        let first = RemoteFile::from_queue_entry(
            1,
            "dup.jpg",
            "https://files.example.com/a/dup.jpg",
            4,
            "image/jpeg",
        );
        let second = RemoteFile::from_queue_entry(
            2,
            "dup.jpg",
            "https://files.example.com/b/dup.jpg",
            4,
            "image/jpeg",
        );
        h.api.set(11, FakeSet::Photos(vec![first.clone(), second.clone()]));
        h.session.script(
            first.original_url.as_deref().unwrap(),
            vec![Scripted::Body(b"data")],
        );
        h.session.script(
            second.original_url.as_deref().unwrap(),
            vec![Scripted::Truncated(b"da")],
        );

        let dir = h.out().join("Two Cameras");
        let kept = dir.join("dup.jpg");
        let renamed = dir.join("dup_2.jpg");

        let m = h.manager(Arc::new(crate::progress::NoProgress));
        let result = m.process_gallery(&target(&g), h.out()).await;
        assert_eq!(result.downloaded, 1);
        assert_eq!(result.failed, 1);
        assert_eq!(std::fs::read(&kept).unwrap(), b"data");
        assert!(!renamed.exists());
        assert!(m.checkpoint().is_file_completed(&kept));
        assert!(!m.checkpoint().is_file_failed(&kept));
        assert!(m.checkpoint().is_file_failed(&renamed));

        // A later run fetches only the photo that failed, under the same name.
        h.session.script(
            second.original_url.as_deref().unwrap(),
            vec![Scripted::Body(b"more")],
        );
        let calls = h.session.calls();
        let m = h.manager(Arc::new(crate::progress::NoProgress));
        let result = m.process_gallery(&target(&g), h.out()).await;
        assert_eq!(result.downloaded, 1);
        assert_eq!(result.already_existed, 1);
        assert_eq!(h.session.calls(), calls + 1);
        assert_eq!(std::fs::read(&kept).unwrap(), b"data");
        assert_eq!(std::fs::read(&renamed).unwrap(), b"more");
    }

    #[tokio::test]
    async fn test_panicking_file_check_is_an_error() {
        let planned = run_blocking(|| -> Vec<DownloadTask> { panic!("disk check blew up") }).await;
        let err = planned.unwrap_err();
        assert!(err.starts_with("Failed to check existing files"), "{err}");
        assert_eq!(run_blocking(|| 7).await, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoint_persisted_at_gallery_end() {
        let h = Harness::new();
        let g = gallery(5, "Misc", 1);
        let listing = photos(5, 1);
        h.api.set(5, FakeSet::Photos(listing.clone()));
        h.session
            .script(listing[0].original_url.as_deref().unwrap(), vec![Scripted::Status(404)]);

        let m = h.manager(Arc::new(crate::progress::NoProgress));
        m.process_gallery(&target(&g), h.out()).await;

        let reloaded = CheckpointStore::for_output_dir(h.out());
        assert!(reloaded.is_file_failed(&h.out().join("Misc").join(&listing[0].file_name)));
    }

    #[test]
    fn test_collect_galleries_filter_and_base_path() {
        let tree = root(vec![
            gallery(1, "Smith Wedding", 10),
            gallery(2, "Portraits", 4),
            gallery(3, "Jones WEDDING", 2),
        ]);
        let re = gallery_filter("wedding").unwrap();
        let found = collect_galleries(&tree, Some(&re), Path::new("clients"));
        let names: Vec<_> = found.iter().map(|t| t.gallery.title.as_str()).collect();
        assert_eq!(names, vec!["Smith Wedding", "Jones WEDDING"]);
        assert_eq!(found[0].local_path, Path::new("clients").join("Smith Wedding"));
        assert_eq!(collect_galleries(&tree, None, Path::new("")).len(), 3);
        assert!(gallery_filter("(").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dry_run_uses_hierarchy_counts_only() {
        let h = Harness::new();
        let m = h.manager(Arc::new(crate::progress::NoProgress));
        let tree = root(vec![gallery(1, "Wedding", 10), gallery(2, "Portraits", 4)]);
        let report = m.dry_run_analysis(&tree, None, Path::new(""));
        assert_eq!(report.galleries_count, 2);
        assert_eq!(report.files_to_download, 14);
        assert_eq!(report.total_size_mb, 70.0);
        assert_eq!(report.galleries[0].size_mb, 50.0);
        assert_eq!(h.api.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_analyze_galleries_counts_media() {
        let h = Harness::new();
        let mut listing = photos(1, 3);
        listing[2].is_video = true;
        h.api.set(1, FakeSet::Photos(listing));
        let m = h.manager(Arc::new(crate::progress::NoProgress));
        let tree = root(vec![gallery(1, "Mixed", 3), gallery(2, "Missing", 1)]);
        let a = m.analyze_galleries(&tree).await;
        assert_eq!(a.total_galleries, 2);
        assert_eq!(a.total_photos, 2);
        assert_eq!(a.total_videos, 1);
        assert_eq!(a.estimated_time, "6 seconds");
    }

    #[test]
    fn test_estimate_download_time() {
        assert_eq!(estimate_download_time(0, 10), "20 seconds");
        assert_eq!(estimate_download_time(300 * 1024 * 1024, 0), "1.0 minutes");
        assert_eq!(estimate_download_time(0, 3600), "2.0 hours");
    }

    #[test]
    fn test_retrieval_reason_routing() {
        let dir = tempfile::tempdir().unwrap();
        let task = crate::download::downloader::tests::task(dir.path(), 1, "a.jpg", 4);
        let with = |error: DownloadError, attempts: u32| {
            let mut r = DownloadResult::new(&task);
            r.error = Some(error);
            r.attempts = attempts;
            retrieval_reason(&r)
        };
        assert_eq!(with(DownloadError::Timeout("t".into()), 3), Some(TIMEOUT_REASON));
        assert_eq!(with(DownloadError::Timeout("t".into()), 2), None);
        assert_eq!(with(DownloadError::server(500, "oops"), 6), Some(SERVER_REASON));
        assert_eq!(with(DownloadError::server(502, ""), 6), Some(GATEWAY_REASON));
        assert_eq!(with(DownloadError::server(503, ""), 6), Some(UNAVAILABLE_REASON));
        assert_eq!(with(DownloadError::NotFound, 1), None);
        assert_eq!(with(DownloadError::Network("bad gateway".into()), 6), Some(GATEWAY_REASON));
        assert_eq!(with(DownloadError::Stopped, 0), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_existing_files() {
        let h = Harness::new();
        let dir = h.out().join("G");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("ok.jpg"), b"data").unwrap();
        std::fs::write(dir.join("empty.jpg"), b"").unwrap();
        std::fs::write(h.out().join(".zenfolio_checkpoint.json"), b"").unwrap();

        let integrity = IntegrityChecker::new(true, true, 1024);
        let report = verify_existing_files(integrity, h.out()).await.unwrap();
        assert_eq!(report.total_checked, 2);
        assert_eq!(report.valid_files, 1);
        assert_eq!(report.invalid_files.len(), 1);
        assert_eq!(report.invalid_files[0].path, dir.join("empty.jpg"));
    }
}
