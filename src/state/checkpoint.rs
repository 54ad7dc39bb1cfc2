//! Per-file outcome record that lets an interrupted run resume.
//!
//! Paths live in exactly one of three sets. `completed` holds files
//! downloaded and verified, `skipped` holds files found intact on disk, and
//! `failed` holds files that exhausted their retries. Files in `completed`
//! or `skipped` are never fetched again unless the run forces overwrites.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use super::{read_json, write_json, StateError};
use crate::api::DownloadInfo;
use crate::stats::ProgressSnapshot;

pub const CHECKPOINT_FILE_NAME: &str = ".zenfolio_checkpoint.json";
pub const CHECKPOINT_VERSION: &str = "1.0";

/// Minimum spacing between automatic saves. Forced saves ignore it.
const SAVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GalleryProgress {
    pub total_files: u64,
    pub downloaded: u64,
    pub failed: u64,
    pub already_existed: u64,
    pub success: bool,
    pub last_updated: Option<DateTime<Local>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TotalProgress {
    pub total_files: u64,
    pub completed_files: u64,
    pub failed_files: u64,
    pub skipped_files: u64,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    pub completion_percentage: f64,
    pub last_updated: Option<DateTime<Local>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct CheckpointData {
    completed_files: BTreeSet<String>,
    failed_files: BTreeSet<String>,
    skipped_files: BTreeSet<String>,
    gallery_progress: BTreeMap<String, GalleryProgress>,
    total_progress: Option<TotalProgress>,
    session_start_time: Option<DateTime<Local>>,
    last_updated: Option<DateTime<Local>>,
    version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResumeInfo {
    pub has_checkpoint: bool,
    pub completed_files: usize,
    pub failed_files: usize,
    pub skipped_files: usize,
    pub galleries_in_progress: usize,
    pub session_start_time: Option<DateTime<Local>>,
    pub last_updated: Option<DateTime<Local>>,
}

#[derive(Debug)]
struct Inner {
    data: CheckpointData,
    auto_save: bool,
    last_save: Option<Instant>,
}

/// Mutations from concurrent completions serialize through one mutex.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

fn key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl CheckpointStore {
    /// Empty store persisting to `path`. Nothing is read from disk.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            inner: Mutex::new(Inner {
                data: CheckpointData::default(),
                auto_save: true,
                last_save: None,
            }),
        }
    }

    /// Store for the checkpoint file inside `output_dir`, loaded if present.
    pub fn for_output_dir(output_dir: &Path) -> Self {
        let store = Self::new(output_dir.join(CHECKPOINT_FILE_NAME));
        store.load();
        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace in-memory state with the file's contents. A missing or
    /// malformed file leaves an empty checkpoint and returns `false`.
    pub fn load(&self) -> bool {
        let data = match read_json::<CheckpointData>(&self.path) {
            Ok(Some(data)) => data,
            Ok(None) => {
                tracing::debug!("No checkpoint file found");
                return false;
            }
            Err(e) => {
                tracing::warn!("Ignoring unreadable checkpoint: {}", e);
                return false;
            }
        };
        tracing::info!(
            "Resuming from checkpoint: {} completed, {} failed, {} previously downloaded",
            data.completed_files.len(),
            data.failed_files.len(),
            data.skipped_files.len()
        );
        self.lock().data = data;
        true
    }

    /// Write the current snapshot now. The file is written on the blocking
    /// pool from a copy taken under the lock.
    pub async fn persist(&self) -> Result<(), StateError> {
        let data = {
            let mut inner = self.lock();
            inner.data.last_updated = Some(Local::now());
            inner.data.version = CHECKPOINT_VERSION.to_string();
            inner.data.clone()
        };
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_json(&path, &data, true)).await??;
        self.lock().last_save = Some(Instant::now());
        tracing::debug!("Checkpoint saved to {}", self.path.display());
        Ok(())
    }

    /// Throttled save after a mutation; saves closer together than the save
    /// interval are coalesced.
    fn autosave_locked(path: &Path, inner: &mut Inner) -> Result<(), StateError> {
        if inner.last_save.is_some_and(|t| t.elapsed() < SAVE_INTERVAL) {
            return Ok(());
        }
        inner.data.last_updated = Some(Local::now());
        inner.data.version = CHECKPOINT_VERSION.to_string();
        write_json(path, &inner.data, true)?;
        inner.last_save = Some(Instant::now());
        tracing::debug!("Checkpoint saved to {}", path.display());
        Ok(())
    }

    fn mutate(&self, f: impl FnOnce(&mut CheckpointData)) {
        let mut inner = self.lock();
        f(&mut inner.data);
        if inner.auto_save {
            if let Err(e) = Self::autosave_locked(&self.path, &mut inner) {
                tracing::warn!("Failed to save checkpoint: {}", e);
            }
        }
    }

    /// Delete the file and reset in-memory state.
    pub fn clear(&self) -> Result<(), StateError> {
        let mut inner = self.lock();
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StateError::write(&self.path, e)),
        }
        inner.data = CheckpointData::default();
        inner.last_save = None;
        tracing::debug!("Checkpoint cleared");
        Ok(())
    }

    pub fn mark_completed(&self, path: &Path) {
        let k = key(path);
        self.mutate(|d| {
            d.failed_files.remove(&k);
            d.skipped_files.remove(&k);
            d.completed_files.insert(k);
        });
    }

    pub fn mark_failed(&self, path: &Path) {
        let k = key(path);
        self.mutate(|d| {
            d.completed_files.remove(&k);
            d.skipped_files.remove(&k);
            d.failed_files.insert(k);
        });
    }

    /// A file verified this session stays completed.
    pub fn mark_skipped(&self, path: &Path) {
        let k = key(path);
        self.mutate(|d| {
            if d.completed_files.contains(&k) {
                return;
            }
            d.failed_files.remove(&k);
            d.skipped_files.insert(k);
        });
    }

    pub fn is_file_completed(&self, path: &Path) -> bool {
        self.lock().data.completed_files.contains(&key(path))
    }

    pub fn is_file_failed(&self, path: &Path) -> bool {
        self.lock().data.failed_files.contains(&key(path))
    }

    pub fn is_file_skipped(&self, path: &Path) -> bool {
        self.lock().data.skipped_files.contains(&key(path))
    }

    pub fn should_download(&self, path: &Path) -> bool {
        let k = key(path);
        let inner = self.lock();
        !(inner.data.completed_files.contains(&k) || inner.data.skipped_files.contains(&k))
    }

    pub fn update_gallery_progress(&self, gallery: &str, progress: GalleryProgress) {
        self.mutate(|d| {
            d.gallery_progress.insert(
                gallery.to_string(),
                GalleryProgress {
                    last_updated: Some(Local::now()),
                    ..progress
                },
            );
        });
    }

    pub fn update_total_progress(&self, progress: &ProgressSnapshot) {
        let completion_percentage = if progress.total_files == 0 {
            0.0
        } else {
            progress.completed_files as f64 / progress.total_files as f64 * 100.0
        };
        let total = TotalProgress {
            total_files: progress.total_files,
            completed_files: progress.completed_files,
            failed_files: progress.failed_files,
            skipped_files: progress.skipped_files,
            total_bytes: progress.total_bytes,
            downloaded_bytes: progress.downloaded_bytes,
            completion_percentage,
            last_updated: Some(Local::now()),
        };
        self.mutate(|d| d.total_progress = Some(total));
    }

    pub fn get_resume_info(&self) -> ResumeInfo {
        let inner = self.lock();
        let d = &inner.data;
        ResumeInfo {
            has_checkpoint: !d.completed_files.is_empty(),
            completed_files: d.completed_files.len(),
            failed_files: d.failed_files.len(),
            skipped_files: d.skipped_files.len(),
            galleries_in_progress: d.gallery_progress.len(),
            session_start_time: d.session_start_time,
            last_updated: d.last_updated,
        }
    }

    /// Split downloads into those still to fetch and those the checkpoint
    /// already settled as completed or skipped.
    pub fn filter_downloads_for_resume(
        &self,
        downloads: Vec<DownloadInfo>,
    ) -> (Vec<DownloadInfo>, Vec<DownloadInfo>) {
        let total = downloads.len();
        let (pending, settled): (Vec<_>, Vec<_>) = downloads
            .into_iter()
            .partition(|d| self.should_download(&d.local_path));
        tracing::debug!(
            "Resume filter: {} files to download out of {} total files",
            pending.len(),
            total
        );
        (pending, settled)
    }

    /// Record the session start once; a resumed session keeps its original
    /// start time.
    pub async fn start_session(&self) -> Result<(), StateError> {
        {
            let mut inner = self.lock();
            if inner.data.session_start_time.is_some() {
                return Ok(());
            }
            inner.data.session_start_time = Some(Local::now());
        }
        self.persist().await
    }

    /// Without auto-save, mutations stay in memory until [`Self::persist`].
    pub fn set_auto_save(&self, enabled: bool) {
        self.lock().auto_save = enabled;
        tracing::debug!("Checkpoint auto-save {}", if enabled { "enabled" } else { "disabled" });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RemoteFile;

    fn store(dir: &tempfile::TempDir) -> CheckpointStore {
        CheckpointStore::new(dir.path().join(CHECKPOINT_FILE_NAME))
    }

    #[test]
    fn test_completed_and_failed_stay_disjoint() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let p = Path::new("/out/a.jpg");

        s.mark_failed(p);
        assert!(s.is_file_failed(p));
        s.mark_completed(p);
        assert!(s.is_file_completed(p) && !s.is_file_failed(p));
        s.mark_failed(p);
        assert!(s.is_file_failed(p) && !s.is_file_completed(p));
    }

    #[test]
    fn test_skipped_does_not_demote_completed() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let p = Path::new("/out/a.jpg");
        s.mark_completed(p);
        s.mark_skipped(p);
        assert!(s.is_file_completed(p));
        assert!(!s.is_file_skipped(p));

        let q = Path::new("/out/b.jpg");
        s.mark_failed(q);
        s.mark_skipped(q);
        assert!(s.is_file_skipped(q) && !s.is_file_failed(q));
    }

    #[test]
    fn test_should_download_gate() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let (a, b, c, d) = (
            Path::new("a"),
            Path::new("b"),
            Path::new("c"),
            Path::new("d"),
        );
        s.mark_completed(a);
        s.mark_skipped(b);
        s.mark_failed(c);
        assert!(!s.should_download(a));
        assert!(!s.should_download(b));
        assert!(s.should_download(c));
        assert!(s.should_download(d));
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        s.mark_completed(Path::new("/out/a.jpg"));
        s.mark_skipped(Path::new("/out/b.jpg"));
        s.update_gallery_progress(
            "Weddings",
            GalleryProgress {
                total_files: 2,
                downloaded: 1,
                ..GalleryProgress::default()
            },
        );
        s.persist().await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(s.path()).unwrap()).unwrap();
        assert_eq!(raw["version"], "1.0");
        assert_eq!(raw["completed_files"][0], "/out/a.jpg");

        let reloaded = store(&dir);
        assert!(reloaded.load());
        assert!(reloaded.is_file_completed(Path::new("/out/a.jpg")));
        assert!(reloaded.is_file_skipped(Path::new("/out/b.jpg")));
        assert_eq!(reloaded.get_resume_info().galleries_in_progress, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_checkpoint_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        s.persist().await.unwrap();
        let mode = std::fs::metadata(s.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_missing_or_malformed_file_is_no_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        assert!(!s.load());
        std::fs::write(s.path(), b"{not json").unwrap();
        assert!(!s.load());
        assert!(!s.get_resume_info().has_checkpoint);
    }

    #[tokio::test]
    async fn test_auto_save_is_throttled() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        s.mark_completed(Path::new("first"));
        assert!(s.path().exists());
        s.mark_completed(Path::new("second"));

        // The second mark landed inside the save interval.
        let reloaded = store(&dir);
        reloaded.load();
        assert!(reloaded.is_file_completed(Path::new("first")));
        assert!(!reloaded.is_file_completed(Path::new("second")));

        s.persist().await.unwrap();
        reloaded.load();
        assert!(reloaded.is_file_completed(Path::new("second")));
    }

    #[tokio::test]
    async fn test_auto_save_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        s.set_auto_save(false);
        s.mark_completed(Path::new("a"));
        assert!(!s.path().exists());
        s.persist().await.unwrap();
        let reloaded = store(&dir);
        assert!(reloaded.load());
        assert!(reloaded.is_file_completed(Path::new("a")));
    }

    #[tokio::test]
    async fn test_clear_removes_file_and_state() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        s.mark_completed(Path::new("a"));
        s.persist().await.unwrap();
        s.clear().unwrap();
        assert!(!s.path().exists());
        assert!(s.should_download(Path::new("a")));
        s.clear().unwrap();
    }

    #[tokio::test]
    async fn test_start_session_keeps_original_start() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        s.start_session().await.unwrap();
        let first = s.get_resume_info().session_start_time;
        assert!(first.is_some());
        assert!(s.path().exists());
        s.start_session().await.unwrap();
        assert_eq!(s.get_resume_info().session_start_time, first);
    }

    #[test]
    fn test_filter_downloads_for_resume() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let out = dir.path();
        let infos: Vec<DownloadInfo> = ["a.jpg", "b.jpg"]
            .iter()
            .enumerate()
            .map(|(i, n)| {
                let f = RemoteFile::from_queue_entry(i as u64 + 1, n, "https://x", 1, "image/jpeg");
                DownloadInfo::for_file(&f, out).unwrap()
            })
            .collect();
        s.mark_completed(&out.join("a.jpg"));
        let (left, settled) = s.filter_downloads_for_resume(infos);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].local_path, out.join("b.jpg"));
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].local_path, out.join("a.jpg"));
    }

    #[tokio::test]
    async fn test_total_progress_percentage() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        s.update_total_progress(&ProgressSnapshot {
            total_files: 4,
            completed_files: 1,
            ..ProgressSnapshot::default()
        });
        s.persist().await.unwrap();
        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(s.path()).unwrap()).unwrap();
        assert_eq!(raw["total_progress"]["completion_percentage"], 25.0);
    }
}
