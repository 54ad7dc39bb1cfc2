//! Download engine: per-gallery orchestration on top of a bounded pool of
//! concurrent file transfers with retry, integrity checks and resume state.

pub mod downloader;
pub mod error;
mod file;
pub mod integrity;
pub mod manager;
pub mod oracle;
pub mod paths;

use std::fs::FileTimes;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::api::DownloadInfo;

pub use downloader::ConcurrentDownloader;
pub use error::DownloadError;
pub use integrity::IntegrityChecker;

/// One file to fetch, tagged with the gallery it belongs to.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub info: DownloadInfo,
    pub gallery_name: String,
}

impl DownloadTask {
    pub fn new(info: DownloadInfo, gallery_name: impl Into<String>) -> Self {
        Self {
            info,
            gallery_name: gallery_name.into(),
        }
    }
}

/// Outcome of one file. Failures are captured here rather than returned as
/// errors so one bad file never aborts its batch.
#[derive(Debug)]
pub struct DownloadResult {
    pub local_path: PathBuf,
    pub photo_id: u64,
    pub file_name: String,
    pub bytes_downloaded: u64,
    pub duration: Duration,
    /// Zero when the download never reached the network.
    pub attempts: u32,
    /// Retries stopped early because of a persistent timeout.
    pub escalated: bool,
    pub error: Option<DownloadError>,
}

impl DownloadResult {
    fn new(task: &DownloadTask) -> Self {
        let info = &task.info;
        Self {
            local_path: info.local_path.clone(),
            photo_id: info.file.id,
            file_name: info.file.file_name.clone(),
            bytes_downloaded: 0,
            duration: Duration::ZERO,
            attempts: 0,
            escalated: false,
            error: None,
        }
    }

    pub fn success(&self) -> bool {
        self.error.is_none()
    }

    pub fn download_speed_mbps(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs == 0.0 || self.bytes_downloaded == 0 {
            return 0.0;
        }
        self.bytes_downloaded as f64 / (1024.0 * 1024.0) / secs
    }
}

pub fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {:02}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Sizes in MB, switching to GB from 1024 MB.
pub fn format_bytes(bytes: u64) -> String {
    let mb = bytes as f64 / (1024.0 * 1024.0);
    if mb >= 1024.0 {
        format!("{:.1} GB", mb / 1024.0)
    } else {
        format!("{:.1} MB", mb)
    }
}

/// Set the modification and access times of a file to the given Unix
/// timestamp. Uses `std::fs::File::set_times` (stable since Rust 1.75).
///
/// Handles negative timestamps (dates before 1970) gracefully by clamping
/// to the Unix epoch.
pub(crate) fn set_file_mtime(path: &Path, timestamp: i64) -> std::io::Result<()> {
    let time = if timestamp >= 0 {
        UNIX_EPOCH + Duration::from_secs(timestamp as u64)
    } else {
        UNIX_EPOCH
            .checked_sub(Duration::from_secs(timestamp.unsigned_abs()))
            .unwrap_or(SystemTime::UNIX_EPOCH)
    };
    let times = FileTimes::new().set_modified(time).set_accessed(time);
    let file = std::fs::File::options().write(true).open(path)?;
    file.set_times(times)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RemoteFile;
    use std::fs;

    fn tmp_file(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        let p = dir.path().join(name);
        fs::write(&p, b"test").unwrap();
        p
    }

    #[test]
    fn test_set_file_mtime_positive_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let p = tmp_file(&dir, "pos.txt");
        set_file_mtime(&p, 1_700_000_000).unwrap();
        let mtime = fs::metadata(&p).unwrap().modified().unwrap();
        assert_eq!(mtime, UNIX_EPOCH + Duration::from_secs(1_700_000_000));
    }

    #[test]
    fn test_set_file_mtime_zero_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let p = tmp_file(&dir, "zero.txt");
        set_file_mtime(&p, 0).unwrap();
        let mtime = fs::metadata(&p).unwrap().modified().unwrap();
        assert_eq!(mtime, UNIX_EPOCH);
    }

    #[test]
    fn test_set_file_mtime_negative_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let p = tmp_file(&dir, "neg.txt");
        set_file_mtime(&p, -86400).unwrap();
    }

    #[test]
    fn test_set_file_mtime_nonexistent_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(set_file_mtime(&dir.path().join("missing.txt"), 0).is_err());
    }

    #[test]
    fn test_format_duration_seconds_only() {
        assert_eq!(format_duration(Duration::from_secs(0)), "0s");
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(59)), "59s");
    }

    #[test]
    fn test_format_duration_minutes_and_seconds() {
        assert_eq!(format_duration(Duration::from_secs(60)), "1m 00s");
        assert_eq!(format_duration(Duration::from_secs(754)), "12m 34s");
    }

    #[test]
    fn test_format_duration_hours() {
        assert_eq!(format_duration(Duration::from_secs(3600)), "1h 00m 00s");
        assert_eq!(format_duration(Duration::from_secs(5025)), "1h 23m 45s");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.0 MB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024 / 2), "1.5 GB");
    }

    #[test]
    fn test_result_carries_task_context() {
        let file = RemoteFile::from_queue_entry(42, "a.jpg", "https://x/a", 10, "image/jpeg");
        let task = DownloadTask::new(
            DownloadInfo {
                local_path: PathBuf::from("/out/a.jpg"),
                url: "https://x/a".into(),
                expected_size: Some(10),
                file,
            },
            "Gallery",
        );
        let mut result = DownloadResult::new(&task);
        assert!(result.success());
        assert_eq!(result.photo_id, 42);
        assert_eq!(result.file_name, "a.jpg");

        result.error = Some(DownloadError::NotFound);
        assert_eq!(result.error.as_ref().unwrap().to_string(), "File not found on server");
        assert_eq!(result.download_speed_mbps(), 0.0);
    }
}
