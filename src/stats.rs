//! Session statistics shared by concurrent downloads.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::download::{format_bytes, format_duration};

const MB: f64 = 1024.0 * 1024.0;

fn elapsed(start: Option<DateTime<Local>>, end: Option<DateTime<Local>>) -> Duration {
    let Some(start) = start else {
        return Duration::ZERO;
    };
    let end = end.unwrap_or_else(Local::now);
    (end - start).to_std().unwrap_or(Duration::ZERO)
}

fn percentage(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

fn speed_mbps(bytes: u64, duration: Duration) -> f64 {
    let secs = duration.as_secs_f64();
    if secs == 0.0 {
        0.0
    } else {
        bytes as f64 / MB / secs
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GalleryStats {
    pub name: String,
    pub total_files: u64,
    pub completed_files: u64,
    pub failed_files: u64,
    pub skipped_files: u64,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    pub start_time: Option<DateTime<Local>>,
    pub end_time: Option<DateTime<Local>>,
}

impl GalleryStats {
    pub fn duration(&self) -> Duration {
        elapsed(self.start_time, self.end_time)
    }

    pub fn completion_percentage(&self) -> f64 {
        percentage(self.completed_files, self.total_files)
    }

    pub fn download_speed_mbps(&self) -> f64 {
        speed_mbps(self.downloaded_bytes, self.duration())
    }

    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OverallStats {
    pub total_galleries: u64,
    pub completed_galleries: u64,
    pub total_files: u64,
    pub completed_files: u64,
    pub failed_files: u64,
    pub skipped_files: u64,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    pub start_time: Option<DateTime<Local>>,
    pub end_time: Option<DateTime<Local>>,
    /// In the order galleries were started.
    pub galleries: Vec<GalleryStats>,
}

impl OverallStats {
    pub fn duration(&self) -> Duration {
        elapsed(self.start_time, self.end_time)
    }

    pub fn completion_percentage(&self) -> f64 {
        percentage(self.completed_files, self.total_files)
    }

    pub fn download_speed_mbps(&self) -> f64 {
        speed_mbps(self.downloaded_bytes, self.duration())
    }

    pub fn gallery(&self, name: &str) -> Option<&GalleryStats> {
        self.galleries.iter().rev().find(|g| g.name == name)
    }

    fn gallery_mut(&mut self, name: &str) -> Option<&mut GalleryStats> {
        self.galleries.iter_mut().rev().find(|g| g.name == name)
    }
}

/// Point-in-time snapshot for progress displays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub total_files: u64,
    pub completed_files: u64,
    pub failed_files: u64,
    pub skipped_files: u64,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryReport {
    pub start_time: Option<DateTime<Local>>,
    pub end_time: Option<DateTime<Local>>,
    pub duration_seconds: f64,
    pub galleries_total: u64,
    pub galleries_completed: u64,
    pub galleries_in_progress: u64,
    pub files_total: u64,
    pub files_completed: u64,
    pub files_failed: u64,
    pub files_previously_downloaded: u64,
    pub completion_percentage: f64,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    pub average_speed_mbps: f64,
    pub files_per_second: f64,
    pub success_rate: f64,
    pub estimated_time_remaining: Option<Duration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FinalSummary {
    pub report: SummaryReport,
    pub galleries: Vec<GalleryStats>,
}

#[derive(Debug, Default)]
struct TrackerState {
    overall: OverallStats,
    current_gallery: Option<String>,
}

impl TrackerState {
    fn end_gallery(&mut self, name: &str) {
        if let Some(g) = self.overall.gallery_mut(name) {
            if g.end_time.is_none() {
                g.end_time = Some(Local::now());
                tracing::debug!(
                    "Completed gallery: {} - {}/{} files in {}",
                    g.name,
                    g.completed_files,
                    g.total_files,
                    format_duration(g.duration())
                );
                self.overall.completed_galleries += 1;
            }
        }
        if self.current_gallery.as_deref() == Some(name) {
            self.current_gallery = None;
        }
    }

    fn estimate_time_remaining(&self) -> Option<Duration> {
        let o = &self.overall;
        if o.completed_files == 0 {
            return None;
        }
        let remaining = o.total_files.saturating_sub(o.completed_files);
        if remaining == 0 {
            return Some(Duration::ZERO);
        }
        let secs = o.duration().as_secs_f64();
        if secs <= 0.0 {
            return None;
        }
        let per_second = o.completed_files as f64 / secs;
        Some(Duration::from_secs_f64(remaining as f64 / per_second))
    }

    fn summary_report(&self) -> SummaryReport {
        let o = &self.overall;
        let duration = o.duration();
        let secs = duration.as_secs_f64();
        let attempted = o.completed_files + o.failed_files;
        SummaryReport {
            start_time: o.start_time,
            end_time: o.end_time,
            duration_seconds: secs,
            galleries_total: o.total_galleries,
            galleries_completed: o.completed_galleries,
            galleries_in_progress: o.galleries.iter().filter(|g| !g.is_finished()).count() as u64,
            files_total: o.total_files,
            files_completed: o.completed_files,
            files_failed: o.failed_files,
            files_previously_downloaded: o.skipped_files,
            completion_percentage: o.completion_percentage(),
            total_bytes: o.total_bytes,
            downloaded_bytes: o.downloaded_bytes,
            average_speed_mbps: o.download_speed_mbps(),
            files_per_second: if secs > 0.0 {
                o.completed_files as f64 / secs
            } else {
                0.0
            },
            success_rate: percentage(o.completed_files, attempted),
            estimated_time_remaining: self.estimate_time_remaining(),
        }
    }
}

/// Mutex-protected counters updated from concurrent download completions.
#[derive(Debug, Default)]
pub struct StatisticsTracker {
    state: Mutex<TrackerState>,
}

impl StatisticsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn start_session(&self) {
        self.lock().overall.start_time = Some(Local::now());
        tracing::debug!("Statistics tracking started");
    }

    /// Close the session, and the current gallery if one is open.
    pub fn end_session(&self) {
        let mut state = self.lock();
        state.overall.end_time = Some(Local::now());
        if let Some(current) = state.current_gallery.clone() {
            state.end_gallery(&current);
        }
    }

    /// Start tracking a gallery. Implicitly ends the previous one.
    pub fn start_gallery(&self, name: &str, total_files: u64, total_bytes: u64) {
        let mut state = self.lock();
        if let Some(current) = state.current_gallery.clone() {
            state.end_gallery(&current);
        }
        state.current_gallery = Some(name.to_string());
        state.overall.galleries.push(GalleryStats {
            name: name.to_string(),
            total_files,
            total_bytes,
            start_time: Some(Local::now()),
            ..GalleryStats::default()
        });
        state.overall.total_galleries += 1;
        state.overall.total_files += total_files;
        state.overall.total_bytes += total_bytes;
        tracing::debug!("Started tracking gallery: {} ({} files)", name, total_files);
    }

    pub fn end_gallery(&self, name: &str) {
        self.lock().end_gallery(name);
    }

    pub fn record_file_completed(&self, gallery: &str, bytes: u64) {
        let mut state = self.lock();
        if let Some(g) = state.overall.gallery_mut(gallery) {
            g.completed_files += 1;
            g.downloaded_bytes += bytes;
        }
        state.overall.completed_files += 1;
        state.overall.downloaded_bytes += bytes;
    }

    pub fn record_file_failed(&self, gallery: &str) {
        let mut state = self.lock();
        if let Some(g) = state.overall.gallery_mut(gallery) {
            g.failed_files += 1;
        }
        state.overall.failed_files += 1;
    }

    /// Skipped files were not downloaded this session, so their size does
    /// not count towards downloaded bytes.
    pub fn record_file_skipped(&self, gallery: &str, _size: u64) {
        self.record_files_skipped(gallery, 1);
    }

    /// Count a whole batch of files found on disk, e.g. a complete gallery.
    pub fn record_files_skipped(&self, gallery: &str, count: u64) {
        let mut state = self.lock();
        if let Some(g) = state.overall.gallery_mut(gallery) {
            g.skipped_files += count;
        }
        state.overall.skipped_files += count;
    }

    pub fn get_current_progress(&self) -> ProgressSnapshot {
        let state = self.lock();
        let o = &state.overall;
        ProgressSnapshot {
            total_files: o.total_files,
            completed_files: o.completed_files,
            failed_files: o.failed_files,
            skipped_files: o.skipped_files,
            total_bytes: o.total_bytes,
            downloaded_bytes: o.downloaded_bytes,
        }
    }

    pub fn get_gallery_stats(&self, name: &str) -> Option<GalleryStats> {
        self.lock().overall.gallery(name).cloned()
    }

    pub fn get_summary_report(&self) -> SummaryReport {
        self.lock().summary_report()
    }

    /// Summary plus per-gallery detail. Ends the session if still open.
    pub fn get_final_summary(&self) -> FinalSummary {
        let mut state = self.lock();
        if state.overall.end_time.is_none() {
            state.overall.end_time = Some(Local::now());
            if let Some(current) = state.current_gallery.clone() {
                state.end_gallery(&current);
            }
        }
        FinalSummary {
            report: state.summary_report(),
            galleries: state.overall.galleries.clone(),
        }
    }

    pub fn get_human_readable_summary(&self) -> String {
        let summary = self.get_final_summary();
        let r = &summary.report;

        // Expected size of what actually needed downloading, scaled from the
        // declared total by the share of files that were attempted.
        let attempted = r.files_completed + r.files_failed;
        let expected = if attempted > 0 && r.files_total > 0 {
            (r.total_bytes as f64 * attempted as f64 / r.files_total as f64) as u64
        } else {
            r.total_bytes
        };

        [
            "Download Session Summary".to_string(),
            format!(
                "  Galleries:   {} completed of {} total",
                r.galleries_completed, r.galleries_total
            ),
            format!(
                "  Files:       {} downloaded, {} previously downloaded, {} failed",
                r.files_completed, r.files_previously_downloaded, r.files_failed
            ),
            format!("  Total files: {}", r.files_total),
            format!(
                "  Data size:   {} downloaded (expected ~{})",
                format_bytes(r.downloaded_bytes),
                format_bytes(expected)
            ),
            format!(
                "  Duration:    {}",
                format_duration(Duration::from_secs_f64(r.duration_seconds))
            ),
            format!("  Speed:       {:.1} MB/s average", r.average_speed_mbps),
        ]
        .join("\n")
    }
}
