//! Durable backlog of assets the service has not finished preparing.
//!
//! Items are replayed on a separate schedule. Each photo has at most one
//! entry; whole-gallery retries use photo id 0 and are keyed by gallery.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Local, NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};

use super::{read_json, write_json, StateError};
use crate::api::{DownloadInfo, Gallery, RemoteFile};

pub const QUEUE_FILE_NAME: &str = "zenfolio_retrieval_queue.json";

/// Photo id reserved for whole-gallery retry items.
pub const GALLERY_RETRY_ID: u64 = 0;
pub const GALLERY_RETRY_MIME: &str = "gallery/retry";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

fn format_timestamp(t: NaiveDateTime) -> String {
    t.format(TIMESTAMP_FORMAT).to_string()
}

/// Local wall-clock timestamps as written by this module, or RFC 3339.
fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|dt| dt.with_timezone(&Local).naive_local())
        })
}

fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// `now` minus `amount` units, or `None` when the span overflows.
fn cutoff_before(
    now: NaiveDateTime,
    amount: u64,
    unit: fn(i64) -> Option<TimeDelta>,
) -> Option<NaiveDateTime> {
    let span = unit(i64::try_from(amount).ok()?)?;
    now.checked_sub_signed(span)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalItem {
    pub photo_id: u64,
    pub gallery_id: u64,
    pub gallery_title: String,
    pub file_name: String,
    pub original_url: String,
    pub local_path: String,
    pub file_size: u64,
    pub mime_type: String,
    pub added_at: String,
    pub last_attempt: String,
    pub attempt_count: u32,
    pub error_message: String,
}

impl RetrievalItem {
    pub fn is_gallery_retry(&self) -> bool {
        self.photo_id == GALLERY_RETRY_ID
    }

    /// The file to fetch again, rebuilt from the stored fields.
    pub fn download_info(&self) -> DownloadInfo {
        let file = RemoteFile::from_queue_entry(
            self.photo_id,
            &self.file_name,
            &self.original_url,
            self.file_size,
            &self.mime_type,
        );
        DownloadInfo {
            local_path: PathBuf::from(&self.local_path),
            url: self.original_url.clone(),
            expected_size: (self.file_size > 0).then_some(self.file_size),
            file,
        }
    }

    fn same_identity(&self, photo_id: u64, gallery_id: u64) -> bool {
        if photo_id == GALLERY_RETRY_ID {
            self.is_gallery_retry() && self.gallery_id == gallery_id
        } else {
            self.photo_id == photo_id
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueItemBrief {
    pub file_name: String,
    pub gallery_title: String,
    pub added_at: String,
    pub attempt_count: u32,
}

impl From<&RetrievalItem> for QueueItemBrief {
    fn from(item: &RetrievalItem) -> Self {
        Self {
            file_name: item.file_name.clone(),
            gallery_title: item.gallery_title.clone(),
            added_at: item.added_at.clone(),
            attempt_count: item.attempt_count,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GalleryQueueSummary {
    pub count: usize,
    pub total_size: u64,
    pub items: Vec<QueueItemBrief>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueSummary {
    pub total_items: usize,
    pub galleries: BTreeMap<String, GalleryQueueSummary>,
    pub oldest_item: Option<QueueItemBrief>,
    pub newest_item: Option<QueueItemBrief>,
}

#[derive(Debug)]
pub struct RetrievalQueue {
    path: PathBuf,
    items: Mutex<Vec<RetrievalItem>>,
}

impl RetrievalQueue {
    /// Load the queue at `path`. A missing or unreadable file starts empty.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let items = match read_json::<Vec<RetrievalItem>>(&path) {
            Ok(Some(items)) => {
                tracing::debug!("Loaded {} items from retrieval queue", items.len());
                items
            }
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::error!("Failed to load retrieval queue: {}", e);
                Vec::new()
            }
        };
        Self {
            path,
            items: Mutex::new(items),
        }
    }

    pub fn for_output_dir(output_dir: &Path) -> Self {
        Self::load(output_dir.join(QUEUE_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Vec<RetrievalItem>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn save(&self, items: &[RetrievalItem]) -> Result<(), StateError> {
        write_json(&self.path, &items, false)?;
        tracing::debug!("Saved {} items to retrieval queue", items.len());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn items(&self) -> Vec<RetrievalItem> {
        self.lock().clone()
    }

    fn upsert(&self, item: RetrievalItem) -> Result<u32, StateError> {
        let mut items = self.lock();
        let count = match items
            .iter_mut()
            .find(|i| i.same_identity(item.photo_id, item.gallery_id))
        {
            Some(existing) => {
                existing.last_attempt = item.last_attempt;
                existing.gallery_title = item.gallery_title;
                existing.attempt_count += 1;
                existing.error_message = item.error_message;
                existing.attempt_count
            }
            None => {
                items.push(item);
                1
            }
        };
        self.save(&items)?;
        Ok(count)
    }

    /// Queue a file whose download hit a "not ready yet" failure. Re-adding
    /// the same photo bumps its attempt count. Returns the attempt count.
    pub fn add_item(
        &self,
        info: &DownloadInfo,
        gallery_id: u64,
        gallery_title: &str,
        error_message: &str,
    ) -> Result<u32, StateError> {
        let stamp = format_timestamp(now());
        let file = &info.file;
        let count = self.upsert(RetrievalItem {
            photo_id: file.id,
            gallery_id,
            gallery_title: gallery_title.to_string(),
            file_name: file.file_name.clone(),
            original_url: info.url.clone(),
            local_path: info.local_path.to_string_lossy().into_owned(),
            file_size: info.expected_size.unwrap_or(file.size),
            mime_type: file.mime_type.clone().unwrap_or_default(),
            added_at: stamp.clone(),
            last_attempt: stamp,
            attempt_count: 1,
            error_message: error_message.to_string(),
        })?;
        tracing::debug!(
            "Queued photo {} ({}) for retrieval retry (attempt {})",
            file.id,
            file.file_name,
            count
        );
        Ok(count)
    }

    /// Queue a whole gallery whose metadata could not be loaded.
    pub fn add_gallery_retry(&self, gallery: &Gallery, error_message: &str) -> Result<u32, StateError> {
        let stamp = format_timestamp(now());
        let count = self.upsert(RetrievalItem {
            photo_id: GALLERY_RETRY_ID,
            gallery_id: gallery.id,
            gallery_title: gallery.title.clone(),
            file_name: format!("GALLERY_RETRY_{}", gallery.id),
            original_url: String::new(),
            local_path: String::new(),
            file_size: 0,
            mime_type: GALLERY_RETRY_MIME.to_string(),
            added_at: stamp.clone(),
            last_attempt: stamp,
            attempt_count: 1,
            error_message: error_message.to_string(),
        })?;
        tracing::debug!(
            "Queued gallery {} (ID: {}) for retry",
            gallery.title,
            gallery.id
        );
        Ok(count)
    }

    /// Drop the entry for a photo that finally downloaded.
    pub fn remove_completed_item(&self, photo_id: u64) -> Result<bool, StateError> {
        let mut items = self.lock();
        let Some(pos) = items
            .iter()
            .position(|i| i.photo_id == photo_id && !i.is_gallery_retry())
        else {
            return Ok(false);
        };
        let removed = items.remove(pos);
        tracing::debug!(
            "Removed completed photo {} ({}) from retrieval queue",
            photo_id,
            removed.file_name
        );
        self.save(&items)?;
        Ok(true)
    }

    pub fn remove_gallery_retry_items(&self, gallery_id: u64) -> Result<usize, StateError> {
        let mut items = self.lock();
        let before = items.len();
        items.retain(|i| !(i.is_gallery_retry() && i.gallery_id == gallery_id));
        let removed = before - items.len();
        if removed > 0 {
            tracing::debug!(
                "Removed {} gallery retry items for gallery {}",
                removed,
                gallery_id
            );
            self.save(&items)?;
        }
        Ok(removed)
    }

    /// Items whose last attempt is older than `max_age_hours`. Items with an
    /// unreadable timestamp are always ready.
    pub fn get_items_for_retry(&self, max_age_hours: u64) -> Vec<RetrievalItem> {
        self.items_ready_at(now(), max_age_hours)
    }

    fn items_ready_at(&self, now: NaiveDateTime, max_age_hours: u64) -> Vec<RetrievalItem> {
        // A cooldown reaching past the representable range holds everything back.
        let Some(cutoff) = cutoff_before(now, max_age_hours, TimeDelta::try_hours) else {
            return Vec::new();
        };
        self.lock()
            .iter()
            .filter(|i| parse_timestamp(&i.last_attempt).map_or(true, |t| t < cutoff))
            .cloned()
            .collect()
    }

    /// Drop items first queued more than `max_age_days` ago, whatever their
    /// state. Items with an unreadable timestamp are kept.
    pub fn clear_old_items(&self, max_age_days: u64) -> Result<usize, StateError> {
        self.clear_older_than(now(), max_age_days)
    }

    fn clear_older_than(&self, now: NaiveDateTime, max_age_days: u64) -> Result<usize, StateError> {
        let Some(cutoff) = cutoff_before(now, max_age_days, TimeDelta::try_days) else {
            return Ok(0);
        };
        let mut items = self.lock();
        let before = items.len();
        items.retain(|i| parse_timestamp(&i.added_at).map_or(true, |t| t > cutoff));
        let removed = before - items.len();
        if removed > 0 {
            tracing::debug!("Removed {} old items from retrieval queue", removed);
            self.save(&items)?;
        }
        Ok(removed)
    }

    /// Move every timestamp `hours` into the past.
    #[cfg(test)]
    pub(crate) fn backdate(&self, hours: i64) {
        let stamp = format_timestamp(now() - TimeDelta::hours(hours));
        for item in self.lock().iter_mut() {
            item.added_at = stamp.clone();
            item.last_attempt = stamp.clone();
        }
    }

    pub fn get_queue_summary(&self) -> QueueSummary {
        let items = self.lock();
        let mut summary = QueueSummary {
            total_items: items.len(),
            ..QueueSummary::default()
        };
        for item in items.iter() {
            let entry = summary
                .galleries
                .entry(item.gallery_title.clone())
                .or_default();
            entry.count += 1;
            entry.total_size += item.file_size;
            entry.items.push(item.into());
        }
        let by_age = |i: &&RetrievalItem| parse_timestamp(&i.added_at);
        summary.oldest_item = items.iter().min_by_key(by_age).map(Into::into);
        summary.newest_item = items.iter().max_by_key(by_age).map(Into::into);
        summary
    }
}
