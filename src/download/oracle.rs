//! Decide whether a gallery is already on disk, without touching the network.

use std::path::Path;

use super::paths::is_hidden;
use crate::api::{Gallery, RemoteFile};
use crate::cache::MetadataCache;

/// Share of the expected files that counts as complete. Some assets are
/// never served, and an exact match would re-list such galleries forever.
pub const COMPLETION_THRESHOLD: f64 = 0.95;

#[derive(Debug, Clone, PartialEq)]
pub struct GalleryCompletion {
    pub complete: bool,
    /// Cached listing, when one exists. Returned for incomplete galleries
    /// too so the caller can download the delta without a remote call.
    pub cached: Option<Vec<RemoteFile>>,
}

impl GalleryCompletion {
    fn incomplete() -> Self {
        Self {
            complete: false,
            cached: None,
        }
    }
}

/// Regular, non-hidden files directly inside `dir`. `None` if the directory
/// cannot be read.
pub async fn count_local_files(dir: &Path) -> Option<u64> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    let mut count = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if is_hidden(&path) {
            continue;
        }
        if entry.file_type().await.is_ok_and(|t| t.is_file()) {
            count += 1;
        }
    }
    Some(count)
}

pub fn meets_threshold(existing: u64, expected: u64) -> bool {
    existing >= expected || existing as f64 >= COMPLETION_THRESHOLD * expected as f64
}

/// Compare the files in `dir` against the cached listing for the gallery,
/// falling back to the photo count from the hierarchy.
pub async fn check_gallery_completion(
    gallery: &Gallery,
    dir: &Path,
    cache: Option<&dyn MetadataCache>,
) -> GalleryCompletion {
    if !dir.is_dir() {
        return GalleryCompletion::incomplete();
    }
    let existing = match count_local_files(dir).await {
        Some(n) if n > 0 => n,
        _ => return GalleryCompletion::incomplete(),
    };

    let cached = match cache {
        Some(cache) => match cache.load_photo_metadata(gallery.id).await {
            Ok(cached) => cached,
            Err(e) => {
                tracing::debug!("Metadata cache unavailable for {}: {}", gallery.title, e);
                None
            }
        },
        None => None,
    };

    if let Some(photos) = cached {
        let expected = photos.len() as u64;
        let complete = meets_threshold(existing, expected);
        tracing::debug!(
            "Gallery {}: {}/{} files on disk (cached listing), complete={}",
            gallery.title,
            existing,
            expected,
            complete
        );
        return GalleryCompletion {
            complete,
            cached: Some(photos),
        };
    }

    if gallery.photo_count > 0 {
        let complete = existing as f64 >= COMPLETION_THRESHOLD * gallery.photo_count as f64;
        tracing::debug!(
            "Gallery {}: {}/{} files on disk, complete={}",
            gallery.title,
            existing,
            gallery.photo_count,
            complete
        );
        return GalleryCompletion {
            complete,
            cached: None,
        };
    }

    GalleryCompletion::incomplete()
}
