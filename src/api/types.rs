//! Photo service models.
//!
//! The hierarchy arrives as a tree of groups and photo sets. [`GroupElement`]
//! is the explicit sum type over the two, and all "find by id" lookups go
//! through [`Group::find_element`] instead of hand-written recursion at each
//! call site.

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use super::error::ApiError;
use crate::download::paths::sanitize_filename;

/// How much detail the service returns for an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InformationLevel {
    Level1,
    Level2,
    Full,
}

impl InformationLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Level1 => "Level1",
            Self::Level2 => "Level2",
            Self::Full => "Full",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PhotoSetType {
    #[default]
    Gallery,
    Collection,
}

/// Accepts the service's date encodings: `{"Value": "..."}` wrappers, RFC 3339
/// strings, or naive `YYYY-MM-DD HH:MM:SS` timestamps (treated as UTC).
fn parse_service_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn de_service_date<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Wrapped {
            #[serde(rename = "Value")]
            value: String,
        },
        Plain(String),
    }
    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Wrapped { value }) | Some(Raw::Plain(value)) => parse_service_date(&value),
        None => None,
    })
}

/// Photo record as the service encodes it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ApiPhoto {
    pub id: u64,
    pub title: Option<String>,
    pub file_name: Option<String>,
    #[serde(deserialize_with = "de_service_date")]
    pub uploaded_on: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "de_service_date")]
    pub taken_on: Option<DateTime<Utc>>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub size: Option<u64>,
    pub is_video: bool,
    pub mime_type: Option<String>,
    pub original_url: Option<String>,
    pub video_url: Option<String>,
    pub sequence: Option<String>,
}

/// A remote photo or video. Immutable for the session; built either from the
/// live API or from the metadata cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub id: u64,
    pub title: String,
    pub file_name: String,
    pub size: u64,
    pub mime_type: Option<String>,
    pub is_video: bool,
    pub original_url: Option<String>,
    pub video_url: Option<String>,
    pub width: u32,
    pub height: u32,
    pub taken_on: Option<DateTime<Utc>>,
    pub uploaded_on: Option<DateTime<Utc>>,
    pub sequence: Option<String>,
}

impl From<ApiPhoto> for RemoteFile {
    fn from(p: ApiPhoto) -> Self {
        let file_name = p
            .file_name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("photo_{}", p.id));
        Self {
            id: p.id,
            title: p.title.unwrap_or_default(),
            file_name,
            size: p.size.unwrap_or(0),
            mime_type: p.mime_type,
            is_video: p.is_video,
            original_url: p.original_url.filter(|u| !u.is_empty()),
            video_url: p.video_url.filter(|u| !u.is_empty()),
            width: p.width.unwrap_or(0),
            height: p.height.unwrap_or(0),
            taken_on: p.taken_on,
            uploaded_on: p.uploaded_on,
            sequence: p.sequence,
        }
    }
}

impl RemoteFile {
    /// Parse a photo object straight from an API response.
    pub fn from_api(value: serde_json::Value) -> Result<Self, ApiError> {
        let photo: ApiPhoto = serde_json::from_value(value)?;
        Ok(photo.into())
    }

    /// Rebuild a file from a retrieval queue entry. Only the fields needed to
    /// download it again are known.
    pub fn from_queue_entry(
        id: u64,
        file_name: &str,
        url: &str,
        size: u64,
        mime_type: &str,
    ) -> Self {
        Self {
            id,
            title: format!("Photo {id}"),
            file_name: file_name.to_string(),
            size,
            mime_type: Some(mime_type.to_string()),
            is_video: mime_type.starts_with("video/"),
            original_url: Some(url.to_string()).filter(|u| !u.is_empty()),
            video_url: None,
            width: 0,
            height: 0,
            taken_on: None,
            uploaded_on: None,
            sequence: None,
        }
    }

    /// Best available download URL: the original, or the video stream for
    /// videos without one.
    pub fn download_url(&self) -> Option<&str> {
        if let Some(url) = &self.original_url {
            return Some(url);
        }
        if self.is_video {
            return self.video_url.as_deref();
        }
        None
    }

    pub fn is_downloadable(&self) -> bool {
        self.download_url().is_some()
    }

    /// Timestamp applied to the downloaded file: capture time, else upload time.
    pub fn file_timestamp(&self) -> Option<DateTime<Utc>> {
        self.taken_on.or(self.uploaded_on)
    }
}

/// Where a remote file goes on disk and how to fetch it.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadInfo {
    pub file: RemoteFile,
    pub local_path: PathBuf,
    pub url: String,
    pub expected_size: Option<u64>,
}

impl DownloadInfo {
    /// Resolve the target path under `output_dir` and the download URL.
    pub fn for_file(file: &RemoteFile, output_dir: &Path) -> Result<Self, ApiError> {
        let url = file
            .download_url()
            .ok_or_else(|| ApiError::NoDownloadUrl(file.file_name.clone()))?
            .to_string();
        Ok(Self {
            local_path: output_dir.join(sanitize_filename(&file.file_name)),
            url,
            expected_size: (file.size > 0).then_some(file.size),
            file: file.clone(),
        })
    }

    pub fn is_video_file(&self) -> bool {
        const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "mkv", "wmv", "flv", "webm", "m4v"];
        let ext = self
            .local_path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        self.file.is_video || VIDEO_EXTENSIONS.contains(&ext.as_str())
    }
}

/// Photo set header as it appears inside the group hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Gallery {
    pub id: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub photo_count: u64,
    #[serde(rename = "Type", default)]
    pub kind: PhotoSetType,
}

impl Gallery {
    pub fn is_gallery(&self) -> bool {
        self.kind == PhotoSetType::Gallery
    }
}

/// A fully loaded photo set with its photos.
#[derive(Debug, Clone)]
pub struct PhotoSet {
    pub id: u64,
    pub title: String,
    pub kind: PhotoSetType,
    pub photo_count: u64,
    pub photos: Vec<RemoteFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Group {
    pub id: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub elements: Vec<GroupElement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "$type")]
pub enum GroupElement {
    Group(Group),
    #[serde(rename = "PhotoSet")]
    Gallery(Gallery),
    #[serde(other)]
    Unknown,
}

/// A gallery found while walking the hierarchy, with the sanitized
/// directory path of its parent groups.
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryEntry<'a> {
    pub gallery: &'a Gallery,
    pub relative_path: PathBuf,
}

impl Group {
    /// Galleries directly inside this group. Collections are excluded.
    pub fn galleries(&self) -> impl Iterator<Item = &Gallery> {
        self.elements.iter().filter_map(|e| match e {
            GroupElement::Gallery(g) if g.is_gallery() => Some(g),
            _ => None,
        })
    }

    pub fn subgroups(&self) -> impl Iterator<Item = &Group> {
        self.elements.iter().filter_map(|e| match e {
            GroupElement::Group(g) => Some(g),
            _ => None,
        })
    }

    /// Depth-first search over every element below this group.
    pub fn find_element<P>(&self, pred: P) -> Option<&GroupElement>
    where
        P: Fn(&GroupElement) -> bool + Copy,
    {
        for element in &self.elements {
            if pred(element) {
                return Some(element);
            }
            if let GroupElement::Group(sub) = element {
                if let Some(found) = sub.find_element(pred) {
                    return Some(found);
                }
            }
        }
        None
    }

    pub fn find_gallery(&self, id: u64) -> Option<&Gallery> {
        match self.find_element(|e| matches!(e, GroupElement::Gallery(g) if g.id == id)) {
            Some(GroupElement::Gallery(g)) => Some(g),
            _ => None,
        }
    }

    /// Every gallery in the tree, own galleries first, then each subgroup in
    /// order. Paths are built from sanitized group titles.
    pub fn walk_galleries(&self) -> Vec<GalleryEntry<'_>> {
        let mut out = Vec::new();
        self.collect_into(PathBuf::new(), &mut out);
        out
    }

    fn collect_into<'a>(&'a self, base: PathBuf, out: &mut Vec<GalleryEntry<'a>>) {
        for gallery in self.galleries() {
            out.push(GalleryEntry {
                gallery,
                relative_path: base.join(sanitize_filename(&gallery.title)),
            });
        }
        for sub in self.subgroups() {
            sub.collect_into(base.join(sanitize_filename(&sub.title)), out);
        }
    }

    /// Sum of photo counts reported by the hierarchy.
    pub fn total_photo_count(&self) -> u64 {
        self.walk_galleries()
            .iter()
            .map(|e| e.gallery.photo_count)
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct User {
    #[serde(default)]
    pub id: u64,
    pub login_name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub photo_count: Option<u64>,
    #[serde(default)]
    pub gallery_count: Option<u64>,
}
