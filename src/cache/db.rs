//! Metadata cache trait and SQLite implementation.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension};

use super::error::CacheError;
use super::schema;
use crate::api::types::{Group, RemoteFile};

/// Counts reported by `cache info`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheInfo {
    pub galleries: u64,
    pub photos: u64,
    pub hierarchies: u64,
    pub expired_galleries: u64,
    pub size_bytes: u64,
}

/// Cached service metadata, so complete galleries can be recognized and
/// partial ones resumed without listing them remotely again.
///
/// Entries older than the configured TTL read as absent.
#[async_trait]
pub trait MetadataCache: Send + Sync {
    async fn load_photo_metadata(
        &self,
        gallery_id: u64,
    ) -> Result<Option<Vec<RemoteFile>>, CacheError>;

    async fn save_photo_metadata(
        &self,
        gallery_id: u64,
        photos: &[RemoteFile],
    ) -> Result<(), CacheError>;

    async fn load_hierarchy(&self, login_name: &str) -> Result<Option<Group>, CacheError>;

    async fn save_hierarchy(&self, login_name: &str, root: &Group) -> Result<(), CacheError>;

    async fn clear(&self) -> Result<(), CacheError>;

    async fn info(&self) -> Result<CacheInfo, CacheError>;
}

pub struct SqliteMetadataCache {
    /// rusqlite::Connection is not Sync.
    conn: Mutex<Connection>,
    path: PathBuf,
    ttl: Duration,
}

impl std::fmt::Debug for SqliteMetadataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteMetadataCache")
            .field("path", &self.path)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

fn ts_to_datetime(ts: Option<i64>) -> Option<DateTime<Utc>> {
    ts.and_then(|t| Utc.timestamp_opt(t, 0).single())
}

impl RemoteFile {
    /// Rebuild a file from a `photos` row of the metadata cache.
    pub(crate) fn from_cache_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get::<_, i64>("photo_id")? as u64,
            title: row.get("title")?,
            file_name: row.get("file_name")?,
            size: row.get::<_, i64>("size_bytes")?.max(0) as u64,
            mime_type: row.get("mime_type")?,
            is_video: row.get::<_, i64>("is_video")? != 0,
            original_url: row.get("original_url")?,
            video_url: row.get("video_url")?,
            width: row.get::<_, i64>("width")?.max(0) as u32,
            height: row.get::<_, i64>("height")?.max(0) as u32,
            taken_on: ts_to_datetime(row.get("taken_on")?),
            uploaded_on: ts_to_datetime(row.get("uploaded_on")?),
            sequence: row.get("sequence")?,
        })
    }
}

impl SqliteMetadataCache {
    /// File name of the database inside the cache directory.
    pub const FILE_NAME: &'static str = "metadata.db";

    /// Open or create the cache database inside `cache_dir`.
    pub async fn open(cache_dir: &Path, ttl: Duration) -> Result<Self, CacheError> {
        tokio::fs::create_dir_all(cache_dir)
            .await
            .map_err(|source| CacheError::Directory {
                path: cache_dir.to_path_buf(),
                source,
            })?;
        let path = cache_dir.join(Self::FILE_NAME);
        let path_clone = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path_clone).map_err(|e| CacheError::Open {
                path: path_clone.clone(),
                source: e,
            })?;
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(CacheError::Migration)?;
            conn.pragma_update(None, "synchronous", "NORMAL")
                .map_err(CacheError::Migration)?;
            schema::migrate(&conn)?;
            Ok::<_, CacheError>(conn)
        })
        .await??;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
            ttl,
        })
    }

    #[cfg(test)]
    pub fn open_in_memory(ttl: Duration) -> Result<Self, CacheError> {
        let conn = Connection::open_in_memory().map_err(|e| CacheError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
            ttl,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, CacheError> {
        self.conn
            .lock()
            .map_err(|e| CacheError::Query(e.to_string()))
    }

    fn cutoff(&self) -> i64 {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        Utc::now()
            .checked_sub_signed(ttl)
            .map_or(i64::MIN, |t| t.timestamp())
    }

    fn save_photos_at(
        &self,
        gallery_id: u64,
        photos: &[RemoteFile],
        cached_at: i64,
    ) -> Result<(), CacheError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(CacheError::query)?;
        tx.execute(
            "DELETE FROM photos WHERE gallery_id = ?1",
            [gallery_id as i64],
        )
        .map_err(CacheError::query)?;
        {
            let mut stmt = tx
                .prepare(
                    r#"
                    INSERT INTO photos (gallery_id, position, photo_id, title, file_name, size_bytes,
                        mime_type, is_video, original_url, video_url, width, height,
                        taken_on, uploaded_on, sequence)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                    "#,
                )
                .map_err(CacheError::query)?;
            for (position, p) in photos.iter().enumerate() {
                stmt.execute(rusqlite::params![
                    gallery_id as i64,
                    position as i64,
                    p.id as i64,
                    &p.title,
                    &p.file_name,
                    p.size as i64,
                    &p.mime_type,
                    p.is_video as i64,
                    &p.original_url,
                    &p.video_url,
                    p.width as i64,
                    p.height as i64,
                    p.taken_on.map(|d| d.timestamp()),
                    p.uploaded_on.map(|d| d.timestamp()),
                    &p.sequence,
                ])
                .map_err(CacheError::query)?;
            }
        }
        tx.execute(
            r#"
            INSERT INTO galleries (gallery_id, photo_count, cached_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(gallery_id) DO UPDATE SET
                photo_count = excluded.photo_count,
                cached_at = excluded.cached_at
            "#,
            rusqlite::params![gallery_id as i64, photos.len() as i64, cached_at],
        )
        .map_err(CacheError::query)?;
        tx.commit().map_err(CacheError::query)?;
        Ok(())
    }

    fn save_hierarchy_at(
        &self,
        login_name: &str,
        root: &Group,
        cached_at: i64,
    ) -> Result<(), CacheError> {
        let data = serde_json::to_string(root)?;
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO hierarchies (login_name, data, cached_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(login_name) DO UPDATE SET
                data = excluded.data,
                cached_at = excluded.cached_at
            "#,
            rusqlite::params![login_name, data, cached_at],
        )
        .map_err(CacheError::query)?;
        Ok(())
    }
}

#[async_trait]
impl MetadataCache for SqliteMetadataCache {
    async fn load_photo_metadata(
        &self,
        gallery_id: u64,
    ) -> Result<Option<Vec<RemoteFile>>, CacheError> {
        let cutoff = self.cutoff();
        let conn = self.lock()?;

        let cached_at: Option<i64> = conn
            .query_row(
                "SELECT cached_at FROM galleries WHERE gallery_id = ?1",
                [gallery_id as i64],
                |row| row.get(0),
            )
            .optional()
            .map_err(CacheError::query)?;

        match cached_at {
            None => return Ok(None),
            Some(at) if at < cutoff => {
                tracing::debug!(gallery_id, "Cached photo metadata expired");
                return Ok(None);
            }
            Some(_) => {}
        }

        let mut stmt = conn
            .prepare("SELECT * FROM photos WHERE gallery_id = ?1 ORDER BY position")
            .map_err(CacheError::query)?;
        let photos = stmt
            .query_map([gallery_id as i64], RemoteFile::from_cache_row)
            .map_err(CacheError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(CacheError::query)?;

        if photos.is_empty() {
            return Ok(None);
        }
        Ok(Some(photos))
    }

    async fn save_photo_metadata(
        &self,
        gallery_id: u64,
        photos: &[RemoteFile],
    ) -> Result<(), CacheError> {
        self.save_photos_at(gallery_id, photos, Utc::now().timestamp())
    }

    async fn load_hierarchy(&self, login_name: &str) -> Result<Option<Group>, CacheError> {
        let cutoff = self.cutoff();
        let row: Option<(String, i64)> = {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT data, cached_at FROM hierarchies WHERE login_name = ?1",
                [login_name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(CacheError::query)?
        };
        match row {
            Some((data, cached_at)) if cached_at >= cutoff => Ok(Some(serde_json::from_str(&data)?)),
            _ => Ok(None),
        }
    }

    async fn save_hierarchy(&self, login_name: &str, root: &Group) -> Result<(), CacheError> {
        self.save_hierarchy_at(login_name, root, Utc::now().timestamp())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let conn = self.lock()?;
        conn.execute_batch("DELETE FROM photos; DELETE FROM galleries; DELETE FROM hierarchies;")
            .map_err(CacheError::query)?;
        tracing::info!("Metadata cache cleared");
        Ok(())
    }

    async fn info(&self) -> Result<CacheInfo, CacheError> {
        let cutoff = self.cutoff();
        let info = {
            let conn = self.lock()?;
            let count = |sql: &str| -> Result<u64, CacheError> {
                conn.query_row(sql, [], |row| row.get::<_, i64>(0))
                    .map(|n| n.max(0) as u64)
                    .map_err(CacheError::query)
            };
            CacheInfo {
                galleries: count("SELECT COUNT(*) FROM galleries")?,
                photos: count("SELECT COUNT(*) FROM photos")?,
                hierarchies: count("SELECT COUNT(*) FROM hierarchies")?,
                expired_galleries: conn
                    .query_row(
                        "SELECT COUNT(*) FROM galleries WHERE cached_at < ?1",
                        [cutoff],
                        |row| row.get::<_, i64>(0),
                    )
                    .map(|n| n.max(0) as u64)
                    .map_err(CacheError::query)?,
                size_bytes: 0,
            }
        };
        let size_bytes = tokio::fs::metadata(&self.path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        Ok(CacheInfo { size_bytes, ..info })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn photo(id: u64, name: &str) -> RemoteFile {
        RemoteFile::from_api(json!({
            "Id": id,
            "Title": format!("Photo {id}"),
            "FileName": name,
            "Size": 1000 + id,
            "MimeType": "image/jpeg",
            "OriginalUrl": format!("https://example.com/{id}.jpg"),
            "TakenOn": "2021-06-01T12:00:00Z"
        }))
        .unwrap()
    }

    fn day() -> Duration {
        Duration::from_secs(24 * 3600)
    }

    #[tokio::test]
    async fn test_photo_metadata_roundtrip_preserves_order() {
        let cache = SqliteMetadataCache::open_in_memory(day()).unwrap();
        let photos = vec![photo(3, "c.jpg"), photo(1, "a.jpg"), photo(2, "b.jpg")];
        cache.save_photo_metadata(42, &photos).await.unwrap();

        let loaded = cache.load_photo_metadata(42).await.unwrap().unwrap();
        assert_eq!(loaded, photos);
    }

    #[tokio::test]
    async fn test_missing_gallery_is_none() {
        let cache = SqliteMetadataCache::open_in_memory(day()).unwrap();
        assert!(cache.load_photo_metadata(7).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_metadata_is_none() {
        let cache = SqliteMetadataCache::open_in_memory(day()).unwrap();
        let two_days_ago = Utc::now().timestamp() - 2 * 24 * 3600;
        cache
            .save_photos_at(42, &[photo(1, "a.jpg")], two_days_ago)
            .unwrap();
        assert!(cache.load_photo_metadata(42).await.unwrap().is_none());
        assert_eq!(cache.info().await.unwrap().expired_galleries, 1);
    }

    #[tokio::test]
    async fn test_save_replaces_previous_listing() {
        let cache = SqliteMetadataCache::open_in_memory(day()).unwrap();
        cache
            .save_photo_metadata(42, &[photo(1, "a.jpg"), photo(2, "b.jpg")])
            .await
            .unwrap();
        cache
            .save_photo_metadata(42, &[photo(9, "z.jpg")])
            .await
            .unwrap();
        let loaded = cache.load_photo_metadata(42).await.unwrap().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, 9);
    }

    #[tokio::test]
    async fn test_hierarchy_roundtrip_and_expiry() {
        let cache = SqliteMetadataCache::open_in_memory(day()).unwrap();
        let root: Group = serde_json::from_value(json!({
            "Id": 1, "Title": "Root",
            "Elements": [{"$type": "PhotoSet", "Id": 5, "Title": "G", "PhotoCount": 3, "Type": "Gallery"}]
        }))
        .unwrap();
        cache.save_hierarchy("alice", &root).await.unwrap();
        assert_eq!(cache.load_hierarchy("alice").await.unwrap(), Some(root.clone()));
        assert_eq!(cache.load_hierarchy("bob").await.unwrap(), None);

        cache
            .save_hierarchy_at("alice", &root, Utc::now().timestamp() - 3 * 24 * 3600)
            .unwrap();
        assert_eq!(cache.load_hierarchy("alice").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_clear_and_info() {
        let cache = SqliteMetadataCache::open_in_memory(day()).unwrap();
        cache
            .save_photo_metadata(1, &[photo(1, "a.jpg"), photo(2, "b.jpg")])
            .await
            .unwrap();
        let info = cache.info().await.unwrap();
        assert_eq!(info.galleries, 1);
        assert_eq!(info.photos, 2);

        cache.clear().await.unwrap();
        assert_eq!(cache.info().await.unwrap().photos, 0);
        assert!(cache.load_photo_metadata(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_on_disk_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("nested").join(".zenfolio_cache");
        let cache = SqliteMetadataCache::open(&cache_dir, day()).await.unwrap();
        cache
            .save_photo_metadata(1, &[photo(1, "a.jpg")])
            .await
            .unwrap();
        assert!(cache.path().exists());
        assert_eq!(cache.info().await.unwrap().galleries, 1);
    }
}
