//! Photo service collaborators: the metadata API and the authenticated
//! download session. Both sit behind traits so the download engine can be
//! driven by fakes in tests.

pub mod auth;
pub mod client;
pub mod error;
pub mod types;

use std::path::Path;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;

pub use client::ZenfolioClient;
pub use error::ApiError;
pub use types::{
    DownloadInfo, Gallery, Group, GroupElement, InformationLevel, PhotoSet, RemoteFile, User,
};

use crate::download::error::DownloadError;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, DownloadError>> + Send>>;

/// Response head plus streaming body of a file download.
pub struct DownloadResponse {
    pub status: u16,
    /// Parsed `Retry-After` header, in seconds.
    pub retry_after: Option<u64>,
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

impl std::fmt::Debug for DownloadResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadResponse")
            .field("status", &self.status)
            .field("retry_after", &self.retry_after)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Streaming GET with the session's auth headers.
#[async_trait::async_trait]
pub trait DownloadSession: Send + Sync {
    async fn get(&self, url: &str, timeout: Duration) -> Result<DownloadResponse, DownloadError>;
}

/// Metadata calls the download engine needs from the photo service.
#[async_trait::async_trait]
pub trait PhotoApi: Send + Sync {
    async fn authenticate(&self, username: &str, password: &str) -> Result<(), ApiError>;

    async fn load_private_profile(&self) -> Result<User, ApiError>;

    async fn load_group_hierarchy(
        &self,
        login_name: &str,
        force_refresh: bool,
    ) -> Result<Group, ApiError>;

    async fn load_photo_set(
        &self,
        id: u64,
        level: InformationLevel,
        include_photos: bool,
    ) -> Result<PhotoSet, ApiError>;

    /// Fails with [`ApiError::NoDownloadUrl`] when the file has no URL.
    fn get_download_info(
        &self,
        file: &RemoteFile,
        output_dir: &Path,
    ) -> Result<DownloadInfo, ApiError> {
        DownloadInfo::for_file(file, output_dir)
    }
}
