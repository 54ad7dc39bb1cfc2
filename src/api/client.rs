//! JSON-RPC client for the photo service.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, RETRY_AFTER, USER_AGENT};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use super::auth::{self, AuthChallenge, TOKEN_HEADER};
use super::error::ApiError;
use super::types::{ApiPhoto, Group, InformationLevel, PhotoSet, PhotoSetType, RemoteFile, User};
use super::{DownloadResponse, DownloadSession, PhotoApi};
use crate::cache::MetadataCache;
use crate::download::error::DownloadError;

const DEFAULT_USER_AGENT: &str = concat!("zenfolio-dl/", env!("CARGO_PKG_VERSION"));

/// Photos requested per `LoadPhotoSetPhotos` call.
const PHOTO_BATCH_SIZE: u64 = 100;

/// Hard stop for runaway paging on sets that misreport their size.
const MAX_PHOTOS_PER_SET: u64 = 10_000;

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiPhotoSet {
    id: u64,
    #[serde(default)]
    title: String,
    #[serde(rename = "Type", default)]
    kind: PhotoSetType,
    #[serde(default)]
    photo_count: u64,
    #[serde(default)]
    photos: Option<Vec<ApiPhoto>>,
}

fn error_message(error: &Value) -> String {
    error
        .get("message")
        .or_else(|| error.get("Message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string())
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// HTTP client for the photo service API and its file downloads.
///
/// One instance is shared by the whole run. The token set by
/// [`PhotoApi::authenticate`] is attached to every later request.
pub struct ZenfolioClient {
    http: Client,
    api_url: String,
    request_timeout: Duration,
    token: RwLock<Option<String>>,
    next_id: AtomicU64,
    cache: Option<Arc<dyn MetadataCache>>,
}

impl std::fmt::Debug for ZenfolioClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let token = self.token.read().ok().and_then(|t| t.clone());
        f.debug_struct("ZenfolioClient")
            .field("api_url", &self.api_url)
            .field("request_timeout", &self.request_timeout)
            .field("token", &auth::redact_token(token.as_deref()))
            .finish_non_exhaustive()
    }
}

impl ZenfolioClient {
    pub fn new(
        api_url: &str,
        request_timeout: Duration,
        cache: Option<Arc<dyn MetadataCache>>,
    ) -> Result<Self, ApiError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
        let http = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            api_url: api_url.to_string(),
            request_timeout,
            token: RwLock::new(None),
            next_id: AtomicU64::new(1),
            cache,
        })
    }

    fn token(&self) -> Option<String> {
        self.token.read().ok().and_then(|t| t.clone())
    }

    fn set_token(&self, token: String) {
        if let Ok(mut guard) = self.token.write() {
            *guard = Some(token);
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.token().is_some()
    }

    /// Issue one JSON-RPC call and return its `result`.
    async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, ApiError> {
        let timeout = timeout.unwrap_or(self.request_timeout);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({ "method": method, "params": params, "id": id });

        tracing::debug!(method, id, "API request");

        let mut request = self
            .http
            .post(&self.api_url)
            .header(CONTENT_TYPE, "application/json")
            .timeout(timeout)
            .json(&body);
        if let Some(token) = self.token() {
            request = request.header(TOKEN_HEADER, token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ApiError::Timeout(timeout.as_secs())
            } else {
                ApiError::Http(e)
            }
        })?;
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                ApiError::Timeout(timeout.as_secs())
            } else {
                ApiError::Http(e)
            }
        })?;

        match status {
            200 => {}
            401 => {
                tracing::debug!("{} rejected: {}", method, truncate(&text, 500));
                return Err(ApiError::Authentication(
                    "Authentication required or token expired".into(),
                ));
            }
            403 => return Err(ApiError::Permission(format!("{method}: access forbidden"))),
            404 => return Err(ApiError::NotFound(format!("{method}: endpoint not found"))),
            429 => {
                return Err(ApiError::RateLimit {
                    retry_after: retry_after.unwrap_or(60),
                })
            }
            s if s >= 500 => {
                return Err(ApiError::Server {
                    status: s,
                    message: truncate(&text, 200),
                })
            }
            s => {
                return Err(ApiError::InvalidResponse(format!(
                    "HTTP {s} from {method}: {}",
                    truncate(&text, 200)
                )))
            }
        }

        let rpc: RpcResponse = serde_json::from_str(&text)?;
        if !rpc.error.is_null() {
            return Err(ApiError::Fault {
                method: method.to_string(),
                message: error_message(&rpc.error),
            });
        }
        Ok(rpc.result)
    }

    async fn get_challenge(&self, login_name: &str) -> Result<AuthChallenge, ApiError> {
        let result = self.call("GetChallenge", json!([login_name]), None).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn load_photo_set_photos(
        &self,
        set_id: u64,
        start: u64,
        count: u64,
    ) -> Result<Vec<RemoteFile>, ApiError> {
        let result = self
            .call("LoadPhotoSetPhotos", json!([set_id, start, count]), None)
            .await?;
        let raw: Vec<Value> = match result {
            Value::Null => Vec::new(),
            other => serde_json::from_value(other)?,
        };
        // One malformed record must not cost the rest of the page.
        let mut photos = Vec::with_capacity(raw.len());
        for value in raw {
            match RemoteFile::from_api(value) {
                Ok(photo) => photos.push(photo),
                Err(e) => tracing::warn!("Skipping unreadable photo in set {}: {}", set_id, e),
            }
        }
        Ok(photos)
    }

    /// Page through a set's photos until an empty page, the declared count,
    /// or the safety cap.
    async fn load_all_photos(&self, set_id: u64, declared: u64) -> Result<Vec<RemoteFile>, ApiError> {
        let mut photos = Vec::new();
        let mut start = 0;
        loop {
            let batch = self
                .load_photo_set_photos(set_id, start, PHOTO_BATCH_SIZE)
                .await?;
            if batch.is_empty() {
                break;
            }
            start += batch.len() as u64;
            photos.extend(batch);
            if declared > 0 && start >= declared {
                break;
            }
            if start >= MAX_PHOTOS_PER_SET {
                tracing::warn!(
                    "Reached safety limit of {} photos for photo set {}",
                    MAX_PHOTOS_PER_SET,
                    set_id
                );
                break;
            }
        }
        Ok(photos)
    }
}

#[async_trait::async_trait]
impl PhotoApi for ZenfolioClient {
    async fn authenticate(&self, username: &str, password: &str) -> Result<(), ApiError> {
        let challenge = self.get_challenge(username).await.map_err(|e| match e {
            ApiError::Fault { message, .. } => ApiError::Authentication(message),
            other => other,
        })?;
        let proof = auth::compute_proof(&challenge, password);
        let result = self
            .call(
                "Authenticate",
                json!([challenge.challenge, proof.to_vec()]),
                None,
            )
            .await
            .map_err(|e| match e {
                ApiError::Fault { message, .. } => ApiError::Authentication(message),
                other => other,
            })?;
        let token = result
            .as_str()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::Authentication("no token returned".into()))?;
        self.set_token(token.to_string());
        tracing::info!("Authenticated as {}", username);
        Ok(())
    }

    async fn load_private_profile(&self) -> Result<User, ApiError> {
        if !self.is_authenticated() {
            return Err(ApiError::NotAuthenticated);
        }
        let result = self.call("LoadPrivateProfile", json!([]), None).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn load_group_hierarchy(
        &self,
        login_name: &str,
        force_refresh: bool,
    ) -> Result<Group, ApiError> {
        if !force_refresh {
            if let Some(cache) = &self.cache {
                match cache.load_hierarchy(login_name).await {
                    Ok(Some(root)) => {
                        tracing::debug!("Using cached hierarchy for {}", login_name);
                        return Ok(root);
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!("Failed to read cached hierarchy: {}", e),
                }
            }
        }

        let result = self
            .call("LoadGroupHierarchy", json!([login_name]), None)
            .await?;
        let root: Group = serde_json::from_value(result)?;

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.save_hierarchy(login_name, &root).await {
                tracing::warn!("Failed to cache hierarchy: {}", e);
            }
        }
        Ok(root)
    }

    async fn load_photo_set(
        &self,
        id: u64,
        level: InformationLevel,
        include_photos: bool,
    ) -> Result<PhotoSet, ApiError> {
        // Photos are paged separately; very large sets time out when
        // requested inline.
        let result = self
            .call("LoadPhotoSet", json!([id, level.as_str(), false]), None)
            .await?;
        let set: ApiPhotoSet = serde_json::from_value(result)?;

        let photos = match (include_photos, set.photos) {
            (false, _) => Vec::new(),
            (true, Some(inline)) if !inline.is_empty() => {
                inline.into_iter().map(RemoteFile::from).collect()
            }
            (true, _) => self.load_all_photos(set.id, set.photo_count).await?,
        };

        Ok(PhotoSet {
            id: set.id,
            title: set.title,
            kind: set.kind,
            photo_count: set.photo_count,
            photos,
        })
    }
}

#[async_trait::async_trait]
impl DownloadSession for ZenfolioClient {
    async fn get(&self, url: &str, timeout: Duration) -> Result<DownloadResponse, DownloadError> {
        let mut request = self.http.get(url).timeout(timeout);
        if let Some(token) = self.token() {
            request = request.header(TOKEN_HEADER, token);
        }
        let response = request.send().await.map_err(DownloadError::from_reqwest)?;

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok())
            .map(|secs| secs.max(0.0).ceil() as u64);

        Ok(DownloadResponse {
            status: response.status().as_u16(),
            retry_after,
            content_length: response.content_length(),
            body: Box::pin(
                response
                    .bytes_stream()
                    .map(|chunk| chunk.map_err(DownloadError::from_reqwest)),
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_prefers_message_field() {
        assert_eq!(
            error_message(&json!({"code": "E_INVALIDPARAM", "message": "bad id"})),
            "bad id"
        );
        assert_eq!(error_message(&json!("plain")), "\"plain\"");
    }

    #[test]
    fn test_photo_set_parses_with_inline_photos() {
        let set: ApiPhotoSet = serde_json::from_value(json!({
            "Id": 12,
            "Title": "Trip",
            "Type": "Gallery",
            "PhotoCount": 1,
            "Photos": [{"Id": 1, "FileName": "a.jpg", "OriginalUrl": "https://x/a.jpg"}]
        }))
        .unwrap();
        assert_eq!(set.photo_count, 1);
        assert_eq!(set.photos.unwrap().len(), 1);
    }

    #[test]
    fn test_debug_redacts_token() {
        let client = ZenfolioClient::new("http://localhost", Duration::from_secs(5), None).unwrap();
        client.set_token("secret-token".into());
        let dbg = format!("{client:?}");
        assert!(!dbg.contains("secret-token"));
        assert!(dbg.contains("<redacted>"));
        assert!(client.is_authenticated());
    }

    #[test]
    fn test_truncate_counts_chars() {
        assert_eq!(truncate("héllo wörld", 5), "héllo");
    }

    #[tokio::test]
    async fn test_profile_requires_authentication() {
        let client = ZenfolioClient::new("http://localhost", Duration::from_secs(5), None).unwrap();
        assert!(matches!(
            client.load_private_profile().await,
            Err(ApiError::NotAuthenticated)
        ));
    }
}
