use std::path::PathBuf;
use std::time::Duration;

use crate::cli::GlobalArgs;
use crate::download::downloader::{DownloaderConfig, MAX_CONCURRENCY};
use crate::retry::RetryConfig;

/// Validated application settings.
pub struct Config {
    pub username: Option<String>,
    pub password: Option<String>,
    pub output_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub api_url: String,

    pub request_timeout: Duration,
    pub download_timeout: Duration,
    pub cache_ttl: Duration,
    pub initial_backoff_secs: f64,
    pub max_backoff_secs: f64,

    pub concurrent_downloads: usize,
    pub chunk_size: usize,
    pub max_retries: u32,

    pub verify_integrity: bool,
    pub preserve_timestamps: bool,
    pub cache_enabled: bool,
    pub no_progress_bar: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("output_dir", &self.output_dir)
            .field("cache_dir", &self.cache_dir)
            .field("api_url", &self.api_url)
            .field("concurrent_downloads", &self.concurrent_downloads)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

impl Config {
    pub fn from_cli(args: &GlobalArgs) -> anyhow::Result<Self> {
        if !(1..=MAX_CONCURRENCY).contains(&args.concurrent_downloads) {
            anyhow::bail!(
                "--concurrent-downloads must be between 1 and {}, got {}",
                MAX_CONCURRENCY,
                args.concurrent_downloads
            );
        }
        if args.max_retries > 50 {
            anyhow::bail!("--max-retries must be at most 50, got {}", args.max_retries);
        }
        if args.initial_backoff.is_nan() || args.initial_backoff < 0.1 {
            anyhow::bail!("--initial-backoff must be at least 0.1 seconds");
        }
        if args.max_backoff.is_nan()
            || args.max_backoff < 1.0
            || args.max_backoff <= args.initial_backoff
        {
            anyhow::bail!(
                "--max-backoff must be at least 1.0 seconds and greater than --initial-backoff"
            );
        }
        if !(5..=300).contains(&args.request_timeout) {
            anyhow::bail!(
                "--request-timeout must be between 5 and 300 seconds, got {}",
                args.request_timeout
            );
        }
        if !(10..=300).contains(&args.download_timeout) {
            anyhow::bail!(
                "--download-timeout must be between 10 and 300 seconds, got {}",
                args.download_timeout
            );
        }
        if args.chunk_size < 1024 {
            anyhow::bail!("--chunk-size must be at least 1024 bytes, got {}", args.chunk_size);
        }
        if !(1..=168).contains(&args.cache_ttl_hours) {
            anyhow::bail!(
                "--cache-ttl-hours must be between 1 and 168, got {}",
                args.cache_ttl_hours
            );
        }
        if args.api_url.trim().is_empty() {
            anyhow::bail!("--api-url must not be empty");
        }
        let output_dir = expand_tilde(&args.directory);
        if output_dir.as_os_str().is_empty() {
            anyhow::bail!("--directory must not be empty");
        }

        Ok(Self {
            username: args
                .username
                .as_deref()
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_string),
            password: args.password.clone().filter(|p| !p.is_empty()),
            output_dir,
            cache_dir: expand_tilde(&args.cache_dir),
            api_url: args.api_url.clone(),
            request_timeout: Duration::from_secs(args.request_timeout),
            download_timeout: Duration::from_secs(args.download_timeout),
            cache_ttl: Duration::from_secs(args.cache_ttl_hours * 3600),
            initial_backoff_secs: args.initial_backoff,
            max_backoff_secs: args.max_backoff,
            concurrent_downloads: args.concurrent_downloads,
            chunk_size: args.chunk_size,
            max_retries: args.max_retries,
            verify_integrity: !args.no_verify_integrity,
            preserve_timestamps: !args.no_preserve_timestamps,
            cache_enabled: !args.no_cache,
            no_progress_bar: args.no_progress_bar,
        })
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            initial_backoff_secs: self.initial_backoff_secs,
            max_backoff_secs: self.max_backoff_secs,
        }
    }

    pub fn downloader_config(&self) -> DownloaderConfig {
        DownloaderConfig {
            concurrency: self.concurrent_downloads,
            download_timeout: self.download_timeout,
            retry: self.retry_config(),
        }
    }
}
