use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "zenfolio-dl",
    version,
    about = "Download Zenfolio photo libraries with resume support"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Cli {
    /// The requested subcommand, `download` when none was given.
    pub fn effective_command(&self) -> Command {
        self.command
            .clone()
            .unwrap_or_else(|| Command::Download(DownloadArgs::default()))
    }
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Zenfolio login name
    #[arg(short = 'u', long, env = "ZENFOLIO_USERNAME", global = true)]
    pub username: Option<String>,

    /// Zenfolio password (if not provided, will prompt).
    /// WARNING: passing via --password is visible in process listings.
    /// Prefer the ZENFOLIO_PASSWORD environment variable instead.
    #[arg(short = 'p', long, env = "ZENFOLIO_PASSWORD", global = true, hide_env_values = true)]
    pub password: Option<String>,

    /// Local directory for downloads
    #[arg(
        short = 'd',
        long,
        env = "ZENFOLIO_OUTPUT_DIR",
        default_value = ".",
        global = true
    )]
    pub directory: String,

    /// Number of concurrent downloads (1-20)
    #[arg(long, env = "ZENFOLIO_CONCURRENT_DOWNLOADS", default_value_t = 8, global = true)]
    pub concurrent_downloads: usize,

    /// Retries per file after the first attempt (0-50)
    #[arg(long, env = "ZENFOLIO_MAX_RETRIES", default_value_t = 5, global = true)]
    pub max_retries: u32,

    /// First backoff delay in seconds
    #[arg(long, env = "ZENFOLIO_INITIAL_BACKOFF", default_value_t = 1.0, global = true)]
    pub initial_backoff: f64,

    /// Upper bound for backoff delays in seconds
    #[arg(long, env = "ZENFOLIO_MAX_BACKOFF", default_value_t = 60.0, global = true)]
    pub max_backoff: f64,

    /// Timeout for API calls in seconds (5-300)
    #[arg(long, env = "ZENFOLIO_REQUEST_TIMEOUT", default_value_t = 60, global = true)]
    pub request_timeout: u64,

    /// Timeout for one file transfer attempt in seconds (10-300)
    #[arg(long, env = "ZENFOLIO_DOWNLOAD_TIMEOUT", default_value_t = 30, global = true)]
    pub download_timeout: u64,

    /// Read buffer for integrity hashing, in bytes
    #[arg(long, env = "ZENFOLIO_CHUNK_SIZE", default_value_t = 8192, global = true)]
    pub chunk_size: usize,

    /// Skip post-download integrity checks
    #[arg(long, global = true)]
    pub no_verify_integrity: bool,

    /// Do not set file modification times from photo metadata
    #[arg(long, global = true)]
    pub no_preserve_timestamps: bool,

    /// Disable the metadata cache
    #[arg(long, global = true)]
    pub no_cache: bool,

    /// Directory for the metadata cache
    #[arg(long, env = "ZENFOLIO_CACHE_DIR", default_value = ".zenfolio_cache", global = true)]
    pub cache_dir: String,

    /// Hours before cached metadata is refreshed (1-168)
    #[arg(long, env = "ZENFOLIO_CACHE_TTL_HOURS", default_value_t = 24, global = true)]
    pub cache_ttl_hours: u64,

    /// Zenfolio API endpoint
    #[arg(
        long,
        env = "ZENFOLIO_API_URL",
        default_value = "https://api.zenfolio.com/api/1.8/zfapi.asmx",
        global = true
    )]
    pub api_url: String,

    /// Log level
    #[arg(long, value_enum, default_value = "info", global = true)]
    pub log_level: LogLevel,

    /// Disable progress bar
    #[arg(long, global = true)]
    pub no_progress_bar: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Download all galleries (default)
    Download(DownloadArgs),
    /// Retry files and galleries from the retrieval queue
    ProcessQueue(ProcessQueueArgs),
    /// Show what is waiting in the retrieval queue
    QueueStatus,
    /// List the gallery tree with photo counts
    List {
        /// Also list every gallery's photos to count media and estimate download time
        #[arg(long)]
        analyze: bool,
    },
    /// Show resume information from the checkpoint
    CheckpointStatus,
    /// Delete the checkpoint so the next run starts fresh
    ClearCheckpoint,
    /// Inspect or clear the metadata cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Check downloaded files for emptiness and readability
    Verify,
}

#[derive(Args, Debug, Clone, Default)]
pub struct DownloadArgs {
    /// Only galleries whose title matches this regex (case-insensitive)
    #[arg(short = 'g', long)]
    pub gallery: Option<String>,

    /// Re-download files that already exist locally
    #[arg(long)]
    pub overwrite: bool,

    /// Estimate the work without downloading anything
    #[arg(long)]
    pub dry_run: bool,

    /// Subdirectory of the output directory to place galleries under
    #[arg(long, default_value = "")]
    pub base_path: String,

    /// Reload the gallery hierarchy even if a cached copy is fresh
    #[arg(long)]
    pub refresh: bool,
}

/// One year.
const MAX_QUEUE_AGE_HOURS: u64 = 24 * 365;

#[derive(Args, Debug, Clone)]
pub struct ProcessQueueArgs {
    /// Only retry items last attempted more than this many hours ago (0-8760)
    #[arg(
        long,
        default_value_t = 24,
        value_parser = clap::value_parser!(u64).range(0..=MAX_QUEUE_AGE_HOURS)
    )]
    pub max_age_hours: u64,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAction {
    /// Show cache statistics
    Info,
    /// Remove all cached metadata
    Clear,
}
