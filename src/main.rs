//! zenfolio-dl: resumable downloader for Zenfolio photo libraries.
//!
//! Walks the account's gallery hierarchy and mirrors every gallery into a
//! local directory tree. Complete galleries are recognized without network
//! calls; per-file progress is checkpointed so an interrupted run resumes
//! where it stopped, and files the service cannot deliver right now are
//! parked in a retrieval queue for a later `process-queue` run.

#![warn(clippy::all)]

mod api;
mod cache;
mod cli;
mod config;
mod download;
mod progress;
mod retry;
mod shutdown;
mod state;
mod stats;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use api::{Group, GroupElement, PhotoApi, ZenfolioClient};
use cache::{MetadataCache, SqliteMetadataCache};
use cli::{CacheAction, Command, DownloadArgs, ProcessQueueArgs};
use config::Config;
use download::manager::{self, DownloadManager, SessionSummary};
use download::{format_bytes, ConcurrentDownloader, IntegrityChecker};
use progress::{ConsoleProgress, NoProgress, ProgressSink};
use retry::{CircuitBreaker, CircuitState};
use state::{CheckpointStore, RetrievalQueue};
use stats::StatisticsTracker;

/// Some galleries failed.
const EXIT_PARTIAL_FAILURE: u8 = 2;
/// Stopped by a signal before finishing.
const EXIT_INTERRUPTED: u8 = 130;

/// Authenticated API client plus the cache it shares with the manager.
struct Connection {
    client: Arc<ZenfolioClient>,
    cache: Option<Arc<dyn MetadataCache>>,
    login_name: String,
}

async fn open_cache(config: &Config) -> Option<Arc<dyn MetadataCache>> {
    if !config.cache_enabled {
        return None;
    }
    match SqliteMetadataCache::open(&config.cache_dir, config.cache_ttl).await {
        Ok(cache) => {
            tracing::debug!("Metadata cache opened at {}", cache.path().display());
            Some(Arc::new(cache) as Arc<dyn MetadataCache>)
        }
        Err(e) => {
            tracing::warn!(
                "Failed to open metadata cache in {}: {}. Continuing without cache.",
                config.cache_dir.display(),
                e
            );
            None
        }
    }
}

/// Authenticate and resolve the login name whose hierarchy is downloaded.
async fn connect(config: &Config) -> anyhow::Result<Connection> {
    let username = config
        .username
        .clone()
        .context("--username (or ZENFOLIO_USERNAME) is required")?;
    let password = match &config.password {
        Some(p) => p.clone(),
        None => tokio::task::block_in_place(|| {
            rpassword::prompt_password(format!("Zenfolio password for {username}: "))
        })
        .context("Failed to read password")?,
    };

    let cache = open_cache(config).await;
    let client = Arc::new(ZenfolioClient::new(
        &config.api_url,
        config.request_timeout,
        cache.clone(),
    )?);
    client
        .authenticate(&username, &password)
        .await
        .context("Authentication failed")?;

    let login_name = match client.load_private_profile().await {
        Ok(user) if !user.login_name.is_empty() => user.login_name,
        Ok(_) => username,
        Err(e) => {
            tracing::debug!("Failed to load profile, using {} as login name: {}", username, e);
            username
        }
    };
    Ok(Connection {
        client,
        cache,
        login_name,
    })
}

async fn load_hierarchy(conn: &Connection, refresh: bool) -> anyhow::Result<Group> {
    tracing::info!("Loading gallery hierarchy for {}", conn.login_name);
    conn.client
        .load_group_hierarchy(&conn.login_name, refresh)
        .await
        .context("Failed to load gallery hierarchy")
}

fn build_manager(
    config: &Config,
    conn: &Connection,
    progress: Arc<dyn ProgressSink>,
) -> DownloadManager {
    let integrity = IntegrityChecker::new(
        config.verify_integrity,
        config.preserve_timestamps,
        config.chunk_size,
    );
    let downloader = ConcurrentDownloader::new(
        conn.client.clone(),
        integrity,
        config.downloader_config(),
        CircuitBreaker::default(),
        CancellationToken::new(),
    );
    let mut manager = DownloadManager::new(
        conn.client.clone(),
        downloader,
        CheckpointStore::for_output_dir(&config.output_dir),
        RetrievalQueue::for_output_dir(&config.output_dir),
        StatisticsTracker::new(),
        progress,
    );
    if let Some(cache) = &conn.cache {
        manager = manager.with_cache(cache.clone());
    }
    manager
}

/// Stop `manager` when the shutdown signal arrives.
fn stop_on_shutdown(manager: &Arc<DownloadManager>, shutdown: CancellationToken) {
    let manager = Arc::clone(manager);
    tokio::spawn(async move {
        shutdown.cancelled().await;
        manager.stop();
    });
}

fn console_progress(config: &Config) -> Arc<dyn ProgressSink> {
    Arc::new(ConsoleProgress::new(config.no_progress_bar))
}

async fn run_download(
    config: &Config,
    args: DownloadArgs,
    shutdown: CancellationToken,
) -> anyhow::Result<u8> {
    let filter = args
        .gallery
        .as_deref()
        .map(manager::gallery_filter)
        .transpose()
        .context("Invalid --gallery pattern")?;
    let base_path = PathBuf::from(&args.base_path);

    let conn = connect(config).await?;
    let root = load_hierarchy(&conn, args.refresh).await?;

    let manager = Arc::new(
        build_manager(config, &conn, console_progress(config)).with_overwrite(args.overwrite),
    );

    if args.dry_run {
        let report = manager.dry_run_analysis(&root, filter.as_ref(), &base_path);
        println!("Dry run: {} galleries", report.galleries_count);
        for g in &report.galleries {
            println!(
                "  {} ({} photos, ~{:.0} MB) -> {}",
                g.name,
                g.photo_count,
                g.size_mb,
                config.output_dir.join(&g.path).display()
            );
        }
        let estimated_bytes = (report.total_size_mb * 1024.0 * 1024.0) as u64;
        println!(
            "Estimated {} files, ~{:.1} GB, about {}",
            report.files_to_download,
            report.total_size_mb / 1024.0,
            manager::estimate_download_time(estimated_bytes, report.files_to_download)
        );
        return Ok(0);
    }

    let resume = manager.checkpoint().get_resume_info();
    if resume.has_checkpoint && resume.completed_files > 0 {
        tracing::info!(
            "Resuming: {} files already completed in a previous session",
            resume.completed_files
        );
    }

    stop_on_shutdown(&manager, shutdown);
    tracing::info!("Downloading to {}", config.output_dir.display());
    let summary = manager
        .download_all_galleries(&root, &config.output_dir, filter.as_ref(), &base_path)
        .await?;
    print_session_summary(&manager, &summary);

    if summary.interrupted {
        return Ok(EXIT_INTERRUPTED);
    }
    if summary.failed_count > 0 {
        return Ok(EXIT_PARTIAL_FAILURE);
    }
    Ok(0)
}

fn print_session_summary(manager: &DownloadManager, summary: &SessionSummary) {
    println!();
    println!("{}", manager.stats().get_human_readable_summary());
    println!(
        "Galleries: {} processed, {} successful, {} failed, {} skipped",
        summary.galleries_processed,
        summary.successful_count,
        summary.failed_count,
        summary.skipped_count
    );
    println!(
        "Files: {} downloaded, {} already present, {} failed",
        summary.downloaded(),
        summary.already_existed(),
        summary.failed_files()
    );
    let transfers = manager.downloader().get_download_statistics();
    if transfers.total_downloads > 0 {
        println!(
            "Transfers: {} of {} succeeded ({:.1}%), {:.2} MB/s per transfer",
            transfers.successful_downloads,
            transfers.total_downloads,
            transfers.success_rate,
            transfers.average_speed_mbps
        );
    }
    if manager.downloader().circuit_state() != CircuitState::Closed {
        println!("The service kept failing; downloads were paused to let it recover");
    }
    for g in summary.gallery_results.iter().filter(|g| g.error.is_some()) {
        println!(
            "  {}: {}",
            g.gallery_name,
            g.error.as_deref().unwrap_or_default()
        );
    }
    let queued = manager.queue().len();
    if queued > 0 {
        println!(
            "{queued} item(s) in the retrieval queue; run `zenfolio-dl process-queue` later"
        );
    }
    if summary.interrupted {
        println!("Interrupted; run again to resume");
    }
}

async fn run_process_queue(
    config: &Config,
    args: ProcessQueueArgs,
    shutdown: CancellationToken,
) -> anyhow::Result<u8> {
    let queue = RetrievalQueue::for_output_dir(&config.output_dir);
    if queue.is_empty() {
        println!("Retrieval queue is empty");
        return Ok(0);
    }
    drop(queue);

    let conn = connect(config).await?;
    // Only used to pick up renamed galleries; the queue works without it.
    let root = match load_hierarchy(&conn, false).await {
        Ok(root) => Some(root),
        Err(e) => {
            tracing::warn!("{:#}", e);
            None
        }
    };
    let manager = Arc::new(build_manager(config, &conn, console_progress(config)));
    stop_on_shutdown(&manager, shutdown);
    let run = manager
        .process_retrieval_queue(args.max_age_hours, root.as_ref())
        .await;

    if run.total_items == 0 {
        println!(
            "No items ready for retry (last attempt within {} hours)",
            args.max_age_hours
        );
    } else {
        println!(
            "Processed {} of {} item(s): {} successful, {} failed, {} still pending",
            run.processed, run.total_items, run.successful, run.failed, run.still_pending
        );
        let report = manager.stats().get_summary_report();
        println!(
            "Downloaded {} in {}",
            format_bytes(report.downloaded_bytes),
            download::format_duration(std::time::Duration::from_secs_f64(report.duration_seconds))
        );
    }
    println!("{} item(s) remain in the retrieval queue", manager.queue().len());
    if manager.is_stopped() {
        return Ok(EXIT_INTERRUPTED);
    }
    Ok(0)
}

fn run_queue_status(config: &Config) -> u8 {
    let queue = RetrievalQueue::for_output_dir(&config.output_dir);
    let summary = queue.get_queue_summary();
    if summary.total_items == 0 {
        println!("Retrieval queue is empty");
        return 0;
    }
    println!("Retrieval queue: {} item(s)", summary.total_items);
    for (title, gallery) in &summary.galleries {
        println!(
            "  {}: {} item(s), {}",
            title,
            gallery.count,
            format_bytes(gallery.total_size)
        );
        for item in &gallery.items {
            println!(
                "    {} (added {}, {} attempt(s))",
                item.file_name, item.added_at, item.attempt_count
            );
        }
    }
    if let Some(oldest) = &summary.oldest_item {
        println!("Oldest: {} ({})", oldest.file_name, oldest.added_at);
    }
    if let Some(newest) = &summary.newest_item {
        println!("Newest: {} ({})", newest.file_name, newest.added_at);
    }
    0
}

fn print_tree(group: &Group, depth: usize) {
    let indent = "  ".repeat(depth);
    for element in &group.elements {
        match element {
            GroupElement::Group(sub) => {
                println!("{indent}{}/ ({} photos)", sub.title, sub.total_photo_count());
                print_tree(sub, depth + 1);
            }
            GroupElement::Gallery(g) => {
                println!("{indent}{} [{}] ({} photos)", g.title, g.id, g.photo_count);
            }
            GroupElement::Unknown => {}
        }
    }
}

async fn run_list(config: &Config, analyze: bool) -> anyhow::Result<u8> {
    let conn = connect(config).await?;
    let root = load_hierarchy(&conn, false).await?;
    println!("{}", if root.title.is_empty() { &conn.login_name } else { &root.title });
    print_tree(&root, 1);
    println!(
        "{} galleries, {} photos",
        root.walk_galleries().len(),
        root.total_photo_count()
    );

    if analyze {
        let manager = build_manager(config, &conn, Arc::new(NoProgress));
        let a = manager.analyze_galleries(&root).await;
        println!(
            "Analysis: {} galleries, {} photos, {} videos, {:.1} MB, estimated download time {}",
            a.total_galleries, a.total_photos, a.total_videos, a.total_size_mb, a.estimated_time
        );
    }
    Ok(0)
}

fn run_checkpoint_status(config: &Config) -> u8 {
    let checkpoint = CheckpointStore::for_output_dir(&config.output_dir);
    let info = checkpoint.get_resume_info();
    if !info.has_checkpoint {
        println!("No checkpoint in {}", config.output_dir.display());
        return 0;
    }
    println!("Checkpoint: {}", checkpoint.path().display());
    if let Some(start) = info.session_start_time {
        println!("  Session started:   {}", start.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(updated) = info.last_updated {
        println!("  Last updated:      {}", updated.format("%Y-%m-%d %H:%M:%S"));
    }
    println!("  Completed files:   {}", info.completed_files);
    println!("  Failed files:      {}", info.failed_files);
    println!("  Skipped files:     {}", info.skipped_files);
    println!("  Galleries tracked: {}", info.galleries_in_progress);
    0
}

fn run_clear_checkpoint(config: &Config) -> anyhow::Result<u8> {
    let checkpoint = CheckpointStore::for_output_dir(&config.output_dir);
    checkpoint.clear().context("Failed to clear checkpoint")?;
    println!("Checkpoint cleared");
    Ok(0)
}

async fn run_cache(config: &Config, action: CacheAction) -> anyhow::Result<u8> {
    let cache = SqliteMetadataCache::open(&config.cache_dir, config.cache_ttl)
        .await
        .with_context(|| format!("Failed to open cache in {}", config.cache_dir.display()))?;
    match action {
        CacheAction::Info => {
            let info = cache.info().await?;
            println!("Cache: {}", cache.path().display());
            println!("  Galleries:   {} ({} expired)", info.galleries, info.expired_galleries);
            println!("  Photos:      {}", info.photos);
            println!("  Hierarchies: {}", info.hierarchies);
            println!("  Size:        {}", format_bytes(info.size_bytes));
        }
        CacheAction::Clear => {
            cache.clear().await?;
            println!("Cache cleared");
        }
    }
    Ok(0)
}

async fn run_verify(config: &Config) -> anyhow::Result<u8> {
    let output_dir: &Path = &config.output_dir;
    if !output_dir.is_dir() {
        anyhow::bail!("Output directory {} does not exist", output_dir.display());
    }
    let integrity = IntegrityChecker::new(true, false, config.chunk_size);
    let report = manager::verify_existing_files(integrity, output_dir).await?;
    println!(
        "Checked {} file(s): {} valid, {} invalid",
        report.total_checked,
        report.valid_files,
        report.invalid_files.len()
    );
    for invalid in &report.invalid_files {
        println!("  {}: {}", invalid.path.display(), invalid.reasons.join("; "));
    }
    Ok(if report.invalid_files.is_empty() {
        0
    } else {
        EXIT_PARTIAL_FAILURE
    })
}

async fn run(cli: cli::Cli) -> anyhow::Result<u8> {
    let command = cli.effective_command();
    let config = Config::from_cli(&cli.global)?;
    tracing::debug!(?config, "Starting zenfolio-dl");

    match command {
        Command::Download(args) => {
            let shutdown = shutdown::install_signal_handler()?;
            run_download(&config, args, shutdown).await
        }
        Command::ProcessQueue(args) => {
            let shutdown = shutdown::install_signal_handler()?;
            run_process_queue(&config, args, shutdown).await
        }
        Command::QueueStatus => Ok(run_queue_status(&config)),
        Command::List { analyze } => run_list(&config, analyze).await,
        Command::CheckpointStatus => Ok(run_checkpoint_status(&config)),
        Command::ClearCheckpoint => run_clear_checkpoint(&config),
        Command::Cache { action } => run_cache(&config, action).await,
        Command::Verify => run_verify(&config).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.global.log_level.as_filter())),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
