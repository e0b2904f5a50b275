//! Logging Module
//!
//! tracing setup for the server binary:
//! - human readable stdout layer
//! - JSON file layer with daily rolling files (tracing-appender)
//! - `log` crate events bridged into tracing
//! - miette hook for startup diagnostics
//! - gzip compression of rotated logs in the background

use std::fs;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;

const LOG_PREFIX: &str = "encounter-sync.log";

// ============================================================================
// Logging Initialization
// ============================================================================

/// Initialize the logging system.
///
/// `RUST_LOG` wins over `config.level`. Returns the `WorkerGuard` of the file
/// writer (when enabled); keep it alive until shutdown so buffered lines are
/// flushed.
pub fn init(config: &LoggingConfig, log_dir: &Path) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_ansi(io::stdout().is_terminal())
        .with_target(true)
        .with_filter(env_filter.clone());

    let mut guard = None;
    let file_layer = if config.json_file && ensure_dir(log_dir) {
        let file_appender = tracing_appender::rolling::daily(log_dir, LOG_PREFIX);
        let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);
        guard = Some(worker_guard);
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .json()
                .with_file(true)
                .with_line_number(true)
                .with_thread_ids(true)
                .with_target(true)
                .with_filter(env_filter),
        )
    } else {
        None
    };

    let initialized = tracing_subscriber::registry()
        .with(file_layer)
        .with(stdout_layer)
        .try_init()
        .is_ok();

    if initialized {
        if let Err(e) = tracing_log::LogTracer::init() {
            eprintln!("Failed to initialize LogTracer: {}", e);
        }
    }

    init_miette();

    if guard.is_some() {
        let dir = log_dir.to_path_buf();
        std::thread::spawn(move || compress_old_logs(&dir));
        tracing::info!(log_dir = %log_dir.display(), "Logging initialized (daily rolling)");
    }

    guard
}

fn ensure_dir(dir: &Path) -> bool {
    if dir.exists() {
        return true;
    }
    match fs::create_dir_all(dir) {
        Ok(()) => true,
        Err(e) => {
            eprintln!("Failed to create logs directory {}: {}", dir.display(), e);
            false
        }
    }
}

fn init_miette() {
    let colorize = io::stderr().is_terminal();
    miette::set_hook(Box::new(move |_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .context_lines(3)
                .tab_width(4)
                .break_words(true)
                .color(colorize)
                .build(),
        )
    }))
    .ok(); // Ignore if already set
}

// ============================================================================
// Rotation
// ============================================================================

/// Files written by the rolling appender on earlier days
fn rotated_logs(log_dir: &Path, today: &str) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(log_dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| {
                    name.starts_with(&format!("{}.", LOG_PREFIX))
                        && !name.ends_with(today)
                        && !name.ends_with(".gz")
                })
        })
        .collect()
}

fn compress_old_logs(log_dir: &Path) {
    let today = chrono::Local::now().format("%Y-%m-%d").to_string();
    for path in rotated_logs(log_dir, &today) {
        match compress_file(&path) {
            Ok(()) => tracing::debug!(path = %path.display(), "Compressed old log"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to compress old log"),
        }
    }
}

fn compress_file(path: &Path) -> io::Result<()> {
    let mut gz_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "No filename"))?
        .to_os_string();
    gz_name.push(".gz");
    let gz_path = path.with_file_name(gz_name);

    // Skip if already exists
    if gz_path.exists() {
        return Ok(());
    }

    let mut reader = io::BufReader::new(fs::File::open(path)?);
    let mut encoder = GzEncoder::new(fs::File::create(&gz_path)?, Compression::default());
    io::copy(&mut reader, &mut encoder)?;
    encoder.finish()?;

    fs::remove_file(path)
}
