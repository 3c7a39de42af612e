use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

const FILE_PREFIX: &str = "chatpilot";
const FILE_SUFFIX: &str = "log";
/// 30 days of hourly files.
pub const MAX_LOG_FILES: usize = 30 * 24;

fn default_filter() -> EnvFilter {
    EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())
}

pub fn log_dir(data_dir: &str) -> PathBuf {
    PathBuf::from(data_dir).join("logs")
}

/// File logging for daemon mode: `chatpilot.YYYY-MM-DD-HH.log` under
/// `<data_dir>/logs`, oldest files removed past [`MAX_LOG_FILES`].
/// Keep the guard alive for the life of the process.
pub fn init_logging(data_dir: &str) -> Result<WorkerGuard> {
    let dir = log_dir(data_dir);
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::HOURLY)
        .filename_prefix(FILE_PREFIX)
        .filename_suffix(FILE_SUFFIX)
        .max_log_files(MAX_LOG_FILES)
        .build(&dir)
        .context("Failed to create log appender")?;
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(default_filter())
        .with_ansi(false)
        .with_target(true)
        .with_writer(writer)
        .init();
    Ok(guard)
}

pub fn init_console_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(default_filter())
        .with_target(true)
        .init();
}

fn hour_of(file_name: &str) -> Option<DateTime<Utc>> {
    let stamp = file_name
        .strip_prefix(FILE_PREFIX)?
        .strip_prefix('.')?
        .strip_suffix(FILE_SUFFIX)?
        .strip_suffix('.')?;
    let naive = NaiveDateTime::parse_from_str(&format!("{stamp}:00"), "%Y-%m-%d-%H:%M").ok()?;
    Some(naive.and_utc())
}

/// Hourly log files in `dir`, oldest first. A missing directory has none.
fn log_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(v) => v,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", dir.display())),
    };
    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let hour = path.file_name().and_then(|s| s.to_str()).and_then(hour_of);
        if let (Some(hour), true) = (hour, path.is_file()) {
            files.push((hour, path));
        }
    }
    files.sort();
    Ok(files.into_iter().map(|(_, path)| path).collect())
}

/// Last `max_lines` lines across all hourly files, oldest first.
pub fn tail_logs(dir: &Path, max_lines: usize) -> Result<Vec<String>> {
    let mut window: VecDeque<String> = VecDeque::with_capacity(max_lines);
    if max_lines == 0 {
        return Ok(Vec::new());
    }
    for path in log_files(dir)? {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        for line in content.lines() {
            if window.len() == max_lines {
                window.pop_front();
            }
            window.push_back(line.to_string());
        }
    }
    Ok(window.into())
}
