use crate::config::EngineConfig;
use std::path::{Path, PathBuf};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default log directory: `~/.intermittent/logs`
pub fn default_log_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".intermittent")
        .join("logs")
}

/// Log file prefix for an arena: `nvm.bin` logs to `nvm.log.<date>`.
///
/// Arenas sharing a log directory keep separate files.
pub fn log_file_prefix(nvm_path: &Path) -> String {
    let stem = nvm_path
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("engine");
    format!("{}.log", stem)
}

// RUST_LOG overrides level
fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Initialize logging for long inference runs
///
/// Writes a daily rotating file named after the NVM arena (see
/// [`log_file_prefix`]) under `logging.dir`, or [`default_log_dir`] when unset,
/// next to compact stdout output. Each run starts with an event naming the
/// arena and recovery mode, so a log can be matched to the image it drove.
pub fn init_production_logging(config: &EngineConfig) -> anyhow::Result<()> {
    let level = config.logging.level.as_str();
    let log_dir = config.logging.dir.clone().unwrap_or_else(default_log_dir);
    std::fs::create_dir_all(&log_dir)?;

    let prefix = log_file_prefix(&config.storage.nvm_path);
    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, &prefix);

    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_target(true)
                .with_line_number(true),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_target(false)
                .with_line_number(false),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    tracing::info!(
        log_dir = %log_dir.display(),
        log_file = %prefix,
        level = %level,
        nvm = %config.storage.nvm_path.display(),
        nvm_size = config.storage.nvm_size,
        mode = %config.recovery.mode,
        "Engine logging initialized"
    );

    Ok(())
}

/// Initialize simple logging for CLI commands (stdout only)
pub fn init_simple_logging(level: &str) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_target(false)
                .with_line_number(false),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}
