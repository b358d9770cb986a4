//! Daily rolling-file logging, dual stdout+file layers. Loosely mirrors a
//! sibling-domain agent CLI's tracing setup.

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt::time::ChronoUtc, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

const LOG_FILE_PREFIX: &str = "storyforge";

pub fn init(level: Option<&str>, log_dir: Option<&Path>, default_root: &Path) -> Result<PathBuf> {
    let log_dir = log_dir.map(Path::to_path_buf).unwrap_or_else(|| default_root.join("logs"));
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    LOG_GUARD
        .set(guard)
        .map_err(|_| anyhow!("logging already initialized"))?;

    let time_format = ChronoUtc::new("%Y-%m-%dT%H:%M:%S".to_string());

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .compact()
        .with_timer(time_format.clone());

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .compact()
        .with_timer(time_format);

    let default_filter = || {
        let base = level.unwrap_or("info");
        EnvFilter::new(format!("storyforge={base},storyforge_sdk={base},storyforge_runtime={base},warn"))
    };

    let filter = if let Some(level) = level {
        EnvFilter::try_new(format!("storyforge={level},storyforge_sdk={level},storyforge_runtime={level},warn"))
            .unwrap_or_else(|_| default_filter())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter())
    };

    let _ = tracing_subscriber::registry().with(filter).with(stdout_layer).with(file_layer).try_init();

    Ok(log_dir)
}
