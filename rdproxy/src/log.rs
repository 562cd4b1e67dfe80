use anyhow::Context as _;
use camino::Utf8Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::VerbosityProfile;

/// Keeps the non-blocking writers flushing; hold it for the process lifetime.
pub struct LoggerGuard {
    _file_guard: Option<WorkerGuard>,
    _stdio_guard: WorkerGuard,
}

struct LogPathCfg<'a> {
    folder: &'a Utf8Path,
    prefix: &'a str,
}

impl<'a> LogPathCfg<'a> {
    fn from_path(path: &'a Utf8Path) -> anyhow::Result<Self> {
        if path.is_dir() {
            Ok(Self {
                folder: path,
                prefix: "rdproxy",
            })
        } else {
            Ok(Self {
                folder: path.parent().context("invalid log path (parent)")?,
                prefix: path.file_name().context("invalid log path (file_name)")?,
            })
        }
    }
}

pub fn init(
    profile: VerbosityProfile,
    debug_filtering_directives: Option<&str>,
    log_file: Option<&Utf8Path>,
) -> anyhow::Result<LoggerGuard> {
    let (file_layer, file_guard) = if let Some(path) = log_file {
        let log_cfg = LogPathCfg::from_path(path)?;
        let file_appender = rolling::daily(log_cfg.folder, log_cfg.prefix);
        let (file_non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
        let file_layer = fmt::layer().with_writer(file_non_blocking).with_ansi(false);
        (Some(file_layer), Some(file_guard))
    } else {
        (None, None)
    };

    let (non_blocking_stdio, stdio_guard) = tracing_appender::non_blocking(std::io::stdout());
    let stdio_layer = fmt::layer().with_writer(non_blocking_stdio);

    let env_filter = match debug_filtering_directives {
        Some(directives) => EnvFilter::try_new(directives).context("invalid log filtering directives")?,
        None => EnvFilter::try_new(profile.to_directives())
            .context("invalid built-in filtering directives (this is a bug)")?,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdio_layer)
        .try_init()
        .context("failed to set the global tracing subscriber")?;

    Ok(LoggerGuard {
        _file_guard: file_guard,
        _stdio_guard: stdio_guard,
    })
}
