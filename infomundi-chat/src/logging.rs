use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{ChatError, ChatResult};

const LOG_FILE_NAME: &str = "infomundi-chat.log";

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Used when `RUST_LOG` is unset
    pub default_filter: String,
    /// Daily-rolling log files go here; stderr only when unset
    pub log_dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            log_dir: None,
        }
    }
}

/// Install the global subscriber.
///
/// Keep the returned guard alive for the life of the process or buffered
/// file output is lost.
pub fn init(config: &LogConfig) -> ChatResult<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));
    let registry = tracing_subscriber::registry().with(env_filter);

    let guard = match &config.log_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            registry
                .with(fmt::layer().with_ansi(false).with_writer(non_blocking))
                .try_init()
                .map_err(|e| ChatError::Config(format!("Logging already initialized: {}", e)))?;
            Some(guard)
        }
        None => {
            registry
                .with(fmt::layer().with_writer(std::io::stderr))
                .try_init()
                .map_err(|e| ChatError::Config(format!("Logging already initialized: {}", e)))?;
            None
        }
    };

    tracing::info!(
        log_dir = ?config.log_dir,
        "Logging initialized"
    );
    Ok(guard)
}
