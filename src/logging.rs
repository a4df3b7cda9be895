//! Logging Module
//!
//! Installs the process-wide `tracing` subscriber: a compact console layer and,
//! when a log directory is configured, a daily-rolling file layer named after
//! the host so several machines can log into the same shared directory.

use crate::config::LoggingConfig;
use crate::{Result, StoreError};
use tracing::{debug, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// `hostname:pid` of this process
pub fn instance_id() -> String {
    format!("{}:{}", host_name(), std::process::id())
}

pub fn host_name() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

/// Initialize application logging
///
/// RUST_LOG overrides the configured level. Calling this more than once (or
/// after a test harness installed a subscriber) is a no-op.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| {
            StoreError::Config(format!("Invalid log level '{}': {}", config.log_level, e))
        })?;

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
        .compact();

    let file_layer = match &config.log_dir {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir).map_err(|e| {
                StoreError::Io(format!("Failed to create log directory {:?}: {}", log_dir, e))
            })?;
            let file_appender = RollingFileAppender::new(
                Rotation::DAILY,
                log_dir,
                format!("stats-{}.log", host_name()),
            );
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(file_appender)
                    .with_ansi(false)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                    .compact(),
            )
        }
        None => None,
    };

    let result = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    match result {
        Ok(()) => {
            info!("Logging initialized: instance={}", instance_id());
            if let Some(log_dir) = &config.log_dir {
                info!("Application logs will be written to: {:?}", log_dir);
            }
        }
        Err(_) => {
            debug!("Tracing subscriber already initialized, skipping");
        }
    }

    Ok(())
}
