use std::fs;

use anyhow::Context;
use tokio::sync::broadcast;
use tracing::metadata::LevelFilter;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Registry;
use tributary_types::LOG_DIR_ENV;

/// Installs the global subscriber: human-readable logs on stdout and, when `LOG_DIR` is set,
/// logfmt lines in a daily-rolling file named after `name`.
///
/// The returned guard must be held for the lifetime of the process so buffered file logs are
/// flushed.
pub fn init_logging(name: &str) -> anyhow::Result<Option<WorkerGuard>> {
    let stdout_log = tracing_subscriber::fmt::layer()
        .with_line_number(false)
        .with_file(false)
        .with_span_events(FmtSpan::NEW)
        .with_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        );

    let subscriber = Registry::default().with(stdout_log);

    let mut guard = None;

    let file_log = match std::env::var(LOG_DIR_ENV) {
        Ok(log_dir) => {
            fs::create_dir_all(&log_dir)
                .with_context(|| format!("failed to create log directory {}", log_dir))?;

            let file_appender = tracing_appender::rolling::daily(&log_dir, name);
            let (non_blocking, g) = tracing_appender::non_blocking(file_appender);
            guard = Some(g);

            Some(
                tracing_subscriber::fmt::layer()
                    .event_format(tracing_logfmt::EventsFormatter::default())
                    .fmt_fields(tracing_logfmt::FieldsFormatter::default())
                    .with_writer(non_blocking)
                    .with_filter(
                        EnvFilter::builder()
                            .with_default_directive(LevelFilter::INFO.into())
                            .from_env_lossy(),
                    ),
            )
        }
        Err(_) => None,
    };

    let subscriber = subscriber.with(file_log);

    tracing::subscriber::set_global_default(subscriber)
        .context("unable to set global subscriber")?;

    std::panic::set_hook(Box::new(|panic| {
        if let Some(location) = panic.location() {
            tracing::error!(
                message = %panic,
                panic.file = location.file(),
                panic.line = location.line(),
                panic.column = location.column(),
            );
        } else {
            tracing::error!(message = %panic);
        }
    }));

    Ok(guard)
}

/// Resolves on the first ctrl-c and fans the signal out to every subscriber of the returned
/// channel.
pub fn shutdown_signal() -> broadcast::Sender<()> {
    let (tx, _) = broadcast::channel(1);
    let sender = tx.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received ctrl-c, shutting down");
                let _ = sender.send(());
            }
            Err(e) => warn!("unable to listen for shutdown signal: {}", e),
        }
    });
    tx
}
