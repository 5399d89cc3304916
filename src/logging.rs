/*
 * Sesly Meeting Bot - Rust Edition
 * Copyright (c) 2024 Sesly Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging for one of the bot binaries.
///
/// Logs go to `logs/<name>.log` (daily rotation) at the level given by
/// `LOG_LEVEL`/`RUST_LOG` (default `info`), and to stderr compactly.
/// The returned guard must be held for the life of the process so the
/// non-blocking writer flushes on exit.
pub fn init(name: &str) -> Result<WorkerGuard> {
    let log_dir = std::path::Path::new("logs");
    std::fs::create_dir_all(log_dir).context("Failed to create log directory")?;

    let file_appender =
        RollingFileAppender::new(Rotation::DAILY, log_dir, format!("{name}.log"));
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let level = std::env::var("LOG_LEVEL")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());

    let filter = || {
        EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let subscriber = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_target(true)
                .with_filter(filter()),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact()
                .with_filter(filter()),
        );

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    tracing::info!("Logging initialized for {}", name);
    Ok(guard)
}
