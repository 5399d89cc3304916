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

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use sesly_bot::recorder::SegmentRecorder;
use sesly_bot::types::Platform;
use sesly_bot::{config::Config, ipc::IpcStore, logging};

/// Sesly Recorder - rolling WebM/Opus segments with live upload
#[derive(Parser)]
#[command(name = "sesly-recorder")]
#[command(version)]
struct Cli {
    /// Platform the active meeting runs on (forwarded as a diarization hint)
    #[arg(long)]
    platform: Platform,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = logging::init("recorder")?;

    let config = Config::load()?;
    let store = IpcStore::default();

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    let mut recorder = SegmentRecorder::new(config, store, cli.platform)?;
    recorder.run(cancel).await
}

/// SIGTERM (worker kill path) and Ctrl+C both trigger the graceful stop.
fn spawn_signal_listener(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let token = cancel.clone();
        tokio::spawn(async move {
            if let Ok(mut term) = signal(SignalKind::terminate()) {
                term.recv().await;
                token.cancel();
            }
        });
    }
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });
}
