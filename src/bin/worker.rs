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

use sesly_bot::types::Platform;
use sesly_bot::{config::Config, ipc::IpcStore, logging, platform, worker};

/// Sesly Worker - joins one meeting, records it and produces the report
#[derive(Parser)]
#[command(name = "sesly-worker")]
#[command(version)]
struct Cli {
    /// Meeting URL (or, for Zoom, a /wc/ web-client URL)
    meeting_url: String,

    /// Target platform
    #[arg(long)]
    platform: Platform,

    /// Display name the bot joins with
    #[arg(long, default_value = "Sesly Bot")]
    name: String,

    /// Meeting passcode, when the link does not carry it
    #[arg(long)]
    passcode: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = logging::init(&format!("{}_worker", cli.platform))?;
    platform::setup_display();

    let config = Config::load()?;
    let store = IpcStore::default();

    let options = worker::WorkerOptions {
        platform: cli.platform,
        meeting_url: cli.meeting_url,
        bot_name: cli.name,
        passcode: cli.passcode,
    };

    worker::run(&config, &store, options).await
}
