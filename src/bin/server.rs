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

use sesly_bot::{config::Config, ipc::IpcStore, logging, server};

/// Sesly API - job submission, bot commands and the transcription endpoint
#[derive(Parser)]
#[command(name = "sesly-server")]
#[command(version)]
struct Cli {}

#[tokio::main]
async fn main() -> Result<()> {
    let _cli = Cli::parse();
    let _guard = logging::init("server")?;

    let config = Config::load()?;
    let store = IpcStore::default();

    server::serve(config, store).await
}
