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

use sesly_bot::{config::Config, dispatcher, ipc::IpcStore, logging};

/// Sesly Dispatcher - watches for meeting jobs and runs one worker at a time
#[derive(Parser)]
#[command(name = "sesly-dispatcher")]
#[command(version)]
#[command(about = "Toplantı görevlerini izler ve platforma uygun worker'ı çalıştırır")]
struct Cli {}

#[tokio::main]
async fn main() -> Result<()> {
    let _cli = Cli::parse();
    let _guard = logging::init("dispatcher")?;

    let config = Config::load()?;
    let store = IpcStore::default();

    dispatcher::run(&config, &store).await
}
