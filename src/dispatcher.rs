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

//! Single-process supervisor: polls the job document, spawns the matching
//! worker binary and blocks on it. Never two workers at once.

use anyhow::{Context, Result};
use colored::*;
use serde_json::Value;
use tokio::process::Command;
use tokio::time::{sleep, Duration};

use crate::config::Config;
use crate::ipc::{IpcStore, JOB_FILE};
use crate::platform;
use crate::types::Job;

const POLL_INTERVAL_SECS: u64 = 2;

pub async fn run(config: &Config, store: &IpcStore) -> Result<()> {
    startup_cleanup(config, store).await?;
    banner(config);

    loop {
        match read_job_checked(store) {
            JobRead::Active(job) => {
                tracing::info!(
                    "Görev alındı: platform={}, url={}",
                    job.platform,
                    job.meeting_url
                );
                if let Err(e) = dispatch(&job, config).await {
                    tracing::error!("Worker çalıştırma hatası: {:#}", e);
                    // The job document must not wedge the loop
                    store.delete_job();
                }
            }
            JobRead::UnknownPlatform => {
                tracing::error!("Bilinmeyen platform, görev siliniyor");
                store.delete_job();
            }
            JobRead::None => {}
        }
        sleep(Duration::from_secs(POLL_INTERVAL_SECS)).await;
    }
}

enum JobRead {
    Active(Job),
    UnknownPlatform,
    None,
}

/// A job file that is active but fails typed parsing carries a platform we
/// do not recognize; it must be deleted, not ignored forever.
fn read_job_checked(store: &IpcStore) -> JobRead {
    if let Some(job) = store.read_job() {
        return if job.active {
            JobRead::Active(job)
        } else {
            JobRead::None
        };
    }
    let path = store.path(JOB_FILE);
    let Ok(raw) = std::fs::read_to_string(&path) else {
        return JobRead::None;
    };
    match serde_json::from_str::<Value>(&raw) {
        Ok(value) if value.get("active").and_then(Value::as_bool).unwrap_or(false) => {
            JobRead::UnknownPlatform
        }
        _ => JobRead::None,
    }
}

/// Spawn the worker binary for this job and block until it finishes.
async fn dispatch(job: &Job, config: &Config) -> Result<()> {
    let worker_bin = std::env::current_exe()
        .context("current_exe unavailable")?
        .parent()
        .context("executable has no parent directory")?
        .join(if cfg!(windows) {
            "sesly-worker.exe"
        } else {
            "sesly-worker"
        });

    let mut cmd = Command::new(worker_bin);
    cmd.arg(&job.meeting_url)
        .arg("--platform")
        .arg(job.platform.to_string());
    let bot_name = job
        .bot_display_name
        .clone()
        .unwrap_or_else(|| config.bot_display_name.clone());
    cmd.arg("--name").arg(bot_name);
    if let Some(passcode) = &job.passcode {
        cmd.arg("--passcode").arg(passcode);
    }

    let mut child = cmd.spawn().context("Worker subprocess başlatılamadı")?;
    let status = child.wait().await.context("Worker bekleme hatası")?;
    if status.success() {
        tracing::info!("Worker tamamlandı");
    } else {
        tracing::error!("Worker hata koduyla kapandı: {:?}", status.code());
    }
    Ok(())
}

/// Kill zombies from a previous run, reset the status document and sweep
/// stale streaming artifacts so a fresh start really is fresh.
async fn startup_cleanup(config: &Config, store: &IpcStore) -> Result<()> {
    tracing::info!("Başlangıç temizliği yapılıyor...");
    platform::kill_zombie_processes().await;

    for rel in [
        crate::ipc::TRANSCRIPT_FILE,
        crate::ipc::ACTIVITY_LOG_FILE,
        crate::ipc::SNAPSHOT_FILE,
        crate::ipc::TIMELINE_FILE,
        crate::ipc::RECORDER_STATUS_FILE,
        crate::ipc::STOP_SIGNAL_FILE,
    ] {
        let path = store.path(rel);
        if path.exists() {
            if std::fs::remove_file(&path).is_ok() {
                tracing::info!("Silindi: {}", rel);
            }
        }
    }
    store.prune_reports_dir(&config.reports_dir);

    store
        .reset_worker_status("Sistem Hazır")
        .context("Worker status sıfırlanamadı")?;
    Ok(())
}

fn banner(config: &Config) {
    println!("{}", "=".repeat(60));
    println!("{}", " SESLY DISPATCHER BAŞLATILDI!".bold().green());
    println!("{}", "=".repeat(60));
    println!(
        " API: http://{}:{}",
        config.api_host,
        config.api_port.to_string().cyan()
    );
    println!(" Segment klasörü: {}", config.segment_dir.display());
    println!("{}", "=".repeat(60));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{now_ts, Platform};

    #[test]
    fn unknown_platform_jobs_are_flagged_for_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let store = IpcStore::new(dir.path());
        std::fs::create_dir_all(store.path("data")).unwrap();
        std::fs::write(
            store.path(JOB_FILE),
            r#"{"active": true, "platform": "webex", "meeting_url": "x", "created_at": 0}"#,
        )
        .unwrap();
        assert!(matches!(read_job_checked(&store), JobRead::UnknownPlatform));
    }

    #[test]
    fn inactive_and_missing_jobs_idle() {
        let dir = tempfile::tempdir().unwrap();
        let store = IpcStore::new(dir.path());
        assert!(matches!(read_job_checked(&store), JobRead::None));

        let job = crate::types::Job {
            active: false,
            platform: Platform::Zoom,
            meeting_url: "https://zoom.us/wc/123/join".to_string(),
            meeting_id: None,
            passcode: None,
            bot_display_name: None,
            title: None,
            user_id: None,
            created_at: now_ts(),
        };
        store.write_job(&job).unwrap();
        assert!(matches!(read_job_checked(&store), JobRead::None));
    }

    #[test]
    fn active_typed_jobs_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = IpcStore::new(dir.path());
        let job = crate::types::Job {
            active: true,
            platform: Platform::Meet,
            meeting_url: "https://meet.google.com/abc-defg-hij".to_string(),
            meeting_id: None,
            passcode: None,
            bot_display_name: None,
            title: None,
            user_id: None,
            created_at: now_ts(),
        };
        store.write_job(&job).unwrap();
        match read_job_checked(&store) {
            JobRead::Active(read) => assert_eq!(read.platform, Platform::Meet),
            _ => panic!("expected an active job"),
        }
    }
}
