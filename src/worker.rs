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

//! Per-job coordinator: owns the meeting client and the recorder subprocess,
//! feeds the speaker timeline, reacts to commands and the end condition, and
//! drives teardown (browser first for fast user feedback, then the recorder's
//! graceful stop, then the report).

use anyhow::{Context, Result};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::time::{sleep, Duration, Instant};

use crate::config::Config;
use crate::ipc::IpcStore;
use crate::meeting::{create_client, MeetingClient};
use crate::report;
use crate::types::{
    clock_hms, now_ts, ActivityEntry, CommandKind, EndReason, ParticipantSnapshot, Platform,
    TimelineEntry,
};

const LOOP_INTERVAL_MS: u64 = 500;
const PARTICIPANT_REFRESH_SECS: u64 = 60;
const RECORDER_STOP_WAIT_SECS: u64 = 60;

pub struct WorkerOptions {
    pub platform: Platform,
    pub meeting_url: String,
    pub bot_name: String,
    pub passcode: Option<String>,
}

/// Run one meeting job start to finish. Returns an error only for
/// unrecoverable setup failures; in-meeting problems end the job normally.
pub async fn run(config: &Config, store: &IpcStore, options: WorkerOptions) -> Result<()> {
    let platform = options.platform;

    store.clean_job_start()?;
    store.update_worker_status(|s| {
        s.platform = platform.to_string();
        s.running = true;
        s.recording = false;
        s.paused = false;
        s.error = None;
        s.status_message = format!("{platform} (Web) başlatılıyor...");
    })?;

    let mut client = create_client(
        platform,
        &options.meeting_url,
        &options.bot_name,
        options.passcode.as_deref(),
        store.clone(),
    );

    let outcome = run_meeting(store, &mut client, &options).await;

    // Teardown always runs: browser first so the user sees the bot leave
    store.update_worker_status(|s| {
        s.recording = false;
        s.status_message = "Kapatılıyor...".to_string();
    })?;
    tracing::info!("Toplantıdan çıkılıyor...");
    client.close().await;

    let (joined, end_reason, recorder) = match outcome {
        Ok(state) => state,
        Err(e) => {
            tracing::error!("Görev hatası: {:#}", e);
            store.update_worker_status(|s| {
                s.error = Some(format!("{e:#}"));
            })?;
            (false, Some(EndReason::Normal), None)
        }
    };

    if let Some(recorder) = recorder {
        stop_recorder(store, recorder).await;
    }

    // Invalid links skip the normal report; everything else gets one (an
    // empty transcript produces the placeholder report).
    let invalid_link = matches!(end_reason, Some(EndReason::Invalid(_)));
    let recorder_failed = store
        .read_recorder_status()
        .map(|s| !s.success)
        .unwrap_or(false);
    let transcript_empty = store.read_transcript().trim().is_empty();

    if joined && !invalid_link && !(recorder_failed && transcript_empty) {
        store.update_worker_status(|s| {
            s.status_message = "Rapor hazırlanıyor...".to_string();
        })?;
        match report::run(config, store).await {
            Ok(outcome) => tracing::info!("Rapor oluşturuldu: {:?}", outcome.html_path),
            Err(e) => tracing::error!("Rapor oluşturma hatası: {:#}", e),
        }
    } else {
        tracing::info!(
            "Rapor atlandı (joined={}, invalid_link={}, recorder_failed={})",
            joined,
            invalid_link,
            recorder_failed
        );
    }

    // Per-job ephemerals; the transcript cache stays for the status endpoint
    let _ = store.truncate_timeline();
    store.remove_stop_signal();
    let cleanup = [
        crate::ipc::ACTIVITY_LOG_FILE,
        crate::ipc::SNAPSHOT_FILE,
        crate::ipc::RECORDER_STATUS_FILE,
    ];
    for rel in cleanup {
        let path = store.path(rel);
        if path.exists() {
            let _ = std::fs::remove_file(path);
        }
    }

    store.update_worker_status(|s| {
        s.running = false;
        s.recording = false;
        s.paused = false;
        s.platform = String::new();
        s.status_message = "Hazır".to_string();
    })?;

    // Dispatcher resumes polling once the job document is gone
    store.delete_job();
    tracing::info!("Görev tamamlandı");
    Ok(())
}

type MeetingState = (bool, Option<EndReason>, Option<Child>);

async fn run_meeting(
    store: &IpcStore,
    client: &mut Box<dyn MeetingClient>,
    options: &WorkerOptions,
) -> Result<MeetingState> {
    let platform = options.platform;

    client.start().await.context("Tarayıcı başlatılamadı")?;

    store.update_worker_status(|s| {
        s.status_message = "Toplantıya katılıyor...".to_string();
    })?;
    let joined = client.join().await.unwrap_or(false);
    if !joined {
        tracing::error!("Toplantıya katılınamadı");
        // An invalid link may already be visible on the page; prefer its
        // diagnostic over the generic join-failure text.
        let reason = match client.check_meeting_ended().await {
            Ok(Some(reason)) => Some(reason),
            _ => None,
        };
        let diagnostic = reason
            .as_ref()
            .and_then(|r| r.message())
            .map(|m| m.to_string());
        store.update_worker_status(|s| {
            s.running = false;
            s.status_message = "Katılım başarısız!".to_string();
            s.error = Some(diagnostic.unwrap_or_else(|| {
                format!(
                    "{platform} toplantısına katılınamadı. Link geçersiz veya bekleme odası zaman aşımına uğradı."
                )
            }));
        })?;
        return Ok((false, reason, None));
    }
    tracing::info!("Toplantıya giriş başarılı");
    // Windows hosts get the meeting window focused; elsewhere a no-op
    let focus_keywords: &[&str] = match platform {
        Platform::Zoom => &["Zoom", "zoom.us", "wc/"],
        Platform::Teams => &["Teams", "Microsoft Teams"],
        Platform::Meet => &["Meet", "Google Meet"],
    };
    crate::platform::bring_to_front(focus_keywords).await;
    store.update_worker_status(|s| {
        s.status_message = "Toplantıda - Kayıt başlıyor...".to_string();
    })?;

    // Post-join housekeeping
    let _ = client.dismiss_popups().await;
    let _ = client.open_participants_panel().await;
    if let Ok(participants) = client.participants().await {
        if !participants.is_empty() {
            tracing::info!("{} katılımcı kaydedildi: {:?}", participants.len(), participants);
            let _ = store.write_snapshot(&ParticipantSnapshot {
                platform: platform.to_string(),
                participants,
                active_speakers: None,
                timestamp: now_ts(),
            });
        }
    }

    let recorder = match spawn_recorder(platform) {
        Ok(child) => {
            store.update_worker_status(|s| {
                s.recording = true;
                s.status_message = "🔴 Kayıt Alınıyor".to_string();
            })?;
            Some(child)
        }
        Err(e) => {
            tracing::error!("Recorder başlatılamadı: {:#}", e);
            None
        }
    };

    // Welcome chat, then captions (Meet); popups may reappear in between
    sleep(Duration::from_secs(5)).await;
    let welcome = "Merhaba! Ben Sesly Bot 🤖 Bu toplantıyı kaydediyorum.";
    match client.send_chat(welcome).await {
        Ok(true) => tracing::info!("Giriş mesajı gönderildi"),
        _ => tracing::warn!("Giriş mesajı gönderilemedi"),
    }
    let _ = client.dismiss_popups().await;
    if platform == Platform::Meet {
        sleep(Duration::from_secs(2)).await;
        match client.enable_captions().await {
            Ok(true) => tracing::info!("Canlı altyazı açık"),
            _ => tracing::warn!("Altyazı açılamadı - toplantı ayarlarından kapalı olabilir"),
        }
    }

    // Monitor loop
    tracing::info!("Toplantı izleniyor...");
    let mut last_speakers: Vec<String> = Vec::new();
    let mut paused = false;
    let mut last_refresh = Instant::now();
    let mut end_reason: Option<EndReason> = None;

    loop {
        if let Some(command) = store.read_pending_command() {
            match command.command {
                CommandKind::Stop => {
                    tracing::info!("STOP komutu alındı, çıkılıyor");
                    store.mark_command_processed(command)?;
                    break;
                }
                CommandKind::Pause => {
                    paused = true;
                    store.mark_command_processed(command)?;
                    store.update_worker_status(|s| {
                        s.paused = true;
                        s.status_message = "Duraklatıldı".to_string();
                    })?;
                    tracing::info!("PAUSE komutu alındı");
                }
                CommandKind::Resume => {
                    paused = false;
                    store.mark_command_processed(command)?;
                    store.update_worker_status(|s| {
                        s.paused = false;
                        s.status_message = "🔴 Kayıt Alınıyor".to_string();
                    })?;
                    tracing::info!("RESUME komutu alındı");
                }
                // force_reset is the API's job; summary is answered inline
                CommandKind::ForceReset | CommandKind::Summary => {}
            }
        }

        match client.check_meeting_ended().await {
            Ok(Some(reason)) => {
                tracing::info!("Toplantı bitişi tespit edildi");
                if let Some(message) = reason.message() {
                    // Surfaced before the worker exits (end-reason contract)
                    store.update_worker_status(|s| {
                        s.running = false;
                        s.error = Some(message.to_string());
                    })?;
                }
                end_reason = Some(reason);
                break;
            }
            Ok(None) => {}
            Err(e) => tracing::debug!("End-check hatası: {}", e),
        }

        if !paused {
            match client.active_speakers().await {
                Ok(speakers) if !speakers.is_empty() => {
                    if speakers != last_speakers {
                        tracing::info!("Konuşanlar: {}", speakers.join(", "));
                        let ts = now_ts();
                        let _ = store.append_activity(ActivityEntry {
                            timestamp: ts,
                            platform: platform.to_string(),
                            speakers: speakers.clone(),
                        });
                        let _ = store.append_timeline_if_changed(&TimelineEntry {
                            ts,
                            time: clock_hms(),
                            speakers: speakers.clone(),
                        });
                        let _ = store.write_snapshot(&ParticipantSnapshot {
                            platform: platform.to_string(),
                            participants: speakers.clone(),
                            active_speakers: Some(speakers.clone()),
                            timestamp: ts,
                        });
                        last_speakers = speakers;
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::debug!("Konuşmacı tespiti hatası: {}", e),
            }

            if last_refresh.elapsed().as_secs() >= PARTICIPANT_REFRESH_SECS {
                last_refresh = Instant::now();
                if let Ok(participants) = client.participants().await {
                    if !participants.is_empty() {
                        tracing::info!("Katılımcı listesi güncellendi: {} kişi", participants.len());
                        let _ = store.write_snapshot(&ParticipantSnapshot {
                            platform: platform.to_string(),
                            participants,
                            active_speakers: None,
                            timestamp: now_ts(),
                        });
                    }
                }
            }
        }

        // Heartbeat keeps the UI alive
        store.update_worker_status(|s| {
            s.running = true;
        })?;

        sleep(Duration::from_millis(LOOP_INTERVAL_MS)).await;
    }

    Ok((true, end_reason, recorder))
}

/// The recorder runs as a sibling binary next to this executable.
fn spawn_recorder(platform: Platform) -> Result<Child> {
    let recorder_bin = std::env::current_exe()
        .context("current_exe unavailable")?
        .parent()
        .context("executable has no parent directory")?
        .join(if cfg!(windows) {
            "sesly-recorder.exe"
        } else {
            "sesly-recorder"
        });

    tracing::info!("Recorder başlatılıyor: {:?}", recorder_bin);
    Command::new(recorder_bin)
        .arg("--platform")
        .arg(platform.to_string())
        .stdin(Stdio::null())
        .spawn()
        .context("Recorder subprocess başlatılamadı")
}

/// Graceful recorder stop: signal file, bounded wait, then kill.
async fn stop_recorder(store: &IpcStore, mut recorder: Child) {
    tracing::info!("Recorder durduruluyor (graceful)...");
    if let Err(e) = store.touch_stop_signal() {
        tracing::warn!("Stop signal yazılamadı: {}", e);
    }
    tokio::select! {
        result = recorder.wait() => {
            match result {
                Ok(status) => tracing::info!("Recorder kapandı: {:?}", status),
                Err(e) => tracing::warn!("Recorder bekleme hatası: {}", e),
            }
        }
        _ = sleep(Duration::from_secs(RECORDER_STOP_WAIT_SECS)) => {
            tracing::warn!("Recorder zaman aşımına uğradı, zorla kapatılıyor");
            let _ = recorder.kill().await;
        }
    }
}
