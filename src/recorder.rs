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

//! Long-running segment recorder: drives ffmpeg to emit fixed-duration
//! Opus-in-WebM segments, validates finalized files and uploads them in name
//! order to the local transcription endpoint. On stop, the open segment is
//! flushed via ffmpeg's `q` command so it closes as a valid WebM.

use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::SystemTime;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::ipc::IpcStore;
use crate::platform;
use crate::types::{now_ts, Platform, RecorderStatus};

const SEGMENT_TIME_SECS: u32 = 300;
const SCAN_INTERVAL_SECS: u64 = 5;
const UPLOAD_TIMEOUT_SECS: u64 = 300;
const GRACEFUL_STOP_SECS: u64 = 60;
const MIN_SEGMENT_BYTES: u64 = 20 * 1024;
const SMALL_SEGMENT_BYTES: u64 = 100 * 1024;
const MIN_SEGMENT_DURATION_SECS: f64 = 0.3;
/// Activity-log entries this close to the segment time qualify as a hint.
const SPEAKER_HINT_WINDOW_SECS: f64 = 10.0;

/// WebM/Matroska Cluster element id.
const CLUSTER_MARKER: [u8; 4] = [0x1F, 0x43, 0xB6, 0x75];

pub struct SegmentRecorder {
    config: Config,
    store: IpcStore,
    platform: Platform,
    http: reqwest::Client,
    ffmpeg: Option<Child>,
    recording_start: SystemTime,
    uploaded: HashSet<String>,
    /// Monotonic-ish open stamp per chunk: wall time when the scan first saw
    /// the file. More robust than `mtime - duration` when the encoder lags.
    first_seen: HashMap<String, f64>,
    sent: usize,
    skipped: usize,
}

impl SegmentRecorder {
    pub fn new(config: Config, store: IpcStore, platform: Platform) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(UPLOAD_TIMEOUT_SECS))
            .build()
            .context("Failed to build upload client")?;
        Ok(Self {
            config,
            store,
            platform,
            http,
            ffmpeg: None,
            recording_start: SystemTime::now(),
            uploaded: HashSet::new(),
            first_seen: HashMap::new(),
            sent: 0,
            skipped: 0,
        })
    }

    /// Main entry: record until the stop signal file appears or `cancel`
    /// fires, then flush, drain remaining segments and report status.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        let segment_dir = self.config.segment_dir.clone();
        platform::kill_stale_ffmpeg(&segment_dir).await;
        self.sweep_stale_chunks(&segment_dir);
        self.store.remove_stop_signal();

        self.recording_start = SystemTime::now();
        self.spawn_ffmpeg(&segment_dir).await?;
        tracing::info!(
            "Kayıt başladı: platform={}, segment klasörü={:?}",
            self.platform,
            segment_dir
        );

        let success = loop {
            tokio::select! {
                _ = sleep(Duration::from_secs(SCAN_INTERVAL_SECS)) => {}
                _ = cancel.cancelled() => {
                    tracing::info!("SIGTERM alındı, kayıt durduruluyor");
                    break true;
                }
            }

            if self.store.stop_signal_exists() {
                tracing::info!("stop_recording.signal görüldü, kayıt durduruluyor");
                break true;
            }

            // ffmpeg dying without a stop request is a hard failure
            if let Some(child) = self.ffmpeg.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    tracing::error!("ffmpeg beklenmedik şekilde kapandı: {:?}", status);
                    self.ffmpeg = None;
                    break false;
                }
            }

            self.stamp_new_chunks(&segment_dir);
            if let Err(e) = self.scan_and_upload(&segment_dir, false).await {
                tracing::warn!("Segment tarama hatası: {}", e);
            }
        };

        self.stop_ffmpeg().await;
        // Final pass: every remaining chunk is now finalized.
        self.stamp_new_chunks(&segment_dir);
        if let Err(e) = self.scan_and_upload(&segment_dir, true).await {
            tracing::warn!("Kapanış segment taraması hatası: {}", e);
        }

        let status = RecorderStatus {
            success,
            segments_sent: self.sent,
            segments_skipped: self.skipped,
            timestamp: now_ts(),
        };
        self.store.write_recorder_status(&status)?;
        tracing::info!(
            "Kayıt bitti: {} segment gönderildi, {} atlandı",
            self.sent,
            self.skipped
        );
        if !success {
            anyhow::bail!("ffmpeg exited unexpectedly");
        }
        Ok(())
    }

    fn sweep_stale_chunks(&self, segment_dir: &Path) {
        for path in list_chunks(segment_dir) {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::debug!("Eski chunk silinemedi {:?}: {}", path, e);
            }
        }
    }

    async fn spawn_ffmpeg(&mut self, segment_dir: &Path) -> Result<()> {
        let ffmpeg = platform::ffmpeg_binary_path(self.config.ffmpeg_path.as_deref());
        let pattern = segment_dir.join("chunk_%03d.webm");

        let mut cmd = Command::new(&ffmpeg);
        cmd.args(platform::ffmpeg_input_args());
        cmd.args([
            "-ac",
            "1",
            "-ar",
            "16000",
            "-c:a",
            "libopus",
            "-b:a",
            "16k",
            "-vbr",
            "off",
            "-application",
            "voip",
            "-f",
            "segment",
            "-segment_format",
            "webm",
            "-segment_time",
            &SEGMENT_TIME_SECS.to_string(),
            "-reset_timestamps",
            "1",
            "-break_non_keyframes",
            "1",
            "-avoid_negative_ts",
            "make_zero",
            "-y",
        ]);
        cmd.arg(pattern.as_os_str());
        cmd.stdin(Stdio::piped()).stdout(Stdio::null()).stderr(Stdio::piped());

        tracing::info!("ffmpeg başlatılıyor: {} ({})", ffmpeg, platform::audio_device_name());
        let mut child = cmd.spawn().context("Failed to start ffmpeg")?;

        // Drain stderr so ffmpeg never blocks on a full pipe
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                use tokio::io::{AsyncBufReadExt, BufReader};
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!("ffmpeg: {}", line);
                }
            });
        }

        // Catch immediate startup failures (bad device, missing binary)
        sleep(Duration::from_millis(1500)).await;
        if let Ok(Some(status)) = child.try_wait() {
            anyhow::bail!("ffmpeg exited immediately with {:?} - check the audio device", status);
        }

        self.ffmpeg = Some(child);
        Ok(())
    }

    /// Send `q` to ffmpeg's stdin so the open segment gets flushed and closed
    /// as a valid WebM; escalate to kill after the grace period.
    async fn stop_ffmpeg(&mut self) {
        let Some(mut child) = self.ffmpeg.take() else {
            return;
        };
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(b"q\n").await;
            let _ = stdin.flush().await;
        }
        tokio::select! {
            result = child.wait() => {
                match result {
                    Ok(status) => tracing::info!("ffmpeg düzgün kapandı: {:?}", status),
                    Err(e) => tracing::warn!("ffmpeg bekleme hatası: {}", e),
                }
            }
            _ = sleep(Duration::from_secs(GRACEFUL_STOP_SECS)) => {
                tracing::warn!("ffmpeg {} sn içinde kapanmadı, zorla kapatılıyor", GRACEFUL_STOP_SECS);
                let _ = child.kill().await;
            }
        }
        // Let the filesystem settle before the final scan
        sleep(Duration::from_millis(500)).await;
    }

    /// Record the first-seen stamp for chunks that just appeared.
    fn stamp_new_chunks(&mut self, segment_dir: &Path) {
        for path in list_chunks(segment_dir) {
            if let Some(name) = chunk_name(&path) {
                self.first_seen.entry(name).or_insert_with(now_ts);
            }
        }
    }

    /// Upload every finalized chunk not sent yet, in name order. A chunk is
    /// finalized once a later-named chunk exists; at stop everything is.
    async fn scan_and_upload(&mut self, segment_dir: &Path, all_finalized: bool) -> Result<()> {
        let mut chunks = list_chunks(segment_dir);
        chunks.sort();
        if chunks.is_empty() {
            return Ok(());
        }
        let finalized: Vec<PathBuf> = if all_finalized {
            chunks
        } else {
            chunks[..chunks.len() - 1].to_vec()
        };

        for path in finalized {
            let Some(name) = chunk_name(&path) else { continue };
            if self.uploaded.contains(&name) {
                continue;
            }

            let Ok(meta) = std::fs::metadata(&path) else {
                continue;
            };
            // Files from before this recording never go out
            if let Ok(mtime) = meta.modified() {
                if mtime < self.recording_start {
                    tracing::warn!("Eski mtime, segment atlandı: {}", name);
                    self.uploaded.insert(name);
                    self.skipped += 1;
                    continue;
                }
            }

            let probed = self.probe_duration(&path).await;
            match validate_segment(meta.len(), probed, count_clusters(&path)) {
                SegmentVerdict::Accept => {}
                SegmentVerdict::Reject(reason) => {
                    tracing::warn!("Segment reddedildi ({}): {}", reason, name);
                    self.uploaded.insert(name);
                    self.skipped += 1;
                    continue;
                }
            }

            let duration = probed.unwrap_or(SEGMENT_TIME_SECS as f64);
            let mtime_ts = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs_f64())
                .unwrap_or_else(now_ts);
            // Preferred: the stamp taken when the segment file was opened.
            let start_time = self
                .first_seen
                .get(&name)
                .copied()
                .unwrap_or(mtime_ts - duration);

            match self.upload_segment(&path, &name, start_time, duration, mtime_ts).await {
                Ok(()) => {
                    self.uploaded.insert(name.clone());
                    self.sent += 1;
                    if let Err(e) = std::fs::remove_file(&path) {
                        tracing::debug!("Gönderilen segment silinemedi {:?}: {}", path, e);
                    }
                    tracing::info!("Segment gönderildi: {} ({:.1}s)", name, duration);
                }
                Err(e) => {
                    // Left unmarked so the next scan retries it. Later
                    // segments must wait: uploads stay in name order.
                    tracing::warn!("Segment upload hatası {}: {}", name, e);
                    break;
                }
            }
        }
        Ok(())
    }

    async fn upload_segment(
        &self,
        path: &Path,
        name: &str,
        start_time: f64,
        duration: f64,
        mtime_ts: f64,
    ) -> Result<()> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {:?}", path))?;

        let mut form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(bytes)
                    .file_name(name.to_string())
                    .mime_str("audio/webm")?,
            )
            .text("start_time", format!("{start_time:.3}"))
            .text("duration", format!("{duration:.3}"))
            .text("platform", self.platform.to_string());

        if let Some(speaker) = self.speaker_hint(mtime_ts) {
            form = form.text("speaker_name", speaker);
        }

        let response = self
            .http
            .post(self.config.transcribe_url())
            .multipart(form)
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!("transcribe endpoint returned {}", response.status());
        }
        Ok(())
    }

    fn speaker_hint(&self, segment_ts: f64) -> Option<String> {
        speaker_hint_for(&self.store.read_activity(), segment_ts)
    }

    async fn probe_duration(&self, path: &Path) -> Option<f64> {
        let output = Command::new(platform::ffprobe_binary_path())
            .args([
                "-v",
                "quiet",
                "-show_entries",
                "format=duration",
                "-of",
                "csv=p=0",
            ])
            .arg(path.as_os_str())
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout).trim().parse::<f64>().ok()
    }
}

/// First speaker of the activity-log entry closest to the segment time, if
/// any entry falls within the ±10 s window.
fn speaker_hint_for(
    entries: &[crate::types::ActivityEntry],
    segment_ts: f64,
) -> Option<String> {
    entries
        .iter()
        .filter(|e| (e.timestamp - segment_ts).abs() <= SPEAKER_HINT_WINDOW_SECS)
        .min_by(|a, b| {
            let da = (a.timestamp - segment_ts).abs();
            let db = (b.timestamp - segment_ts).abs();
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        })
        .and_then(|e| e.speakers.first().cloned())
}

fn list_chunks(segment_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(segment_dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("chunk_") && n.ends_with(".webm"))
                .unwrap_or(false)
        })
        .collect()
}

fn chunk_name(path: &Path) -> Option<String> {
    path.file_name().and_then(|n| n.to_str()).map(|n| n.to_string())
}

#[derive(Debug, PartialEq)]
enum SegmentVerdict {
    Accept,
    Reject(&'static str),
}

/// The validation policy has no false negatives: when ffprobe cannot tell us
/// anything we accept and let the transcription endpoint sort it out.
fn validate_segment(size: u64, duration: Option<f64>, clusters: Option<usize>) -> SegmentVerdict {
    if size < MIN_SEGMENT_BYTES {
        return SegmentVerdict::Reject("çok küçük");
    }
    if let Some(d) = duration {
        if d < MIN_SEGMENT_DURATION_SECS && size < SMALL_SEGMENT_BYTES {
            return SegmentVerdict::Reject("çok kısa");
        }
    }
    if let Some(count) = clusters {
        if count < 2 {
            return SegmentVerdict::Reject("eksik cluster");
        }
    }
    SegmentVerdict::Accept
}

/// Count Matroska Cluster markers in the file. `None` when unreadable.
fn count_clusters(path: &Path) -> Option<usize> {
    let bytes = std::fs::read(path).ok()?;
    if bytes.len() < CLUSTER_MARKER.len() {
        return Some(0);
    }
    Some(
        bytes
            .windows(CLUSTER_MARKER.len())
            .filter(|w| *w == CLUSTER_MARKER)
            .count(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn tiny_segments_are_rejected() {
        assert_eq!(
            validate_segment(10 * 1024, Some(300.0), Some(50)),
            SegmentVerdict::Reject("çok küçük")
        );
    }

    #[test]
    fn short_and_small_is_rejected_but_short_and_big_passes() {
        assert_eq!(
            validate_segment(50 * 1024, Some(0.1), Some(5)),
            SegmentVerdict::Reject("çok kısa")
        );
        assert_eq!(validate_segment(200 * 1024, Some(0.1), Some(5)), SegmentVerdict::Accept);
    }

    #[test]
    fn probe_failure_accepts() {
        // No duration available: accept (no false negatives)
        assert_eq!(validate_segment(50 * 1024, None, None), SegmentVerdict::Accept);
    }

    #[test]
    fn missing_clusters_reject() {
        assert_eq!(
            validate_segment(50 * 1024, Some(10.0), Some(1)),
            SegmentVerdict::Reject("eksik cluster")
        );
    }

    #[test]
    fn cluster_counter_finds_markers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunk_000.webm");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&[0x00, 0x1F, 0x43, 0xB6, 0x75, 0xAA, 0x1F, 0x43, 0xB6, 0x75])
            .unwrap();
        assert_eq!(count_clusters(&path), Some(2));
        assert_eq!(count_clusters(&dir.path().join("missing.webm")), None);
    }

    #[test]
    fn speaker_hint_respects_the_ten_second_window() {
        use crate::types::ActivityEntry;
        let entry = |ts: f64, who: &str| ActivityEntry {
            timestamp: ts,
            platform: "zoom".to_string(),
            speakers: vec![who.to_string()],
        };
        let entries = vec![entry(100.0, "Ali"), entry(130.0, "Veli")];
        // 105 is within 10s of Ali's entry
        assert_eq!(speaker_hint_for(&entries, 105.0).as_deref(), Some("Ali"));
        // 126 is closest to Veli
        assert_eq!(speaker_hint_for(&entries, 126.0).as_deref(), Some("Veli"));
        // 115 is 15s/15s away from both: no hint
        assert_eq!(speaker_hint_for(&entries, 115.0), None);
    }

    #[test]
    fn chunk_listing_is_lexicographically_ordered_after_sort() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["chunk_002.webm", "chunk_000.webm", "chunk_001.webm", "other.txt"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let mut chunks = list_chunks(dir.path());
        chunks.sort();
        let names: Vec<_> = chunks
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["chunk_000.webm", "chunk_001.webm", "chunk_002.webm"]);
    }
}
