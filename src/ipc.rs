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

//! File-backed IPC store.
//!
//! Every document the components share lives as a small JSON file. Singleton
//! documents are written atomically (write-temp-then-rename); logs are
//! appended. Readers treat missing or unparsable files as "no value" - a
//! half-written document must never take a component down.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::types::{
    ActivityEntry, BotCommand, Job, ParticipantSnapshot, RecorderStatus, TimelineEntry,
    WorkerStatus, now_ts,
};

pub const JOB_FILE: &str = "data/bot_task.json";
pub const COMMAND_FILE: &str = "data/bot_command.json";
pub const WORKER_STATUS_FILE: &str = "data/worker_status.json";
pub const TIMELINE_FILE: &str = "speaker_timeline.jsonl";
pub const ACTIVITY_LOG_FILE: &str = "speaker_activity_log.json";
pub const SNAPSHOT_FILE: &str = "current_meeting_participants.json";
pub const TRANSCRIPT_FILE: &str = "latest_transcript.txt";
pub const RECORDER_STATUS_FILE: &str = "recorder_status.json";
pub const STOP_SIGNAL_FILE: &str = "stop_recording.signal";

#[derive(Debug, Clone)]
pub struct IpcStore {
    root: PathBuf,
}

impl Default for IpcStore {
    fn default() -> Self {
        Self::new(".")
    }
}

impl IpcStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    fn read_json<T: DeserializeOwned>(&self, rel: &str) -> Option<T> {
        let path = self.path(rel);
        let raw = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::debug!("Ignoring unparsable IPC document {:?}: {}", path, e);
                None
            }
        }
    }

    fn write_json<T: Serialize>(&self, rel: &str, value: &T) -> Result<()> {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(value)?;
        fs::write(&tmp, body).with_context(|| format!("Failed to write {:?}", tmp))?;
        fs::rename(&tmp, &path).with_context(|| format!("Failed to replace {:?}", path))?;
        Ok(())
    }

    fn remove(&self, rel: &str) {
        let path = self.path(rel);
        if path.exists() {
            if let Err(e) = fs::remove_file(&path) {
                tracing::debug!("Could not remove {:?}: {}", path, e);
            }
        }
    }

    // ---- Job ------------------------------------------------------------

    pub fn read_job(&self) -> Option<Job> {
        self.read_json(JOB_FILE)
    }

    pub fn write_job(&self, job: &Job) -> Result<()> {
        self.write_json(JOB_FILE, job)
    }

    pub fn delete_job(&self) {
        self.remove(JOB_FILE);
    }

    // ---- Command --------------------------------------------------------

    pub fn read_command(&self) -> Option<BotCommand> {
        self.read_json(COMMAND_FILE)
    }

    /// Returns the command only if no consumer has acted on it yet.
    pub fn read_pending_command(&self) -> Option<BotCommand> {
        self.read_command().filter(|c| !c.processed)
    }

    /// Writes a new command unless an unprocessed one is already waiting.
    pub fn write_command(&self, command: &BotCommand) -> Result<bool> {
        if self.read_pending_command().is_some() {
            return Ok(false);
        }
        self.write_json(COMMAND_FILE, command)?;
        Ok(true)
    }

    pub fn mark_command_processed(&self, mut command: BotCommand) -> Result<()> {
        command.processed = true;
        self.write_json(COMMAND_FILE, &command)
    }

    pub fn delete_command(&self) {
        self.remove(COMMAND_FILE);
    }

    // ---- Worker status --------------------------------------------------

    pub fn read_worker_status(&self) -> Option<WorkerStatus> {
        self.read_json(WORKER_STATUS_FILE)
    }

    /// Merge-update: load the document, let the caller patch it, write back.
    /// The original status fields survive fields the caller does not touch.
    pub fn update_worker_status<F>(&self, patch: F) -> Result<()>
    where
        F: FnOnce(&mut WorkerStatus),
    {
        let mut status = self.read_worker_status().unwrap_or_default();
        patch(&mut status);
        status.timestamp = now_ts();
        self.write_json(WORKER_STATUS_FILE, &status)
    }

    pub fn reset_worker_status(&self, message: &str) -> Result<()> {
        let status = WorkerStatus {
            status_message: message.to_string(),
            timestamp: now_ts(),
            ..Default::default()
        };
        self.write_json(WORKER_STATUS_FILE, &status)
    }

    // ---- Speaker timeline (append-only jsonl) ---------------------------

    /// Appends a timeline entry unless the speaker set equals the previous
    /// entry's. Returns whether a line was written.
    pub fn append_timeline_if_changed(&self, entry: &TimelineEntry) -> Result<bool> {
        if let Some(last) = self.read_timeline().last() {
            if last.speakers == entry.speakers {
                return Ok(false);
            }
        }
        let path = self.path(TIMELINE_FILE);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {:?}", path))?;
        let line = serde_json::to_string(entry)?;
        writeln!(file, "{}", line)?;
        Ok(true)
    }

    pub fn read_timeline(&self) -> Vec<TimelineEntry> {
        let path = self.path(TIMELINE_FILE);
        let Ok(raw) = fs::read_to_string(&path) else {
            return Vec::new();
        };
        raw.lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }

    pub fn truncate_timeline(&self) -> Result<()> {
        fs::write(self.path(TIMELINE_FILE), "")?;
        Ok(())
    }

    // ---- Speaker activity log (JSON array) ------------------------------

    pub fn append_activity(&self, entry: ActivityEntry) -> Result<()> {
        let mut entries = self.read_activity();
        entries.push(entry);
        self.write_json(ACTIVITY_LOG_FILE, &entries)
    }

    pub fn read_activity(&self) -> Vec<ActivityEntry> {
        self.read_json::<Vec<ActivityEntry>>(ACTIVITY_LOG_FILE)
            .unwrap_or_default()
    }

    // ---- Participant snapshot -------------------------------------------

    pub fn write_snapshot(&self, snapshot: &ParticipantSnapshot) -> Result<()> {
        self.write_json(SNAPSHOT_FILE, snapshot)
    }

    pub fn read_snapshot(&self) -> Option<ParticipantSnapshot> {
        self.read_json(SNAPSHOT_FILE)
    }

    // ---- Transcript cache -----------------------------------------------

    pub fn read_transcript(&self) -> String {
        fs::read_to_string(self.path(TRANSCRIPT_FILE)).unwrap_or_default()
    }

    /// Raw append; the dedup policy lives in the transcription module.
    pub fn append_transcript(&self, text: &str) -> Result<()> {
        let path = self.path(TRANSCRIPT_FILE);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {:?}", path))?;
        file.write_all(text.as_bytes())?;
        Ok(())
    }

    pub fn truncate_transcript(&self) -> Result<()> {
        fs::write(self.path(TRANSCRIPT_FILE), "")?;
        Ok(())
    }

    // ---- Recorder status / stop signal ----------------------------------

    pub fn write_recorder_status(&self, status: &RecorderStatus) -> Result<()> {
        self.write_json(RECORDER_STATUS_FILE, status)
    }

    pub fn read_recorder_status(&self) -> Option<RecorderStatus> {
        self.read_json(RECORDER_STATUS_FILE)
    }

    pub fn touch_stop_signal(&self) -> Result<()> {
        fs::write(self.path(STOP_SIGNAL_FILE), "")?;
        Ok(())
    }

    pub fn stop_signal_exists(&self) -> bool {
        self.path(STOP_SIGNAL_FILE).exists()
    }

    pub fn remove_stop_signal(&self) {
        self.remove(STOP_SIGNAL_FILE);
    }

    // ---- Lifecycle sweeps ------------------------------------------------

    /// Remove stale artifacts from a previous job and reset the streaming
    /// documents for a fresh one.
    pub fn clean_job_start(&self) -> Result<()> {
        self.delete_command();
        self.remove_stop_signal();
        self.remove(ACTIVITY_LOG_FILE);
        self.remove(SNAPSHOT_FILE);
        self.remove(RECORDER_STATUS_FILE);
        self.truncate_timeline()?;
        self.truncate_transcript()?;
        Ok(())
    }

    /// Force-reset sweep: every IPC document goes away, including the Job.
    pub fn clear_all(&self) {
        for rel in [
            JOB_FILE,
            COMMAND_FILE,
            TIMELINE_FILE,
            ACTIVITY_LOG_FILE,
            SNAPSHOT_FILE,
            TRANSCRIPT_FILE,
            RECORDER_STATUS_FILE,
            STOP_SIGNAL_FILE,
        ] {
            self.remove(rel);
        }
    }

    /// Prune leftover report artifacts (dispatcher/server startup).
    pub fn prune_reports_dir(&self, dir: &Path) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() {
                let _ = fs::remove_file(&path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CommandKind, Platform};
    use tempfile::TempDir;

    fn store() -> (TempDir, IpcStore) {
        let dir = TempDir::new().unwrap();
        let store = IpcStore::new(dir.path());
        (dir, store)
    }

    fn job() -> Job {
        Job {
            active: true,
            platform: Platform::Meet,
            meeting_url: "https://meet.google.com/abc-defg-hij".to_string(),
            meeting_id: None,
            passcode: None,
            bot_display_name: None,
            title: Some("Sprint".to_string()),
            user_id: Some("u1".to_string()),
            created_at: now_ts(),
        }
    }

    #[test]
    fn job_write_read_delete() {
        let (_dir, store) = store();
        assert!(store.read_job().is_none());
        store.write_job(&job()).unwrap();
        let read = store.read_job().unwrap();
        assert_eq!(read.platform, Platform::Meet);
        store.delete_job();
        assert!(store.read_job().is_none());
    }

    #[test]
    fn corrupt_document_reads_as_absent() {
        let (_dir, store) = store();
        fs::create_dir_all(store.path("data")).unwrap();
        fs::write(store.path(JOB_FILE), "{not json").unwrap();
        assert!(store.read_job().is_none());
    }

    #[test]
    fn pending_command_is_not_overwritten() {
        let (_dir, store) = store();
        let stop = BotCommand {
            command: CommandKind::Stop,
            issued_at: now_ts(),
            processed: false,
        };
        assert!(store.write_command(&stop).unwrap());
        let pause = BotCommand {
            command: CommandKind::Pause,
            issued_at: now_ts(),
            processed: false,
        };
        // Stop is still pending, pause must be refused.
        assert!(!store.write_command(&pause).unwrap());
        let pending = store.read_pending_command().unwrap();
        store.mark_command_processed(pending).unwrap();
        assert!(store.read_pending_command().is_none());
        // Processed commands may be replaced.
        assert!(store.write_command(&pause).unwrap());
    }

    #[test]
    fn timeline_dedups_consecutive_sets_and_stays_monotonic() {
        let (_dir, store) = store();
        let entry = |ts: f64, speakers: &[&str]| TimelineEntry {
            ts,
            time: "10:00:00".to_string(),
            speakers: speakers.iter().map(|s| s.to_string()).collect(),
        };
        assert!(store.append_timeline_if_changed(&entry(1.0, &["Ali"])).unwrap());
        assert!(!store.append_timeline_if_changed(&entry(2.0, &["Ali"])).unwrap());
        assert!(store
            .append_timeline_if_changed(&entry(3.0, &["Ali", "Veli"]))
            .unwrap());
        let lines = store.read_timeline();
        assert_eq!(lines.len(), 2);
        for pair in lines.windows(2) {
            assert!(pair[1].ts >= pair[0].ts);
            assert_ne!(pair[1].speakers, pair[0].speakers);
        }
    }

    #[test]
    fn worker_status_merge_preserves_untouched_fields() {
        let (_dir, store) = store();
        store
            .update_worker_status(|s| {
                s.platform = "zoom".to_string();
                s.running = true;
                s.status_message = "Toplantıya katılıyor...".to_string();
            })
            .unwrap();
        store.update_worker_status(|s| s.recording = true).unwrap();
        let status = store.read_worker_status().unwrap();
        assert!(status.running);
        assert!(status.recording);
        assert_eq!(status.platform, "zoom");
        assert_eq!(status.status_message, "Toplantıya katılıyor...");
    }

    #[test]
    fn clean_job_start_resets_streams() {
        let (_dir, store) = store();
        store.append_transcript("önceki toplantı").unwrap();
        store
            .append_activity(ActivityEntry {
                timestamp: 1.0,
                platform: "meet".to_string(),
                speakers: vec!["Ali".to_string()],
            })
            .unwrap();
        store.touch_stop_signal().unwrap();
        store.clean_job_start().unwrap();
        assert!(store.read_transcript().is_empty());
        assert!(store.read_activity().is_empty());
        assert!(!store.stop_signal_exists());
    }
}
