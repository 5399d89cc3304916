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

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Meeting platform a job targets. Serialized lowercase in every IPC document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Zoom,
    Teams,
    Meet,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Zoom => write!(f, "zoom"),
            Platform::Teams => write!(f, "teams"),
            Platform::Meet => write!(f, "meet"),
        }
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "zoom" => Ok(Platform::Zoom),
            "teams" => Ok(Platform::Teams),
            "meet" | "google_meet" | "googlemeet" => Ok(Platform::Meet),
            other => Err(format!("unknown platform: {other}")),
        }
    }
}

/// Singleton job document (`data/bot_task.json`). Created by the API,
/// consumed by the Dispatcher, deleted by the Worker on completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub active: bool,
    pub platform: Platform,
    pub meeting_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meeting_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passcode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub created_at: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Pause,
    Resume,
    Stop,
    ForceReset,
    Summary,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::Pause => write!(f, "pause"),
            CommandKind::Resume => write!(f, "resume"),
            CommandKind::Stop => write!(f, "stop"),
            CommandKind::ForceReset => write!(f, "force_reset"),
            CommandKind::Summary => write!(f, "summary"),
        }
    }
}

/// Singleton command document (`data/bot_command.json`). A consumer that acts
/// on a command sets `processed: true`; writers never overwrite a pending one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotCommand {
    pub command: CommandKind,
    pub issued_at: f64,
    #[serde(default)]
    pub processed: bool,
}

/// Worker heartbeat document (`data/worker_status.json`). Merge-updated: the
/// writer overlays changed fields onto whatever is on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerStatus {
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub recording: bool,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub status_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub timestamp: f64,
}

/// One line of `speaker_timeline.jsonl`. Appended only when the speaker set
/// differs from the previous entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub ts: f64,
    /// Wall-clock `HH:MM:SS`, kept for human inspection of the log.
    pub time: String,
    pub speakers: Vec<String>,
}

/// One element of the `speaker_activity_log.json` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub timestamp: f64,
    pub platform: String,
    pub speakers: Vec<String>,
}

/// Last-writer-wins snapshot (`current_meeting_participants.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantSnapshot {
    pub platform: String,
    pub participants: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_speakers: Option<Vec<String>>,
    #[serde(default)]
    pub timestamp: f64,
}

/// Written once by the recorder at completion (`recorder_status.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderStatus {
    pub success: bool,
    pub segments_sent: usize,
    pub segments_skipped: usize,
    pub timestamp: f64,
}

/// How a meeting ended, as observed by a meeting client.
#[derive(Debug, Clone, PartialEq)]
pub enum EndReason {
    /// Host ended it, everyone left, alone timeout, and similar clean exits.
    Normal,
    /// Invalid or expired link; carries the user-facing diagnostic string.
    Invalid(String),
}

impl EndReason {
    pub fn is_normal(&self) -> bool {
        matches!(self, EndReason::Normal)
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            EndReason::Normal => None,
            EndReason::Invalid(msg) => Some(msg),
        }
    }
}

pub fn now_ts() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub fn clock_hms() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_roundtrip() {
        for (s, p) in [
            ("zoom", Platform::Zoom),
            ("teams", Platform::Teams),
            ("meet", Platform::Meet),
        ] {
            assert_eq!(s.parse::<Platform>().unwrap(), p);
            assert_eq!(p.to_string(), s);
            let json = serde_json::to_string(&p).unwrap();
            assert_eq!(json, format!("\"{s}\""));
        }
        assert!("webex".parse::<Platform>().is_err());
    }

    #[test]
    fn command_kind_serializes_snake_case() {
        let cmd = BotCommand {
            command: CommandKind::ForceReset,
            issued_at: 1.0,
            processed: false,
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"force_reset\""));
    }

    #[test]
    fn worker_status_tolerates_missing_fields() {
        let status: WorkerStatus = serde_json::from_str("{\"running\": true}").unwrap();
        assert!(status.running);
        assert!(!status.recording);
        assert!(status.error.is_none());
    }
}
