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

//! Transcription orchestration for one uploaded audio segment: diarization
//! hint resolution, prompt construction, retried LLM call, ghost-output
//! filtering, name canonicalization and deduplicated transcript append.

use anyhow::Result;
use lazy_static::lazy_static;
use regex::{Regex, RegexBuilder};
use tokio::time::{sleep, Duration};

use crate::gemini::{GeminiClient, GeminiError};
use crate::ipc::IpcStore;
use crate::types::{Platform, TimelineEntry};

/// Appended once when the daily quota dies mid-meeting, so the report can
/// note the interruption.
pub const QUOTA_SENTINEL: &str = "[TRANSKRIPSIYON KOTASI DOLDU]";

const MAX_ATTEMPTS: u32 = 5;
const RATE_LIMIT_BASE_DELAY_SECS: u64 = 30;
const DEDUP_TAIL_CHARS: usize = 15_000;

#[derive(Debug, Clone, PartialEq)]
pub enum DiarizationHint {
    /// `HH:MM:SS: name1, name2` lines relative to the segment start.
    TimelineSlice(String),
    SingleSpeaker(String),
    Participants(Vec<String>),
    None,
}

#[derive(Debug, Default)]
pub struct TranscribeOutcome {
    pub appended: bool,
    pub chars: usize,
    pub quota_exhausted: bool,
}

/// Resolve the best available diarization hint for a segment, in the order
/// the endpoint contract prescribes: timeline slice, explicit speaker name,
/// cached participant snapshot.
pub fn resolve_hint(
    store: &IpcStore,
    start_time: Option<f64>,
    duration: Option<f64>,
    speaker_name: Option<&str>,
) -> DiarizationHint {
    if let (Some(start), Some(dur)) = (start_time, duration) {
        let timeline = store.read_timeline();
        if let Some(slice) = format_timeline_slice(&timeline, start, dur) {
            return DiarizationHint::TimelineSlice(slice);
        }
    }
    if let Some(name) = speaker_name {
        let name = name.trim();
        if !name.is_empty() {
            return DiarizationHint::SingleSpeaker(name.to_string());
        }
    }
    if let Some(snapshot) = store.read_snapshot() {
        if !snapshot.participants.is_empty() {
            return DiarizationHint::Participants(snapshot.participants);
        }
    }
    DiarizationHint::None
}

/// Render the timeline entries that fall inside `[start, start+duration]`,
/// one line per speaker-set change, offsets relative to the segment start.
pub fn format_timeline_slice(
    timeline: &[TimelineEntry],
    start: f64,
    duration: f64,
) -> Option<String> {
    let end = start + duration;
    let mut lines = Vec::new();
    let mut prev_speakers: Option<&Vec<String>> = None;
    for entry in timeline {
        let changed = prev_speakers.map(|p| p != &entry.speakers).unwrap_or(true);
        if entry.ts >= start && entry.ts <= end && changed && !entry.speakers.is_empty() {
            let offset = (entry.ts - start).max(0.0) as u64;
            lines.push(format!(
                "{:02}:{:02}:{:02}: {}",
                offset / 3600,
                (offset % 3600) / 60,
                offset % 60,
                entry.speakers.join(", ")
            ));
        }
        prev_speakers = Some(&entry.speakers);
    }
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

/// Build the diarization prompt. Zoom/Teams hints come from explicit UI
/// signals and are declared authoritative; Meet's come largely from caption
/// heuristics, so the model may override them from the audio itself.
pub fn build_prompt(platform: Option<Platform>, hint: &DiarizationHint) -> String {
    let mut prompt = String::from(
        "Bu ses kaydını Türkçe olarak transkript et ve konuşmacı ayrımı (diarization) yap.\n\
         Kurallar:\n\
         - Her konuşma satırını 'İsim: metin' formatında yaz.\n\
         - Katılımcı listesindeki gerçek isimleri kullan; isimler mevcutken asla \
           'Konuşmacı 1' / 'Speaker N' gibi genel etiketler üretme.\n\
         - 'ııı', 'eee' gibi dolgu seslerini temizle.\n\
         - Konuşma yoksa sadece [NO SPEECH] yaz.\n",
    );

    let authoritative = !matches!(platform, Some(Platform::Meet));
    match hint {
        DiarizationHint::TimelineSlice(slice) => {
            if authoritative {
                prompt.push_str(
                    "\nAşağıdaki zaman çizelgesi KESİN veridir; konuşmaları bu çizelgeye göre \
                     kişilere ata:\n",
                );
            } else {
                prompt.push_str(
                    "\nAşağıdaki zaman çizelgesi yalnızca REFERANSTIR; ses analizinle çelişirse \
                     ses analizini tercih et:\n",
                );
            }
            prompt.push_str(slice);
            prompt.push('\n');
        }
        DiarizationHint::SingleSpeaker(name) => {
            if authoritative {
                prompt.push_str(&format!(
                    "\nBu segmentte konuşan kişi: {name}. Konuşmaları bu kişiye ata.\n"
                ));
            } else {
                prompt.push_str(&format!(
                    "\nBu segmentte büyük olasılıkla konuşan kişi: {name} (referans).\n"
                ));
            }
        }
        DiarizationHint::Participants(names) => {
            prompt.push_str(&format!(
                "\nToplantı katılımcıları: {}.\n",
                names.join(", ")
            ));
        }
        DiarizationHint::None => {}
    }
    prompt
}

/// Up to five attempts. 429 backs off exponentially from 30 s; a recognized
/// daily-quota error aborts immediately with the sentinel text.
pub async fn transcribe_with_retry(
    gemini: &GeminiClient,
    audio: &[u8],
    mime_type: &str,
    prompt: &str,
) -> Result<String, GeminiError> {
    let mut rate_limit_delay = RATE_LIMIT_BASE_DELAY_SECS;
    let mut last_error = GeminiError::Api("no attempts made".to_string());

    for attempt in 1..=MAX_ATTEMPTS {
        match gemini.transcribe_audio(audio, mime_type, prompt).await {
            Ok(text) => return Ok(text),
            Err(GeminiError::QuotaExhausted) => {
                tracing::error!("Daily transcription quota exhausted, giving up");
                return Err(GeminiError::QuotaExhausted);
            }
            Err(GeminiError::RateLimited) => {
                tracing::warn!(
                    "Rate limited (attempt {}/{}), retrying in {}s",
                    attempt,
                    MAX_ATTEMPTS,
                    rate_limit_delay
                );
                if attempt < MAX_ATTEMPTS {
                    sleep(Duration::from_secs(rate_limit_delay)).await;
                }
                rate_limit_delay *= 2;
                last_error = GeminiError::RateLimited;
            }
            Err(e) => {
                tracing::warn!("Transcription attempt {}/{} failed: {}", attempt, MAX_ATTEMPTS, e);
                if attempt < MAX_ATTEMPTS {
                    sleep(Duration::from_secs(5)).await;
                }
                last_error = e;
            }
        }
    }
    Err(last_error)
}

lazy_static! {
    static ref GHOST_RE: Regex = RegexBuilder::new(
        r"\[\s*(?:silence|music|noise|empty|no\s*speech|sessizlik|müzik|gürültü)\s*\]"
    )
    .case_insensitive(true)
    .build()
    .unwrap();
}

/// Strip bracketed pseudo-outputs. Anything shorter than two characters
/// afterwards is treated as an empty (but successful) transcription.
pub fn strip_ghost_output(text: &str) -> String {
    let cleaned = GHOST_RE.replace_all(text, "");
    let cleaned = cleaned.trim();
    if cleaned.chars().count() < 2 {
        String::new()
    } else {
        cleaned.to_string()
    }
}

/// Replace whole-word, case-insensitive occurrences of each participant name
/// with its canonical cased form.
pub fn canonicalize_names(text: &str, participants: &[String]) -> String {
    let mut result = text.to_string();
    for name in participants {
        let name = name.trim();
        if name.len() < 2 {
            continue;
        }
        let pattern = format!(r"\b{}\b", regex::escape(name));
        let Ok(re) = RegexBuilder::new(&pattern).case_insensitive(true).build() else {
            continue;
        };
        result = re.replace_all(&result, name).to_string();
    }
    result
}

fn normalize(text: &str) -> String {
    text.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

fn tail_chars(text: &str, n: usize) -> &str {
    let count = text.chars().count();
    if count <= n {
        return text;
    }
    let skip = count - n;
    match text.char_indices().nth(skip) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

fn first_half(text: &str) -> &str {
    let count = text.chars().count();
    match text.char_indices().nth(count / 2) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Append `incoming` to the transcript cache unless the anti-duplication
/// policy rejects it. Returns whether an append happened.
///
/// Policy, against the normalized last 15 000 characters of the cache:
/// - incoming longer than 30 chars and fully contained in the tail → skip;
/// - incoming longer than 100 chars whose first half is contained → skip;
/// - otherwise append with a blank-line separator.
pub fn append_with_dedup(store: &IpcStore, incoming: &str) -> Result<bool> {
    let incoming = incoming.trim();
    if incoming.is_empty() {
        return Ok(false);
    }

    let existing = store.read_transcript();
    let tail = normalize(tail_chars(&existing, DEDUP_TAIL_CHARS));
    let norm_incoming = normalize(incoming);

    if norm_incoming.chars().count() > 30 && tail.contains(&norm_incoming) {
        tracing::info!("Duplicate transcript chunk skipped ({} chars)", incoming.len());
        return Ok(false);
    }
    if norm_incoming.chars().count() > 100 && tail.contains(first_half(&norm_incoming)) {
        tracing::info!("Half-duplicate transcript chunk skipped ({} chars)", incoming.len());
        return Ok(false);
    }

    if existing.trim().is_empty() {
        store.append_transcript(incoming)?;
    } else {
        store.append_transcript(&format!("\n\n{}", incoming))?;
    }
    Ok(true)
}

/// Full pipeline for one uploaded segment.
pub async fn process_segment(
    store: &IpcStore,
    gemini: Option<&GeminiClient>,
    audio: &[u8],
    mime_type: &str,
    start_time: Option<f64>,
    duration: Option<f64>,
    speaker_name: Option<&str>,
    platform: Option<Platform>,
) -> Result<TranscribeOutcome> {
    let Some(gemini) = gemini else {
        tracing::warn!("Transcription disabled (no API key), segment dropped");
        return Ok(TranscribeOutcome::default());
    };

    let hint = resolve_hint(store, start_time, duration, speaker_name);
    let prompt = build_prompt(platform, &hint);

    let raw = match transcribe_with_retry(gemini, audio, mime_type, &prompt).await {
        Ok(text) => text,
        Err(GeminiError::QuotaExhausted) => {
            if !store.read_transcript().contains(QUOTA_SENTINEL) {
                append_with_dedup(store, QUOTA_SENTINEL)?;
            }
            return Ok(TranscribeOutcome {
                appended: false,
                chars: 0,
                quota_exhausted: true,
            });
        }
        Err(e) => return Err(e.into()),
    };

    let cleaned = strip_ghost_output(&raw);
    if cleaned.is_empty() {
        return Ok(TranscribeOutcome::default());
    }

    let participants = store
        .read_snapshot()
        .map(|s| s.participants)
        .unwrap_or_default();
    let canonical = canonicalize_names(&cleaned, &participants);

    let appended = append_with_dedup(store, &canonical)?;
    Ok(TranscribeOutcome {
        appended,
        chars: canonical.chars().count(),
        quota_exhausted: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(ts: f64, speakers: &[&str]) -> TimelineEntry {
        TimelineEntry {
            ts,
            time: "00:00:00".to_string(),
            speakers: speakers.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn timeline_slice_formats_relative_offsets() {
        let timeline = vec![
            entry(100.0, &["Ali"]),
            entry(150.0, &["Veli"]),
            entry(500.0, &["Ayşe"]),
        ];
        let slice = format_timeline_slice(&timeline, 90.0, 300.0).unwrap();
        assert_eq!(slice, "00:00:10: Ali\n00:01:00: Veli");
    }

    #[test]
    fn timeline_slice_skips_unchanged_sets() {
        let timeline = vec![entry(10.0, &["Ali"]), entry(20.0, &["Ali"])];
        let slice = format_timeline_slice(&timeline, 0.0, 100.0).unwrap();
        assert_eq!(slice.lines().count(), 1);
    }

    #[test]
    fn ghost_outputs_are_stripped() {
        assert_eq!(strip_ghost_output("[silence]"), "");
        assert_eq!(strip_ghost_output("[MUSIC] [noise]"), "");
        assert_eq!(strip_ghost_output(" [no speech] "), "");
        assert_eq!(strip_ghost_output("[silence] Ali: merhaba"), "Ali: merhaba");
        assert_eq!(strip_ghost_output("a"), "");
    }

    #[test]
    fn names_are_canonicalized_whole_word() {
        let participants = vec!["Yusuf Batkitar".to_string()];
        let text = "yusuf batkitar: merhaba. yusufcuk geldi.";
        let fixed = canonicalize_names(text, &participants);
        assert!(fixed.starts_with("Yusuf Batkitar: merhaba."));
        // Partial word untouched
        assert!(fixed.contains("yusufcuk"));
    }

    #[test]
    fn name_filter_is_idempotent() {
        let participants = vec!["Ayşe Yılmaz".to_string()];
        let once = canonicalize_names("ayşe yılmaz konuştu", &participants);
        let twice = canonicalize_names(&once, &participants);
        assert_eq!(once, twice);
    }

    #[test]
    fn dedup_skips_contained_chunk() {
        let dir = TempDir::new().unwrap();
        let store = IpcStore::new(dir.path());
        let chunk = "Ali: bugün sprint planlamasını konuşacağız arkadaşlar";
        assert!(append_with_dedup(&store, chunk).unwrap());
        // Exact duplicate, longer than 30 chars -> skipped
        assert!(!append_with_dedup(&store, chunk).unwrap());
        // Different casing and spacing still counts as duplicate
        assert!(!append_with_dedup(&store, &chunk.to_uppercase()).unwrap());
        assert_eq!(store.read_transcript().matches("sprint").count(), 1);
    }

    #[test]
    fn dedup_skips_half_duplicate() {
        let dir = TempDir::new().unwrap();
        let store = IpcStore::new(dir.path());
        let first: String = "Veli: dün yaptıklarımızı özetliyorum. ".repeat(4);
        assert!(append_with_dedup(&store, &first).unwrap());
        // New chunk repeats the old text as its first half
        let second = format!("{} Yeni kısım burada devam ediyor tamamen farklı.", first.trim());
        assert!(!append_with_dedup(&store, &second).unwrap());
    }

    #[test]
    fn short_chunks_always_append() {
        let dir = TempDir::new().unwrap();
        let store = IpcStore::new(dir.path());
        assert!(append_with_dedup(&store, "Evet.").unwrap());
        assert!(append_with_dedup(&store, "Evet.").unwrap());
        let body = store.read_transcript();
        assert_eq!(body.matches("Evet.").count(), 2);
        assert!(body.contains("\n\n"));
    }

    #[test]
    fn hint_priority_order() {
        let dir = TempDir::new().unwrap();
        let store = IpcStore::new(dir.path());
        // Nothing available
        assert_eq!(resolve_hint(&store, None, None, None), DiarizationHint::None);
        // Speaker name wins over nothing
        assert_eq!(
            resolve_hint(&store, None, None, Some("Ali")),
            DiarizationHint::SingleSpeaker("Ali".to_string())
        );
        // Timeline wins over speaker name
        store
            .append_timeline_if_changed(&entry(10.0, &["Veli"]))
            .unwrap();
        match resolve_hint(&store, Some(0.0), Some(60.0), Some("Ali")) {
            DiarizationHint::TimelineSlice(s) => assert!(s.contains("Veli")),
            other => panic!("expected timeline slice, got {:?}", other),
        }
    }

    #[test]
    fn meet_prompt_declares_hint_as_reference() {
        let hint = DiarizationHint::SingleSpeaker("Ali".to_string());
        let meet = build_prompt(Some(Platform::Meet), &hint);
        let zoom = build_prompt(Some(Platform::Zoom), &hint);
        assert!(meet.contains("referans") || meet.contains("REFERANS"));
        assert!(!zoom.contains("referans"));
    }
}
