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

//! Report builder: per-speaker statistics from the activity log, transcript
//! line analysis, LLM report synthesis, printable HTML shell, artifact upload
//! and the meetings-table row.

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::config::Config;
use crate::gemini::GeminiClient;
use crate::ipc::IpcStore;
use crate::storage::{SupabaseClient, REPORTS_BUCKET, TRANSCRIPTS_BUCKET};
use crate::types::ActivityEntry;

/// Labels that show up in the participant sources but are not humans: the bot
/// itself, UI glyph strings and platform chrome.
const EXCLUDED_LABELS: &[&str] = &[
    "frame",
    "pen_spark",
    "pen_spark_io",
    "spark_io",
    "sesly bot",
    "sesly",
    "toplantı botu",
    "meeting bot",
    "localhost",
    "panel",
    "bot panel",
    "sesly asistan",
    "google meet",
    "zoom",
    "meet",
    "katılım isteği",
    "join request",
];

/// Gaps longer than this between two activity entries are not credited as
/// speaking time (detection pauses would otherwise inflate totals).
const MAX_CREDIT_GAP_SECS: f64 = 10.0;

/// Drop non-human labels from a participant list. Applying the filter twice
/// yields the same result as once.
pub fn filter_participants(names: &[String]) -> Vec<String> {
    names
        .iter()
        .filter(|name| {
            let lower = name.to_lowercase();
            let lower = lower.trim();
            !lower.is_empty() && !EXCLUDED_LABELS.iter().any(|ex| lower.contains(ex))
        })
        .cloned()
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpeakerStat {
    pub total_seconds: f64,
    pub turn_count: usize,
    pub percentage: u32,
}

#[derive(Debug, Default)]
pub struct SpeakerStatistics {
    pub per_speaker: BTreeMap<String, SpeakerStat>,
    pub meeting_duration_secs: f64,
}

/// Credit speaking time from the raw activity log: for each consecutive pair
/// the interval (clipped to 0..=10 s) goes to every speaker of the earlier
/// entry; a turn starts when a speaker appears who was absent in the previous
/// entry.
pub fn compute_statistics(entries: &[ActivityEntry]) -> SpeakerStatistics {
    let mut sorted: Vec<&ActivityEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.timestamp.partial_cmp(&b.timestamp).unwrap_or(std::cmp::Ordering::Equal));

    let mut stats = SpeakerStatistics::default();
    if sorted.is_empty() {
        return stats;
    }
    stats.meeting_duration_secs =
        (sorted.last().unwrap().timestamp - sorted[0].timestamp).max(0.0);

    for i in 0..sorted.len().saturating_sub(1) {
        let delta = (sorted[i + 1].timestamp - sorted[i].timestamp).clamp(0.0, MAX_CREDIT_GAP_SECS);
        let prev_speakers: &[String] = if i > 0 { &sorted[i - 1].speakers } else { &[] };
        for speaker in &sorted[i].speakers {
            let entry = stats.per_speaker.entry(speaker.clone()).or_default();
            entry.total_seconds += delta;
            if !prev_speakers.contains(speaker) {
                entry.turn_count += 1;
            }
        }
    }
    // Speakers only present in the final entry still get their turn counted.
    if let Some(last) = sorted.last() {
        let prev: &[String] = if sorted.len() > 1 {
            &sorted[sorted.len() - 2].speakers
        } else {
            &[]
        };
        for speaker in &last.speakers {
            let entry = stats.per_speaker.entry(speaker.clone()).or_default();
            if !prev.contains(speaker) {
                entry.turn_count += 1;
            }
        }
    }

    if stats.meeting_duration_secs > 0.0 {
        for stat in stats.per_speaker.values_mut() {
            stat.percentage =
                ((stat.total_seconds / stats.meeting_duration_secs) * 100.0).round() as u32;
        }
    }
    stats
}

pub fn format_duration(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    format!("{}m {}s", total / 60, total % 60)
}

lazy_static! {
    static ref SPEAKER_LINE_RE: Regex = Regex::new(r"^([^:]{2,50}):\s*(.+)$").unwrap();
}

#[derive(Debug, Default)]
pub struct TranscriptAnalysis {
    pub speaker_turns: BTreeMap<String, usize>,
    pub speaker_words: BTreeMap<String, usize>,
    pub identified: Vec<String>,
    pub unknown: Vec<String>,
}

/// Pull `Name: text` lines out of the transcript and cross-validate the names
/// against the participant list.
pub fn analyze_transcript(transcript: &str, participants: &[String]) -> TranscriptAnalysis {
    let mut analysis = TranscriptAnalysis::default();
    for line in transcript.lines() {
        let line = line.trim();
        if line.len() < 5 {
            continue;
        }
        let Some(caps) = SPEAKER_LINE_RE.captures(line) else {
            continue;
        };
        let speaker = caps[1].trim().to_string();
        let words = caps[2].split_whitespace().count();

        *analysis.speaker_turns.entry(speaker.clone()).or_default() += 1;
        *analysis.speaker_words.entry(speaker.clone()).or_default() += words;

        if participants.iter().any(|p| p == &speaker) {
            if !analysis.identified.contains(&speaker) {
                analysis.identified.push(speaker);
            }
        } else if !speaker.contains("Konuşmacı")
            && !speaker.contains("Speaker")
            && !analysis.unknown.contains(&speaker)
        {
            analysis.unknown.push(speaker);
        }
    }
    analysis
}

/// The LLM prompt: a fixed HTML scaffold with numbered sections the model
/// fills in, plus the measured speaker durations as hard data.
fn build_report_prompt(
    transcript: &str,
    title: Option<&str>,
    stats: &SpeakerStatistics,
) -> String {
    let heading = title.unwrap_or("PROJE TOPLANTI ANALİZ RAPORU");

    let mut stats_context = String::new();
    if !stats.per_speaker.is_empty() {
        stats_context.push_str("\n**TESPİT EDİLEN KONUŞMACI SÜRELERİ (KESİN VERİ):**\n");
        stats_context.push_str(&format!(
            "- Toplam Toplantı Süresi: {}\n",
            format_duration(stats.meeting_duration_secs)
        ));
        let mut ranked: Vec<_> = stats.per_speaker.iter().collect();
        ranked.sort_by(|a, b| {
            b.1.total_seconds
                .partial_cmp(&a.1.total_seconds)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for (speaker, stat) in ranked {
            stats_context.push_str(&format!(
                "- {}: {} (%{}), {} kez konuştu\n",
                speaker,
                format_duration(stat.total_seconds),
                stat.percentage,
                stat.turn_count
            ));
        }
    }

    let clipped: String = transcript.chars().take(20_000).collect();

    format!(
        r#"SEN: Profesyonel bir toplantı analisti ve formatlama uzmanısın. Aşağıdaki transkriptten detaylı bir rapor hazırla ve çıktıyı A4 basımına uygun HTML olarak ver. Sadece HTML döndür, asla Markdown veya düz metin kullanma.

<h1>{heading}</h1>

<h2>1. TOPLANTI ÖZETİ (ANA FİKİR)</h2>
<p>Toplantının ana konusunu, tartışılan en önemli 3 noktayı ve nihai sonuçları özetle.</p>

<h2>2. SUNULAN FİKİRLER, KARARLAR VE DURUM ANALİZİ</h2>
<table border='1' cellpadding='8' cellspacing='0' width='100%'>
    <tr><th>Fikri Sunan</th><th>Fikir Detayı</th><th>Durum (Kabul/Red/Tartışıldı)</th></tr>
</table>

<h2>3. AKSİYON MADDELERİ (YAPILACAKLAR)</h2>
<table border='1' cellpadding='8' cellspacing='0' width='100%'>
    <tr><th>Sorumlu Kişi</th><th>Görev Tanımı</th><th>Son Tarih/Durum</th></tr>
</table>

<h2>4. KATILIM KALİTESİ ANALİZİ</h2>
<table border='1' cellpadding='8' cellspacing='0' width='100%'>
    <tr><th>Katılımcı</th><th>Sunduğu Fikir Sayısı</th><th>Aldığı Karar/Görev</th><th>Sorduğu Soru</th><th>Katkı Notu</th></tr>
</table>
{stats_context}
**TRANSKRİPT:**
{clipped}

**ÖNEMLİ TALİMATLAR:**
- Çıktıyı sadece HTML olarak ver, markdown kullanma.
- Tüm tabloları doldur; bir bölüm için bilgi yoksa "Transkriptte bu konuda bilgi bulunamadı" yaz.
- Konuşmacı süre verilerini kullanarak fikir ve aksiyonları doğru kişilere atfet.
- Katkı Notu: Yüksek / Orta / Düşük.
- Türkçe karakter kullan."#
    )
}

lazy_static! {
    static ref FENCE_OPEN_RE: Regex = Regex::new(r"(?m)^```html\s*").unwrap();
    static ref FENCE_RE: Regex = Regex::new(r"(?m)^```\s*$").unwrap();
}

/// Remove Markdown code fences the LLM sometimes wraps its HTML in.
pub fn strip_html_fences(text: &str) -> String {
    let text = FENCE_OPEN_RE.replace_all(text, "");
    let text = FENCE_RE.replace_all(&text, "");
    text.trim().to_string()
}

/// Wrap the generated body in the fixed printable shell (corporate white
/// theme, header date, footer).
pub fn wrap_html_shell(body: &str, title: Option<&str>) -> String {
    let report_date = chrono::Local::now().format("%d.%m.%Y %H:%M:%S");
    let header_title = title.unwrap_or("PROJE TOPLANTI ANALİZ RAPORU");
    format!(
        r#"<!DOCTYPE html>
<html lang="tr">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Toplantı Raporu - {report_date}</title>
    <link href="https://fonts.googleapis.com/css2?family=Inter:wght@400;500;600;700&display=swap" rel="stylesheet">
    <style>
        * {{ margin: 0; padding: 0; box-sizing: border-box; }}
        body {{
            font-family: 'Inter', -apple-system, BlinkMacSystemFont, 'Segoe UI', sans-serif;
            line-height: 1.7; background: #f8fafc; min-height: 100vh;
            color: #1e293b; padding: 40px 20px;
        }}
        .container {{
            max-width: 900px; margin: 0 auto; background: white;
            border-radius: 16px; box-shadow: 0 4px 24px rgba(0, 0, 0, 0.06); overflow: hidden;
        }}
        .header {{
            text-align: center; padding: 40px 30px 35px;
            background: linear-gradient(135deg, #4f46e5 0%, #6366f1 100%); color: white;
        }}
        .header-date {{
            font-size: 12px; color: rgba(255, 255, 255, 0.8); margin-bottom: 12px;
            text-transform: uppercase; letter-spacing: 2px; font-weight: 500;
        }}
        .header h1 {{ font-size: 26px; font-weight: 700; color: white; margin: 0; }}
        .content {{ padding: 40px; }}
        h2 {{
            font-size: 16px; font-weight: 600; color: #1e293b; padding: 12px 16px;
            margin: 32px 0 18px 0; background: linear-gradient(90deg, #f1f5f9, #fff);
            border-left: 4px solid #4f46e5; border-radius: 0 8px 8px 0;
        }}
        h2:first-child {{ margin-top: 0; }}
        p {{ font-size: 14px; color: #475569; margin-bottom: 16px; }}
        ul, ol {{ margin: 12px 0 16px 24px; color: #475569; }}
        li {{ margin-bottom: 8px; font-size: 14px; }}
        table {{
            width: 100%; border-collapse: collapse; margin: 20px 0; font-size: 14px;
            border: 1px solid #e2e8f0; border-radius: 8px; overflow: hidden;
        }}
        th {{
            background: #1e3a5f !important; color: #ffffff !important; padding: 14px 16px;
            text-align: left; font-weight: 600; font-size: 13px; border: none !important;
        }}
        td {{
            padding: 12px 16px; border-bottom: 1px solid #e2e8f0;
            color: #334155 !important; background: white !important;
        }}
        tr:last-child td {{ border-bottom: none; }}
        tr:nth-child(even) td {{ background: #f8fafc !important; }}
        .footer {{
            text-align: center; padding: 24px 40px; background: #f8fafc;
            border-top: 1px solid #e2e8f0;
        }}
        .footer p {{ font-size: 12px; color: #64748b; margin: 0; }}
        .footer strong {{ color: #4f46e5; }}
        @media print {{
            body {{ background: white; padding: 0; }}
            .container {{ box-shadow: none; border-radius: 0; }}
        }}
    </style>
</head>
<body>
    <div class="container">
        <div class="header">
            <div class="header-date">Oluşturulma Tarihi: {report_date}</div>
            <h1>{header_title}</h1>
        </div>
        <div class="content">
            {body}
        </div>
        <div class="footer">
            <p>Bu rapor <strong>Sesly Bot</strong> tarafından otomatik olarak oluşturulmuştur.</p>
        </div>
    </div>
</body>
</html>
"#
    )
}

fn fallback_report_body(participants: &[String], stats: &SpeakerStatistics, note: &str) -> String {
    let participants_str = if participants.is_empty() {
        "Bilinmiyor".to_string()
    } else {
        participants.join(", ")
    };
    format!(
        "<h1>TOPLANTI RAPORU</h1>\n\
         <h2>1. Özet</h2>\n<p>Toplantı kaydı alındı. {} katılımcı tespit edildi.</p>\n\
         <h2>2. Katılımcılar</h2>\n<p>{}</p>\n\
         <h2>3. Konuşmacı İstatistikleri</h2>\n<p>Toplam konuşmacı: {}</p>\n\
         <h2>4. Not</h2>\n<p>{}</p>",
        participants.len(),
        participants_str,
        stats.per_speaker.len(),
        note
    )
}

#[derive(Debug)]
pub struct ReportOutcome {
    pub html_path: PathBuf,
    pub report_url: Option<String>,
    pub transcript_url: Option<String>,
}

/// Build the report end-to-end: statistics, LLM synthesis (with fallback),
/// HTML artifact, uploads and the meetings-table row. Upload or insert
/// failures are logged and leave the local artifact in place.
pub async fn run(config: &Config, store: &IpcStore) -> Result<ReportOutcome> {
    let transcript = store.read_transcript();
    let job = store.read_job();
    let title = job.as_ref().and_then(|j| j.title.clone());

    let participants = filter_participants(
        &store
            .read_snapshot()
            .map(|s| s.participants)
            .unwrap_or_default(),
    );
    let activity = store.read_activity();
    let stats = compute_statistics(&activity);
    let analysis = analyze_transcript(&transcript, &participants);
    tracing::info!(
        "Rapor girdisi: {} karakter transkript, {} katılımcı, {} konuşmacı ({} tanımlı)",
        transcript.len(),
        participants.len(),
        stats.per_speaker.len(),
        analysis.identified.len()
    );

    let body = if transcript.trim().is_empty() {
        fallback_report_body(
            &participants,
            &stats,
            "Transkript oluşturulamadı (ses kaydı boş veya konuşma tespit edilemedi).",
        )
    } else {
        match &config.gemini {
            Some(gemini_cfg) => {
                let gemini = GeminiClient::new(gemini_cfg.clone());
                let prompt = build_report_prompt(&transcript, title.as_deref(), &stats);
                match gemini.generate_text(&prompt).await {
                    Ok(raw) => strip_html_fences(&raw),
                    Err(e) => {
                        tracing::error!("Rapor üretimi başarısız: {}", e);
                        fallback_report_body(
                            &participants,
                            &stats,
                            &format!("Detaylı analiz yapılamadı. Hata: {e}"),
                        )
                    }
                }
            }
            None => fallback_report_body(
                &participants,
                &stats,
                "Detaylı analiz için GEMINI_API_KEY gerekli.",
            ),
        }
    };

    let html = wrap_html_shell(&body, title.as_deref());

    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let uuid_full = uuid::Uuid::new_v4().simple().to_string();
    let unique = &uuid_full[..8];
    std::fs::create_dir_all(&config.reports_dir).context("Failed to create temp_reports")?;
    let html_path = config
        .reports_dir
        .join(format!("Toplanti_Raporu_{timestamp}_{unique}.html"));
    std::fs::write(&html_path, &html)
        .with_context(|| format!("Failed to write {:?}", html_path))?;
    tracing::info!("HTML raporu kaydedildi: {:?}", html_path);

    let mut report_url = None;
    let mut transcript_url = None;

    if let Some(supabase_cfg) = &config.supabase {
        let supabase = SupabaseClient::new(supabase_cfg.clone());

        match supabase.upload_file(REPORTS_BUCKET, &html_path).await {
            Ok(url) => report_url = Some(url),
            Err(e) => tracing::warn!("Rapor upload hatası: {}", e),
        }

        if !transcript.trim().is_empty() {
            let t_path = config
                .reports_dir
                .join(format!("transcript_{timestamp}_{unique}.txt"));
            if std::fs::write(&t_path, &transcript).is_ok() {
                match supabase.upload_file(TRANSCRIPTS_BUCKET, &t_path).await {
                    Ok(url) => transcript_url = Some(url),
                    Err(e) => tracing::warn!("Transkript upload hatası: {}", e),
                }
            }
        }

        let user_id = job.as_ref().and_then(|j| j.user_id.clone());
        match user_id {
            Some(user_id) if !user_id.is_empty() => {
                let duration = if stats.meeting_duration_secs > 0.0 {
                    format!("{} dk", (stats.meeting_duration_secs / 60.0).ceil() as u64)
                } else {
                    let est = (transcript.len() / 1000).max(1);
                    format!("{est} dk")
                };
                let platform = job
                    .as_ref()
                    .map(|j| j.platform.to_string())
                    .unwrap_or_else(|| "zoom".to_string());
                let result = supabase
                    .save_meeting_record(
                        &user_id,
                        title.as_deref().unwrap_or("İsimsiz Toplantı"),
                        &platform,
                        &chrono::Utc::now().to_rfc3339(),
                        &duration,
                        transcript_url.as_deref(),
                        report_url.as_deref(),
                        "Otomatik oluşturulan toplantı raporu.",
                    )
                    .await;
                if let Err(e) = result {
                    tracing::warn!("Veritabanı kaydı başarısız: {}", e);
                }
            }
            _ => tracing::info!("user_id yok (misafir mod), DB kaydı atlanıyor"),
        }
    }

    Ok(ReportOutcome {
        html_path,
        report_url,
        transcript_url,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ts: f64, speakers: &[&str]) -> ActivityEntry {
        ActivityEntry {
            timestamp: ts,
            platform: "zoom".to_string(),
            speakers: speakers.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn excluded_labels_are_filtered_idempotently() {
        let names = vec![
            "Yusuf Batkitar".to_string(),
            "Sesly Bot".to_string(),
            "frame".to_string(),
            "pen_spark".to_string(),
            "Ayşe".to_string(),
            "localhost:9000".to_string(),
        ];
        let once = filter_participants(&names);
        assert_eq!(once, vec!["Yusuf Batkitar".to_string(), "Ayşe".to_string()]);
        let twice = filter_participants(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn statistics_clip_long_gaps() {
        // Ali speaks at t=0, next observation 60s later: only 10s credited.
        let entries = vec![entry(0.0, &["Ali"]), entry(60.0, &["Veli"])];
        let stats = compute_statistics(&entries);
        let ali = &stats.per_speaker["Ali"];
        assert!((ali.total_seconds - 10.0).abs() < f64::EPSILON);
        assert_eq!(ali.turn_count, 1);
    }

    #[test]
    fn turn_counts_need_absence_in_previous_entry() {
        let entries = vec![
            entry(0.0, &["Ali"]),
            entry(2.0, &["Ali"]),
            entry(4.0, &["Ali", "Veli"]),
            entry(6.0, &["Veli"]),
            entry(8.0, &["Ali"]),
        ];
        let stats = compute_statistics(&entries);
        assert_eq!(stats.per_speaker["Ali"].turn_count, 2); // t=0 and t=8
        assert_eq!(stats.per_speaker["Veli"].turn_count, 1); // t=4
    }

    #[test]
    fn percentages_relate_to_meeting_duration() {
        let entries = vec![
            entry(0.0, &["Ali"]),
            entry(5.0, &["Ali"]),
            entry(10.0, &[]),
            entry(20.0, &[]),
        ];
        let stats = compute_statistics(&entries);
        assert!((stats.meeting_duration_secs - 20.0).abs() < f64::EPSILON);
        assert_eq!(stats.per_speaker["Ali"].percentage, 50);
    }

    #[test]
    fn transcript_analysis_cross_validates_names() {
        let participants = vec!["Ali Kaya".to_string()];
        let transcript = "Ali Kaya: merhaba herkese bugün sprint var\nGizemli Kişi: ben kimim\nKonuşmacı 1: genel etiket\n";
        let analysis = analyze_transcript(transcript, &participants);
        assert_eq!(analysis.identified, vec!["Ali Kaya".to_string()]);
        assert_eq!(analysis.unknown, vec!["Gizemli Kişi".to_string()]);
        assert_eq!(analysis.speaker_words["Ali Kaya"], 5);
    }

    #[test]
    fn fences_are_stripped() {
        let input = "```html\n<h1>Rapor</h1>\n```";
        assert_eq!(strip_html_fences(input), "<h1>Rapor</h1>");
    }

    #[test]
    fn shell_contains_numbered_sections_when_body_does() {
        let body = "<h2>1. TOPLANTI ÖZETİ</h2><h2>2. FİKİRLER</h2><h2>3. AKSİYON</h2><h2>4. KATILIM</h2>";
        let html = wrap_html_shell(body, Some("Sprint"));
        assert!(html.contains("charset=\"UTF-8\""));
        assert!(html.contains("Sprint"));
        for n in 1..=4 {
            assert!(html.contains(&format!("{n}.")));
        }
        assert!(html.contains("Sesly Bot"));
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration(0.0), "0m 0s");
        assert_eq!(format_duration(75.0), "1m 15s");
        assert_eq!(format_duration(-5.0), "0m 0s");
    }
}
