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

//! Google Meet adapter. Meet has no internal roster channel, so speaker
//! detection leans on live captions (most reliable here) and the DOM visual
//! scan. A WebRTC hook is still installed pre-navigation so
//! the page exposes its peer connections for diagnostics.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Instant;
use tokio::time::{sleep, Duration};

use super::browser::BrowserSession;
use super::{
    is_excluded_name, js_click_button, sanitize_chat_message, MeetingClient,
    JS_SPEAKING_COLOR_FN, LOBBY_WAIT_SECS, PANEL_REOPEN_COOLDOWN_SECS,
};
use crate::ipc::IpcStore;
use crate::types::{CommandKind, EndReason, Platform};

const MEET_PLATFORM_WORDS: &[&str] = &["google meet", "siz", "you"];

/// Installed before navigation: captures RTCPeerConnection instances and
/// exposes a per-track volume probe on `window`.
const MEET_BOOTSTRAP_JS: &str = r#"
window._meetPCs = [];
const OriginalPC = window.RTCPeerConnection;
window.RTCPeerConnection = function(...args) {
    const pc = new OriginalPC(...args);
    window._meetPCs.push(pc);
    return pc;
};
window.getMeetVolumes = () => {
    const volumes = {};
    window._meetPCs.forEach(pc => {
        pc.getReceivers().forEach(r => {
            if (r.track && r.track.kind === 'audio') {
                if (!r._analyser) {
                    try {
                        const ctx = new AudioContext();
                        const src = ctx.createMediaStreamSource(new MediaStream([r.track]));
                        const analyser = ctx.createAnalyser();
                        analyser.fftSize = 512;
                        src.connect(analyser);
                        r._analyser = analyser;
                    } catch (e) { return; }
                }
                const data = new Uint8Array(r._analyser.frequencyBinCount);
                r._analyser.getByteFrequencyData(data);
                volumes[r.track.id] = data.reduce((a, b) => a + b, 0) / data.length;
            }
        });
    });
    return volumes;
};
"#;

const END_PHRASES: &[&str] = &[
    "you left",
    "meeting has ended",
    "toplantıdan ayrıldınız",
    "toplantı sona erdi",
];

const INVALID_PHRASES: &[&str] = &[
    "invalid video call link",
    "check your meeting code",
    "this video call link is invalid",
    "meeting doesn't exist",
    "couldn't find the meeting",
    "video call has ended",
    "this call has ended",
    "not allowed to join",
    "geçersiz görüntülü arama bağlantısı",
    "toplantı kodu hatalı",
    "bu toplantı artık mevcut değil",
    "toplantı sona ermiş",
    "bu aramaya katılamazsınız",
    "geçersiz toplantı linki",
    "bu görüşme sona erdi",
];

const WAITING_ROOM_PHRASES: &[&str] = &[
    "düzenleyen kişi sizi görüşmeye alana kadar bekleyin",
    "waiting for the host",
    "asking to join",
    "katılma isteği gönderildi",
];

/// A single participant alone for this long means the meeting is over.
const ALONE_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Deserialize)]
struct SpeakerScan {
    speakers: Vec<String>,
    all: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CaptionHit {
    speaker: String,
}

pub struct MeetClient {
    meeting_url: String,
    bot_name: String,
    store: IpcStore,
    session: Option<BrowserSession>,
    cached_participants: Vec<String>,
    alone_since: Option<Instant>,
    no_controls_count: u32,
    last_panel_attempt: Option<Instant>,
}

impl MeetClient {
    pub fn new(meeting_url: &str, bot_name: &str, store: IpcStore) -> Self {
        let meeting_url = if meeting_url.starts_with("http") {
            meeting_url.to_string()
        } else {
            format!("https://{meeting_url}")
        };
        Self {
            meeting_url,
            bot_name: bot_name.to_string(),
            store,
            session: None,
            cached_participants: Vec::new(),
            alone_since: None,
            no_controls_count: 0,
            last_panel_attempt: None,
        }
    }

    fn session(&self) -> Result<&BrowserSession> {
        self.session
            .as_ref()
            .ok_or_else(|| anyhow!("browser not started"))
    }

    fn stop_requested(&self) -> bool {
        self.store
            .read_pending_command()
            .map(|c| c.command == CommandKind::Stop)
            .unwrap_or(false)
    }

    async fn turn_off_av(&self) -> Result<()> {
        let session = self.session()?;

        // Labelled buttons first; Meet says "Turn off microphone" while on
        let mic_js = r#"
const btns = document.querySelectorAll("button, div[role='button']");
for (const b of btns) {
    const label = (b.getAttribute('aria-label') || '').toLowerCase();
    if ((label.includes('mikrofon') || label.includes('microphone')) &&
        (label.includes('kapat') || label.includes('turn off'))) {
        b.click();
        return true;
    }
}
return false;
"#;
        let mic_clicked: bool = session.eval(mic_js).await.unwrap_or(false);
        if !mic_clicked {
            tracing::info!("Mikrofon butonu bulunamadı, Ctrl+D deneniyor");
            let _ = session.press_ctrl_shortcut('d').await;
        }
        sleep(Duration::from_millis(500)).await;

        let cam_js = r#"
const btns = document.querySelectorAll("button, div[role='button']");
for (const b of btns) {
    const label = (b.getAttribute('aria-label') || '').toLowerCase();
    if ((label.includes('kamera') || label.includes('camera') || label.includes('video')) &&
        (label.includes('kapat') || label.includes('turn off'))) {
        b.click();
        return true;
    }
}
return false;
"#;
        let cam_clicked: bool = session.eval(cam_js).await.unwrap_or(false);
        if !cam_clicked {
            tracing::info!("Kamera butonu bulunamadı, Ctrl+E deneniyor");
            let _ = session.press_ctrl_shortcut('e').await;
        }
        sleep(Duration::from_millis(500)).await;
        Ok(())
    }

    /// Route meeting audio to the virtual cable: open the speaker dropdown
    /// and pick the cleanest CABLE Input entry.
    async fn select_virtual_speaker(&self) -> Result<()> {
        let session = self.session()?;
        let opened: Option<String> = session
            .eval(&js_click_button(&["hoparlör", "speaker"], false))
            .await
            .unwrap_or(None);
        if opened.is_none() {
            tracing::warn!("Hoparlör dropdown bulunamadı");
            return Ok(());
        }
        sleep(Duration::from_secs(2)).await;

        let pick_js = r#"
const options = Array.from(document.querySelectorAll("li[role='option'], div[role='option'], ul li"))
    .filter(o => (o.offsetWidth || o.offsetHeight) && (o.innerText || '').trim());
if (!options.length) return null;
const texts = options.map(o => o.innerText.toLowerCase());
let idx = texts.findIndex(t => t.includes('cable input') && !/\d/.test(t));
if (idx < 0) idx = texts.findIndex(t => t.includes('vb-audio') && t.includes('input') && !t.includes('16'));
if (idx < 0) {
    const bad = texts.findIndex(t => t.includes('16'));
    if (bad >= 0 && bad + 1 < options.length) idx = bad + 1;
}
if (idx < 0) idx = options.length - 1;
options[idx].click();
return options[idx].innerText.substring(0, 60);
"#;
        // Options can take a moment to render inside the dropdown
        for _ in 0..10 {
            let picked: Option<String> = session.eval(pick_js).await.unwrap_or(None);
            if let Some(choice) = picked {
                tracing::info!("Hoparlör seçildi: {}", choice.replace('\n', " "));
                return Ok(());
            }
            sleep(Duration::from_millis(500)).await;
        }
        tracing::warn!("Hoparlör seçenekleri yüklenmedi");
        Ok(())
    }

    async fn in_meeting_indicator_visible(&self) -> bool {
        let js = r#"
const btns = document.querySelectorAll("button, div[role='button']");
for (const b of btns) {
    if (!(b.offsetWidth || b.offsetHeight)) continue;
    const label = ((b.getAttribute('aria-label') || '') + (b.innerText || '')).toLowerCase();
    if (label.includes('chat') || label.includes('sohbet') ||
        label.includes('participant') || label.includes('kişi')) {
        return true;
    }
}
return false;
"#;
        match self.session() {
            Ok(session) => session.eval(js).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Read the live caption block; returns a participant-validated name.
    async fn caption_speaker(&self) -> Option<String> {
        let js = r#"
const selectors = ['div[class*="caption"]', 'div[class*="subtitle"]', 'div[jsname][data-caption]'];
for (const sel of selectors) {
    for (const container of document.querySelectorAll(sel)) {
        const text = container.innerText || '';
        const lines = text.split('\n');
        if (lines.length >= 2) {
            const speaker = lines[0].trim();
            if (speaker.length >= 2 && speaker.length <= 50 &&
                !speaker.toLowerCase().includes('sesly') && !speaker.toLowerCase().includes('bot')) {
                return { speaker: speaker };
            }
        }
    }
}
return null;
"#;
        let session = self.session.as_ref()?;
        let hit: Option<CaptionHit> = session.eval(js).await.ok()?;
        let name = hit?.speaker;

        // Only a real participant name may be returned. Equality or
        // either-contains match against the cached list.
        if self.cached_participants.is_empty() {
            return None;
        }
        let lower = name.to_lowercase();
        for cached in &self.cached_participants {
            let cached_lower = cached.to_lowercase();
            if cached_lower == lower
                || cached_lower.contains(&lower)
                || lower.contains(&cached_lower)
            {
                return Some(cached.clone());
            }
        }
        None
    }

    fn speaker_scan_js() -> String {
        format!(
            r#"
{JS_SPEAKING_COLOR_FN}
function hasGlowEffect(shadowStr) {{
    if (!shadowStr || shadowStr === 'none') return false;
    const hasBlur = /\dpx\s+\d+px\s+\d+px/.test(shadowStr);
    return hasBlur && isSpeakingColor(shadowStr);
}}
const activeSpeakers = [];
const allParticipants = [];
const containers = document.querySelectorAll(
    '[data-participant-id], div[data-self-name], div[jsname][data-requested-participant-id], ' +
    'div[class*="participant"], div[class*="video-tile"]'
);
const uiTexts = [
    'yeniden kadraja al', 'reframe', 'sabitle', 'pin', 'sessize al', 'mute',
    'sesi aç', 'unmute', 'kaldır', 'remove', 'tam ekran', 'fullscreen',
    'ayarlar', 'settings', 'daha fazla', 'more', 'kapat', 'close',
    'spotlight', 'grid', 'sidebar', 'tiles'
];
containers.forEach(container => {{
    let name = '';
    const nameEl = container.querySelector('[data-self-name], [class*="name"], span');
    if (nameEl) name = nameEl.innerText || nameEl.textContent || '';
    if (!name) name = (container.innerText || '');
    if (!name && container.getAttribute('aria-label')) {{
        name = container.getAttribute('aria-label').split(',')[0];
    }}
    name = name.split('\n')[0].trim();
    if (!name || name.length > 50) return;
    if (/\d{{2}}:\d{{2}}/.test(name)) return;
    const lower = name.toLowerCase();
    if (uiTexts.some(ui => lower.includes(ui))) return;

    allParticipants.push(name);

    let speaking = false;
    const style = window.getComputedStyle(container);
    const borderWidth = parseInt(style.borderWidth) || 0;
    if (borderWidth >= 3 && isSpeakingColor(style.borderColor || '')) speaking = true;
    if (!speaking && style.outline && style.outline !== 'none') {{
        const m = style.outline.match(/(\d+)px/);
        if (m && parseInt(m[1]) >= 2 && isSpeakingColor(style.outline)) speaking = true;
    }}
    if (!speaking && hasGlowEffect(style.boxShadow || '')) speaking = true;
    if (!speaking) {{
        for (const el of container.querySelectorAll('*')) {{
            const s = window.getComputedStyle(el);
            const bw = parseInt(s.borderWidth) || 0;
            if ((bw >= 3 && isSpeakingColor(s.borderColor || '')) || hasGlowEffect(s.boxShadow || '')) {{
                speaking = true;
                break;
            }}
        }}
    }}
    if (!speaking) {{
        // Audio indicator animation next to the mic icon
        for (const wave of container.querySelectorAll(
            'svg[class*="audio"], svg[class*="wave"], div[class*="audio"], div[class*="wave"], ' +
            'div[class*="indicator"], [class*="speaking"], [data-is-speaking]'
        )) {{
            const s = window.getComputedStyle(wave);
            if (s.display === 'none' || s.visibility === 'hidden') continue;
            if ((s.animation && s.animation !== 'none') || (s.transform && s.transform !== 'none')) {{
                speaking = true;
                break;
            }}
        }}
    }}
    if (!speaking) {{
        const label = (container.getAttribute('aria-label') || '').toLowerCase();
        if (label.includes('konuşuyor') || label.includes('speaking') || label.includes('talking')) {{
            speaking = true;
        }}
    }}
    if (!speaking) {{
        const classes = (container.className || '').toString().toLowerCase();
        if (classes.includes('speaking') || classes.includes('talking')) speaking = true;
    }}
    if (speaking && !activeSpeakers.includes(name)) activeSpeakers.push(name);
}});
return {{ speakers: [...new Set(activeSpeakers)], all: [...new Set(allParticipants)] }};
"#
        )
    }

    async fn participant_count(&self) -> i64 {
        let js = r#"
const btns = document.querySelectorAll("button, div[role='button']");
for (const b of btns) {
    const label = (b.getAttribute('aria-label') || '').toLowerCase();
    if (label.includes('participant') || label.includes('katılımcı') || label.includes('kişi')) {
        const m = (b.innerText || '').match(/\d+/);
        if (m) return parseInt(m[0]);
    }
}
return -1;
"#;
        match self.session() {
            Ok(session) => session.eval(js).await.unwrap_or(-1),
            Err(_) => -1,
        }
    }

    async fn hangup_controls_visible(&self) -> bool {
        let js = r#"
const btns = document.querySelectorAll("button, div[role='button']");
for (const b of btns) {
    if (!(b.offsetWidth || b.offsetHeight)) continue;
    const label = (b.getAttribute('aria-label') || '').toLowerCase();
    if (label.includes('leave call') || label.includes('aramadan ayrıl') ||
        label.includes('çağrıdan ayrıl') || label.includes('end call')) {
        return true;
    }
}
return false;
"#;
        match self.session() {
            Ok(session) => session.eval(js).await.unwrap_or(false),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl MeetingClient for MeetClient {
    fn platform(&self) -> Platform {
        Platform::Meet
    }

    async fn start(&mut self) -> Result<()> {
        tracing::info!("Meet için tarayıcı başlatılıyor");
        let session = BrowserSession::launch(&[MEET_BOOTSTRAP_JS]).await?;
        self.session = Some(session);
        Ok(())
    }

    async fn join(&mut self) -> Result<bool> {
        if self.stop_requested() {
            return Ok(false);
        }
        let url = self.meeting_url.clone();
        tracing::info!("Meet linki açılıyor: {}", url);
        self.session()?.goto(&url).await?;
        sleep(Duration::from_secs(3)).await;
        if self.stop_requested() {
            return Ok(false);
        }

        // Identify
        match self.session()?.fill_input("input[type='text']", &self.bot_name).await {
            Ok(true) => tracing::info!("İsim girildi: {}", self.bot_name),
            _ => tracing::warn!("İsim alanı bulunamadı (devam ediliyor)"),
        }
        sleep(Duration::from_secs(1)).await;
        let _ = self.dismiss_popups().await;

        // Configure AV, then the speaker output device
        if let Err(e) = self.turn_off_av().await {
            tracing::warn!("AV kapatma hatası: {}", e);
        }
        if self.stop_requested() {
            return Ok(false);
        }
        if let Err(e) = self.select_virtual_speaker().await {
            tracing::warn!("Hoparlör ayarı hatası: {}", e);
        }
        sleep(Duration::from_secs(2)).await;
        if self.stop_requested() {
            return Ok(false);
        }

        // Submit: up to three click attempts
        let join_js = js_click_button(&["ask to join", "join now", "şimdi katıl", "katıl"], false);
        let mut submitted = false;
        for attempt in 1..=3 {
            let clicked: Option<String> = self.session()?.eval(&join_js).await.unwrap_or(None);
            match clicked {
                Some(label) => {
                    tracing::info!("Join tıklandı ({}): {}", attempt, label);
                    submitted = true;
                }
                None if submitted => break, // button gone after an earlier click
                None => tracing::warn!("Join butonu bulunamadı (deneme {})", attempt),
            }
            sleep(Duration::from_secs(5)).await;
            if self.in_meeting_indicator_visible().await {
                break;
            }
        }
        if !submitted {
            tracing::error!("Join butonuna hiç tıklanamadı");
            return Ok(false);
        }

        // Lobby wait, bounded
        let started = Instant::now();
        let mut waiting_logged = false;
        loop {
            if started.elapsed().as_secs() > LOBBY_WAIT_SECS {
                tracing::error!("Bekleme odası süresi doldu ({}s)", LOBBY_WAIT_SECS);
                return Ok(false);
            }
            if self.in_meeting_indicator_visible().await {
                tracing::info!("Toplantıya katılım başarılı");
                return Ok(true);
            }
            let body = self.session()?.body_text().await;
            if let Some(found) = WAITING_ROOM_PHRASES.iter().find(|p| body.contains(**p)) {
                if !waiting_logged {
                    tracing::info!("Bekleme odası algılandı: '{}'", found);
                    waiting_logged = true;
                }
                if self.stop_requested() {
                    tracing::info!("Bekleme sırasında STOP komutu algılandı");
                    return Ok(false);
                }
            }
            sleep(Duration::from_secs(1)).await;
        }
    }

    async fn send_chat(&mut self, message: &str) -> Result<bool> {
        let message = sanitize_chat_message(message);
        let session = self.session()?;

        let open_result: Option<String> = session
            .eval(&js_click_button(&["chat", "sohbet"], true))
            .await
            .unwrap_or(None);
        let opened_by_us = matches!(open_result.as_deref(), Some(l) if l != "pressed");
        if open_result.is_some() {
            sleep(Duration::from_millis(1500)).await;
        }

        let editor_selectors = [
            "textarea[placeholder*='Send']",
            "textarea[placeholder*='İlet']",
            "textarea[placeholder*='mesaj']",
            "textarea",
            "div[contenteditable='true'][data-placeholder]",
            "div[contenteditable='true']",
        ];
        let mut focused = false;
        for selector in editor_selectors {
            if let Ok(element) = session.page().find_element(selector).await {
                if element.click().await.is_ok() {
                    tracing::info!("Mesaj alanı bulundu: {}", selector);
                    focused = true;
                    break;
                }
            }
        }
        if !focused {
            tracing::error!("Mesaj alanı bulunamadı");
            return Ok(false);
        }
        sleep(Duration::from_millis(500)).await;

        let tier = session.type_text_tiered(&message).await?;
        sleep(Duration::from_millis(500)).await;
        session.press_enter().await?;
        tracing::info!("Mesaj gönderildi ({})", tier);

        if opened_by_us {
            sleep(Duration::from_secs(1)).await;
            let close_js = r#"
const btns = document.querySelectorAll("button, div[role='button']");
for (const b of btns) {
    const label = (b.getAttribute('aria-label') || '').toLowerCase();
    if ((label.includes('chat') || label.includes('sohbet')) &&
        b.getAttribute('aria-pressed') === 'true') {
        b.click();
        return true;
    }
}
return false;
"#;
            session.eval_quiet(close_js).await;
        }
        Ok(true)
    }

    async fn open_participants_panel(&mut self) -> Result<bool> {
        let session = self.session()?;

        // Newer Meet: the participant-count button sits top right
        let count_button_js = r#"
const width = window.innerWidth;
const btns = document.querySelectorAll("button, div[role='button']");
for (const b of btns) {
    if (!(b.offsetWidth || b.offsetHeight)) continue;
    const text = (b.innerText || '').trim();
    if (/^\d{1,3}$/.test(text)) {
        const rect = b.getBoundingClientRect();
        if (rect.left > width * 0.6) {
            b.click();
            return true;
        }
    }
}
return false;
"#;
        if session.eval::<bool>(count_button_js).await.unwrap_or(false) {
            sleep(Duration::from_secs(1)).await;
            return Ok(true);
        }

        let result: Option<String> = session
            .eval(&js_click_button(
                &["participant", "katılımcı", "kişi", "people", "herkes", "show everyone"],
                true,
            ))
            .await
            .unwrap_or(None);
        match result.as_deref() {
            Some("pressed") => Ok(true), // already open, do not toggle it shut
            Some(label) => {
                tracing::info!("Katılımcı paneli açıldı: {}", label);
                sleep(Duration::from_secs(1)).await;
                Ok(true)
            }
            None => {
                tracing::warn!("Katılımcı butonu bulunamadı");
                Ok(false)
            }
        }
    }

    async fn close_participants_panel(&mut self) -> Result<bool> {
        let session = self.session()?;
        let result: Option<String> = session
            .eval(&js_click_button(&["kapat", "close"], false))
            .await
            .unwrap_or(None);
        Ok(result.is_some())
    }

    async fn active_speakers(&mut self) -> Result<Vec<String>> {
        // Captions first: they carry Google's own speaker attribution
        if let Some(speaker) = self.caption_speaker().await {
            tracing::debug!("Altyazı ile tespit: {}", speaker);
            return Ok(vec![speaker]);
        }

        // Visual scan of the tiles. A closed panel may be re-opened
        // once per cool-down window.
        let scan: Option<SpeakerScan> = match self.session() {
            Ok(session) => session.eval(&Self::speaker_scan_js()).await.ok(),
            Err(_) => None,
        };
        let Some(scan) = scan else {
            return Ok(Vec::new());
        };

        let all: Vec<String> = scan
            .all
            .into_iter()
            .filter(|n| !is_excluded_name(n, MEET_PLATFORM_WORDS))
            .collect();
        if !all.is_empty() {
            self.cached_participants = all;
        } else {
            let reopen_due = self
                .last_panel_attempt
                .map(|t| t.elapsed().as_secs() >= PANEL_REOPEN_COOLDOWN_SECS)
                .unwrap_or(true);
            if reopen_due {
                self.last_panel_attempt = Some(Instant::now());
                let _ = self.open_participants_panel().await;
            }
        }

        Ok(scan
            .speakers
            .into_iter()
            .filter(|n| !is_excluded_name(n, MEET_PLATFORM_WORDS))
            .collect())
    }

    async fn participants(&mut self) -> Result<Vec<String>> {
        let opened = self.open_participants_panel().await.unwrap_or(false);
        if opened {
            sleep(Duration::from_secs(1)).await;
        }
        let js = r#"
const names = [];
const selectors = [
    '[data-participant-id]', '[data-requested-participant-id]',
    'div[role="listitem"]', 'div[class*="participant"]', '[data-self-name]'
];
for (const sel of selectors) {
    document.querySelectorAll(sel).forEach(el => {
        let name = el.getAttribute('data-self-name') || '';
        if (!name) name = ((el.innerText || el.textContent || '').split('\n')[0] || '').trim();
        if (!name && el.getAttribute('aria-label')) {
            name = el.getAttribute('aria-label').split(',')[0].trim();
        }
        if (!name || name.length < 2 || name.length > 50) return;
        if (/\d{2}:\d{2}/.test(name)) return;
        if (!names.includes(name)) names.push(name);
    });
}
return names;
"#;
        let raw: Vec<String> = match self.session() {
            Ok(session) => session.eval(js).await.unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        let filtered: Vec<String> = raw
            .into_iter()
            .filter(|n| !is_excluded_name(n, MEET_PLATFORM_WORDS))
            .collect();
        if !filtered.is_empty() {
            self.cached_participants = filtered.clone();
            Ok(filtered)
        } else {
            Ok(self.cached_participants.clone())
        }
    }

    async fn check_meeting_ended(&mut self) -> Result<Option<EndReason>> {
        let Ok(session) = self.session() else {
            return Ok(Some(EndReason::Normal));
        };
        if session.is_closed().await {
            tracing::info!("Sayfa kapandı, toplantı bitti");
            return Ok(Some(EndReason::Normal));
        }

        let body = session.body_text().await;
        if END_PHRASES.iter().any(|p| body.contains(p)) {
            tracing::info!("Toplantı bitiş mesajı tespit edildi");
            return Ok(Some(EndReason::Normal));
        }
        if let Some(phrase) = INVALID_PHRASES.iter().find(|p| body.contains(**p)) {
            tracing::warn!("Geçersiz Meet toplantısı tespit edildi: {}", phrase);
            return Ok(Some(EndReason::Invalid(format!(
                "Geçersiz Meet toplantısı: {phrase}"
            ))));
        }

        // Alone-in-meeting timer
        let count = self.participant_count().await;
        if in_range(count) {
            if count <= 1 {
                match self.alone_since {
                    None => {
                        self.alone_since = Some(Instant::now());
                        tracing::info!("Tek katılımcı algılandı, {}s sayaç başladı", ALONE_TIMEOUT_SECS);
                    }
                    Some(since) if since.elapsed().as_secs() > ALONE_TIMEOUT_SECS => {
                        tracing::info!("Tek katılımcı süresi doldu, toplantı bitiyor");
                        return Ok(Some(EndReason::Normal));
                    }
                    Some(_) => {}
                }
            } else if self.alone_since.take().is_some() {
                tracing::info!("Yeni katılımcı geldi, sayaç sıfırlandı");
            }
        }

        // Control surface lost for three consecutive checks
        if self.hangup_controls_visible().await {
            self.no_controls_count = 0;
        } else {
            self.no_controls_count += 1;
            if self.no_controls_count >= 3 {
                tracing::info!("Toplantı kontrolleri kayboldu, toplantı bitmiş sayılıyor");
                return Ok(Some(EndReason::Normal));
            }
        }

        Ok(None)
    }

    async fn enable_captions(&mut self) -> Result<bool> {
        let session = self.session()?;

        // Already rendering captions? Leave the toggle alone.
        let visible_js = r#"
const captions = document.querySelectorAll('div[class*="caption"], div[class*="subtitle"]');
for (const c of captions) {
    if (c.innerText && c.innerText.length > 5 && c.offsetParent !== null) return true;
}
return false;
"#;
        if session.eval::<bool>(visible_js).await.unwrap_or(false) {
            tracing::info!("Altyazı zaten açık");
            return Ok(true);
        }

        let result: Option<String> = session
            .eval(&js_click_button(&["altyazı", "caption", "subtitles"], true))
            .await
            .unwrap_or(None);
        match result.as_deref() {
            Some("pressed") => Ok(true),
            Some(label) => {
                tracing::info!("Altyazı açıldı: {}", label);
                Ok(true)
            }
            None => {
                tracing::warn!("Altyazı butonu bulunamadı");
                Ok(false)
            }
        }
    }

    async fn dismiss_popups(&mut self) -> Result<()> {
        let session = self.session()?;
        let js = js_click_button(
            &[
                "anladım", "anladim", "got it", "dismiss", "kapat", "close", "tamam",
                "understood",
            ],
            false,
        );
        // A popup click can reveal the next popup; a few rounds are enough
        for _ in 0..3 {
            let clicked: Option<String> = session.eval(&js).await.unwrap_or(None);
            match clicked {
                Some(label) => {
                    tracing::info!("Popup kapatıldı: {}", label);
                    sleep(Duration::from_millis(500)).await;
                }
                None => break,
            }
        }
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
    }
}

// Participant-count reads of -1 mean "could not read"; only real counts
// may drive the alone timer.
fn in_range(count: i64) -> bool {
    count >= 0
}
