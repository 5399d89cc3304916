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

//! Zoom web-client adapter. Launcher URLs are rewritten to the `/wc/` web
//! client up front so the native-app prompt never appears. Speaker detection
//! reads the participants panel: the voip-speaking icon is the trustworthy
//! signal, the unmuted microphone SVG only a last resort.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::time::Instant;
use tokio::time::{sleep, Duration};

use super::browser::BrowserSession;
use super::{
    is_excluded_name, js_click_button, sanitize_chat_message, MeetingClient, LOBBY_WAIT_SECS,
    PANEL_REOPEN_COOLDOWN_SECS,
};
use crate::ipc::IpcStore;
use crate::types::{CommandKind, EndReason, Platform};

const ZOOM_PLATFORM_WORDS: &[&str] = &["zoom"];

const END_PHRASES: &[&str] = &[
    "the meeting has ended",
    "this meeting has been ended by host",
    "meeting has been ended by host",
    "toplantı sahibi tarafından sonlandırıldı",
    "you have been removed",
];

const INVALID_PHRASES: &[&str] = &[
    "this meeting id is not valid",
    "invalid meeting id",
    "meeting does not exist",
    "meeting not found",
    "this meeting link is not valid",
    "the meeting has expired",
    "meeting has already ended",
    "this link has expired",
    "geçersiz toplantı",
    "toplantı bulunamadı",
    "toplantı mevcut değil",
    "bu toplantı linki geçersiz",
];

const WAITING_ROOM_PHRASES: &[&str] = &[
    "host has joined",
    "we've let them know",
    "waiting for the host",
    "waiting room",
    "please wait",
    "bekleme odası",
];

const ALONE_TIMEOUT_SECS: u64 = 300;

lazy_static! {
    static ref LAUNCHER_URL_RE: Regex = Regex::new(r"/j/(\d+)").unwrap();
}

/// `https://us05web.zoom.us/j/123?pwd=abc` → `https://us05web.zoom.us/wc/123/join?pwd=abc`
pub fn convert_to_web_url(url: &str) -> String {
    let Some(caps) = LAUNCHER_URL_RE.captures(url) else {
        return url.to_string();
    };
    let meeting_id = &caps[1];
    let (base, query) = match url.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (url, None),
    };
    let Some((domain, _)) = base.split_once("/j/") else {
        return url.to_string();
    };
    match query {
        Some(q) => format!("{domain}/wc/{meeting_id}/join?{q}"),
        None => format!("{domain}/wc/{meeting_id}/join"),
    }
}

#[derive(Debug, Deserialize)]
struct PanelScan {
    speakers: Vec<String>,
    unmuted: Vec<String>,
    all: Vec<String>,
    panel_found: bool,
}

pub struct ZoomClient {
    meeting_url: String,
    bot_name: String,
    passcode: Option<String>,
    store: IpcStore,
    session: Option<BrowserSession>,
    cached_participants: Vec<String>,
    alone_since: Option<Instant>,
    no_controls_count: u32,
    last_panel_attempt: Option<Instant>,
}

impl ZoomClient {
    pub fn new(meeting_url: &str, bot_name: &str, passcode: Option<&str>, store: IpcStore) -> Self {
        let web_url = convert_to_web_url(meeting_url);
        if web_url != meeting_url {
            tracing::info!("Zoom URL web client formatına çevrildi: {}", web_url);
        }
        Self {
            meeting_url: web_url,
            bot_name: bot_name.to_string(),
            passcode: passcode.map(|s| s.to_string()),
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

    async fn name_input_visible(&self) -> bool {
        let js = r#"
const input = document.querySelector(
    "input[id='inputname'], input[name='inputname'], input[id='input-name'], input[type='text']"
);
return !!(input && (input.offsetWidth || input.offsetHeight));
"#;
        match self.session() {
            Ok(session) => session.eval(js).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn fill_passcode(&self) -> Result<()> {
        let Some(passcode) = &self.passcode else {
            return Ok(());
        };
        let session = self.session()?;
        let filled = session
            .fill_input(
                "input[id='inputpasscode'], input[name='inputpasscode'], input[type='password']",
                passcode,
            )
            .await
            .unwrap_or(false);
        if filled {
            tracing::info!("Şifre girildi");
            sleep(Duration::from_millis(500)).await;
            let _: Option<String> = session
                .eval(&js_click_button(&["join", "katıl"], false))
                .await
                .unwrap_or(None);
            sleep(Duration::from_secs(2)).await;
        }
        Ok(())
    }

    /// Pick the virtual cable as the speaker device in the pre-join screen.
    async fn select_virtual_speaker(&self) -> Result<()> {
        let session = self.session()?;
        let open_js = r#"
const selectors = [
    "button[class*='arrowDown']", "button[class*='arrow-down']",
    "button[aria-label*='Select a microphone']", "button[aria-label*='Select a speaker']",
    "button[aria-label*='audio settings']"
];
for (const sel of selectors) {
    const btn = document.querySelector(sel);
    if (btn && (btn.offsetWidth || btn.offsetHeight)) {
        btn.click();
        return true;
    }
}
return false;
"#;
        if !session.eval::<bool>(open_js).await.unwrap_or(false) {
            tracing::warn!("Audio dropdown bulunamadı");
            return Ok(());
        }
        sleep(Duration::from_secs(1)).await;

        let pick_js = r#"
const options = Array.from(document.querySelectorAll("li, div[role='menuitem'], span"))
    .filter(o => (o.offsetWidth || o.offsetHeight) && (o.innerText || '').includes('CABLE Input'));
if (!options.length) return null;
options[0].click();
return options[0].innerText.substring(0, 60);
"#;
        match session.eval::<Option<String>>(pick_js).await.unwrap_or(None) {
            Some(choice) => tracing::info!("CABLE Input seçildi: {}", choice.replace('\n', " ")),
            None => tracing::warn!("CABLE Input listede bulunamadı"),
        }
        sleep(Duration::from_secs(1)).await;
        Ok(())
    }

    async fn mute_and_stop_video(&self) -> Result<()> {
        let session = self.session()?;
        // "Mute" only while the mic is live; an already-muted mic says
        // "Unmute" and must not be toggled back on.
        let mute_js = r#"
const btns = document.querySelectorAll("button, div[role='button']");
for (const b of btns) {
    const label = (b.getAttribute('aria-label') || '').toLowerCase();
    if (label.includes('mute') && !label.includes('unmute')) {
        b.click();
        return true;
    }
}
return false;
"#;
        if session.eval::<bool>(mute_js).await.unwrap_or(false) {
            tracing::info!("Mikrofon kapatıldı");
        }
        sleep(Duration::from_millis(500)).await;

        let video_off: Option<String> = session
            .eval(&js_click_button(
                &["stop video", "turn off camera", "kamerayı kapat", "videoyu durdur"],
                false,
            ))
            .await
            .unwrap_or(None);
        if video_off.is_some() {
            tracing::info!("Video kapatıldı");
        }
        Ok(())
    }

    async fn meeting_toolbar_visible(&self) -> bool {
        let js = r#"
const selectors = [
    "button[aria-label*='Mute']", "button[aria-label*='Chat']",
    "button[aria-label*='Share']", "button[aria-label*='Audio']",
    "div[class*='footer']"
];
for (const sel of selectors) {
    const el = document.querySelector(sel);
    if (el && (el.offsetWidth || el.offsetHeight)) return true;
}
return false;
"#;
        match self.session() {
            Ok(session) => session.eval(js).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    fn panel_scan_js() -> &'static str {
        r#"
const panel = document.querySelector('#participants-ul, .participants-list-container');
if (!panel) return { speakers: [], unmuted: [], all: [], panel_found: false };
const speakers = [];
const unmuted = [];
const all = [];
for (const item of panel.querySelectorAll('.participants-li')) {
    const aria = (item.getAttribute('aria-label') || '');
    let name = '';
    const nameEl = item.querySelector('.participants-item__display-name');
    if (nameEl) name = (nameEl.textContent || '').trim();
    if (!name && aria) {
        name = aria.split(',')[0].replace('(Host)', '').replace('(Me)', '').replace('(Co-host)', '').trim();
    }
    if (!name) continue;
    if (aria.toLowerCase().includes('(me)')) continue;
    all.push(name);

    if (item.querySelector('.participants-icon__voip-speaking-icon')) {
        speakers.push(name);
        continue;
    }
    const ariaLower = aria.toLowerCase();
    if (ariaLower.includes('talking') || ariaLower.includes('speaking') || ariaLower.includes('konuşuyor')) {
        speakers.push(name);
        continue;
    }
    // Unmuted mic: potential speaker, only usable when nothing better exists
    if (item.querySelector("svg[class*='audio-unmuted']")) {
        unmuted.push(name);
    }
}
return { speakers: [...new Set(speakers)], unmuted: [...new Set(unmuted)], all: [...new Set(all)], panel_found: true };
"#
    }

    async fn scan_panel(&mut self) -> Option<PanelScan> {
        let scan: Option<PanelScan> = match self.session() {
            Ok(session) => session.eval(Self::panel_scan_js()).await.ok(),
            Err(_) => None,
        };
        let scan = scan?;
        if scan.panel_found {
            return Some(scan);
        }
        // Panel closed: one re-open attempt per cool-down window
        let reopen_due = self
            .last_panel_attempt
            .map(|t| t.elapsed().as_secs() >= PANEL_REOPEN_COOLDOWN_SECS)
            .unwrap_or(true);
        if !reopen_due {
            return None;
        }
        self.last_panel_attempt = Some(Instant::now());
        let _ = self.open_participants_panel().await;
        sleep(Duration::from_millis(500)).await;
        match self.session() {
            Ok(session) => session
                .eval::<PanelScan>(Self::panel_scan_js())
                .await
                .ok()
                .filter(|s| s.panel_found),
            Err(_) => None,
        }
    }
}

#[async_trait]
impl MeetingClient for ZoomClient {
    fn platform(&self) -> Platform {
        Platform::Zoom
    }

    async fn start(&mut self) -> Result<()> {
        tracing::info!("Zoom için tarayıcı başlatılıyor");
        let session = BrowserSession::launch(&[]).await?;
        self.session = Some(session);
        Ok(())
    }

    async fn join(&mut self) -> Result<bool> {
        if self.stop_requested() {
            return Ok(false);
        }
        let url = self.meeting_url.clone();
        tracing::info!("Toplantıya gidiliyor: {}", url);
        self.session()?.goto(&url).await?;
        sleep(Duration::from_secs(2)).await;

        // Preflight: scroll up, dismiss the native-app prompt
        self.session()?.eval_quiet("window.scrollTo(0, 0); return true;").await;
        self.session()?.press_escape_burst(1).await;

        // With a /wc/ URL we normally land straight on the name screen
        if !self.name_input_visible().await {
            tracing::info!("İsim ekranı yok, 'Join from Browser' aranıyor");
            let clicked: Option<String> = self
                .session()?
                .eval(&js_click_button(
                    &["join from your browser", "tarayıcınızdan katılın", "tarayıcıdan katıl"],
                    false,
                ))
                .await
                .unwrap_or(None);
            if clicked.is_none() {
                let _: Option<String> = self
                    .session()?
                    .eval(&js_click_button(
                        &["launch meeting", "toplantıyı başlat"],
                        false,
                    ))
                    .await
                    .unwrap_or(None);
                sleep(Duration::from_secs(2)).await;
                let retry: Option<String> = self
                    .session()?
                    .eval(&js_click_button(
                        &["join from your browser", "tarayıcınızdan katılın"],
                        false,
                    ))
                    .await
                    .unwrap_or(None);
                if retry.is_none() {
                    tracing::error!("'Join from Browser' linki bulunamadı");
                    return Ok(false);
                }
            }
            sleep(Duration::from_secs(2)).await;
        }

        self.fill_passcode().await?;

        // Identify
        let filled = self
            .session()?
            .fill_input(
                "input[id='inputname'], input[name='inputname'], input[id='input-name'], input[type='text']",
                &self.bot_name,
            )
            .await
            .unwrap_or(false);
        if !filled {
            tracing::error!("İsim alanı bulunamadı");
            return Ok(false);
        }
        sleep(Duration::from_secs(1)).await;

        // Configure AV before submitting
        if let Err(e) = self.select_virtual_speaker().await {
            tracing::warn!("Ses ayarı hatası: {}", e);
        }
        if let Err(e) = self.mute_and_stop_video().await {
            tracing::warn!("AV kapatma hatası: {}", e);
        }
        if self.stop_requested() {
            return Ok(false);
        }

        // Submit, up to three attempts; terms dialog may interpose
        let mut submitted = false;
        for attempt in 1..=3 {
            let _: Option<String> = self
                .session()?
                .eval(&js_click_button(&["i agree", "kabul ediyorum"], false))
                .await
                .unwrap_or(None);
            let clicked: Option<String> = self
                .session()?
                .eval(&js_click_button(&["join", "katıl"], false))
                .await
                .unwrap_or(None);
            if clicked.is_some() {
                tracing::info!("Join butonuna basıldı (deneme {})", attempt);
                submitted = true;
                break;
            }
            sleep(Duration::from_secs(2)).await;
        }
        if !submitted {
            tracing::error!("Join butonu bulunamadı");
            return Ok(false);
        }
        sleep(Duration::from_secs(3)).await;

        // Waiting room or straight in
        let body = self.session()?.body_text().await;
        let in_waiting_room = WAITING_ROOM_PHRASES.iter().any(|p| body.contains(p));
        if in_waiting_room {
            tracing::info!("Bekleme odası tespit edildi, {}s sınırıyla bekleniyor", LOBBY_WAIT_SECS);
            let started = Instant::now();
            loop {
                if started.elapsed().as_secs() > LOBBY_WAIT_SECS {
                    tracing::error!("Bekleme süresi doldu");
                    return Ok(false);
                }
                if self.stop_requested() {
                    tracing::info!("Bekleme odasında STOP komutu alındı");
                    return Ok(false);
                }
                let body = self.session()?.body_text().await;
                let still_waiting = WAITING_ROOM_PHRASES.iter().any(|p| body.contains(p));
                if !still_waiting && self.meeting_toolbar_visible().await {
                    tracing::info!("Bekleme odasından içeri alındık");
                    break;
                }
                sleep(Duration::from_secs(1)).await;
            }
        } else {
            // Give the in-meeting toolbar a moment to render
            let mut ok = false;
            for _ in 0..10 {
                if self.meeting_toolbar_visible().await {
                    ok = true;
                    break;
                }
                sleep(Duration::from_secs(1)).await;
            }
            if !ok {
                tracing::error!("Toplantı arayüzü yüklenmedi");
                return Ok(false);
            }
        }

        // Connect computer audio; often auto-connected
        let _: Option<String> = self
            .session()?
            .eval(&js_click_button(
                &["join audio by computer", "bilgisayarın sesiyle katıl"],
                false,
            ))
            .await
            .unwrap_or(None);

        let _ = self.open_participants_panel().await;
        tracing::info!("Katılım başarılı");
        Ok(true)
    }

    async fn send_chat(&mut self, message: &str) -> Result<bool> {
        let message = sanitize_chat_message(message);
        let session = self.session()?;

        let open_result: Option<String> = session
            .eval(&js_click_button(&["chat", "sohbet"], true))
            .await
            .unwrap_or(None);
        let opened_by_us = matches!(open_result.as_deref(), Some(l) if l != "pressed");
        sleep(Duration::from_secs(1)).await;

        let editor_selectors = [
            "div[contenteditable='true'][aria-label*='chat']",
            "div[contenteditable='true']",
            "textarea[class*='chat']",
            "textarea",
        ];
        let mut focused = false;
        for selector in editor_selectors {
            if let Ok(element) = session.page().find_element(selector).await {
                if element.click().await.is_ok() {
                    focused = true;
                    break;
                }
            }
        }
        if !focused {
            tracing::warn!("Chat mesaj alanı bulunamadı");
            return Ok(false);
        }
        sleep(Duration::from_millis(300)).await;

        let tier = session.type_text_tiered(&message).await?;
        session.press_enter().await?;
        tracing::info!("Chat mesajı gönderildi ({})", tier);

        if opened_by_us {
            sleep(Duration::from_millis(500)).await;
            let _ = self.close_participants_chat().await;
        }
        Ok(true)
    }

    async fn open_participants_panel(&mut self) -> Result<bool> {
        let session = self.session()?;
        let result: Option<String> = session
            .eval(&js_click_button(&["participants", "katılımcılar"], true))
            .await
            .unwrap_or(None);
        match result.as_deref() {
            Some("pressed") => Ok(true),
            Some(label) => {
                tracing::info!("Katılımcı paneli açıldı: {}", label);
                sleep(Duration::from_millis(500)).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn close_participants_panel(&mut self) -> Result<bool> {
        let session = self.session()?;
        let result: Option<String> = session
            .eval(&js_click_button(&["close", "kapat"], false))
            .await
            .unwrap_or(None);
        Ok(result.is_some())
    }

    async fn active_speakers(&mut self) -> Result<Vec<String>> {
        let Some(scan) = self.scan_panel().await else {
            return Ok(Vec::new());
        };

        let all: Vec<String> = scan
            .all
            .into_iter()
            .filter(|n| !is_excluded_name(n, ZOOM_PLATFORM_WORDS))
            .collect();
        if !all.is_empty() {
            self.cached_participants = all;
        }

        let speakers: Vec<String> = scan
            .speakers
            .into_iter()
            .filter(|n| !is_excluded_name(n, ZOOM_PLATFORM_WORDS))
            .collect();
        if !speakers.is_empty() {
            return Ok(speakers);
        }
        // Last resort only: the unmuted-mic set has a high false-positive rate
        Ok(scan
            .unmuted
            .into_iter()
            .filter(|n| !is_excluded_name(n, ZOOM_PLATFORM_WORDS))
            .collect())
    }

    async fn participants(&mut self) -> Result<Vec<String>> {
        if let Some(scan) = self.scan_panel().await {
            let all: Vec<String> = scan
                .all
                .into_iter()
                .filter(|n| !is_excluded_name(n, ZOOM_PLATFORM_WORDS))
                .collect();
            if !all.is_empty() {
                self.cached_participants = all.clone();
                return Ok(all);
            }
        }
        Ok(self.cached_participants.clone())
    }

    async fn check_meeting_ended(&mut self) -> Result<Option<EndReason>> {
        let Ok(session) = self.session() else {
            return Ok(Some(EndReason::Normal));
        };
        if session.is_closed().await {
            tracing::info!("Sayfa kapandı tespit edildi");
            return Ok(Some(EndReason::Normal));
        }

        let url = session.current_url().await.to_lowercase();
        if url.contains("postattendee") || url.contains("ended") {
            tracing::info!("URL değişikliği tespit edildi (meeting ended)");
            return Ok(Some(EndReason::Normal));
        }

        let body = session.body_text().await;
        if let Some(phrase) = END_PHRASES.iter().find(|p| body.contains(**p)) {
            tracing::info!("Toplantı bitiş metni tespit edildi: {}", phrase);
            return Ok(Some(EndReason::Normal));
        }
        if let Some(phrase) = INVALID_PHRASES.iter().find(|p| body.contains(**p)) {
            tracing::warn!("Geçersiz toplantı tespit edildi: {}", phrase);
            return Ok(Some(EndReason::Invalid(format!(
                "Geçersiz toplantı linki: {phrase}"
            ))));
        }

        // Alone-in-meeting timer, driven by the panel participant count
        if let Some(scan) = self.scan_panel().await {
            let count = scan.all.len();
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

        // Leave/hangup controls missing three checks in a row
        if self.meeting_toolbar_visible().await {
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

    async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
    }
}

impl ZoomClient {
    async fn close_participants_chat(&self) -> Result<()> {
        let session = self.session()?;
        let _: Option<String> = session
            .eval(&js_click_button(&["chat", "sohbet"], false))
            .await
            .unwrap_or(None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launcher_url_is_rewritten_to_web_client() {
        assert_eq!(
            convert_to_web_url("https://us05web.zoom.us/j/123456789?pwd=abc"),
            "https://us05web.zoom.us/wc/123456789/join?pwd=abc"
        );
        assert_eq!(
            convert_to_web_url("https://zoom.us/j/987654"),
            "https://zoom.us/wc/987654/join"
        );
    }

    #[test]
    fn non_launcher_urls_pass_through() {
        let wc = "https://zoom.us/wc/123/join";
        assert_eq!(convert_to_web_url(wc), wc);
        let other = "https://example.com/meeting";
        assert_eq!(convert_to_web_url(other), other);
    }
}
