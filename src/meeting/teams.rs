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

//! Microsoft Teams adapter. Primary speaker detection decodes the
//! `rosterUpdate` messages captured off the page's WebSockets (gzip+base64
//! JSON bodies with per-stream speaking flags); the DOM grid/list scan is the
//! fallback. Launcher URLs are rewritten straight to the web client.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::Engine;
use flate2::read::GzDecoder;
use serde::Deserialize;
use serde_json::Value;
use std::io::Read;
use std::time::Instant;
use tokio::time::{sleep, Duration};

use super::browser::BrowserSession;
use super::{
    clean_display_name, is_excluded_name, js_click_button, sanitize_chat_message, MeetingClient,
    LOBBY_WAIT_SECS,
};
use crate::ipc::IpcStore;
use crate::types::{CommandKind, EndReason, Platform};

const TEAMS_PLATFORM_WORDS: &[&str] = &["microsoft teams", "teams"];

/// Captures WebSocket traffic; messages touching speakers or the roster are
/// kept in a separate ring the adapter drains.
const TEAMS_BOOTSTRAP_JS: &str = r#"
window._wsMessages = [];
window._wsSpeakerData = [];
const OriginalWebSocket = WebSocket;
window.WebSocket = function(...args) {
    const ws = new OriginalWebSocket(...args);
    ws.addEventListener('message', function(event) {
        const data = event.data;
        window._wsMessages.push({ time: Date.now(), data: typeof data === 'string' ? data : '[Binary]' });
        if (typeof data === 'string' && /speak|participant|roster/i.test(data)) {
            window._wsSpeakerData.push({ time: Date.now(), data: data });
        }
        if (window._wsMessages.length > 500) window._wsMessages.splice(0, 250);
        if (window._wsSpeakerData.length > 200) window._wsSpeakerData.splice(0, 100);
    });
    return ws;
};
"#;

const END_PHRASES: &[&str] = &[
    "meeting ended",
    "toplantı bitti",
    "you have been removed",
    "toplantıdan kaldırıldınız",
    "çağrınızdan memnun musunuz",
    "you left the meeting",
    "toplantıdan ayrıldınız",
    "the meeting has ended",
    "call ended",
    "arama sona erdi",
    "rejoin",
    "yeniden katıl",
];

const POST_MEETING_URL_MARKERS: &[&str] = &[
    "post-meeting",
    "feedback",
    "call-ended",
    "meeting-ended",
    "about:blank",
    "login.microsoftonline",
    "login.live.com",
];

const INVALID_PHRASES: &[&str] = &[
    "this meeting doesn't exist",
    "meeting doesn't exist",
    "this meeting has expired",
    "meeting has expired",
    "invalid meeting link",
    "meeting link is no longer valid",
    "meeting not found",
    "unable to join this meeting",
    "bu toplantı mevcut değil",
    "toplantı bulunamadı",
    "geçersiz toplantı linki",
    "bu toplantı süresi dolmuş",
    "toplantı bağlantısı geçersiz",
    "couldn't find the meeting",
];

const WAITING_PHRASES: &[&str] = &[
    "başkalarının katılması bekleniyor",
    "waiting for others to join",
    "when the meeting starts, we'll let people know",
];

/// Teams gives up on an empty room faster than the other platforms.
const ALONE_TIMEOUT_SECS: u64 = 120;

/// Teams launcher URL → direct web client URL.
pub fn convert_to_web_url(raw: &str) -> String {
    if !raw.contains("launcher.html") && !raw.contains("/dl/launcher") {
        return raw.to_string();
    }
    let Ok(parsed) = url::Url::parse(raw) else {
        return raw.to_string();
    };
    for (key, value) in parsed.query_pairs() {
        if key == "url" {
            let web = format!("https://teams.live.com{value}");
            tracing::info!("Teams URL dönüştürüldü: launcher -> {}", web);
            return web;
        }
    }
    raw.to_string()
}

/// Decode captured `rosterUpdate` frames into the set of active speakers.
/// Frame format: `3:::{json}` where `json.body` is base64(gzip(roster)).
pub fn decode_roster_messages(messages: &[String]) -> Vec<String> {
    let mut speakers: Vec<String> = Vec::new();
    for raw in messages {
        let Some((_, json_part)) = raw.split_once(":::") else {
            continue;
        };
        let Ok(envelope) = serde_json::from_str::<Value>(json_part) else {
            continue;
        };
        let url = envelope.get("url").and_then(Value::as_str).unwrap_or("");
        if !url.contains("/rosterUpdate/") {
            continue;
        }
        let Some(body_b64) = envelope.get("body").and_then(Value::as_str) else {
            continue;
        };
        let Ok(compressed) = base64::engine::general_purpose::STANDARD.decode(body_b64) else {
            continue;
        };
        let mut decoder = GzDecoder::new(compressed.as_slice());
        let mut text = String::new();
        if decoder.read_to_string(&mut text).is_err() {
            continue;
        }
        let Ok(roster) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        collect_roster_speakers(&roster, &mut speakers);
    }
    speakers
}

fn collect_roster_speakers(roster: &Value, speakers: &mut Vec<String>) {
    let Some(participants) = roster.get("participants").and_then(Value::as_object) else {
        return;
    };
    for participant in participants.values() {
        let Some(name) = participant
            .pointer("/details/displayName")
            .and_then(Value::as_str)
        else {
            continue;
        };
        let Some(endpoints) = participant.get("endpoints").and_then(Value::as_object) else {
            continue;
        };
        let speaking = endpoints.values().any(|endpoint| {
            ["call", "lobby"].iter().any(|location| {
                endpoint
                    .get(*location)
                    .and_then(|loc| loc.get("mediaStreams"))
                    .and_then(Value::as_array)
                    .map(|streams| {
                        streams.iter().any(|stream| {
                            stream.get("type").and_then(Value::as_str) == Some("audio")
                                && ["isActiveSpeaker", "isSpeaking", "speaking"].iter().any(|flag| {
                                    stream.get(*flag).and_then(Value::as_bool).unwrap_or(false)
                                })
                        })
                    })
                    .unwrap_or(false)
            })
        });
        if speaking && !speakers.iter().any(|s| s == name) {
            speakers.push(name.to_string());
        }
    }
}

#[derive(Debug, Deserialize)]
struct GridScan {
    speakers: Vec<String>,
    unmuted: Vec<String>,
    all: Vec<String>,
}

pub struct TeamsClient {
    meeting_url: String,
    bot_name: String,
    store: IpcStore,
    session: Option<BrowserSession>,
    cached_participants: Vec<String>,
    alone_since: Option<Instant>,
    no_controls_count: u32,
}

impl TeamsClient {
    pub fn new(meeting_url: &str, bot_name: &str, store: IpcStore) -> Self {
        Self {
            meeting_url: convert_to_web_url(meeting_url),
            bot_name: bot_name.to_string(),
            store,
            session: None,
            cached_participants: Vec::new(),
            alone_since: None,
            no_controls_count: 0,
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

    /// Drain the captured speaker-related WebSocket frames.
    async fn ws_speaker_frames(&self) -> Vec<String> {
        let js = "return (window._wsSpeakerData || []).slice(-50).map(m => m.data);";
        match self.session() {
            Ok(session) => session.eval(js).await.unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    async fn hangup_visible(&self) -> bool {
        let js = r#"
const selectors = [
    "button[data-tid='hangup-button']", "button[id='hangup-button']",
    "button[aria-label='Leave']", "button[aria-label='Ayrıl']"
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

    async fn configure_av(&self) -> Result<()> {
        let session = self.session()?;

        // Make sure computer audio is active so the device menus exist
        let _: Option<String> = session
            .eval(&js_click_button(&["bilgisayar sesi", "computer audio"], false))
            .await
            .unwrap_or(None);
        sleep(Duration::from_secs(1)).await;

        // Speaker -> CABLE Input, with a short retry loop
        for attempt in 1..=3 {
            let open_js = r#"
const els = Array.from(document.querySelectorAll('*'))
    .filter(el => (el.offsetWidth || el.offsetHeight) &&
                  ((el.innerText || '').includes('Hoparlör') || (el.innerText || '').includes('Speaker')) &&
                  el.children.length < 4);
if (!els.length) return null;
const target = els[els.length - 1];
if ((target.innerText || '').includes('CABLE Input')) return 'already';
target.click();
return 'opened';
"#;
            let opened: Option<String> = session.eval(open_js).await.unwrap_or(None);
            match opened.as_deref() {
                Some("already") => {
                    tracing::info!("Hoparlör zaten CABLE Input");
                    break;
                }
                Some(_) => {
                    sleep(Duration::from_secs(1)).await;
                    let pick_js = r#"
const opt = Array.from(document.querySelectorAll("li[role='option'], span"))
    .find(o => (o.offsetWidth || o.offsetHeight) && (o.innerText || '').includes('CABLE Input'));
if (!opt) return false;
opt.click();
return true;
"#;
                    if session.eval::<bool>(pick_js).await.unwrap_or(false) {
                        tracing::info!("CABLE Input menüden seçildi");
                        break;
                    }
                }
                None => {
                    tracing::warn!("Hoparlör/Speaker yazısı bulunamadı (deneme {})", attempt);
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }

        // Camera and microphone toggles default to on in the pre-join screen
        for (label_fragment, name) in [("amera", "kamera"), ("ikrofon", "mikrofon"), ("icrophone", "mikrofon")] {
            let js = format!(
                r#"
for (const el of document.querySelectorAll("[aria-label*='{label_fragment}'], [title*='{label_fragment}']")) {{
    if (el.getAttribute('aria-checked') === 'true') {{
        el.click();
        return true;
    }}
}}
return false;
"#
            );
            if session.eval::<bool>(&js).await.unwrap_or(false) {
                tracing::info!("{} kapatıldı", name);
                sleep(Duration::from_millis(500)).await;
            }
        }
        Ok(())
    }

    fn grid_scan_js() -> &'static str {
        r#"
const speakers = [];
const unmuted = [];
const all = [];
const clean = (s) => (s || '').split('\n')[0].trim();

for (const el of document.querySelectorAll("div[data-tid][data-stream-type]")) {
    const name = clean(el.getAttribute('data-tid'));
    if (!name) continue;
    if (!all.includes(name)) all.push(name);
    const style = el.getAttribute('style') || '';
    if ((style.includes('outline') || style.includes('box-shadow') || style.includes('border')) &&
        style.includes('rgb')) {
        if (!speakers.includes(name)) speakers.push(name);
        continue;
    }
    // Unmuted mic icon: filled path without the muted slash fragment
    for (const path of el.querySelectorAll('.ui-icon svg path')) {
        const d = path.getAttribute('d') || '';
        if (d.includes('15 15') || d.includes('16 16') || d.includes('l15 15')) continue;
        if ((path.getAttribute('class') || '').includes('ui-icon__filled')) {
            if (!unmuted.includes(name)) unmuted.push(name);
            break;
        }
    }
}

for (const el of document.querySelectorAll("[data-is-speaking='true'], [data-active-speaker-id]")) {
    const name = clean(el.innerText || el.getAttribute('aria-label'));
    if (name && !speakers.includes(name)) speakers.push(name);
}

// React fiber inspection: memoized props carry the activeSpeaker flag
for (const root of document.querySelectorAll("div.video-container, div[data-tid='video-tile']")) {
    const key = Object.keys(root).find(k => k.startsWith('__reactFiber'));
    if (!key) continue;
    const fiber = root[key];
    const props = fiber.memoizedProps || fiber.pendingProps;
    if (props && (props.activeSpeaker || props.isSpeaking || props.speaking)) {
        const name = clean(props.displayName || props.name || root.innerText);
        if (name && !speakers.includes(name)) speakers.push(name);
    }
}

// Side-panel list rows
const list = document.querySelectorAll("ul[role='list'] li[role='listitem'], div[role='list'] div[role='listitem']");
for (const li of list) {
    const aria = (li.getAttribute('aria-label') || '');
    const name = clean(li.innerText || aria);
    if (!name) continue;
    if (!all.includes(name)) all.push(name);
    const lower = aria.toLowerCase();
    if (li.getAttribute('data-is-speaking') === 'true' ||
        lower.includes('konuşuyor') || lower.includes('speaking')) {
        if (!speakers.includes(name)) speakers.push(name);
        continue;
    }
    if (lower.includes('muted') && !lower.includes('unmuted')) continue;
    const paths = li.querySelectorAll('svg path');
    if (paths.length) {
        let mutedIcon = false;
        for (const p of paths) {
            const d = p.getAttribute('d') || '';
            if (d.includes('15 15') || d.includes('15-15')) { mutedIcon = true; break; }
        }
        if (!mutedIcon && !unmuted.includes(name)) unmuted.push(name);
    }
}

return { speakers: [...new Set(speakers)], unmuted: [...new Set(unmuted)], all: [...new Set(all)] };
"#
    }

    async fn grid_scan(&self) -> Option<GridScan> {
        match self.session() {
            Ok(session) => session.eval(Self::grid_scan_js()).await.ok(),
            Err(_) => None,
        }
    }
}

#[async_trait]
impl MeetingClient for TeamsClient {
    fn platform(&self) -> Platform {
        Platform::Teams
    }

    async fn start(&mut self) -> Result<()> {
        tracing::info!("Teams için tarayıcı başlatılıyor");
        let session = BrowserSession::launch(&[TEAMS_BOOTSTRAP_JS]).await?;
        self.session = Some(session);
        Ok(())
    }

    async fn join(&mut self) -> Result<bool> {
        if self.stop_requested() {
            return Ok(false);
        }
        let url = self.meeting_url.clone();
        tracing::info!("Linke gidiliyor: {}", url);
        self.session()?.goto(&url).await?;
        sleep(Duration::from_secs(2)).await;

        // Native-app dialog cannot be reached via the DOM
        self.session()?.press_escape_burst(3).await;

        // Launcher bypass in case the redirect put us back on it
        let current = self.session()?.current_url().await;
        if current.contains("launcher") {
            let direct = convert_to_web_url(&current);
            if direct != current {
                tracing::info!("Launcher tespit edildi, doğrudan gidiliyor: {}", direct);
                self.session()?.goto(&direct).await?;
                sleep(Duration::from_secs(2)).await;
            }
            if self.session()?.current_url().await.contains("launcher") {
                // Last resort: the page's own web-join button
                let _: Option<String> = self
                    .session()?
                    .eval(&js_click_button(
                        &[
                            "bu tarayıcıda",
                            "continue on this browser",
                            "use the web app",
                        ],
                        false,
                    ))
                    .await
                    .unwrap_or(None);
                sleep(Duration::from_secs(5)).await;
            }
        }

        // Identify
        let filled = self
            .session()?
            .fill_input(
                "input[data-tid='prejoin-display-name-input'], input[placeholder='Adınızı yazın'], input[placeholder='Type your name'], input[type='text']",
                &self.bot_name,
            )
            .await
            .unwrap_or(false);
        if filled {
            tracing::info!("İsim girildi: {}", self.bot_name);
        } else {
            tracing::warn!("İsim girme başarısız (kritik değil, devam ediliyor)");
        }

        if let Err(e) = self.configure_av().await {
            tracing::warn!("AV ayar hatası: {}", e);
        }
        if self.stop_requested() {
            return Ok(false);
        }

        // Submit
        let mut submitted = false;
        for attempt in 1..=3 {
            let clicked: Option<String> = self
                .session()?
                .eval(&js_click_button(
                    &["şimdi katıl", "join now", "katıl"],
                    false,
                ))
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

        // Admission: the hangup button is the definitive in-meeting signal
        let started = Instant::now();
        let mut waiting_logged = false;
        loop {
            if started.elapsed().as_secs() > LOBBY_WAIT_SECS {
                tracing::error!("Bekleme süresi doldu ({}s)", LOBBY_WAIT_SECS);
                return Ok(false);
            }
            if self.hangup_visible().await {
                tracing::info!("Toplantıya katılım başarılı");
                return Ok(true);
            }
            let body = self.session()?.body_text().await;
            if WAITING_PHRASES.iter().any(|p| body.contains(p))
                || body.contains("let you in")
                || body.contains("kabul edilmeyi bekliyorsunuz")
            {
                if !waiting_logged {
                    tracing::info!("Lobi algılandı, kabul bekleniyor");
                    waiting_logged = true;
                }
            }
            if self.stop_requested() {
                tracing::info!("Lobide STOP komutu alındı");
                return Ok(false);
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
        sleep(Duration::from_millis(1500)).await;

        let editor_selectors = [
            "div[data-tid='ckeditor-replyConversation'] div[contenteditable='true']",
            "div[contenteditable='true'][role='textbox']",
            "div[contenteditable='true']",
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
            tracing::warn!("Chat editörü bulunamadı");
            return Ok(false);
        }
        sleep(Duration::from_millis(300)).await;

        let tier = session.type_text_tiered(&message).await?;
        session.press_enter().await?;
        tracing::info!("Chat mesajı gönderildi ({})", tier);

        if opened_by_us {
            sleep(Duration::from_millis(500)).await;
            let _: Option<String> = session
                .eval(&js_click_button(&["chat", "sohbet"], false))
                .await
                .unwrap_or(None);
        }
        Ok(true)
    }

    async fn open_participants_panel(&mut self) -> Result<bool> {
        let session = self.session()?;
        let result: Option<String> = session
            .eval(&js_click_button(
                &["people", "kişiler", "participants", "katılımcı"],
                true,
            ))
            .await
            .unwrap_or(None);
        match result.as_deref() {
            Some("pressed") => Ok(true),
            Some(label) => {
                tracing::info!("Katılımcı listesi açıldı: {}", label);
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
        // WebSocket roster first. A short retry covers the frame cadence.
        let mut frames = self.ws_speaker_frames().await;
        let mut speakers = decode_roster_messages(&frames);
        if speakers.is_empty() {
            sleep(Duration::from_secs(2)).await;
            frames = self.ws_speaker_frames().await;
            speakers = decode_roster_messages(&frames);
        }
        let speakers: Vec<String> = speakers
            .into_iter()
            .map(|n| clean_display_name(&n))
            .filter(|n| !is_excluded_name(n, TEAMS_PLATFORM_WORDS))
            .collect();
        if !speakers.is_empty() {
            tracing::debug!("Konuşanlar (WebSocket): {}", speakers.join(", "));
            return Ok(speakers);
        }

        // DOM fallback: grid and list scan
        let Some(scan) = self.grid_scan().await else {
            return Ok(Vec::new());
        };
        let all: Vec<String> = scan
            .all
            .into_iter()
            .map(|n| clean_display_name(&n))
            .filter(|n| !is_excluded_name(n, TEAMS_PLATFORM_WORDS))
            .collect();
        if !all.is_empty() {
            self.cached_participants = all;
        }

        let visual: Vec<String> = scan
            .speakers
            .into_iter()
            .map(|n| clean_display_name(&n))
            .filter(|n| !is_excluded_name(n, TEAMS_PLATFORM_WORDS))
            .collect();
        if !visual.is_empty() {
            return Ok(visual);
        }
        // Unmuted-mic names are the explicit last resort
        Ok(scan
            .unmuted
            .into_iter()
            .map(|n| clean_display_name(&n))
            .filter(|n| !is_excluded_name(n, TEAMS_PLATFORM_WORDS))
            .collect())
    }

    async fn participants(&mut self) -> Result<Vec<String>> {
        if let Some(scan) = self.grid_scan().await {
            let all: Vec<String> = scan
                .all
                .into_iter()
                .map(|n| clean_display_name(&n))
                .filter(|n| !is_excluded_name(n, TEAMS_PLATFORM_WORDS))
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
            tracing::info!("Sayfa kapanmış, toplantı bitti");
            return Ok(Some(EndReason::Normal));
        }

        let current_url = session.current_url().await.to_lowercase();
        if POST_MEETING_URL_MARKERS.iter().any(|m| current_url.contains(m)) {
            tracing::info!("URL bitiş göstergesi tespit edildi: {}", current_url);
            return Ok(Some(EndReason::Normal));
        }

        let body = session.body_text().await;
        if let Some(phrase) = END_PHRASES.iter().find(|p| body.contains(**p)) {
            tracing::info!("Toplantı bitiş mesajı tespit edildi: {}", phrase);
            return Ok(Some(EndReason::Normal));
        }
        if let Some(phrase) = INVALID_PHRASES.iter().find(|p| body.contains(**p)) {
            tracing::warn!("Geçersiz Teams toplantısı tespit edildi: {}", phrase);
            return Ok(Some(EndReason::Invalid(format!(
                "Geçersiz Teams toplantısı: {phrase}"
            ))));
        }

        // Hangup button lost on three consecutive checks
        if self.hangup_visible().await {
            self.no_controls_count = 0;
        } else {
            self.no_controls_count += 1;
            if self.no_controls_count >= 3 {
                tracing::info!(
                    "Toplantı kontrolleri {} ardışık kontrolde bulunamadı, toplantı bitmiş",
                    self.no_controls_count
                );
                return Ok(Some(EndReason::Normal));
            }
        }

        // Alone / waiting-for-others timer
        let mut is_waiting = WAITING_PHRASES.iter().any(|p| body.contains(p));
        if !is_waiting {
            if let Some(scan) = self.grid_scan().await {
                let count = scan
                    .all
                    .iter()
                    .filter(|n| !is_excluded_name(n, TEAMS_PLATFORM_WORDS))
                    .count();
                is_waiting = count == 1;
            }
        }
        if is_waiting {
            match self.alone_since {
                None => {
                    self.alone_since = Some(Instant::now());
                    tracing::info!("Tek kişi/bekleme modu, {}s sayaç başladı", ALONE_TIMEOUT_SECS);
                }
                Some(since) if since.elapsed().as_secs() > ALONE_TIMEOUT_SECS => {
                    tracing::info!("Bekleme/yalnızlık süresi doldu, toplantı bitmiş sayılıyor");
                    return Ok(Some(EndReason::Normal));
                }
                Some(_) => {}
            }
        } else if self.alone_since.take().is_some() {
            tracing::info!("Katılımcı geldi, bekleme sayacı sıfırlandı");
        }

        Ok(None)
    }

    async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn roster_frame(name: &str, speaking: bool) -> String {
        let roster = serde_json::json!({
            "participants": {
                "8:orgid:abc": {
                    "details": { "displayName": name },
                    "endpoints": {
                        "ep1": {
                            "call": {
                                "mediaStreams": [
                                    { "type": "audio", "isActiveSpeaker": speaking },
                                    { "type": "video", "isActiveSpeaker": true }
                                ]
                            }
                        }
                    }
                }
            }
        });
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(roster.to_string().as_bytes())
            .unwrap();
        let compressed = encoder.finish().unwrap();
        let body = base64::engine::general_purpose::STANDARD.encode(compressed);
        let envelope = serde_json::json!({
            "url": "https://api/conv/rosterUpdate/12",
            "body": body,
        });
        format!("3:::{envelope}")
    }

    #[test]
    fn roster_decode_finds_active_speaker() {
        let frames = vec![roster_frame("Ahmet Yılmaz", true)];
        assert_eq!(decode_roster_messages(&frames), vec!["Ahmet Yılmaz"]);
    }

    #[test]
    fn roster_decode_ignores_silent_and_video_streams() {
        let frames = vec![roster_frame("Sessiz Üye", false)];
        assert!(decode_roster_messages(&frames).is_empty());
    }

    #[test]
    fn roster_decode_tolerates_garbage() {
        let frames = vec![
            "not a frame".to_string(),
            "3:::{broken json".to_string(),
            "3:::{\"url\": \"/other/\", \"body\": \"xx\"}".to_string(),
            "3:::{\"url\": \"/rosterUpdate/\", \"body\": \"!!!notbase64\"}".to_string(),
        ];
        assert!(decode_roster_messages(&frames).is_empty());
    }

    #[test]
    fn launcher_urls_are_rewritten() {
        let launcher = "https://teams.live.com/dl/launcher/launcher.html?url=%2F_%23%2Fmeet%2F936319368?p=abc&type=meet";
        let web = convert_to_web_url(launcher);
        assert!(web.starts_with("https://teams.live.com/_#/meet/"));

        let plain = "https://teams.microsoft.com/l/meetup-join/xyz";
        assert_eq!(convert_to_web_url(plain), plain);
    }
}
