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

//! Meeting clients: one capability trait, three platform adapters. All
//! cross-component state goes through the IPC store; the adapters only own
//! their browser session.

pub mod browser;
pub mod meet;
pub mod teams;
pub mod zoom;

use anyhow::Result;
use async_trait::async_trait;

use crate::ipc::IpcStore;
use crate::types::{EndReason, Platform};

/// Lobby admission is bounded to ten minutes.
pub const LOBBY_WAIT_SECS: u64 = 600;
/// Re-opening an apparently closed participants panel is rate limited.
pub const PANEL_REOPEN_COOLDOWN_SECS: u64 = 3;

/// Capability set every platform adapter implements. The worker only ever
/// talks to this trait; dispatch happens on the Job's `platform` tag.
#[async_trait]
pub trait MeetingClient: Send {
    fn platform(&self) -> Platform;

    /// Launch the browser and install platform hooks. Does not navigate.
    async fn start(&mut self) -> Result<()>;

    /// Run the full join flow. `true` means admitted to the meeting.
    async fn join(&mut self) -> Result<bool>;

    /// Post a chat message. Best effort; `false` when every tier failed.
    async fn send_chat(&mut self, message: &str) -> Result<bool>;

    async fn open_participants_panel(&mut self) -> Result<bool>;
    async fn close_participants_panel(&mut self) -> Result<bool>;

    /// Currently speaking participants, tiered per platform.
    async fn active_speakers(&mut self) -> Result<Vec<String>>;

    /// Known participants (panel preferred, grid fallback, cached).
    async fn participants(&mut self) -> Result<Vec<String>>;

    /// `Some(reason)` once the meeting is over or the link turned out bad.
    async fn check_meeting_ended(&mut self) -> Result<Option<EndReason>>;

    /// Meet only; the other platforms report `false`.
    async fn enable_captions(&mut self) -> Result<bool> {
        Ok(false)
    }

    /// Close incidental popups ("Anladım", "Got it", ...). Default no-op.
    async fn dismiss_popups(&mut self) -> Result<()> {
        Ok(())
    }

    /// Tear the browser down; every step tolerates failure.
    async fn close(&mut self);
}

/// Build the adapter for a job's platform.
pub fn create_client(
    platform: Platform,
    meeting_url: &str,
    bot_name: &str,
    passcode: Option<&str>,
    store: IpcStore,
) -> Box<dyn MeetingClient> {
    match platform {
        Platform::Zoom => Box::new(zoom::ZoomClient::new(meeting_url, bot_name, passcode, store)),
        Platform::Teams => Box::new(teams::TeamsClient::new(meeting_url, bot_name, store)),
        Platform::Meet => Box::new(meet::MeetClient::new(meeting_url, bot_name, store)),
    }
}

/// Labels that must never be reported as a speaker or participant: the bot
/// itself, panel/localhost windows, UI glyph strings and material icon names.
pub const EXCLUDED_NAME_FRAGMENTS: &[&str] = &[
    "frame",
    "pen_spark",
    "spark_io",
    "sesly",
    "toplantı botu",
    "meeting bot",
    "localhost",
    "panel",
    "katılım isteği",
    "join request",
];

/// Per-platform chrome words appended to the shared exclusion list.
pub fn is_excluded_name(name: &str, platform_words: &[&str]) -> bool {
    let lower = name.to_lowercase();
    let lower = lower.trim();
    if lower.is_empty() || lower.len() > 60 {
        return true;
    }
    EXCLUDED_NAME_FRAGMENTS
        .iter()
        .chain(platform_words.iter())
        .any(|ex| lower.contains(ex))
}

/// Strip host/self markers a roster row decorates the display name with.
pub fn clean_display_name(raw: &str) -> String {
    raw.replace("(Me)", "")
        .replace("(Host)", "")
        .replace("(Co-host)", "")
        .lines()
        .next()
        .unwrap_or("")
        .trim()
        .to_string()
}

pub const CHAT_FALLBACK_MESSAGE: &str =
    "Merhaba! Ben Sesly Bot. Bu toplantiyi kaydediyorum.";

/// Keep ASCII plus Turkish letters; emoji and exotic symbols break the
/// OS-level typing tier. An empty result falls back to a fixed message.
pub fn sanitize_chat_message(message: &str) -> String {
    const TURKISH: &str = "çÇğĞıİöÖşŞüÜ";
    let cleaned: String = message
        .chars()
        .filter(|c| c.is_ascii() || TURKISH.contains(*c))
        .collect();
    let cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.trim().is_empty() {
        CHAT_FALLBACK_MESSAGE.to_string()
    } else {
        cleaned
    }
}

/// JS fragment deciding whether a border/outline/shadow color marks a
/// speaking tile: anything that is not black, white or near-gray
/// (|R-G|,|G-B|,|R-B| all < 30) counts as a highlight color.
pub const JS_SPEAKING_COLOR_FN: &str = r#"
function isSpeakingColor(colorStr) {
    if (!colorStr) return false;
    const match = colorStr.match(/rgb\((\d+),\s*(\d+),\s*(\d+)\)/);
    if (!match) return false;
    const r = parseInt(match[1]), g = parseInt(match[2]), b = parseInt(match[3]);
    if (r < 30 && g < 30 && b < 30) return false;
    if (r > 225 && g > 225 && b > 225) return false;
    const maxDiff = Math.max(Math.abs(r-g), Math.abs(g-b), Math.abs(r-b));
    if (maxDiff < 30) return false;
    return true;
}
"#;

/// JS that finds the first visible `button`/`div[role=button]` whose text,
/// aria-label or tooltip contains one of the keywords and clicks it.
/// Returns the matched label, `"pressed"` when the target was already in the
/// pressed state and `require_unpressed` was requested, or `null`.
pub fn js_click_button(keywords: &[&str], require_unpressed: bool) -> String {
    let list = serde_json::to_string(keywords).unwrap_or_else(|_| "[]".to_string());
    format!(
        r#"
const keywords = {list};
const candidates = document.querySelectorAll("button, div[role='button']");
for (const btn of candidates) {{
    if (!(btn.offsetWidth || btn.offsetHeight || btn.getClientRects().length)) continue;
    const label = ((btn.getAttribute('aria-label') || '') + ' ' +
                   (btn.innerText || '') + ' ' +
                   (btn.getAttribute('data-tooltip') || '')).toLowerCase();
    if (!keywords.some(k => label.includes(k))) continue;
    if ({require_unpressed} && btn.getAttribute('aria-pressed') === 'true') return 'pressed';
    btn.click();
    return label.trim().substring(0, 80);
}}
return null;
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excluded_names_catch_bot_and_ui_glyphs() {
        for name in ["Sesly Bot", "frame", "pen_spark", "localhost:9000", "Bot Panel", ""] {
            assert!(is_excluded_name(name, &[]), "{name} should be excluded");
        }
        assert!(!is_excluded_name("Yusuf Batkitar", &[]));
        assert!(is_excluded_name("Google Meet", &["google meet"]));
        assert!(!is_excluded_name("Mehmet", &["google meet"]));
    }

    #[test]
    fn display_name_cleaning() {
        assert_eq!(clean_display_name("Ali Kaya (Host)"), "Ali Kaya");
        assert_eq!(clean_display_name("Ayşe\nOrganizatör"), "Ayşe");
        assert_eq!(clean_display_name("  Veli (Me) "), "Veli");
    }

    #[test]
    fn chat_sanitizer_keeps_turkish_drops_emoji() {
        let msg = "Merhaba! 👋 Ben Sesly Bot 🤖 kayıt alıyorum.";
        let clean = sanitize_chat_message(msg);
        assert!(clean.contains("kayıt alıyorum."));
        assert!(!clean.contains('👋'));
        // Emoji-only message falls back to the fixed text
        assert_eq!(sanitize_chat_message("🤖🎥"), CHAT_FALLBACK_MESSAGE);
    }

    #[test]
    fn click_button_js_embeds_keywords() {
        let js = js_click_button(&["katılımcı", "participants"], true);
        assert!(js.contains("katılımcı"));
        assert!(js.contains("aria-pressed"));
    }
}
