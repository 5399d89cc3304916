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

//! Chromium session shared by the platform adapters: launch with the right
//! flags, keep the CDP event loop alive, register pre-navigation bootstrap
//! scripts and offer the tiered input helpers the join/chat flows need.

use anyhow::{anyhow, Context, Result};
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::input::{DispatchKeyEventParams, DispatchKeyEventType};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::process::Stdio;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};

use crate::platform;

pub struct BrowserSession {
    browser: Browser,
    handler_task: JoinHandle<()>,
    page: Page,
}

impl BrowserSession {
    /// Launch Chromium headful (Linux runs under Xvfb; reliable speaker
    /// detection needs a rendered page) and open a blank page. Bootstrap
    /// scripts are installed before any navigation so platform hooks see
    /// every document from the start.
    pub async fn launch(bootstrap_scripts: &[&str]) -> Result<Self> {
        platform::setup_display();

        let mut builder = BrowserConfig::builder().with_head();
        for arg in platform::browser_launch_args(false) {
            builder = builder.arg(arg);
        }
        let config = builder.build().map_err(|e| anyhow!("browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("Failed to launch Chromium")?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .context("Failed to open page")?;

        for script in bootstrap_scripts {
            page.execute(
                AddScriptToEvaluateOnNewDocumentParams::builder()
                    .source(script.to_string())
                    .build()
                    .map_err(|e| anyhow!("bootstrap script: {e}"))?,
            )
            .await
            .context("Failed to register bootstrap script")?;
        }

        Ok(Self {
            browser,
            handler_task,
            page,
        })
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    pub async fn goto(&self, url: &str) -> Result<()> {
        self.page
            .goto(url)
            .await
            .with_context(|| format!("Navigation failed: {url}"))?;
        Ok(())
    }

    pub async fn current_url(&self) -> String {
        match self.page.url().await {
            Ok(Some(url)) => url,
            _ => String::new(),
        }
    }

    /// Evaluate a JS body (may contain `return`) and deserialize the result.
    pub async fn eval<T: DeserializeOwned>(&self, body: &str) -> Result<T> {
        let wrapped = format!("(() => {{ {body} }})()");
        let result = self
            .page
            .evaluate(wrapped)
            .await
            .context("Script evaluation failed")?;
        result
            .into_value::<T>()
            .map_err(|e| anyhow!("Script result deserialization failed: {e}"))
    }

    /// Evaluate and swallow failures; for fire-and-forget DOM pokes.
    pub async fn eval_quiet(&self, body: &str) {
        if let Err(e) = self.eval::<serde_json::Value>(body).await {
            tracing::debug!("eval_quiet: {}", e);
        }
    }

    /// Lowercased full-page text, empty on failure. Drives the text-based
    /// end/lobby detection.
    pub async fn body_text(&self) -> String {
        self.eval::<String>("return document.body ? document.body.innerText.toLowerCase() : '';")
            .await
            .unwrap_or_default()
    }

    pub async fn is_closed(&self) -> bool {
        self.page.evaluate("1 + 1").await.is_err()
    }

    async fn dispatch_key(&self, key: &str, code: &str, vk: i64) -> Result<()> {
        for kind in [DispatchKeyEventType::KeyDown, DispatchKeyEventType::KeyUp] {
            self.page
                .execute(
                    DispatchKeyEventParams::builder()
                        .r#type(kind)
                        .key(key)
                        .code(code)
                        .windows_virtual_key_code(vk)
                        .native_virtual_key_code(vk)
                        .build()
                        .map_err(|e| anyhow!("key event: {e}"))?,
                )
                .await?;
        }
        Ok(())
    }

    /// ESC bursts dismiss native app-launch prompts the DOM cannot reach.
    pub async fn press_escape_burst(&self, times: usize) {
        for i in 0..times {
            if let Err(e) = self.dispatch_key("Escape", "Escape", 27).await {
                tracing::debug!("ESC {} gönderilemedi: {}", i + 1, e);
            }
            sleep(Duration::from_millis(500)).await;
        }
    }

    pub async fn press_enter(&self) -> Result<()> {
        self.dispatch_key("Enter", "Enter", 13).await
    }

    /// Type into the currently focused editor using the tiered strategy:
    /// Linux tries the OS keyboard (`xdotool`, trusted events) first, then
    /// clipboard paste via `xclip`, then synthetic CDP key events. Other
    /// hosts go straight to synthetic events. Returns the tier used.
    pub async fn type_text_tiered(&self, text: &str) -> Result<&'static str> {
        if cfg!(target_os = "linux") {
            if self.try_xdotool(text).await {
                return Ok("xdotool");
            }
            if self.try_xclip_paste(text).await {
                return Ok("xclip");
            }
        }
        self.type_text_synthetic(text).await?;
        Ok("synthetic")
    }

    async fn try_xdotool(&self, text: &str) -> bool {
        let result = tokio::process::Command::new("xdotool")
            .args(["type", "--clearmodifiers", "--delay", "50", text])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match result {
            Ok(status) if status.success() => true,
            Ok(status) => {
                tracing::debug!("xdotool rc={:?}", status.code());
                false
            }
            Err(_) => false,
        }
    }

    async fn try_xclip_paste(&self, text: &str) -> bool {
        use tokio::io::AsyncWriteExt;
        let spawned = tokio::process::Command::new("xclip")
            .args(["-selection", "clipboard"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        let Ok(mut child) = spawned else {
            return false;
        };
        if let Some(mut stdin) = child.stdin.take() {
            if stdin.write_all(text.as_bytes()).await.is_err() {
                return false;
            }
        }
        if !matches!(child.wait().await, Ok(s) if s.success()) {
            return false;
        }
        // Ctrl+V into the focused editor
        let paste = async {
            self.dispatch_modified_key("v", "KeyV", 86, 2).await
        };
        paste.await.is_ok()
    }

    async fn dispatch_modified_key(&self, key: &str, code: &str, vk: i64, modifiers: i64) -> Result<()> {
        for kind in [DispatchKeyEventType::KeyDown, DispatchKeyEventType::KeyUp] {
            self.page
                .execute(
                    DispatchKeyEventParams::builder()
                        .r#type(kind)
                        .key(key)
                        .code(code)
                        .windows_virtual_key_code(vk)
                        .native_virtual_key_code(vk)
                        .modifiers(modifiers)
                        .build()
                        .map_err(|e| anyhow!("key event: {e}"))?,
                )
                .await?;
        }
        Ok(())
    }

    /// Keyboard shortcut with Ctrl held (Meet: Ctrl+D / Ctrl+E toggles).
    pub async fn press_ctrl_shortcut(&self, letter: char) -> Result<()> {
        let key = letter.to_string();
        let code = format!("Key{}", letter.to_ascii_uppercase());
        let vk = letter.to_ascii_uppercase() as i64;
        self.dispatch_modified_key(&key, &code, vk, 2).await
    }

    async fn type_text_synthetic(&self, text: &str) -> Result<()> {
        if let Ok(element) = self.page.find_element("textarea, div[contenteditable='true'], input[type='text']").await {
            element.type_str(text).await?;
            return Ok(());
        }
        // No obvious editor: send char events to whatever has focus
        for ch in text.chars() {
            let params = DispatchKeyEventParams::builder()
                .r#type(DispatchKeyEventType::Char)
                .text(ch.to_string())
                .build()
                .map_err(|e| anyhow!("char event: {e}"))?;
            self.page.execute(params).await?;
        }
        Ok(())
    }

    /// Fill an input by CSS selector: element typing first, native-setter JS
    /// fallback (some React inputs ignore synthetic keystrokes).
    pub async fn fill_input(&self, selectors: &str, value: &str) -> Result<bool> {
        if let Ok(element) = self.page.find_element(selectors).await {
            if element.click().await.is_ok() {
                if element.type_str(value).await.is_ok() {
                    return Ok(true);
                }
            }
        }
        let escaped_value = value.replace('\\', "\\\\").replace('\'', "\\'");
        let escaped_sel = selectors.replace('\\', "\\\\").replace('\'', "\\'");
        let body = format!(
            r#"
const input = document.querySelector('{escaped_sel}');
if (!input) return false;
const setter = Object.getOwnPropertyDescriptor(window.HTMLInputElement.prototype, 'value').set;
setter.call(input, '{escaped_value}');
input.dispatchEvent(new Event('input', {{ bubbles: true }}));
input.dispatchEvent(new Event('change', {{ bubbles: true }}));
return true;
"#
        );
        self.eval::<bool>(&body).await
    }

    /// Close page then browser, each step tolerating failure; kill the
    /// browser process if it is still alive afterwards.
    pub async fn close(mut self) {
        if let Err(e) = self.page.close().await {
            tracing::debug!("Sayfa kapatma hatası (önemsiz): {}", e);
        }
        if let Err(e) = self.browser.close().await {
            tracing::debug!("Browser kapatma hatası (önemsiz): {}", e);
        }
        match timeout(Duration::from_secs(20), self.browser.wait()).await {
            Ok(Ok(_)) => tracing::info!("Tarayıcı kapandı"),
            _ => {
                tracing::warn!("Tarayıcı 20 sn içinde kapanmadı, zorla kapatılıyor");
                if let Some(result) = self.browser.kill().await {
                    if let Err(e) = result {
                        tracing::debug!("Browser kill hatası: {}", e);
                    }
                }
            }
        }
        self.handler_task.abort();
    }
}
