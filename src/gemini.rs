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

//! Thin Gemini REST client. One call shape (`generateContent`) serves both
//! the audio transcription and the report synthesis paths.

use base64::Engine;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::GeminiConfig;

#[derive(Debug, thiserror::Error)]
pub enum GeminiError {
    /// HTTP 429 that is worth retrying with backoff.
    #[error("Gemini rate limited")]
    RateLimited,
    /// Daily quota exhausted - retrying is pointless until tomorrow.
    #[error("Gemini daily quota exhausted")]
    QuotaExhausted,
    #[error("Gemini API error: {0}")]
    Api(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

pub struct GeminiClient {
    client: Client,
    config: GeminiConfig,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, config }
    }

    /// Transcribe one audio segment. The prompt carries the diarization
    /// instructions; the audio rides along as an inline base64 part.
    pub async fn transcribe_audio(
        &self,
        audio: &[u8],
        mime_type: &str,
        prompt: &str,
    ) -> Result<String, GeminiError> {
        let body = json!({
            "contents": [{
                "parts": [
                    { "text": prompt },
                    {
                        "inline_data": {
                            "mime_type": mime_type,
                            "data": base64::engine::general_purpose::STANDARD.encode(audio),
                        }
                    }
                ]
            }]
        });
        self.generate(body).await
    }

    /// Text-only generation (report synthesis).
    pub async fn generate_text(&self, prompt: &str) -> Result<String, GeminiError> {
        let body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }]
        });
        self.generate(body).await
    }

    async fn generate(&self, body: Value) -> Result<String, GeminiError> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.config.model, self.config.api_key
        );

        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if status.as_u16() == 429 {
            if is_daily_quota_error(&text) {
                return Err(GeminiError::QuotaExhausted);
            }
            return Err(GeminiError::RateLimited);
        }
        if !status.is_success() {
            return Err(GeminiError::Api(format!("HTTP {}: {}", status, truncate(&text, 500))));
        }

        let value: Value = serde_json::from_str(&text)
            .map_err(|e| GeminiError::Api(format!("unparsable response: {e}")))?;
        extract_text(&value).ok_or_else(|| {
            GeminiError::Api(format!("no candidates in response: {}", truncate(&text, 300)))
        })
    }
}

/// Join the text parts of the first candidate.
fn extract_text(value: &Value) -> Option<String> {
    let parts = value
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .as_array()?;
    let joined: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("");
    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}

/// A 429 that names a per-day quota metric will keep failing all day;
/// everything else on 429 is a per-minute limit worth backing off on.
fn is_daily_quota_error(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("perday") || lower.contains("per day") || lower.contains("daily")
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_text_joins_parts() {
        let value = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "Merhaba " }, { "text": "dünya" }] }
            }]
        });
        assert_eq!(extract_text(&value).unwrap(), "Merhaba dünya");
    }

    #[test]
    fn extract_text_handles_empty_response() {
        assert!(extract_text(&json!({"candidates": []})).is_none());
        assert!(extract_text(&json!({})).is_none());
    }

    #[test]
    fn daily_quota_detection() {
        assert!(is_daily_quota_error(
            "{\"error\": {\"message\": \"Quota exceeded for metric GenerateRequestsPerDayPerProject\"}}"
        ));
        assert!(!is_daily_quota_error(
            "{\"error\": {\"message\": \"Resource exhausted, retry in 30s\"}}"
        ));
    }
}
