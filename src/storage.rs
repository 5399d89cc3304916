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

//! Thin Supabase client: object-store uploads for report artifacts and a
//! single insert into the `meetings` table. Nothing here is fatal - a failed
//! upload leaves the local file in place and the caller carries on.

use anyhow::{Context, Result};
use reqwest::Client;
use serde_json::json;
use std::path::Path;
use std::time::Duration;

use crate::config::SupabaseConfig;

pub const REPORTS_BUCKET: &str = "reports";
pub const TRANSCRIPTS_BUCKET: &str = "transcripts";

pub struct SupabaseClient {
    client: Client,
    config: SupabaseConfig,
}

impl SupabaseClient {
    pub fn new(config: SupabaseConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, config }
    }

    /// Upload a local file into a bucket and return its public URL.
    pub async fn upload_file(&self, bucket: &str, file_path: &Path) -> Result<String> {
        let file_name = file_path
            .file_name()
            .and_then(|n| n.to_str())
            .context("Upload path has no file name")?;
        let body = tokio::fs::read(file_path)
            .await
            .with_context(|| format!("Failed to read {:?}", file_path))?;

        let content_type = content_type_for(file_name);
        let url = format!(
            "{}/storage/v1/object/{}/{}",
            self.config.url, bucket, file_name
        );

        tracing::info!("Uploading {} -> {}/{}", file_name, bucket, file_name);
        let response = self
            .client
            .post(&url)
            .header("apikey", &self.config.key)
            .header("Authorization", format!("Bearer {}", self.config.key))
            .header("Content-Type", content_type)
            .header("x-upsert", "true")
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Upload failed ({}): {}", status, text);
        }

        Ok(format!(
            "{}/storage/v1/object/public/{}/{}",
            self.config.url, bucket, file_name
        ))
    }

    /// Insert one row into the `meetings` table.
    #[allow(clippy::too_many_arguments)]
    pub async fn save_meeting_record(
        &self,
        user_id: &str,
        title: &str,
        platform: &str,
        start_time: &str,
        duration: &str,
        transcript_url: Option<&str>,
        report_url: Option<&str>,
        summary_text: &str,
    ) -> Result<()> {
        let url = format!("{}/rest/v1/meetings", self.config.url);
        let row = json!({
            "user_id": user_id,
            "title": title,
            "platform": platform,
            "start_time": start_time,
            "duration": duration,
            "status": "completed",
            "summary_text": summary_text,
            "transcript_path": transcript_url,
            "report_path": report_url,
        });

        let response = self
            .client
            .post(&url)
            .header("apikey", &self.config.key)
            .header("Authorization", format!("Bearer {}", self.config.key))
            .header("Content-Type", "application/json")
            .header("Prefer", "return=minimal")
            .json(&row)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Meeting insert failed ({}): {}", status, text);
        }

        tracing::info!("Meeting row saved: {}", title);
        Ok(())
    }
}

/// Explicit UTF-8 charset on the text types so browsers render Turkish
/// characters correctly.
fn content_type_for(file_name: &str) -> &'static str {
    let lower = file_name.to_lowercase();
    if lower.ends_with(".html") {
        "text/html; charset=utf-8"
    } else if lower.ends_with(".txt") {
        "text/plain; charset=utf-8"
    } else if lower.ends_with(".json") {
        "application/json; charset=utf-8"
    } else if lower.ends_with(".pdf") {
        "application/pdf"
    } else if lower.ends_with(".webm") {
        "audio/webm"
    } else {
        "application/octet-stream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn content_types_carry_charset() {
        assert_eq!(content_type_for("rapor.html"), "text/html; charset=utf-8");
        assert_eq!(content_type_for("t.TXT"), "text/plain; charset=utf-8");
        assert_eq!(content_type_for("x.bin"), "application/octet-stream");
    }

    #[tokio::test]
    async fn upload_posts_to_storage_and_returns_public_url() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/storage/v1/object/reports/r.html")
            .match_header("x-upsert", "true")
            .with_status(200)
            .with_body("{\"Key\": \"reports/r.html\"}")
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.html");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"<html></html>").unwrap();

        let client = SupabaseClient::new(SupabaseConfig {
            url: server.url(),
            key: "test-key".to_string(),
        });
        let public = client.upload_file(REPORTS_BUCKET, &path).await.unwrap();
        assert!(public.ends_with("/storage/v1/object/public/reports/r.html"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn failed_insert_is_an_error_not_a_panic() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/rest/v1/meetings")
            .with_status(401)
            .with_body("{\"message\": \"invalid key\"}")
            .create_async()
            .await;

        let client = SupabaseClient::new(SupabaseConfig {
            url: server.url(),
            key: "bad".to_string(),
        });
        let result = client
            .save_meeting_record("u1", "T", "zoom", "2024-01-01T00:00:00Z", "5 dk", None, None, "")
            .await;
        assert!(result.is_err());
    }
}
