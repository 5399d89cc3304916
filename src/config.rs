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

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct SupabaseConfig {
    pub url: String,
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub gemini: Option<GeminiConfig>,
    pub supabase: Option<SupabaseConfig>,
    pub api_host: String,
    pub api_port: u16,
    pub bot_display_name: String,
    pub ffmpeg_path: Option<String>,
    /// Directory the recorder writes `chunk_NNN.webm` files into.
    pub segment_dir: PathBuf,
    /// Directory report artifacts land in before (and after) upload.
    pub reports_dir: PathBuf,
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load environment variables from .env file if it exists
        dotenv::dotenv().ok();

        let gemini = match env::var("GEMINI_API_KEY") {
            Ok(api_key) if !api_key.trim().is_empty() => Some(GeminiConfig {
                api_key,
                model: env::var("GEMINI_MODEL").unwrap_or_else(|_| "gemini-2.0-flash".to_string()),
            }),
            _ => {
                tracing::warn!("GEMINI_API_KEY not set - transcription and reports disabled");
                None
            }
        };

        // Service role key is preferred for backend writes; the anon key works
        // for public buckets.
        let supabase_key = env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| env::var("SUPABASE_KEY"))
            .ok();
        let supabase = match (env::var("SUPABASE_URL").ok(), supabase_key) {
            (Some(url), Some(key)) if !url.trim().is_empty() => Some(SupabaseConfig {
                url: url.trim_end_matches('/').to_string(),
                key,
            }),
            _ => {
                tracing::warn!("SUPABASE_URL / key not set - cloud persistence disabled");
                None
            }
        };

        let api_host = env::var("API_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let api_port = env::var("API_PORT")
            .or_else(|_| env::var("PORT"))
            .unwrap_or_else(|_| "9000".to_string())
            .parse::<u16>()
            .unwrap_or(9000);

        let bot_display_name =
            env::var("BOT_DISPLAY_NAME").unwrap_or_else(|_| "Sesly Bot".to_string());

        let segment_dir = env::var("SEGMENT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("sesly_segments"));
        std::fs::create_dir_all(&segment_dir).context("Failed to create segment directory")?;

        let reports_dir = PathBuf::from("temp_reports");
        std::fs::create_dir_all(&reports_dir).context("Failed to create reports directory")?;

        Ok(Config {
            gemini,
            supabase,
            api_host,
            api_port,
            bot_display_name,
            ffmpeg_path: env::var("FFMPEG_PATH").ok().filter(|s| !s.trim().is_empty()),
            segment_dir,
            reports_dir,
        })
    }

    /// Endpoint the recorder uploads finalized segments to.
    pub fn transcribe_url(&self) -> String {
        format!("http://{}:{}/transcribe-webm", self.api_host, self.api_port)
    }
}
