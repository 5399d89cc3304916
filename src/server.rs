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

//! HTTP edge: job submission, bot commands, status, the transcription
//! endpoint the recorder uploads into, and force-reset. Report artifacts are
//! served statically out of `temp_reports/`.

use anyhow::{Context, Result};
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::gemini::GeminiClient;
use crate::ipc::IpcStore;
use crate::platform;
use crate::report;
use crate::transcription;
use crate::types::{now_ts, BotCommand, CommandKind, Job, Platform};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: IpcStore,
    pub gemini: Option<Arc<GeminiClient>>,
}

pub fn build_router(state: AppState) -> Router {
    let reports_dir = state.config.reports_dir.clone();
    Router::new()
        .route("/start-bot", post(start_bot))
        .route("/bot-command", post(bot_command))
        .route("/bot-status", get(bot_status))
        .route("/transcribe-webm", post(transcribe_webm))
        .route("/force-reset", post(force_reset))
        .nest_service("/reports", ServeDir::new(reports_dir))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(config: Config, store: IpcStore) -> Result<()> {
    // Leftover reports from a previous run are stale by definition
    store.prune_reports_dir(&config.reports_dir);

    let gemini = config
        .gemini
        .clone()
        .map(|cfg| Arc::new(GeminiClient::new(cfg)));
    let addr = format!("{}:{}", config.api_host, config.api_port);
    let state = AppState {
        config: Arc::new(config),
        store,
        gemini,
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Bind failed: {addr}"))?;
    tracing::info!("API dinliyor: http://{}", addr);
    axum::serve(listener, app).await.context("Server crashed")?;
    Ok(())
}

// ---- /start-bot ---------------------------------------------------------

#[derive(Debug, Deserialize)]
struct StartBotRequest {
    platform: String,
    meeting_url: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ZoomTarget {
    pub url: String,
    pub meeting_id: String,
    pub passcode: Option<String>,
}

lazy_static! {
    static ref ZOOM_URL_ID_RE: Regex = Regex::new(r"/(?:j|wc)/(\d{8,12})").unwrap();
    static ref ZOOM_PWD_RE: Regex = Regex::new(r"[?&]pwd=([A-Za-z0-9.\-_]+)").unwrap();
    static ref ZOOM_FREETEXT_ID_RE: Regex =
        Regex::new(r"(?i)meeting\s*id\s*[:\s]\s*([\d][\d\s]{7,14}\d)").unwrap();
    static ref ZOOM_FREETEXT_PWD_RE: Regex =
        Regex::new(r"(?i)(?:parola|passcode|password)\s*[:\s]\s*(\S+)").unwrap();
    static ref BARE_ID_RE: Regex = Regex::new(r"^\s*(\d{9,11})\s*$").unwrap();
}

/// Resolve the many ways users paste Zoom meetings: a launcher/web URL, a
/// bare numeric id, or free text like "Meeting ID: 123 456 789  Parola: x".
pub fn parse_zoom_input(input: &str, password: Option<&str>) -> Option<ZoomTarget> {
    let input = input.trim();

    if input.contains("zoom.us") || input.contains("/j/") || input.contains("/wc/") {
        let meeting_id = ZOOM_URL_ID_RE.captures(input)?.get(1)?.as_str().to_string();
        let pwd = ZOOM_PWD_RE
            .captures(input)
            .map(|c| c[1].to_string())
            .or_else(|| password.map(|p| p.to_string()));
        let url = crate::meeting::zoom::convert_to_web_url(input);
        return Some(ZoomTarget {
            url,
            meeting_id,
            passcode: pwd,
        });
    }

    if let Some(caps) = BARE_ID_RE.captures(input) {
        let meeting_id = caps[1].to_string();
        return Some(build_zoom_target(&meeting_id, password.map(|p| p.to_string())));
    }

    if let Some(caps) = ZOOM_FREETEXT_ID_RE.captures(input) {
        let meeting_id: String = caps[1].chars().filter(|c| c.is_ascii_digit()).collect();
        if meeting_id.len() < 8 {
            return None;
        }
        let pwd = ZOOM_FREETEXT_PWD_RE
            .captures(input)
            .map(|c| c[1].to_string())
            .or_else(|| password.map(|p| p.to_string()));
        return Some(build_zoom_target(&meeting_id, pwd));
    }

    None
}

fn build_zoom_target(meeting_id: &str, passcode: Option<String>) -> ZoomTarget {
    let url = match &passcode {
        Some(pwd) => format!("https://zoom.us/wc/{meeting_id}/join?pwd={pwd}"),
        None => format!("https://zoom.us/wc/{meeting_id}/join"),
    };
    ZoomTarget {
        url,
        meeting_id: meeting_id.to_string(),
        passcode,
    }
}

async fn start_bot(
    State(state): State<AppState>,
    Json(request): Json<StartBotRequest>,
) -> impl IntoResponse {
    let Ok(platform) = request.platform.parse::<Platform>() else {
        return error_response(
            StatusCode::BAD_REQUEST,
            &format!("Bilinmeyen platform: {}", request.platform),
        );
    };

    if let Some(job) = state.store.read_job() {
        if job.active {
            return error_response(StatusCode::CONFLICT, "Zaten aktif bir görev var");
        }
    }

    let (meeting_url, meeting_id, passcode) = match platform {
        Platform::Zoom => {
            match parse_zoom_input(&request.meeting_url, request.password.as_deref()) {
                Some(target) => (target.url, Some(target.meeting_id), target.passcode),
                None => {
                    return error_response(
                        StatusCode::BAD_REQUEST,
                        "Zoom toplantı linki veya ID'si çözümlenemedi",
                    );
                }
            }
        }
        Platform::Teams | Platform::Meet => {
            let url = request.meeting_url.trim().to_string();
            if url.is_empty() {
                return error_response(StatusCode::BAD_REQUEST, "meeting_url boş olamaz");
            }
            (url, None, request.password.clone())
        }
    };

    let job = Job {
        active: true,
        platform,
        meeting_url,
        meeting_id,
        passcode,
        bot_display_name: Some(state.config.bot_display_name.clone()),
        title: request.title.clone(),
        user_id: request.user_id.clone(),
        created_at: now_ts(),
    };
    if let Err(e) = state.store.write_job(&job) {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, &format!("{e:#}"));
    }
    tracing::info!("Görev oluşturuldu: {} -> {}", job.platform, job.meeting_url);
    (
        StatusCode::OK,
        Json(json!({ "status": "ok", "platform": job.platform, "meeting_url": job.meeting_url })),
    )
}

// ---- /bot-command -------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CommandRequest {
    command: String,
}

async fn bot_command(
    State(state): State<AppState>,
    Json(request): Json<CommandRequest>,
) -> impl IntoResponse {
    let kind = match request.command.as_str() {
        "pause" => CommandKind::Pause,
        "resume" => CommandKind::Resume,
        "stop" => CommandKind::Stop,
        "force_reset" => CommandKind::ForceReset,
        "summary" => CommandKind::Summary,
        other => {
            return error_response(StatusCode::BAD_REQUEST, &format!("Bilinmeyen komut: {other}"));
        }
    };

    // Summary is answered inline; the worker never consumes it
    if kind == CommandKind::Summary {
        let transcript = state.store.read_transcript();
        let tail: String = transcript
            .chars()
            .rev()
            .take(500)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        return (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "transcript_chars": transcript.chars().count(),
                "preview": tail,
            })),
        );
    }

    if kind == CommandKind::ForceReset {
        let result = run_force_reset(&state).await;
        return (StatusCode::OK, Json(result));
    }

    let command = BotCommand {
        command: kind,
        issued_at: now_ts(),
        processed: false,
    };
    match state.store.write_command(&command) {
        Ok(true) => (StatusCode::OK, Json(json!({ "status": "ok", "command": kind }))),
        Ok(false) => error_response(StatusCode::CONFLICT, "İşlenmemiş bir komut zaten bekliyor"),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &format!("{e:#}")),
    }
}

// ---- /bot-status --------------------------------------------------------

async fn bot_status(State(state): State<AppState>) -> impl IntoResponse {
    let task = state
        .store
        .read_job()
        .map(|j| serde_json::to_value(j).unwrap_or(Value::Null))
        .unwrap_or(Value::Null);
    let worker = state
        .store
        .read_worker_status()
        .map(|s| serde_json::to_value(s).unwrap_or(Value::Null))
        .unwrap_or(Value::Null);
    let has_transcript = state.store.read_transcript().chars().count() > 10;
    Json(json!({
        "task": task,
        "worker": worker,
        "has_transcript": has_transcript,
    }))
}

// ---- /transcribe-webm ---------------------------------------------------

async fn transcribe_webm(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> impl IntoResponse {
    let mut audio: Option<Vec<u8>> = None;
    let mut mime_type = "audio/webm".to_string();
    let mut start_time: Option<f64> = None;
    let mut duration: Option<f64> = None;
    let mut speaker_name: Option<String> = None;
    let mut platform: Option<Platform> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                return error_response(StatusCode::BAD_REQUEST, &format!("multipart: {e}"));
            }
        };
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "file" => {
                if let Some(ct) = field.content_type() {
                    mime_type = ct.to_string();
                }
                match field.bytes().await {
                    Ok(bytes) => audio = Some(bytes.to_vec()),
                    Err(e) => {
                        return error_response(
                            StatusCode::BAD_REQUEST,
                            &format!("dosya okunamadı: {e}"),
                        );
                    }
                }
            }
            "start_time" => {
                start_time = field.text().await.ok().and_then(|t| t.trim().parse().ok());
            }
            "duration" => {
                duration = field.text().await.ok().and_then(|t| t.trim().parse().ok());
            }
            "speaker_name" => {
                speaker_name = field.text().await.ok().filter(|t| !t.trim().is_empty());
            }
            "platform" => {
                platform = field.text().await.ok().and_then(|t| t.parse().ok());
            }
            _ => {}
        }
    }

    let Some(audio) = audio else {
        return error_response(StatusCode::BAD_REQUEST, "ses dosyası eksik");
    };

    let result = transcription::process_segment(
        &state.store,
        state.gemini.as_deref(),
        &audio,
        &mime_type,
        start_time,
        duration,
        speaker_name.as_deref(),
        platform,
    )
    .await;

    match result {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "appended": outcome.appended,
                "chars": outcome.chars,
                "quota_exhausted": outcome.quota_exhausted,
            })),
        ),
        Err(e) => {
            tracing::error!("Transkripsiyon hatası: {:#}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &format!("{e:#}"))
        }
    }
}

// ---- /force-reset -------------------------------------------------------

async fn force_reset(State(state): State<AppState>) -> impl IntoResponse {
    let result = run_force_reset(&state).await;
    (StatusCode::OK, Json(result))
}

/// Persist what we can, kill everything, clear every IPC document.
async fn run_force_reset(state: &AppState) -> Value {
    tracing::warn!("FORCE RESET istendi");

    let transcript = state.store.read_transcript();
    let mut report_generated = false;
    if transcript.trim().chars().count() >= 50 {
        match report::run(&state.config, &state.store).await {
            Ok(_) => {
                report_generated = true;
                tracing::info!("Force-reset raporu oluşturuldu");
            }
            Err(e) => tracing::warn!("Force-reset raporu başarısız: {:#}", e),
        }
    }

    platform::kill_zombie_processes().await;
    state.store.clear_all();
    if let Err(e) = state.store.reset_worker_status("Sistem sıfırlandı") {
        tracing::error!("Worker status sıfırlanamadı: {:#}", e);
    }

    json!({ "status": "ok", "report_generated": report_generated })
}

fn error_response(code: StatusCode, message: &str) -> (StatusCode, Json<Value>) {
    (code, Json(json!({ "status": "error", "message": message })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zoom_launcher_url_parses() {
        let target =
            parse_zoom_input("https://us05web.zoom.us/j/123456789?pwd=Abc123", None).unwrap();
        assert_eq!(target.meeting_id, "123456789");
        assert_eq!(target.passcode.as_deref(), Some("Abc123"));
        assert!(target.url.contains("/wc/123456789/join"));
    }

    #[test]
    fn zoom_free_text_parses_with_turkish_labels() {
        let text = "Toplantıya katılın!\nMeeting ID: 123 4567 8901\nParola: gizli42";
        let target = parse_zoom_input(text, None).unwrap();
        assert_eq!(target.meeting_id, "12345678901");
        assert_eq!(target.passcode.as_deref(), Some("gizli42"));
        assert!(target.url.contains("12345678901"));
    }

    #[test]
    fn zoom_bare_id_uses_request_password() {
        let target = parse_zoom_input("9876543210", Some("pw")).unwrap();
        assert_eq!(target.meeting_id, "9876543210");
        assert_eq!(target.passcode.as_deref(), Some("pw"));
        assert!(target.url.ends_with("?pwd=pw"));
    }

    #[test]
    fn garbage_zoom_input_is_rejected() {
        assert!(parse_zoom_input("not a meeting", None).is_none());
        assert!(parse_zoom_input("https://example.com/foo", None).is_none());
        assert!(parse_zoom_input("", None).is_none());
    }

    #[test]
    fn wc_urls_keep_their_form() {
        let target = parse_zoom_input("https://zoom.us/wc/555566667777/join", None).unwrap();
        assert_eq!(target.meeting_id, "555566667777");
    }
}
