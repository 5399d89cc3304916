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

//! OS abstraction: virtual audio device, ffmpeg discovery, browser flags,
//! display setup and process sweeps. Every operation here fails soft - a
//! missing tool logs a warning and returns a neutral result.

use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// Name of the virtual audio device the meeting audio is routed into.
pub fn audio_device_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "CABLE Output (VB-Audio Virtual Cable)"
    } else if cfg!(target_os = "macos") {
        "BlackHole 2ch"
    } else {
        // PulseAudio monitor of the default sink
        "default"
    }
}

/// ffmpeg input arguments capturing the virtual audio device.
pub fn ffmpeg_input_args() -> Vec<String> {
    if cfg!(target_os = "windows") {
        vec![
            "-f".into(),
            "dshow".into(),
            "-i".into(),
            format!("audio={}", audio_device_name()),
        ]
    } else if cfg!(target_os = "macos") {
        vec!["-f".into(), "avfoundation".into(), "-i".into(), "none:0".into()]
    } else {
        let source = std::env::var("PULSE_SOURCE")
            .unwrap_or_else(|_| "default".to_string());
        vec!["-f".into(), "pulse".into(), "-i".into(), source]
    }
}

/// Resolve the ffmpeg binary: env override, then PATH, then the bare name.
pub fn ffmpeg_binary_path(override_path: Option<&str>) -> String {
    resolve_binary("ffmpeg", override_path)
}

pub fn ffprobe_binary_path() -> String {
    resolve_binary("ffprobe", None)
}

fn resolve_binary(name: &str, override_path: Option<&str>) -> String {
    if let Some(path) = override_path {
        if Path::new(path).exists() {
            return path.to_string();
        }
        tracing::warn!("Configured path {:?} for {} does not exist, falling back", path, name);
    }
    if let Ok(output) = std::process::Command::new(if cfg!(windows) { "where" } else { "which" })
        .arg(name)
        .output()
    {
        if output.status.success() {
            if let Some(line) = String::from_utf8_lossy(&output.stdout).lines().next() {
                let line = line.trim();
                if !line.is_empty() {
                    return line.to_string();
                }
            }
        }
    }
    name.to_string()
}

/// Chromium launch flags shared by every platform adapter.
pub fn browser_launch_args(headless: bool) -> Vec<String> {
    let mut args = vec![
        "--use-fake-ui-for-media-stream".to_string(),
        "--disable-notifications".to_string(),
        "--autoplay-policy=no-user-gesture-required".to_string(),
        "--disable-infobars".to_string(),
    ];
    if cfg!(target_os = "linux") {
        args.extend([
            "--no-sandbox".to_string(),
            "--disable-dev-shm-usage".to_string(),
            "--disable-gpu".to_string(),
            "--window-size=1920,1080".to_string(),
        ]);
    } else {
        args.push("--window-size=1280,800".to_string());
    }
    if headless {
        args.push("--headless=new".to_string());
    }
    args
}

/// On Linux the bot runs headful under Xvfb; make sure DISPLAY points at it.
pub fn setup_display() {
    if cfg!(target_os = "linux") && std::env::var("DISPLAY").is_err() {
        tracing::info!("DISPLAY not set, defaulting to :99 (Xvfb)");
        std::env::set_var("DISPLAY", ":99");
    }
}

/// Best-effort window activation by title keyword. Windows only; a no-op
/// everywhere else (headless Xvfb hosts have nothing to focus).
pub async fn bring_to_front(title_keywords: &[&str]) {
    if !cfg!(target_os = "windows") {
        return;
    }
    for keyword in title_keywords {
        let script = format!(
            "(New-Object -ComObject WScript.Shell).AppActivate('{}')",
            keyword.replace('\'', "")
        );
        let result = Command::new("powershell")
            .args(["-NoProfile", "-Command", &script])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match result {
            Ok(status) if status.success() => {
                tracing::debug!("Activated window matching {:?}", keyword);
                return;
            }
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!("Window activation unavailable: {}", e);
                return;
            }
        }
    }
}

/// Kill ffmpeg processes whose command line targets the given segment
/// directory. Used at recorder startup so a crashed run cannot keep the
/// audio device busy.
pub async fn kill_stale_ffmpeg(segment_dir: &Path) {
    let needle = segment_dir.to_string_lossy().to_string();
    if cfg!(target_os = "windows") {
        run_quiet("taskkill", &["/F", "/IM", "ffmpeg.exe"]).await;
    } else {
        run_quiet("pkill", &["-f", &format!("ffmpeg.*{}", needle)]).await;
    }
}

/// Dispatcher-startup / force-reset sweep: lingering ffmpeg and bot worker
/// processes from a previous run are killed by name.
pub async fn kill_zombie_processes() {
    if cfg!(target_os = "windows") {
        run_quiet("taskkill", &["/F", "/IM", "ffmpeg.exe"]).await;
        run_quiet("taskkill", &["/F", "/IM", "sesly-worker.exe"]).await;
        run_quiet("taskkill", &["/F", "/IM", "sesly-recorder.exe"]).await;
    } else {
        run_quiet("pkill", &["-f", "ffmpeg"]).await;
        run_quiet("pkill", &["-f", "sesly-worker"]).await;
        run_quiet("pkill", &["-f", "sesly-recorder"]).await;
    }
}

async fn run_quiet(program: &str, args: &[&str]) {
    let result = Command::new(program)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = result {
        tracing::debug!("{} {:?} unavailable: {}", program, args, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ffmpeg_args_name_a_capture_backend() {
        let args = ffmpeg_input_args();
        assert_eq!(args[0], "-f");
        assert!(["dshow", "pulse", "avfoundation"].contains(&args[1].as_str()));
        assert!(args.iter().any(|a| a == "-i"));
    }

    #[test]
    fn resolve_binary_falls_back_to_name() {
        let resolved = resolve_binary("definitely-not-a-real-binary-xyz", None);
        assert_eq!(resolved, "definitely-not-a-real-binary-xyz");
    }

    #[test]
    fn browser_args_always_fake_media_ui() {
        for headless in [false, true] {
            let args = browser_launch_args(headless);
            assert!(args.iter().any(|a| a == "--use-fake-ui-for-media-stream"));
            assert_eq!(headless, args.iter().any(|a| a == "--headless=new"));
        }
    }
}
