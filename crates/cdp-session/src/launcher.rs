//! Browser process launch and debugger endpoint discovery.
//!
//! Spawns Chrome/Chromium with remote debugging enabled, then polls the
//! `/json/version` HTTP endpoint until the browser publishes its
//! `webSocketDebuggerUrl`. The child is killed if the endpoint never
//! appears within the configured retry budget.

use std::fs;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::process::{Child, Command};
use tokio::time::sleep;
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::error::SessionError;

pub(crate) struct LaunchedBrowser {
    pub child: Child,
    pub ws_url: String,
}

pub(crate) async fn launch(cfg: &SessionConfig) -> Result<LaunchedBrowser, SessionError> {
    let executable = resolve_executable(cfg)?;
    let profile_dir = ensure_profile_dir(cfg)?;

    let port_arg = format!("--remote-debugging-port={}", cfg.remote_debugging_port);
    let profile_arg = format!("--user-data-dir={}", profile_dir.display());

    let mut args = vec![
        port_arg.as_str(),
        profile_arg.as_str(),
        "--disable-background-networking",
        "--disable-background-timer-throttling",
        "--disable-breakpad",
        "--disable-client-side-phishing-detection",
        "--disable-component-update",
        "--disable-default-apps",
        "--disable-dev-shm-usage",
        "--disable-extensions",
        "--disable-hang-monitor",
        "--disable-popup-blocking",
        "--disable-prompt-on-repost",
        "--disable-sync",
        "--metrics-recording-only",
        "--no-first-run",
        "--no-default-browser-check",
        "--password-store=basic",
        "--remote-allow-origins=*",
        "--use-mock-keychain",
    ];
    if cfg.headless {
        args.push("--headless=new");
        args.push("--hide-scrollbars");
        args.push("--mute-audio");
    }

    info!(target: "cdp-session", executable = %executable.display(), port = cfg.remote_debugging_port, "launching browser");

    let mut child = Command::new(&executable)
        .args(&args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| {
            SessionError::Connection(format!(
                "failed to launch {}: {err}",
                executable.display()
            ))
        })?;

    match discover_ws_url(cfg).await {
        Ok(ws_url) => Ok(LaunchedBrowser { child, ws_url }),
        Err(err) => {
            let _ = child.start_kill();
            Err(err)
        }
    }
}

async fn discover_ws_url(cfg: &SessionConfig) -> Result<String, SessionError> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(3))
        .build()
        .map_err(|err| SessionError::Connection(err.to_string()))?;

    let version_url = format!(
        "http://127.0.0.1:{}/json/version",
        cfg.remote_debugging_port
    );

    let mut last_error = String::from("endpoint never became reachable");
    for attempt in 1..=cfg.connect_retries {
        sleep(cfg.connect_poll()).await;

        match fetch_ws_url(&client, &version_url).await {
            Ok(ws_url) => {
                info!(target: "cdp-session", attempt, url = %ws_url, "debugger endpoint discovered");
                return Ok(ws_url);
            }
            Err(err) => {
                debug!(target: "cdp-session", attempt, retries = cfg.connect_retries, %err, "waiting for debugger endpoint");
                last_error = err;
            }
        }
    }

    Err(SessionError::Connection(format!(
        "no debugger endpoint after {} attempts: {last_error}",
        cfg.connect_retries
    )))
}

async fn fetch_ws_url(client: &reqwest::Client, version_url: &str) -> Result<String, String> {
    let response = client
        .get(version_url)
        .send()
        .await
        .map_err(|err| err.to_string())?;
    let body: Value = response.json().await.map_err(|err| err.to_string())?;
    body.get("webSocketDebuggerUrl")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| "version payload has no webSocketDebuggerUrl".to_string())
}

fn resolve_executable(cfg: &SessionConfig) -> Result<PathBuf, SessionError> {
    if !cfg.executable.as_os_str().is_empty() && cfg.executable.exists() {
        return Ok(cfg.executable.clone());
    }
    crate::detect_chrome_executable().ok_or_else(|| {
        SessionError::Connection(
            "Chrome/Chromium executable not found; set WEBPILOT_CHROME to the full path"
                .to_string(),
        )
    })
}

fn ensure_profile_dir(cfg: &SessionConfig) -> Result<PathBuf, SessionError> {
    let profile_dir = if cfg.user_data_dir.is_absolute() {
        cfg.user_data_dir.clone()
    } else {
        let cwd = std::env::current_dir().map_err(|err| {
            SessionError::Connection(format!("failed to resolve cwd for user-data-dir: {err}"))
        })?;
        cwd.join(&cfg.user_data_dir)
    };

    fs::create_dir_all(&profile_dir).map_err(|err| {
        SessionError::Connection(format!("failed to ensure user-data-dir: {err}"))
    })?;
    Ok(profile_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_executable_prefers_configured_path() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("my-chrome");
        fs::write(&exe, b"").unwrap();

        let cfg = SessionConfig {
            executable: exe.clone(),
            ..SessionConfig::default()
        };
        assert_eq!(resolve_executable(&cfg).unwrap(), exe);
    }

    #[test]
    fn profile_dir_is_created_relative_to_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = SessionConfig {
            user_data_dir: dir.path().join("nested").join("profile"),
            ..SessionConfig::default()
        };
        let resolved = ensure_profile_dir(&cfg).unwrap();
        assert!(resolved.is_dir());
    }
}
