use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::detect_chrome_executable;

/// Configuration for launching the browser and tuning the session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Chrome/Chromium executable. Empty path means "not found"; resolution
    /// order is `WEBPILOT_CHROME`, `PATH`, then OS-specific locations.
    pub executable: PathBuf,

    /// Profile directory handed to `--user-data-dir`.
    pub user_data_dir: PathBuf,

    /// Headless by default; `WEBPILOT_HEADLESS=0|false|no|off` forces a
    /// visible browser.
    pub headless: bool,

    /// Port passed to `--remote-debugging-port`.
    pub remote_debugging_port: u16,

    /// Connect directly to an already-running browser instead of launching
    /// one. Skips the launcher entirely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub websocket_url: Option<String>,

    /// Per-command response deadline.
    pub command_timeout_ms: u64,

    /// Keep-alive probe cadence; a probe that gets no answer closes the
    /// session instead of leaving it indeterminate. 0 disables probing.
    pub heartbeat_interval_ms: u64,

    /// How many times the launcher polls `/json/version` before giving up.
    pub connect_retries: u32,

    /// Delay between launcher polls.
    pub connect_poll_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            executable: detect_chrome_executable().unwrap_or_default(),
            user_data_dir: default_profile_dir(),
            headless: resolve_headless_default(),
            remote_debugging_port: 9222,
            websocket_url: None,
            command_timeout_ms: 30_000,
            heartbeat_interval_ms: 15_000,
            connect_retries: 15,
            connect_poll_ms: 500,
        }
    }
}

impl SessionConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn connect_poll(&self) -> Duration {
        Duration::from_millis(self.connect_poll_ms)
    }

    /// Config for attaching to an existing endpoint, used by tests and by
    /// checkpoint resume against an externally managed browser.
    pub fn for_endpoint(ws_url: impl Into<String>) -> Self {
        Self {
            websocket_url: Some(ws_url.into()),
            ..Self::default()
        }
    }
}

fn resolve_headless_default() -> bool {
    match env::var("WEBPILOT_HEADLESS") {
        Ok(value) => {
            let lower = value.to_ascii_lowercase();
            !matches!(lower.as_str(), "0" | "false" | "no" | "off")
        }
        Err(_) => true,
    }
}

fn default_profile_dir() -> PathBuf {
    if let Ok(path) = env::var("WEBPILOT_CHROME_PROFILE") {
        return PathBuf::from(path);
    }

    Path::new("./.webpilot-profile").into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeouts_are_bounded() {
        let cfg = SessionConfig::default();
        assert!(cfg.command_timeout() >= Duration::from_secs(1));
        assert!(cfg.connect_retries > 0);
    }

    #[test]
    fn endpoint_config_skips_launch() {
        let cfg = SessionConfig::for_endpoint("ws://127.0.0.1:9222/devtools/browser/abc");
        assert_eq!(
            cfg.websocket_url.as_deref(),
            Some("ws://127.0.0.1:9222/devtools/browser/abc")
        );
    }
}
