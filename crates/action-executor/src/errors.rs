//! Error types for action execution.

use thiserror::Error;

use cdp_session::SessionError;

/// Action-level failures. These surface to the control loop as failed
/// `ActionResult`s so the decision policy can recover by re-observing;
/// only transport failures ([`SessionError`]) propagate as hard errors.
#[derive(Debug, Error, Clone)]
pub enum ActionError {
    /// The referenced element index no longer matches the live page: the
    /// observation it came from has been superseded, or the index was
    /// never in range. The caller must re-extract.
    #[error("stale element index {index}: {reason}")]
    StaleElement { index: u32, reason: String },

    /// Navigation did not complete: unreachable URL, browser-reported
    /// load error, or the load timed out.
    #[error("navigation failed: {0}")]
    Navigation(String),

    /// The targeted element does not accept text input.
    #[error("element not editable: {0}")]
    NotEditable(String),

    /// The element exists but could not be interacted with (no box model,
    /// zero-sized, obscured).
    #[error("element not interactable: {0}")]
    NotInteractable(String),

    /// Malformed response payload from the browser.
    #[error("protocol payload error: {0}")]
    Payload(String),
}

impl ActionError {
    pub fn stale(index: u32, reason: impl Into<String>) -> Self {
        Self::StaleElement {
            index,
            reason: reason.into(),
        }
    }

    /// Whether re-observing and retrying a different action is likely to
    /// help. Retrying is the decision policy's call, never this layer's.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ActionError::Payload(_))
    }
}

/// Outcome alias used throughout the executor: action-level failures are
/// data, transport failures are errors.
pub type ExecResult<T> = Result<T, SessionError>;
