use std::time::Duration;

use thiserror::Error;

/// Transport-level failures of a protocol session.
///
/// Every variant here is fatal to the current session except
/// `CommandTimeout`, which fails the one command but leaves the session
/// usable; the caller decides whether to keep going. Nothing in this layer
/// retries.
#[derive(Debug, Error, Clone)]
pub enum SessionError {
    /// The debugging channel could not be established (refused, timed out,
    /// or the browser never exposed an endpoint).
    #[error("connection failed: {0}")]
    Connection(String),

    /// A command got no response within its deadline.
    #[error("command '{method}' timed out after {timeout:?}")]
    CommandTimeout { method: String, timeout: Duration },

    /// The session is closed; issued commands can never complete. Also the
    /// terminal fate of every command that was pending when the underlying
    /// connection dropped.
    #[error("session closed")]
    SessionClosed,

    /// The browser answered the command with a protocol-level error.
    #[error("cdp error {code}: {message}")]
    Cdp { code: i64, message: String },

    /// Malformed frame, serialization failure, or other wire-level surprise.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl SessionError {
    /// Whether this error terminates the session as a whole.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::Connection(_) | SessionError::SessionClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatality_classification() {
        assert!(SessionError::SessionClosed.is_fatal());
        assert!(SessionError::Connection("refused".into()).is_fatal());
        assert!(!SessionError::CommandTimeout {
            method: "Page.navigate".into(),
            timeout: Duration::from_secs(5),
        }
        .is_fatal());
        assert!(!SessionError::Cdp {
            code: -32000,
            message: "no node".into(),
        }
        .is_fatal());
    }
}
