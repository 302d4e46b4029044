//! Streaming-HTTP session tracking
//!
//! A streamable-http server may assign an opaque session id during the
//! initialization exchange. This module records it, classifies
//! session-specific error signatures, and performs the explicit end-of-session
//! request on graceful disconnect.
//!
//! The wrapped transport does not surface HTTP status codes cleanly, so the
//! classifier matches substrings of the lower-cased error rendering. A richer
//! transport should inspect status codes directly instead.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

/// Session error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionErrorKind {
    /// The server no longer knows the session; recoverable by reconnecting.
    Terminated,
    /// The session id was rejected as malformed or wrong; surfaced to callers.
    Invalid,
    /// The session aged out server-side; recoverable by reconnecting.
    Expired,
}

impl SessionErrorKind {
    /// Terminated and expired sessions are recovered transparently.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SessionErrorKind::Terminated | SessionErrorKind::Expired)
    }
}

impl fmt::Display for SessionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionErrorKind::Terminated => "session_terminated",
            SessionErrorKind::Invalid => "session_invalid",
            SessionErrorKind::Expired => "session_expired",
        };
        write!(f, "{}", s)
    }
}

/// Classify an error rendering as a session error, if it is one.
pub fn classify_session_error(message: &str) -> Option<SessionErrorKind> {
    let text = message.to_lowercase();

    if text.contains("404")
        || text.contains("not found")
        || text.contains("session not found")
        || text.contains("session terminated")
    {
        return Some(SessionErrorKind::Terminated);
    }

    if text.contains("400")
        || text.contains("bad request")
        || text.contains("invalid session")
        || text.contains("session invalid")
    {
        return Some(SessionErrorKind::Invalid);
    }

    if text.contains("timeout") || text.contains("expired") || text.contains("session expired") {
        return Some(SessionErrorKind::Expired);
    }

    None
}

/// The per-connection session record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub terminated: bool,
}

/// Tracks zero or one session per connection.
#[derive(Default)]
pub struct SessionTracker {
    info: RwLock<Option<SessionInfo>>,
}

/// Session ids are restricted to printable ASCII (0x21–0x7E).
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty() && id.bytes().all(|b| (0x21..=0x7e).contains(&b))
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt a server-assigned session id. Invalid ids are ignored (the
    /// server is treated as stateless). Returns true if a record was created.
    pub fn adopt(&self, server: &str, session_id: &str) -> bool {
        if !is_valid_session_id(session_id) {
            debug!(
                "Ignoring invalid session id from server {}: {:?}",
                server, session_id
            );
            return false;
        }

        let record = SessionInfo {
            session_id: session_id.to_string(),
            created_at: Utc::now(),
            terminated: false,
        };
        *self.info.write() = Some(record);
        info!("Session established for server {}: {}", server, session_id);
        true
    }

    pub fn get(&self) -> Option<SessionInfo> {
        self.info.read().clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.info.read().as_ref().map(|s| s.session_id.clone())
    }

    /// Remove the record, returning it.
    pub fn clear(&self) -> Option<SessionInfo> {
        self.info.write().take()
    }

    pub fn mark_terminated(&self) {
        if let Some(info) = self.info.write().as_mut() {
            info.terminated = true;
        }
    }

    /// Explicit end-of-session: `DELETE <base>/session` with the session id
    /// header and, when held, a bearer token. Soft-fails: a server without
    /// explicit termination support answers 405, anything else is logged and
    /// left to expire on its own.
    pub async fn terminate(
        &self,
        http: &reqwest::Client,
        server: &str,
        base_url: &str,
        auth_token: Option<&str>,
    ) {
        let Some(info) = self.get() else {
            return;
        };
        if info.terminated {
            return;
        }

        let url = format!("{}/session", base_url.trim_end_matches('/'));
        let mut request = http.delete(&url).header("Mcp-Session-Id", &info.session_id);
        if let Some(token) = auth_token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                self.mark_terminated();
                info!(
                    "Terminated session {} for server {}",
                    info.session_id, server
                );
            },
            Ok(response) if response.status().as_u16() == 405 => {
                debug!(
                    "Server {} does not support explicit session termination",
                    server
                );
            },
            Ok(response) => {
                warn!(
                    "Session termination for server {} returned {}; session will expire",
                    server,
                    response.status()
                );
            },
            Err(e) => {
                warn!(
                    "Session termination request for server {} failed: {}; session will expire",
                    server, e
                );
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifier_matches_spec_signatures() {
        assert_eq!(
            classify_session_error("HTTP 404 Not Found: no such session"),
            Some(SessionErrorKind::Terminated)
        );
        assert_eq!(
            classify_session_error("Session Terminated by server"),
            Some(SessionErrorKind::Terminated)
        );
        assert_eq!(
            classify_session_error("400 Bad Request"),
            Some(SessionErrorKind::Invalid)
        );
        assert_eq!(
            classify_session_error("Invalid Session supplied"),
            Some(SessionErrorKind::Invalid)
        );
        assert_eq!(
            classify_session_error("session expired"),
            Some(SessionErrorKind::Expired)
        );
        assert_eq!(
            classify_session_error("request timeout"),
            Some(SessionErrorKind::Expired)
        );
        assert_eq!(classify_session_error("connection refused"), None);
    }

    #[test]
    fn terminated_takes_precedence_over_expired() {
        // "session not found" + "expired" both present: 404 family wins.
        assert_eq!(
            classify_session_error("404 session not found (expired)"),
            Some(SessionErrorKind::Terminated)
        );
    }

    #[test]
    fn session_id_validation() {
        assert!(is_valid_session_id("ABCD1234"));
        assert!(is_valid_session_id("a-b_c.d~e!f"));
        assert!(!is_valid_session_id(""));
        assert!(!is_valid_session_id("has space"));
        assert!(!is_valid_session_id("newline\n"));
        assert!(!is_valid_session_id("unicode-\u{00e9}"));
    }

    #[test]
    fn tracker_ignores_invalid_ids() {
        let tracker = SessionTracker::new();
        assert!(!tracker.adopt("s", "bad id"));
        assert!(tracker.get().is_none());

        assert!(tracker.adopt("s", "ABCD1234"));
        let info = tracker.get().unwrap();
        assert_eq!(info.session_id, "ABCD1234");
        assert!(!info.terminated);

        tracker.mark_terminated();
        assert!(tracker.get().unwrap().terminated);

        let cleared = tracker.clear().unwrap();
        assert_eq!(cleared.session_id, "ABCD1234");
        assert!(tracker.get().is_none());
    }
}
