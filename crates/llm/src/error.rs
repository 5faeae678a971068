use std::time::Duration;

use thiserror::Error;

/// Failures crossing the model-backend boundary.  Display strings never
/// contain credentials; response bodies are scrubbed before they get here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Connection reset, 408/429, 5xx: worth retrying.
    #[error("model backend temporarily unavailable: {0}")]
    Transient(String),
    /// 401/403.
    #[error("model backend rejected the credentials: {0}")]
    Auth(String),
    /// 400/404/422: the request itself is wrong (model name, schema, ...).
    #[error("model backend rejected the request: {0}")]
    InvalidRequest(String),
    #[error("no data from model backend for {0:?}")]
    Timeout(Duration),
    /// The stream could not be decoded.
    #[error("malformed response stream: {0}")]
    Protocol(String),
    #[error("request cancelled")]
    Cancelled,
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_) | BackendError::Timeout(_))
    }

    /// Map an HTTP status to the matching variant.
    pub fn from_status(status: u16, detail: String) -> Self {
        match status {
            401 | 403 => BackendError::Auth(format!("HTTP {status}: {detail}")),
            408 | 425 | 429 => BackendError::Transient(format!("HTTP {status}: {detail}")),
            s if s >= 500 => BackendError::Transient(format!("HTTP {status}: {detail}")),
            _ => BackendError::InvalidRequest(format!("HTTP {status}: {detail}")),
        }
    }

    /// Short, actionable text for the person at the terminal.
    pub fn user_message(&self) -> String {
        match self {
            BackendError::Auth(_) => {
                "Authentication with the model backend failed. Check CODA_API_KEY.".to_string()
            }
            BackendError::InvalidRequest(d) => {
                format!("The model backend rejected the request ({d}). Check the model name and api_base.")
            }
            BackendError::Transient(d) => {
                format!("The model backend is unavailable ({d}). Try again shortly.")
            }
            BackendError::Timeout(after) => {
                format!("The model backend stopped responding for {}s. Try again.", after.as_secs())
            }
            BackendError::Protocol(d) => format!("The model backend sent an unreadable stream ({d})."),
            BackendError::Cancelled => "Cancelled.".to_string(),
        }
    }
}

/// Remove `secret` (and any bearer token) from text bound for logs or users.
pub fn scrub(text: &str, secret: &str) -> String {
    let mut out = if secret.len() >= 4 {
        text.replace(secret, "***")
    } else {
        text.to_string()
    };
    while let Some(pos) = out.find("Bearer ") {
        let start = pos + "Bearer ".len();
        let end = out[start..]
            .find(|c: char| c.is_whitespace() || c == '"')
            .map(|i| start + i)
            .unwrap_or(out.len());
        if out[start..end] == *"***" {
            break;
        }
        out.replace_range(start..end, "***");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(matches!(BackendError::from_status(401, String::new()), BackendError::Auth(_)));
        assert!(BackendError::from_status(429, String::new()).is_transient());
        assert!(BackendError::from_status(503, String::new()).is_transient());
        assert!(!BackendError::from_status(400, String::new()).is_transient());
        assert!(BackendError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!BackendError::Protocol("x".into()).is_transient());
    }

    #[test]
    fn scrub_removes_key_and_bearer_tokens() {
        let text = r#"bad key sk-abc123 in header "Authorization: Bearer sk-abc123""#;
        let clean = scrub(text, "sk-abc123");
        assert!(!clean.contains("sk-abc123"));

        let other = scrub("Authorization: Bearer zzz-other more", "");
        assert_eq!(other, "Authorization: Bearer *** more");
    }

    #[test]
    fn user_message_never_echoes_auth_detail() {
        let err = BackendError::Auth("HTTP 401: invalid key sk-leaked".into());
        assert!(!err.user_message().contains("sk-leaked"));
    }
}
