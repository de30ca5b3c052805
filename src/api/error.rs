//! Request error taxonomy.

/// Errors surfaced by the gateway and document client.
///
/// Expected failure modes (timeouts, HTTP errors, unreachable hosts)
/// are always returned as values; nothing here panics past the gateway
/// boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The request exceeded its deadline and was cancelled.
    Timeout { ms: u64 },
    /// Non-2xx response after the retry budget ran out. The body is kept
    /// so callers can recognize controller-specific failure text.
    Http { status: u16, body: String },
    /// Transport-level failure after the retry budget ran out.
    Network(String),
    /// 404 — the endpoint does not exist on this firmware. Never
    /// retried; callers treat it as "feature absent", not a failure.
    EndpointNotFound,
    /// The host kept answering 429 until the retry budget ran out.
    RateLimited,
    /// A 2xx response whose body did not match the expected type.
    InvalidBody(String),
}

impl ApiError {
    /// HTTP status attached to this error, when there is one.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            ApiError::EndpointNotFound => Some(404),
            ApiError::RateLimited => Some(429),
            _ => None,
        }
    }

    /// Whether a delete that got this error may be treated as already
    /// applied: the controller rejected the selector because no entry
    /// with that id exists.
    pub fn is_bad_selector(&self) -> bool {
        matches!(self, ApiError::Http { body, .. } if body.contains("BadSelector"))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ApiError::Timeout { .. })
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Timeout { ms } => write!(f, "request timed out after {}ms", ms),
            ApiError::Http { status, body } => {
                if body.is_empty() {
                    write!(f, "HTTP error {}", status)
                } else {
                    write!(f, "HTTP error {}: {}", status, body)
                }
            }
            ApiError::Network(e) => write!(f, "network error: {}", e),
            ApiError::EndpointNotFound => write!(f, "endpoint not found"),
            ApiError::RateLimited => write!(f, "rate limited after all retries"),
            ApiError::InvalidBody(e) => write!(f, "unexpected response body: {}", e),
        }
    }
}

impl std::error::Error for ApiError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_selector_detection() {
        let err = ApiError::Http {
            status: 400,
            body: "BadSelector: no entry with id=x".into(),
        };
        assert!(err.is_bad_selector());

        let err = ApiError::Http {
            status: 500,
            body: "internal error".into(),
        };
        assert!(!err.is_bad_selector());

        assert!(!ApiError::EndpointNotFound.is_bad_selector());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::EndpointNotFound.status(), Some(404));
        assert_eq!(ApiError::RateLimited.status(), Some(429));
        assert_eq!(ApiError::Timeout { ms: 10 }.status(), None);
        assert_eq!(
            ApiError::Http {
                status: 503,
                body: String::new()
            }
            .status(),
            Some(503)
        );
    }
}
