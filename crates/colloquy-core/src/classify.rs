//! Failure taxonomy and the free-text error classifier.
//!
//! Providers do not expose structured error codes uniformly, so after the
//! typed transport cases the classifier falls back to sniffing the failure
//! message: HTTP-status matchers first, then keyword matchers, in a fixed
//! order. Later rules are intentionally more permissive and must not shadow
//! earlier precise ones.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::client::BackendError;

/// Closed taxonomy of generation failures shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    Authentication,
    RateLimit,
    PermissionDenied,
    Timeout,
    ConnectionIssue,
    /// Anything unrecognized; carries the original message verbatim for
    /// user-visible diagnostics.
    Unknown(String),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Authentication => f.write_str("authentication failed"),
            ErrorKind::RateLimit => f.write_str("rate limited"),
            ErrorKind::PermissionDenied => f.write_str("permission denied"),
            ErrorKind::Timeout => f.write_str("request timed out"),
            ErrorKind::ConnectionIssue => f.write_str("connection issue"),
            ErrorKind::Unknown(msg) => write!(f, "unknown error: {msg}"),
        }
    }
}

/// One HTTP status matcher. Accepts the bare word-bounded number plus the
/// `status:`/`error:`/`code:` prefixed forms so numbers embedded in longer
/// tokens never match.
struct StatusMatcher {
    pattern: Regex,
    kind: fn() -> ErrorKind,
}

fn status_pattern(code: u16) -> Regex {
    let pattern = format!(
        r"(?i)\b{code}\b|status[:=]\s*{code}\b|error[:=]\s*{code}\b|code[:=]\s*{code}\b"
    );
    Regex::new(&pattern).expect("status pattern is statically valid")
}

// Checked in this exact order; 429 before the 5xx family, and all status
// matchers before any keyword matcher.
static STATUS_MATCHERS: LazyLock<Vec<StatusMatcher>> = LazyLock::new(|| {
    vec![
        StatusMatcher {
            pattern: status_pattern(429),
            kind: || ErrorKind::RateLimit,
        },
        StatusMatcher {
            pattern: status_pattern(401),
            kind: || ErrorKind::Authentication,
        },
        StatusMatcher {
            pattern: status_pattern(403),
            kind: || ErrorKind::PermissionDenied,
        },
        StatusMatcher {
            pattern: status_pattern(504),
            kind: || ErrorKind::Timeout,
        },
        StatusMatcher {
            pattern: status_pattern(529),
            kind: || ErrorKind::Timeout,
        },
        StatusMatcher {
            pattern: status_pattern(500),
            kind: || ErrorKind::ConnectionIssue,
        },
        StatusMatcher {
            pattern: status_pattern(502),
            kind: || ErrorKind::ConnectionIssue,
        },
        StatusMatcher {
            pattern: status_pattern(503),
            kind: || ErrorKind::ConnectionIssue,
        },
    ]
});

// Case-insensitive substring matchers, checked after all status matchers.
const KEYWORD_MATCHERS: &[(&str, fn() -> ErrorKind)] = &[
    ("api key not valid", || ErrorKind::Authentication),
    ("rate limit", || ErrorKind::RateLimit),
    ("too many requests", || ErrorKind::RateLimit),
    ("overloaded", || ErrorKind::Timeout),
    ("request timeout", || ErrorKind::Timeout),
    ("connection timeout", || ErrorKind::Timeout),
    ("read timeout", || ErrorKind::Timeout),
    ("write timeout", || ErrorKind::Timeout),
    ("connection reset by peer", || ErrorKind::ConnectionIssue),
    ("connection refused", || ErrorKind::ConnectionIssue),
    ("temporarily unavailable", || ErrorKind::ConnectionIssue),
    ("service unavailable", || ErrorKind::ConnectionIssue),
];

/// Classify a backend failure into the closed taxonomy.
///
/// Total and deterministic: never panics, and a fixed input always maps to
/// the same kind. Typed transport cases short-circuit; everything else goes
/// through message sniffing.
pub fn classify(failure: &BackendError) -> ErrorKind {
    match failure {
        BackendError::Timeout => ErrorKind::Timeout,
        BackendError::Network(_) => ErrorKind::ConnectionIssue,
        other => classify_text(&other.to_string()),
    }
}

/// Classify a bare failure message. Falls through to `Unknown` with the
/// message preserved verbatim.
pub fn classify_text(message: &str) -> ErrorKind {
    for matcher in STATUS_MATCHERS.iter() {
        if matcher.pattern.is_match(message) {
            return (matcher.kind)();
        }
    }

    let lowered = message.to_lowercase();
    for (needle, kind) in KEYWORD_MATCHERS {
        if lowered.contains(needle) {
            return kind();
        }
    }

    ErrorKind::Unknown(message.to_string())
}
