//! Execution failures reported by the external executor, and their classification.

use serde::{Deserialize, Serialize};

/// Failure reported by the executor after an attempt.
///
/// This is a value, not an error of the queue: it is always routed through
/// the retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

impl ExecutionFailure {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            status_code: None,
        }
    }

    pub fn with_status(description: impl Into<String>, status_code: u16) -> Self {
        Self {
            description: description.into(),
            status_code: Some(status_code),
        }
    }

    pub fn classify(&self) -> ErrorClass {
        ErrorClass::classify(&self.description, self.status_code)
    }
}

impl core::fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} (status {code})", self.description),
            None => f.write_str(&self.description),
        }
    }
}

/// Classification of a failure.
///
/// The snake_case tags are what `Request::retryable_error_types` holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    ServerError,
    ClientError,
    Redirect,
    Success,
    Informational,
    Timeout,
    ConnectionError,
    NetworkError,
    ExecutionError,
    UnknownError,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::ServerError => "server_error",
            ErrorClass::ClientError => "client_error",
            ErrorClass::Redirect => "redirect",
            ErrorClass::Success => "success",
            ErrorClass::Informational => "informational",
            ErrorClass::Timeout => "timeout",
            ErrorClass::ConnectionError => "connection_error",
            ErrorClass::NetworkError => "network_error",
            ErrorClass::ExecutionError => "execution_error",
            ErrorClass::UnknownError => "unknown_error",
        }
    }

    /// Classify a failure from its status code, falling back to inspecting
    /// the description when no (recognised) status code is present.
    pub fn classify(description: &str, status_code: Option<u16>) -> Self {
        if let Some(class) = status_code.and_then(Self::from_status) {
            return class;
        }
        Self::from_description(description)
    }

    /// Map an HTTP-style status code onto its range class.
    pub fn from_status(code: u16) -> Option<Self> {
        match code {
            100..=199 => Some(ErrorClass::Informational),
            200..=299 => Some(ErrorClass::Success),
            300..=399 => Some(ErrorClass::Redirect),
            400..=499 => Some(ErrorClass::ClientError),
            500..=599 => Some(ErrorClass::ServerError),
            _ => None,
        }
    }

    /// Heuristic classification of a free-form failure description.
    pub fn from_description(description: &str) -> Self {
        let text = description.to_ascii_lowercase();
        let mentions = |needles: &[&str]| needles.iter().any(|n| text.contains(n));

        if mentions(&["timeout", "timed out", "deadline exceeded"]) {
            ErrorClass::Timeout
        } else if mentions(&["connection", "refused", "reset by peer", "broken pipe", "socket"]) {
            ErrorClass::ConnectionError
        } else if mentions(&["network", "unreachable", "dns", "host lookup", "offline"]) {
            ErrorClass::NetworkError
        } else if mentions(&["execution", "execute", "handler"]) {
            ErrorClass::ExecutionError
        } else {
            ErrorClass::UnknownError
        }
    }

    /// Classes a network-error retry policy treats as transient.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorClass::Timeout
                | ErrorClass::ConnectionError
                | ErrorClass::NetworkError
                | ErrorClass::ServerError
                | ErrorClass::ExecutionError
        )
    }
}

impl core::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Human-readable message for a status code, e.g. `HTTP 503: Service Unavailable`.
pub fn describe_status(code: u16) -> String {
    let reason = match code {
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        413 => "Payload Too Large",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => match ErrorClass::from_status(code) {
            Some(ErrorClass::ServerError) => "Server Error",
            Some(ErrorClass::ClientError) => "Client Error",
            Some(ErrorClass::Redirect) => "Redirect",
            Some(ErrorClass::Success) => "Success",
            Some(ErrorClass::Informational) => "Informational",
            _ => "Unknown Status",
        },
    };
    format!("HTTP {code}: {reason}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_ranges_win_over_description() {
        assert_eq!(ErrorClass::classify("timeout", Some(503)), ErrorClass::ServerError);
        assert_eq!(ErrorClass::classify("", Some(404)), ErrorClass::ClientError);
        assert_eq!(ErrorClass::classify("", Some(301)), ErrorClass::Redirect);
        assert_eq!(ErrorClass::classify("", Some(204)), ErrorClass::Success);
        assert_eq!(ErrorClass::classify("", Some(101)), ErrorClass::Informational);
    }

    #[test]
    fn out_of_range_status_falls_back_to_description() {
        assert_eq!(
            ErrorClass::classify("connection refused", Some(999)),
            ErrorClass::ConnectionError
        );
    }

    #[test]
    fn description_heuristics() {
        assert_eq!(ErrorClass::from_description("Request Timed Out"), ErrorClass::Timeout);
        assert_eq!(
            ErrorClass::from_description("Connection reset by peer"),
            ErrorClass::ConnectionError
        );
        assert_eq!(
            ErrorClass::from_description("Network is unreachable"),
            ErrorClass::NetworkError
        );
        assert_eq!(
            ErrorClass::from_description("failed to execute request"),
            ErrorClass::ExecutionError
        );
        assert_eq!(ErrorClass::from_description("boom"), ErrorClass::UnknownError);
    }

    #[test]
    fn tags_match_serde_names() {
        let s = serde_json::to_string(&ErrorClass::ConnectionError).unwrap();
        assert_eq!(s, format!("\"{}\"", ErrorClass::ConnectionError.as_str()));
    }

    #[test]
    fn transient_classes() {
        assert!(ErrorClass::Timeout.is_transient());
        assert!(ErrorClass::ServerError.is_transient());
        assert!(!ErrorClass::ClientError.is_transient());
        assert!(!ErrorClass::UnknownError.is_transient());
    }

    #[test]
    fn describes_known_and_unknown_codes() {
        assert_eq!(describe_status(503), "HTTP 503: Service Unavailable");
        assert_eq!(describe_status(599), "HTTP 599: Server Error");
        assert_eq!(describe_status(999), "HTTP 999: Unknown Status");
    }

    #[test]
    fn display_includes_status() {
        let failure = ExecutionFailure::with_status("bad gateway", 502);
        assert_eq!(failure.to_string(), "bad gateway (status 502)");
        assert_eq!(failure.classify(), ErrorClass::ServerError);
    }
}
