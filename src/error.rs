use thiserror::Error;

use crate::models::JobKind;

/// Type alias for Result with GmailError
pub type Result<T> = std::result::Result<T, GmailError>;

/// Errors raised by the bulk-management core and its provider adapters
#[derive(Error, Debug)]
pub enum GmailError {
    /// A filter could not be turned into a query; raised before any remote call
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// A job start was requested while another job is still running
    #[error("A {running} job is already running")]
    JobAlreadyRunning { running: JobKind },

    /// A request was syntactically fine but carried an unusable value
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Gmail API returned an error
    #[error("Gmail API error: {0}")]
    ApiError(String),

    /// Authentication failed or the grant was revoked
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// Rate limit exceeded - should retry after specified seconds
    #[error("Rate limit exceeded, retry after {retry_after} seconds")]
    RateLimitExceeded { retry_after: u64 },

    /// Network-related error (connection issues, timeouts, etc.)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Server returned 5xx error
    #[error("Server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },

    /// Resource not found (404)
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// Bad request (400)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Forbidden (403)
    #[error("Access forbidden: {0}")]
    Forbidden(String),

    /// Invalid message format or parsing error
    #[error("Invalid message format: {0}")]
    InvalidMessageFormat(String),

    /// An unsubscribe request could not be carried out
    #[error("Unsubscribe failed: {0}")]
    Unsubscribe(String),

    /// IO error (file operations, etc.)
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Writing a CSV backup failed
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic catch-all error
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl GmailError {
    /// Check if the error is transient and the call should be retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GmailError::RateLimitExceeded { .. }
                | GmailError::ServerError { .. }
                | GmailError::NetworkError(_)
        )
    }

    /// Check if the error is permanent and should not be retried
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Errors that make every further remote call pointless.
    ///
    /// A bulk job hitting one of these stops and ends `Failed`; every other
    /// error is confined to the batch or message it happened on.
    pub fn is_systemic(&self) -> bool {
        matches!(self, GmailError::AuthError(_))
    }

    /// Seconds the provider asked us to wait, if it said so
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            GmailError::RateLimitExceeded { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Parse the Retry-After header from an HTTP response
///
/// The header is either delay-seconds ("120") or an HTTP-date. Past dates,
/// missing and unparsable values fall back to 5 seconds.
fn parse_retry_after_header<B>(response: &hyper::Response<B>) -> u64 {
    let Some(value) = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
    else {
        return DEFAULT_RETRY_AFTER;
    };

    if let Ok(seconds) = value.parse::<u64>() {
        return seconds;
    }

    httpdate::parse_http_date(value)
        .ok()
        .and_then(|at| at.duration_since(std::time::SystemTime::now()).ok())
        .map(|wait| wait.as_secs())
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

/// Reasons Gmail attaches to a 403 when the caller is being throttled
const RATE_LIMIT_REASONS: &[&str] = &["rateLimitExceeded", "userRateLimitExceeded"];

/// Fallback wait when a throttled response says nothing about retrying
const DEFAULT_RETRY_AFTER: u64 = 5;

/// Map an HTTP status (plus Google error reasons, when known) to an error
fn from_status(status_code: u16, message: String, reasons: &[String], retry_after: u64) -> GmailError {
    let throttled = reasons
        .iter()
        .any(|r| RATE_LIMIT_REASONS.contains(&r.as_str()));

    match status_code {
        429 => GmailError::RateLimitExceeded { retry_after },
        403 if throttled => GmailError::RateLimitExceeded { retry_after },
        401 => GmailError::AuthError(message),
        404 => GmailError::MessageNotFound(message),
        400 => GmailError::BadRequest(message),
        403 => GmailError::Forbidden(message),
        500..=599 => GmailError::ServerError {
            status: status_code,
            message,
        },
        _ => GmailError::ApiError(message),
    }
}

/// Classify a decoded Google JSON error body
///
/// The hub hands back any non-2xx response with a JSON body this way, so the
/// status lives in `error.code` and throttling in `error.errors[].reason`.
fn from_error_body(body: &serde_json::Value) -> GmailError {
    let error = &body["error"];
    let Some(code) = error["code"].as_u64().and_then(|c| u16::try_from(c).ok()) else {
        return GmailError::BadRequest(body.to_string());
    };

    let message = error["message"]
        .as_str()
        .map(|m| format!("HTTP {}: {}", code, m))
        .unwrap_or_else(|| format!("HTTP {}", code));
    let reasons: Vec<String> = error["errors"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|e| e["reason"].as_str().map(str::to_string))
        .collect();

    from_status(code, message, &reasons, DEFAULT_RETRY_AFTER)
}

impl From<google_gmail1::Error> for GmailError {
    fn from(error: google_gmail1::Error) -> Self {
        match error {
            google_gmail1::Error::Failure(ref response) => {
                let status = response.status();
                let message = format!(
                    "HTTP {}: {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("Unknown")
                );
                from_status(
                    status.as_u16(),
                    message,
                    &[],
                    parse_retry_after_header(response),
                )
            }
            google_gmail1::Error::BadRequest(ref body) => from_error_body(body),
            google_gmail1::Error::MissingToken(ref err) => {
                GmailError::AuthError(format!("No usable token: {}", err))
            }
            google_gmail1::Error::HttpError(ref err) => {
                GmailError::NetworkError(format!("Connection error: {}", err))
            }
            google_gmail1::Error::Io(err) => GmailError::NetworkError(err.to_string()),
            _ => GmailError::ApiError(error.to_string()),
        }
    }
}

impl From<reqwest::Error> for GmailError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() || error.is_connect() {
            GmailError::NetworkError(error.to_string())
        } else {
            GmailError::Unsubscribe(error.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        let rate_limit = GmailError::RateLimitExceeded { retry_after: 5 };
        assert!(rate_limit.is_transient());
        assert!(!rate_limit.is_permanent());
        assert_eq!(rate_limit.retry_after(), Some(5));

        let server_error = GmailError::ServerError {
            status: 503,
            message: "Service unavailable".to_string(),
        };
        assert!(server_error.is_transient());
        assert_eq!(server_error.retry_after(), None);

        assert!(GmailError::NetworkError("Connection timeout".to_string()).is_transient());
    }

    #[test]
    fn test_permanent_errors() {
        assert!(GmailError::BadRequest("Invalid id".to_string()).is_permanent());
        assert!(GmailError::MessageNotFound("msg123".to_string()).is_permanent());
        assert!(GmailError::Forbidden("Access denied".to_string()).is_permanent());
        assert!(GmailError::InvalidFilter("after > before".to_string()).is_permanent());
    }

    #[test]
    fn test_only_auth_is_systemic() {
        assert!(GmailError::AuthError("token revoked".to_string()).is_systemic());
        assert!(!GmailError::BadRequest("x".to_string()).is_systemic());
        assert!(!GmailError::ServerError {
            status: 500,
            message: "x".to_string()
        }
        .is_systemic());
    }

    #[test]
    fn test_error_display() {
        let display = GmailError::RateLimitExceeded { retry_after: 10 }.to_string();
        assert!(display.contains("Rate limit exceeded"));
        assert!(display.contains("10 seconds"));

        let display = GmailError::JobAlreadyRunning {
            running: JobKind::MarkRead,
        }
        .to_string();
        assert_eq!(display, "A mark-read job is already running");

        let display = GmailError::InvalidFilter("bad date".to_string()).to_string();
        assert!(display.starts_with("Invalid filter"));
    }

    fn google_error(code: u64, reason: &str) -> google_gmail1::Error {
        google_gmail1::Error::BadRequest(serde_json::json!({
            "error": {
                "code": code,
                "message": "from google",
                "errors": [{ "domain": "usageLimits", "reason": reason, "message": "from google" }]
            }
        }))
    }

    #[test]
    fn test_json_error_bodies_are_classified_by_code() {
        let err = GmailError::from(google_error(429, "rateLimitExceeded"));
        assert!(matches!(err, GmailError::RateLimitExceeded { retry_after: 5 }));
        assert!(err.is_transient());

        let err = GmailError::from(google_error(403, "userRateLimitExceeded"));
        assert!(matches!(err, GmailError::RateLimitExceeded { .. }));

        let err = GmailError::from(google_error(503, "backendError"));
        assert!(matches!(err, GmailError::ServerError { status: 503, .. }));
        assert!(err.is_transient());

        let err = GmailError::from(google_error(401, "authError"));
        assert!(matches!(err, GmailError::AuthError(_)));
        assert!(err.is_systemic());
    }

    #[test]
    fn test_json_error_bodies_that_stay_permanent() {
        let err = GmailError::from(google_error(403, "insufficientPermissions"));
        assert!(matches!(err, GmailError::Forbidden(_)));
        assert!(err.is_permanent());

        let err = GmailError::from(google_error(400, "invalidArgument"));
        assert!(matches!(err, GmailError::BadRequest(ref m) if m.contains("from google")));

        let err = GmailError::from(google_error(404, "notFound"));
        assert!(matches!(err, GmailError::MessageNotFound(_)));

        let err = GmailError::from(google_gmail1::Error::BadRequest(serde_json::json!({"oops": 1})));
        assert!(matches!(err, GmailError::BadRequest(_)));
    }

    #[test]
    fn test_parse_retry_after_header_integer() {
        let mut response = hyper::Response::builder().status(429).body(()).unwrap();
        response.headers_mut().insert(
            "retry-after",
            hyper::header::HeaderValue::from_static("120"),
        );

        assert_eq!(parse_retry_after_header(&response), 120);
    }

    #[test]
    fn test_parse_retry_after_header_missing() {
        let response = hyper::Response::builder().status(429).body(()).unwrap();
        assert_eq!(parse_retry_after_header(&response), 5);
    }

    #[test]
    fn test_parse_retry_after_header_invalid() {
        let mut response = hyper::Response::builder().status(429).body(()).unwrap();
        response.headers_mut().insert(
            "retry-after",
            hyper::header::HeaderValue::from_static("soon"),
        );

        assert_eq!(parse_retry_after_header(&response), 5);
    }

    #[test]
    fn test_parse_retry_after_header_http_date() {
        let mut response = hyper::Response::builder().status(429).body(()).unwrap();
        let future_time = std::time::SystemTime::now() + std::time::Duration::from_secs(60);
        response.headers_mut().insert(
            "retry-after",
            hyper::header::HeaderValue::from_str(&httpdate::fmt_http_date(future_time)).unwrap(),
        );

        let retry_after = parse_retry_after_header(&response);
        assert!(
            (58..=61).contains(&retry_after),
            "Expected ~60, got {}",
            retry_after
        );
    }

    #[test]
    fn test_parse_retry_after_header_past_http_date() {
        let mut response = hyper::Response::builder().status(429).body(()).unwrap();
        let past_time = std::time::SystemTime::now() - std::time::Duration::from_secs(60);
        response.headers_mut().insert(
            "retry-after",
            hyper::header::HeaderValue::from_str(&httpdate::fmt_http_date(past_time)).unwrap(),
        );

        assert_eq!(parse_retry_after_header(&response), 5);
    }
}
