//! Shared wire types and error classification for the YouTube API client.

use crate::error::{AuthError, UploadError};
use http::{HeaderMap, StatusCode};
use serde::Deserialize;
use std::time::Duration;

/// Error reasons Google uses for quota and rate limiting.
const QUOTA_REASONS: &[&str] = &[
    "quotaExceeded",
    "rateLimitExceeded",
    "userRateLimitExceeded",
    "dailyLimitExceeded",
    "uploadLimitExceeded",
];

/// Body of a failed Google API request.
///
/// See: <https://developers.google.com/youtube/v3/docs/errors>
#[derive(Debug, Deserialize)]
pub struct ApiErrorResponse {
    pub error: ApiError,
}

#[derive(Debug, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: u16,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub errors: Vec<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
pub struct ApiErrorDetail {
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

/// Reads a `Retry-After` header given in seconds.
pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(http::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Maps a non-success response onto the error taxonomy.
pub(crate) fn classify_error(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> UploadError {
    let parsed = serde_json::from_str::<ApiErrorResponse>(body).ok();
    let message = match &parsed {
        Some(r) if !r.error.message.is_empty() => r.error.message.clone(),
        _ if body.trim().is_empty() => status.to_string(),
        _ => body.trim().to_string(),
    };
    let is_quota = parsed.as_ref().is_some_and(|r| {
        r.error
            .errors
            .iter()
            .any(|d| QUOTA_REASONS.contains(&d.reason.as_str()))
    });

    match status {
        StatusCode::UNAUTHORIZED => AuthError::Unauthorized(message).into(),
        StatusCode::NOT_FOUND | StatusCode::GONE => UploadError::NotFound(message),
        StatusCode::TOO_MANY_REQUESTS => UploadError::Quota {
            retry_after,
            message,
        },
        StatusCode::FORBIDDEN if is_quota => UploadError::Quota {
            retry_after,
            message,
        },
        StatusCode::REQUEST_TIMEOUT => UploadError::Transient(message),
        s if s.is_server_error() => UploadError::Transient(format!("{s}: {message}")),
        s => UploadError::Api {
            status: s.as_u16(),
            message,
        },
    }
}
