//! Utility functions for common operations.

use crate::error::TranslationError;
use std::time::Duration;

/// Joins block fragments into one batched request body.
pub fn join_fragments(fragments: &[String], delimiter: &str) -> String {
    fragments.join(&format!("\n{}\n", delimiter))
}

/// Splits a batched response back into trimmed fragments.
///
/// The caller decides what a count mismatch means; no realignment is
/// attempted here.
pub fn split_fragments(response: &str, delimiter: &str) -> Vec<String> {
    response
        .split(delimiter)
        .map(|piece| piece.trim().to_string())
        .collect()
}

/// Checks if an HTTP response is successful, and if not, returns a detailed error.
///
/// This helper extracts both the status code and response body for better error messages.
/// HTTP 429 is reported as [`TranslationError::RateLimited`].
pub async fn check_response_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, TranslationError> {
    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(TranslationError::RateLimited(text));
        }
        return Err(TranslationError::ApiError {
            status: status.as_u16(),
            message: text,
        });
    }
    Ok(response)
}

/// Sleeps for the given duration if it is non-zero.
pub async fn pause(duration: Duration) {
    if !duration.is_zero() {
        tokio::time::sleep(duration).await;
    }
}
