//! HTTP client construction and failure classification

use crate::error::Result;
use crate::retry::AttemptError;
use reqwest::{Client, StatusCode};
use std::time::Duration;

/// Header carrying the API key
pub const API_KEY_HEADER: &str = "x-api-key";

const USER_AGENT: &str = concat!("fac-pipeline/", env!("CARGO_PKG_VERSION"));

/// Client shared by all fetches of a run
pub fn build_client(timeout: Duration) -> Result<Client> {
    Ok(Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()?)
}

/// Classify a transport error
///
/// Timeouts, connection failures and truncated bodies are worth retrying;
/// anything else (bad URL, redirect loops) is not.
pub fn classify_reqwest(context: &str, err: &reqwest::Error) -> AttemptError {
    if let Some(status) = err.status() {
        return classify_status(context, status);
    }
    let message = format!("{}: {}", context, err);
    if err.is_timeout() || err.is_connect() || err.is_body() || err.is_decode() || err.is_request()
    {
        AttemptError::transient(message)
    } else {
        AttemptError::permanent(message)
    }
}

/// Classify a non-success HTTP status
pub fn classify_status(context: &str, status: StatusCode) -> AttemptError {
    let message = format!("{}: HTTP {}", context, status);
    if is_transient_status(status) {
        AttemptError::transient(message)
    } else {
        AttemptError::permanent(message)
    }
}

/// 408, 429 and every 5xx
pub fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}
