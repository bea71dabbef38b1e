//! Shared HTTP plumbing for provider clients.

use std::time::Duration;

use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;
use settlement_types::ProviderError;

pub(crate) fn build_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()
        .unwrap_or_default()
}

pub(crate) fn join(base_url: &str, path: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), path)
}

/// A provider reply: HTTP status plus the decoded JSON body.
pub(crate) struct Reply {
    pub status: StatusCode,
    pub body: Value,
}

impl Reply {
    /// The provider's human-readable message, if any.
    pub fn message(&self) -> String {
        self.body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("no message")
            .to_string()
    }

    pub fn data(&self) -> Option<&Value> {
        self.body.get("data")
    }

    /// Classifies non-2xx replies: 5xx and 429 are retryable, other 4xx are
    /// rejections.
    pub fn error_for_status(self) -> Result<Self, ProviderError> {
        if self.status.is_success() {
            return Ok(self);
        }
        if self.status.is_server_error() || self.status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::Unavailable(format!(
                "HTTP {}: {}",
                self.status,
                self.message()
            )));
        }
        Err(ProviderError::Rejected(self.message()))
    }
}

/// Sends `request`, mapping transport failures to `Unavailable`.
pub(crate) async fn send(request: RequestBuilder) -> Result<Reply, ProviderError> {
    let response = request
        .send()
        .await
        .map_err(|e| ProviderError::Unavailable(describe(&e)))?;

    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| ProviderError::Unavailable(describe(&e)))?;

    let body = if text.trim().is_empty() {
        Value::Null
    } else {
        match serde_json::from_str(&text) {
            Ok(body) => body,
            Err(_) if status.is_server_error() => Value::Null,
            Err(e) => {
                return Err(ProviderError::InvalidResponse(format!(
                    "HTTP {} with undecodable body: {}",
                    status, e
                )));
            }
        }
    };

    Ok(Reply { status, body })
}

fn describe(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        "request timed out".to_string()
    } else if e.is_connect() {
        format!("connection failed: {}", e)
    } else {
        e.to_string()
    }
}

/// Reads a required string field from a JSON object.
pub(crate) fn required_str<'a>(value: &'a Value, field: &str) -> Result<&'a str, ProviderError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ProviderError::InvalidResponse(format!("missing field `{}`", field)))
}

/// Renders a JSON scalar id (number or string) as a string.
pub(crate) fn id_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
