use url::Url;

use crate::error::{ConnectionError, SessionError};

/// Maximum length of one text increment
const MAX_TEXT_LENGTH: usize = 5000;

/// Validate a text increment before it is sent upstream
pub fn validate_text(text: &str) -> Result<(), SessionError> {
    if text.trim().is_empty() {
        return Err(SessionError::InvalidInput("Text cannot be empty".to_string()));
    }
    let chars = text.chars().count();
    if chars > MAX_TEXT_LENGTH {
        return Err(SessionError::InvalidInput(format!(
            "Text too long ({} characters, max {})",
            chars, MAX_TEXT_LENGTH
        )));
    }
    Ok(())
}

/// Validate endpoint format (ws://host[:port][/path] or wss://...)
pub fn validate_endpoint(endpoint: &str) -> Result<(), ConnectionError> {
    let url = Url::parse(endpoint)
        .map_err(|e| ConnectionError::InvalidEndpoint(format!("{}: {}", endpoint, e)))?;

    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(ConnectionError::InvalidEndpoint(format!(
            "{}: expected a ws:// or wss:// URL",
            endpoint
        )));
    }
    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(()),
        _ => Err(ConnectionError::InvalidEndpoint(format!("{}: missing host", endpoint))),
    }
}
