use crate::errors::ConciergeError;
use serde_json::Value;
use tracing::{error, warn};

/// Common error handling for completion-service clients.
///
/// Turns HTTP status codes and API error bodies into typed
/// [`ConciergeError`] values so the retry layer can distinguish transient
/// failures from permanent ones.
pub struct ProviderErrorHandler;

impl ProviderErrorHandler {
    /// Parse an API error body and return a typed error.
    pub fn parse_api_error(status: u16, error_text: &str) -> Result<(), ConciergeError> {
        if let Ok(error_json) = serde_json::from_str::<Value>(error_text) {
            if let Some(err) = error_json.get("error") {
                let error_type = err
                    .get("type")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown");
                let error_msg = err
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Unknown error");

                let retryable = status == 500 || status == 502 || status == 503;
                return Err(ConciergeError::Provider {
                    message: format!("API error ({}): {}", error_type, error_msg),
                    retryable,
                });
            }
        }

        let retryable = status == 500 || status == 502 || status == 503;
        Err(ConciergeError::Provider {
            message: format!("API error ({}): {}", status, error_text),
            retryable,
        })
    }

    fn handle_rate_limit(status: u16, retry_after: Option<u64>) -> ConciergeError {
        if let Some(seconds) = retry_after {
            warn!("Rate limit hit. Retry after {} seconds", seconds);
        } else {
            warn!("Rate limit hit (status: {})", status);
        }
        ConciergeError::RateLimit { retry_after }
    }

    fn handle_auth_error(status: u16, error_text: &str) -> ConciergeError {
        warn!("Authentication error (status: {}): {}", status, error_text);
        ConciergeError::Auth(format!(
            "Authentication failed. Please check your API key or credentials. Error: {}",
            error_text
        ))
    }

    /// Check HTTP status and return a typed error if the response is not
    /// successful. On success, returns the response unchanged.
    pub async fn check_http_status(
        resp: reqwest::Response,
        provider: &str,
    ) -> Result<reqwest::Response, anyhow::Error> {
        if resp.status().is_success() {
            return Ok(resp);
        }

        let status = resp.status();
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());

        let error_text = resp
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());

        if status == 429 {
            error!("{} provider error during chat: rate limit exceeded", provider);
            return Err(Self::handle_rate_limit(status.as_u16(), retry_after).into());
        }

        if status == 401 || status == 403 {
            error!("{} provider error during chat: authentication failed", provider);
            return Err(Self::handle_auth_error(status.as_u16(), &error_text).into());
        }

        error!("{} provider error during chat: {}", provider, error_text);
        Err(Self::parse_api_error(status.as_u16(), &error_text)
            .unwrap_err()
            .into())
    }

    /// Check an HTTP response for errors (rate limit, auth, generic API errors).
    /// Returns the response body as JSON on success, or a typed error on failure.
    pub async fn check_response(
        resp: reqwest::Response,
        provider: &str,
    ) -> Result<Value, anyhow::Error> {
        let resp = Self::check_http_status(resp, provider).await?;

        let json: Value = resp
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to parse {} API response: {}", provider, e))?;

        // Some services report errors with a 200 status
        if let Some(error_val) = json.get("error") {
            let error_text =
                serde_json::to_string(error_val).unwrap_or_else(|_| "Unknown error".to_string());
            error!("{} provider returned error body during chat", provider);
            return Err(Self::parse_api_error(200, &error_text).unwrap_err().into());
        }

        Ok(json)
    }
}
