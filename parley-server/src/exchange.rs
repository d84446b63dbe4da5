//! OAuth code exchange
//!
//! The identity provider turns the authorization code handed to the
//! callback into the signed-in user's id.

use async_trait::async_trait;
use parley_common::UserId;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("API error {0}: {1}")]
    ApiError(u16, String),

    #[error("Parse error: {0}")]
    ParseError(String),
}

#[async_trait]
pub trait CodeExchange: Send + Sync {
    async fn exchange(&self, code: &str) -> Result<UserId, ExchangeError>;
}

#[derive(Debug, Serialize)]
struct ExchangeRequest<'a> {
    code: &'a str,
}

#[derive(Debug, Deserialize)]
struct ExchangeResponse {
    user_id: String,
}

/// POSTs `{"code": ..}` and reads `{"user_id": ..}` back
pub struct HttpCodeExchange {
    http_client: reqwest::Client,
    url: String,
}

impl HttpCodeExchange {
    pub fn new(url: String) -> Result<Self, ExchangeError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| ExchangeError::NetworkError(e.to_string()))?;
        Ok(Self { http_client, url })
    }
}

#[async_trait]
impl CodeExchange for HttpCodeExchange {
    async fn exchange(&self, code: &str) -> Result<UserId, ExchangeError> {
        let response = self
            .http_client
            .post(&self.url)
            .json(&ExchangeRequest { code })
            .send()
            .await
            .map_err(|e| ExchangeError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ExchangeError::ApiError(status.as_u16(), error_text));
        }

        let body: ExchangeResponse = response
            .json()
            .await
            .map_err(|e| ExchangeError::ParseError(e.to_string()))?;

        UserId::new(body.user_id).map_err(|e| ExchangeError::ParseError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_parses() {
        let body: ExchangeResponse = serde_json::from_str(r#"{"user_id":"u-1","extra":1}"#).unwrap();
        assert_eq!(body.user_id, "u-1");
    }

    #[tokio::test]
    async fn test_unreachable_provider_is_network_error() {
        let exchange = HttpCodeExchange::new("http://127.0.0.1:9/token".into()).unwrap();
        assert!(matches!(
            exchange.exchange("abc").await,
            Err(ExchangeError::NetworkError(_))
        ));
    }
}
