use super::{TransientNetworkError, ValidationFunction, ValidationRequest, ValidationResponse};
use crate::error::AppError;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use util::config::AppConfig;

pub const VALIDATE_PATH: &str = "/api/attendance/validate";

#[derive(Deserialize)]
struct Envelope<T> {
    data: Option<T>,
}

/// Device-side [`ValidationFunction`] that posts claims to the server's
/// validation endpoint.
#[derive(Clone)]
pub struct HttpValidationClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpValidationClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::InvalidInput(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}{}", base_url.trim_end_matches('/'), VALIDATE_PATH),
        })
    }

    pub fn from_config() -> Result<Self, AppError> {
        let (url, secs) = {
            let cfg = AppConfig::global();
            (cfg.validation_url.clone(), cfg.network_timeout_secs)
        };
        Self::new(&url, Duration::from_secs(secs))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn classify(e: reqwest::Error) -> TransientNetworkError {
    if e.is_timeout() {
        TransientNetworkError::Timeout
    } else {
        TransientNetworkError::Unreachable(e.to_string())
    }
}

#[async_trait]
impl ValidationFunction for HttpValidationClient {
    async fn validate(
        &self,
        request: ValidationRequest,
    ) -> Result<ValidationResponse, TransientNetworkError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(classify)?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(TransientNetworkError::Server(format!("HTTP {status}")));
        }

        let body: Envelope<ValidationResponse> = resp.json().await.map_err(|e| {
            TransientNetworkError::Server(format!("unreadable response (HTTP {status}): {e}"))
        })?;
        body.data.ok_or_else(|| {
            TransientNetworkError::Server(format!("response without data (HTTP {status})"))
        })
    }
}
