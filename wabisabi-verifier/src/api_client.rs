//! Client for the external risk-scoring API.
//!
//! One GET per address: `{api_url}/{address}` with a bearer token. Transient
//! failures are retried with a linear backoff; client errors are not.

use std::time::Duration;

use bitcoin::{Address, Network, Script};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use wabisabi_core::{CoinVerifierConfig, CoordinatorError, Result, RISK_API_RETRY_STEP};

/// One risk indicator in a report.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskFlag {
    pub name: String,
    pub id: u32,
}

/// Scoring part of a report.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CscoreSection {
    pub cscore: f64,
    #[serde(default)]
    pub cscore_info: Vec<RiskFlag>,
}

/// Risk report for one address.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    /// Opaque provider metadata.
    #[serde(default)]
    pub report_info_section: serde_json::Value,
    pub cscore_section: CscoreSection,
}

impl ApiResponse {
    /// Risk flag ids in the report.
    pub fn flag_ids(&self) -> Vec<u32> {
        self.cscore_section.cscore_info.iter().map(|f| f.id).collect()
    }
}

/// HTTP client for the risk API.
pub struct CoinVerifierApiClient {
    http_client: reqwest::Client,
    base_url: String,
    token: String,
    network: Network,
    max_attempts: u32,
    retry_delay: Duration,
}

impl CoinVerifierApiClient {
    /// Creates a client from the verifier settings.
    pub fn new(config: &CoinVerifierConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.api_timeout())
            .build()
            .map_err(|e| CoordinatorError::ConfigError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.api_token.clone(),
            network: config.network,
            max_attempts: config.max_attempts.max(1),
            retry_delay: RISK_API_RETRY_STEP,
        })
    }

    /// Overrides the base backoff step.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Fetches the report for the address of `script`.
    #[instrument(skip(self, script))]
    pub async fn get_report(&self, script: &Script) -> Result<ApiResponse> {
        let address = Address::from_script(script, self.network)
            .map_err(|e| CoordinatorError::ValidationError(format!("Script has no address form: {}", e)))?;
        let url = format!("{}/{}", self.base_url, address);

        let mut attempt = 1;
        loop {
            match self.send_once(&url).await {
                Ok(response) => {
                    debug!(%address, attempt, flags = ?response.flag_ids(), "Risk report received");
                    return Ok(response);
                }
                Err(e) if e.is_recoverable() && attempt < self.max_attempts => {
                    warn!(%address, attempt, error = %e, "Risk API call failed, retrying");
                    tokio::time::sleep(self.retry_delay * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once(&self, url: &str) -> Result<ApiResponse> {
        let mut request = self.http_client.get(url);
        if !self.token.is_empty() {
            request = request.bearer_auth(&self.token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                CoordinatorError::ConnectionTimeout(e.to_string())
            } else {
                CoordinatorError::HttpError(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CoordinatorError::ApiStatus {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<ApiResponse>()
            .await
            .map_err(|e| CoordinatorError::HttpError(format!("Malformed risk report: {}", e)))
    }
}
