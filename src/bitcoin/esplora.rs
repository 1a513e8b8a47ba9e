use futures::future::BoxFuture;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::BalanceSource;
use crate::config::MonitorConfig;
use crate::error::FetchError;
use crate::storage::Balances;

/// Response body of `GET /address/{address}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddressStats {
    #[serde(default)]
    pub address: Option<String>,
    pub chain_stats: TxoStats,
    pub mempool_stats: TxoStats,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TxoStats {
    pub funded_txo_sum: u64,
    pub spent_txo_sum: u64,
    #[serde(default)]
    pub funded_txo_count: u64,
    #[serde(default)]
    pub spent_txo_count: u64,
    #[serde(default)]
    pub tx_count: u64,
}

impl From<AddressStats> for Balances {
    fn from(stats: AddressStats) -> Self {
        Balances {
            chain_in: stats.chain_stats.funded_txo_sum,
            chain_out: stats.chain_stats.spent_txo_sum,
            mempool_in: stats.mempool_stats.funded_txo_sum,
            mempool_out: stats.mempool_stats.spent_txo_sum,
        }
    }
}

/// Esplora balance client with rate-limit backoff.
///
/// A 429 (or a body mentioning "Too Many Requests") is retried after
/// `retry_base_delay * 2^attempt`, up to `max_retries` times. Every other
/// failure is returned immediately.
pub struct EsploraClient {
    client: reqwest::Client,
    base_url: String,
    max_retries: u32,
    retry_base_delay: Duration,
}

impl EsploraClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let defaults = MonitorConfig::default();
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            max_retries: defaults.max_retries,
            retry_base_delay: defaults.retry_base_delay,
        }
    }

    pub fn from_config(config: &MonitorConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.esplora_url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
            retry_base_delay: config.retry_base_delay,
        })
    }

    pub fn with_retry_policy(mut self, max_retries: u32, retry_base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_base_delay = retry_base_delay;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch cumulative totals, retrying on rate limiting.
    pub async fn fetch_balances(&self, address: &str) -> Result<Balances, FetchError> {
        let mut attempt: u32 = 0;
        loop {
            match self.fetch_once(address).await {
                Err(FetchError::RateLimited { .. }) if attempt < self.max_retries => {
                    let backoff = self
                        .retry_base_delay
                        .saturating_mul(2u32.saturating_pow(attempt));
                    attempt += 1;
                    log::warn!(
                        "⏳ Rate limited on {}, retry {}/{} in {:?}",
                        address,
                        attempt,
                        self.max_retries,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(FetchError::RateLimited { .. }) => {
                    log::error!("Giving up on {} after {} attempt(s)", address, attempt + 1);
                    return Err(FetchError::RateLimited { attempts: attempt + 1 });
                }
                other => return other,
            }
        }
    }

    async fn fetch_once(&self, address: &str) -> Result<Balances, FetchError> {
        let url = format!("{}/address/{}", self.base_url, address);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::RateLimited { attempts: 1 });
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        if !status.is_success() {
            if body.contains("Too Many Requests") {
                return Err(FetchError::RateLimited { attempts: 1 });
            }
            return Err(FetchError::Api {
                status: Some(status.as_u16()),
                message: format!("HTTP {}: {}", status.as_u16(), body.trim()),
            });
        }

        let stats: AddressStats = serde_json::from_str(&body).map_err(|e| FetchError::Api {
            status: None,
            message: format!("unreadable address stats: {}", e),
        })?;

        Ok(stats.into())
    }
}

impl BalanceSource for EsploraClient {
    fn fetch<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<Balances, FetchError>> {
        Box::pin(self.fetch_balances(address))
    }
}
