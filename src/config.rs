/// Monitor configuration from environment variables
///
/// Controls the balance API endpoint, polling cadence, persistence location
/// and the notification sink.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct MonitorConfig {
    /// Esplora-compatible balance API base URL
    pub esplora_url: String,
    /// Minimum spacing between two balance requests
    pub api_delay: Duration,
    /// Number of balance requests in flight per round
    pub parallel_limit: usize,
    /// Retries on HTTP 429 before giving up on an address
    pub max_retries: u32,
    /// First backoff delay; doubles on every retry
    pub retry_base_delay: Duration,
    /// Per-request timeout for the balance API
    pub request_timeout: Duration,
    /// JSON document holding every collection
    pub data_file: PathBuf,
    /// Address the control API binds to
    pub bind_address: String,
    /// Optional webhook receiving alert text; alerts are only logged when unset
    pub webhook_url: Option<String>,
}

impl MonitorConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `ESPLORA_URL`: balance API endpoint (default: mempool.space mainnet)
    /// - `API_DELAY_MS`: pacing between requests in milliseconds
    /// - `API_PARALLEL_LIMIT`: concurrent requests per round
    /// - `API_MAX_RETRIES`: retries on rate limiting
    /// - `API_RETRY_BASE_MS`: first backoff delay in milliseconds
    /// - `API_TIMEOUT_SECS`: request timeout in seconds
    /// - `DATA_FILE`: path of the persisted collections document
    /// - `BIND_ADDRESS`: control API listen address
    /// - `WEBHOOK_URL`: alert webhook (optional)
    ///
    /// # Examples
    ///
    /// ```bash
    /// # Poll a local Esplora every 250ms, four requests at a time
    /// ESPLORA_URL=http://localhost:3000 API_DELAY_MS=250 cargo run
    /// ```
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let esplora_url = env::var("ESPLORA_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or(defaults.esplora_url);
        log::info!("📡 Esplora URL: {}", esplora_url);

        let api_delay = Duration::from_millis(env_or("API_DELAY_MS", 1000));
        let parallel_limit = env_or::<usize>("API_PARALLEL_LIMIT", defaults.parallel_limit).max(1);
        log::info!(
            "⏱️  Polling with {} parallel request(s), {:?} apart",
            parallel_limit,
            api_delay
        );

        let max_retries = env_or("API_MAX_RETRIES", defaults.max_retries);
        let retry_base_delay = Duration::from_millis(env_or("API_RETRY_BASE_MS", 1000));
        let request_timeout = Duration::from_secs(env_or("API_TIMEOUT_SECS", 30));

        let data_file = env::var("DATA_FILE")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_file);
        log::info!("💾 Data file: {}", data_file.display());

        let bind_address = env::var("BIND_ADDRESS").unwrap_or(defaults.bind_address);

        let webhook_url = env::var("WEBHOOK_URL").ok().filter(|url| !url.is_empty());
        match webhook_url {
            Some(ref url) => log::info!("🔔 Alerts delivered to webhook {}", url),
            None => log::warn!("⚠️  WEBHOOK_URL not set, alerts will only be logged"),
        }

        Self {
            esplora_url,
            api_delay,
            parallel_limit,
            max_retries,
            retry_base_delay,
            request_timeout,
            data_file,
            bind_address,
            webhook_url,
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("⚠️  Ignoring unparsable {}='{}'", name, raw);
                default
            }
        },
        Err(_) => default,
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            esplora_url: "https://mempool.space/api".to_string(),
            api_delay: Duration::from_millis(1000),
            parallel_limit: 4,
            max_retries: 5,
            retry_base_delay: Duration::from_millis(1000),
            request_timeout: Duration::from_secs(30),
            data_file: PathBuf::from("./data/collections.json"),
            bind_address: "127.0.0.1:3000".to_string(),
            webhook_url: None,
        }
    }
}
