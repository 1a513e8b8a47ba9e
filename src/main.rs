use balance_monitor::api::server;
use balance_monitor::{EsploraClient, JsonFileStore, LogNotifier, Monitor, MonitorConfig, Notifier, WebhookNotifier};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    // Initialize logger (set RUST_LOG=debug for verbose output, RUST_LOG=info for normal)
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = MonitorConfig::from_env();

    let notifier: Arc<dyn Notifier> = match &config.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
        None => Arc::new(LogNotifier),
    };

    let monitor = Arc::new(Monitor::new(
        (&config).into(),
        Arc::new(EsploraClient::from_config(&config)?),
        Arc::new(JsonFileStore::new(&config.data_file)),
        notifier,
    )?);

    let scheduler = monitor.spawn_scheduler();

    log::info!("Starting balance monitor on {}", config.bind_address);
    let served = server::start_server(&config.bind_address, monitor).await;

    scheduler.stop().await;
    served
}
