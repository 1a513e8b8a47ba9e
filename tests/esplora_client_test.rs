//! Esplora client tests against an in-process mock
//!
//! Tests cover:
//! - Parsing cumulative chain/mempool totals
//! - Exponential retry on HTTP 429
//! - Giving up after the retry budget
//! - Non-retryable API errors
//! - End-to-end monitor rounds reporting BACKOFF

mod common;

use balance_monitor::error::FetchError;
use balance_monitor::monitor::{ApiState, Monitor, MonitorSettings, NewAddress};
use balance_monitor::storage::{Balances, MemoryStore};
use balance_monitor::{AddressRef, BalanceSource, EsploraClient};
use common::{init_logger, sample_addresses, MockEsplora, RecordingNotifier};
use std::sync::Arc;
use std::time::Duration;

fn totals() -> Balances {
    Balances {
        chain_in: 150_000,
        chain_out: 50_000,
        mempool_in: 2_000,
        mempool_out: 0,
    }
}

#[tokio::test]
async fn test_fetch_parses_totals() {
    init_logger();
    let mock = MockEsplora::start().await;
    let address = sample_addresses(1).remove(0);
    mock.set_balance(&address, totals());

    let client = EsploraClient::new(format!("{}/", mock.url));
    assert_eq!(client.base_url(), mock.url);

    let balances = client.fetch_balances(&address).await.unwrap();
    assert_eq!(balances, totals());
    assert_eq!(balances.confirmed_balance(), 100_000);

    // Through the trait object as the monitor sees it
    let source: Arc<dyn BalanceSource> = Arc::new(client);
    assert_eq!(source.fetch(&address).await.unwrap(), totals());
    assert_eq!(mock.request_count(&address), 2);
}

#[tokio::test]
async fn test_retries_after_rate_limit() {
    init_logger();
    let mock = MockEsplora::start().await;
    let address = sample_addresses(1).remove(0);
    mock.set_balance(&address, totals());
    mock.rate_limit(&address, 3);

    let client = EsploraClient::new(&mock.url).with_retry_policy(5, Duration::from_millis(5));
    let balances = client.fetch_balances(&address).await.unwrap();
    assert_eq!(balances, totals());
    assert_eq!(mock.request_count(&address), 4);
}

#[tokio::test]
async fn test_gives_up_after_retry_budget() {
    init_logger();
    let mock = MockEsplora::start().await;
    let address = sample_addresses(1).remove(0);
    mock.rate_limit(&address, 100);

    let client = EsploraClient::new(&mock.url).with_retry_policy(2, Duration::from_millis(5));
    let err = client.fetch_balances(&address).await.unwrap_err();
    assert_eq!(err, FetchError::RateLimited { attempts: 3 });
    assert!(err.is_rate_limited());
    assert_eq!(mock.request_count(&address), 3);
}

#[tokio::test]
async fn test_server_error_not_retried() {
    init_logger();
    let mock = MockEsplora::start().await;
    let address = sample_addresses(1).remove(0);
    mock.break_address(&address);

    let client = EsploraClient::new(&mock.url).with_retry_policy(5, Duration::from_millis(5));
    match client.fetch_balances(&address).await {
        Err(FetchError::Api { status, .. }) => assert_eq!(status, Some(500)),
        other => panic!("expected API error, got {:?}", other),
    }
    assert_eq!(mock.request_count(&address), 1);
}

#[tokio::test]
async fn test_unreachable_host_is_network_error() {
    init_logger();
    // Bind then drop to get a port nobody listens on
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let client = EsploraClient::new(url);
    let err = client.fetch_balances(&sample_addresses(1)[0]).await.unwrap_err();
    assert!(matches!(err, FetchError::Network(_)));
}

#[tokio::test]
async fn test_monitor_reports_backoff_when_retries_exhausted() {
    init_logger();
    let mock = MockEsplora::start().await;
    let addresses = sample_addresses(2);
    mock.set_balance(&addresses[0], totals());
    mock.rate_limit(&addresses[1], 100);

    let client = EsploraClient::new(&mock.url).with_retry_policy(1, Duration::from_millis(5));
    let notifier = Arc::new(RecordingNotifier::default());
    let monitor = Monitor::new(
        MonitorSettings {
            api_delay: Duration::from_millis(1),
            parallel_limit: 2,
        },
        Arc::new(client),
        Arc::new(MemoryStore::new()),
        notifier.clone(),
    )
    .unwrap();

    monitor.add_collection("cold").await.unwrap();
    for address in &addresses {
        monitor.add_address("cold", NewAddress::new(address)).await.unwrap();
    }

    let report = monitor.run_round().await;
    assert_eq!(report.processed, 2);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.rate_limited, 1);

    let ok = monitor.record(&AddressRef::plain("cold", &addresses[0])).await.unwrap();
    assert_eq!(ok.actual, Some(totals()));
    assert!(!ok.error);

    let limited = monitor.record(&AddressRef::plain("cold", &addresses[1])).await.unwrap();
    assert!(limited.error);
    assert!(limited.actual.is_none());

    assert_eq!(monitor.status().await.state, ApiState::Backoff);
    // The unexpected deposit on the healthy address still alerted
    assert_eq!(notifier.count(), 1);
}
