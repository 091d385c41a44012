// Shared helpers for integration tests

#![allow(dead_code)]

use querykit::prelude::*;
use querykit::transport::mock::MockTransport;
use tracing_subscriber::EnvFilter;

pub const BASE_URL: &str = "http://api.test";

/// Routes library logs to the test output. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("querykit=debug")),
        )
        .with_test_writer()
        .try_init();
}

pub fn client(mock: &MockTransport, settings: QuerySettings) -> QueryClient {
    init_tracing();
    QueryClient::builder(BASE_URL)
        .transport(mock.clone())
        .settings(settings)
        .build()
        .unwrap()
}

pub fn client_with_platform(
    mock: &MockTransport,
    settings: QuerySettings,
    platform: &ManualPlatform,
) -> QueryClient {
    init_tracing();
    QueryClient::builder(BASE_URL)
        .transport(mock.clone())
        .settings(settings)
        .platform(platform.clone())
        .build()
        .unwrap()
}

/// Lets spawned fetch tasks run without moving the clock.
pub async fn flush() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
