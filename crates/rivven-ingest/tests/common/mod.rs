//! Shared helpers for rivven-ingest integration tests

#![allow(dead_code)]

use rivven_ingest::{
    CollectionSpec, IngestionMode, IngestionModeController, PartitionKey, PartitionRecord,
    PartitionCoordinator,
};
use std::future::Future;
use std::sync::Once;
use std::time::{Duration, Instant};

static INIT: Once = Once::new();

/// Install a test subscriber once per binary (`RUST_LOG` overrides).
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("rivven_ingest=debug".parse().unwrap()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn spec(key: &str, mode: IngestionMode) -> CollectionSpec {
    CollectionSpec {
        partition: PartitionKey::new(key),
        mode,
        initial_phase: IngestionModeController::initial_phase(mode),
    }
}

/// Poll `check` every 10ms until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn record(coordinator: &PartitionCoordinator, key: &str) -> PartitionRecord {
    coordinator
        .partition(&PartitionKey::new(key))
        .await
        .unwrap()
        .unwrap()
}
