//! Shared helpers for unit and integration tests.

use std::time::Duration;

use crate::config::TopologyConfig;

/// Topology config with millisecond retry delays and unlimited prefetch.
pub fn fast_config() -> TopologyConfig {
    TopologyConfig {
        reconnect_delay: Duration::from_millis(5),
        retry_backoff: Duration::from_millis(1),
        prefetch: 0,
        ..TopologyConfig::default()
    }
}

/// Poll `condition` until it holds; panics after five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached within 5s");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
