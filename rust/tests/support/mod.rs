#![allow(dead_code)]

use std::collections::HashSet;
use std::time::{Duration, Instant};

use pika_relay_core::{
    ConnectionStatus, Event, EventBuilder, Keys, PoolOptions, RelayConfig, RelayPool, RelayUrl,
    Timestamp,
};
use pika_test_utils::MockRelay;

pub async fn wait_until(what: &str, timeout: Duration, mut f: impl FnMut() -> bool) {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{what}: condition not met within {timeout:?}");
}

pub fn relay_url(relay: &MockRelay) -> RelayUrl {
    RelayUrl::parse(relay.url()).unwrap()
}

/// Options with reconnects fast enough for tests.
pub fn fast_options() -> PoolOptions {
    PoolOptions {
        connect_timeout_ms: 2_000,
        reconnect_base_delay_ms: 50,
        reconnect_max_delay_ms: 200,
        query_max_wait_ms: 3_000,
        publish_timeout_ms: 3_000,
        ..PoolOptions::default()
    }
}

/// Pool reconciled onto `relays` with full read/write policy.
pub fn pool_for(relays: &[&MockRelay]) -> (RelayPool, Vec<RelayUrl>) {
    let pool = RelayPool::new(fast_options());
    let urls: Vec<RelayUrl> = relays.iter().map(|r| relay_url(r)).collect();
    let configs: Vec<RelayConfig> = urls.iter().cloned().map(RelayConfig::new).collect();
    pool.reconcile(&configs);
    (pool, urls)
}

/// Block until every url reports `Connected` on the pool's status stream.
pub async fn wait_connected(pool: &RelayPool, urls: &[RelayUrl]) {
    let statuses = pool.status_stream();
    let wanted: HashSet<&RelayUrl> = urls.iter().collect();
    let mut connected: HashSet<RelayUrl> = HashSet::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !wanted.iter().all(|u| connected.contains(*u)) {
            let change = statuses.recv().await.expect("pool alive");
            if change.status == ConnectionStatus::Connected {
                connected.insert(change.relay);
            } else {
                connected.remove(&change.relay);
            }
        }
    })
    .await
    .expect("relays connected in time");
}

pub fn note(keys: &Keys, content: &str, created_at: u64) -> Event {
    EventBuilder::text_note(content)
        .custom_created_at(Timestamp::from_secs(created_at))
        .sign_with_keys(keys)
        .unwrap()
}

pub fn to_json(event: &Event) -> serde_json::Value {
    serde_json::from_str(&event.as_json()).unwrap()
}
