use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use pika_relay_core::{
    ConnectionStatus, Event, PoolOptions, PublishOptions, RelayConfig, RelayPool, RelayUrl,
};
use pika_relay_profiles::{RelayProfile, parse_relay_configs};

/// `--relay` flags win, then `--relays-file`, then the profile.
pub fn relay_configs(
    relay_urls: &[String],
    relays_file: Option<&Path>,
    profile: RelayProfile,
) -> Result<Vec<RelayConfig>> {
    if !relay_urls.is_empty() {
        return parse_relay_urls(relay_urls)
            .map(|urls| urls.into_iter().map(RelayConfig::new).collect());
    }
    if let Some(path) = relays_file {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read relay list {}", path.display()))?;
        let parsed = parse_relay_configs(&raw).context("parse relay list")?;
        for rejected in &parsed.rejected {
            tracing::warn!("skipping relay entry: {rejected}");
        }
        if parsed.configs.is_empty() {
            return Err(anyhow!("no usable relays in {}", path.display()));
        }
        return Ok(parsed.configs);
    }
    Ok(profile.relay_configs())
}

/// Reconcile a fresh pool onto `configs` and wait until at least one relay is
/// connected or `timeout` passes.
pub async fn connect_pool(
    configs: &[RelayConfig],
    options: PoolOptions,
    timeout: Duration,
) -> Result<RelayPool> {
    let pool = RelayPool::new(options);
    let statuses = pool.status_stream();
    pool.reconcile(configs);

    let wanted: HashSet<&RelayUrl> = configs
        .iter()
        .filter(|c| c.enabled)
        .map(|c| &c.endpoint)
        .collect();
    let mut connected = HashSet::new();
    let settled = tokio::time::timeout(timeout, async {
        while connected.len() < wanted.len() {
            let Some(change) = statuses.recv().await else {
                break;
            };
            if change.status == ConnectionStatus::Connected {
                connected.insert(change.relay);
            }
        }
    })
    .await;
    if settled.is_err() && connected.is_empty() {
        pool.shutdown();
        return Err(anyhow!("timeout waiting for any relay to connect"));
    }
    Ok(pool)
}

pub async fn publish_and_confirm(
    pool: &RelayPool,
    event: &Event,
    label: &str,
) -> Result<Vec<RelayUrl>> {
    let out = pool
        .publish(&pool.writable_relays(), event, PublishOptions::default())
        .await;
    if !out.is_success() {
        let reasons: Vec<String> = out
            .failures()
            .map(|f| format!("{}: {}", f.relay, f.message))
            .collect();
        return Err(anyhow!("no relay accepted event ({label}): {reasons:?}"));
    }
    Ok(out.successes().cloned().collect())
}

pub fn parse_relay_urls(urls: &[String]) -> Result<Vec<RelayUrl>> {
    urls.iter()
        .map(|u| RelayUrl::parse(u.as_str()).with_context(|| format!("parse relay url: {u}")))
        .collect()
}
