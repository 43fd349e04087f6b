//! Relay pool: reconciliation plus query/publish/subscribe fan-out

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::RwLock;
use pika_relay_profiles::{RelayConfig, RelayUrl};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::connection::{Connection, PublishAck, RelayPolicy, SubscriptionItem, SubscriptionMessage};
use super::seen::SeenCache;
use super::status::{ConnectionStatus, StatusRegistry, StatusSubscription};
use super::RelayError;
use crate::event::{Event, EventId, Filter};
use crate::message::SubscriptionId;
use crate::options::PoolOptions;

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Defaults to [`PoolOptions::query_max_wait`].
    pub max_wait: Option<Duration>,
    /// Receives each event the first time it is accepted.
    pub progress: Option<flume::Sender<Event>>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    pub fn progress(mut self, progress: flume::Sender<Event>) -> Self {
        self.progress = Some(progress);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryOutput {
    /// Unique by id, newest first.
    pub events: Vec<Event>,
    /// Relays that sent EOSE or CLOSED.
    pub completed: Vec<RelayUrl>,
    /// Relays still pending at the deadline.
    pub timed_out: Vec<RelayUrl>,
    max_wait: Duration,
}

impl QueryOutput {
    pub fn is_complete(&self) -> bool {
        self.timed_out.is_empty()
    }

    pub fn timeout_error(&self) -> Option<RelayError> {
        (!self.timed_out.is_empty()).then_some(RelayError::QueryTimeout(self.max_wait))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    /// Defaults to [`PoolOptions::publish_timeout`].
    pub timeout: Option<Duration>,
    /// Count a relay as successful only once it answers `OK true`. When
    /// false, a completed socket write is enough.
    pub wait_for_ok: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            wait_for_ok: true,
        }
    }
}

impl PublishOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn fire_and_forget(mut self) -> Self {
        self.wait_for_ok = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishResult {
    pub relay: RelayUrl,
    pub success: bool,
    /// Relay message from `OK`, or the error text.
    pub message: String,
    pub error: Option<RelayError>,
}

impl PublishResult {
    fn new(relay: RelayUrl, outcome: Result<String, RelayError>) -> Self {
        match outcome {
            Ok(message) => Self {
                relay,
                success: true,
                message,
                error: None,
            },
            Err(e) => Self {
                relay,
                success: false,
                message: match &e {
                    RelayError::Rejected(message) => message.clone(),
                    other => other.to_string(),
                },
                error: Some(e),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutput {
    pub event_id: EventId,
    pub results: Vec<PublishResult>,
}

impl PublishOutput {
    /// At least one relay succeeded.
    pub fn is_success(&self) -> bool {
        self.results.iter().any(|r| r.success)
    }

    pub fn successes(&self) -> impl Iterator<Item = &RelayUrl> {
        self.results.iter().filter(|r| r.success).map(|r| &r.relay)
    }

    pub fn failures(&self) -> impl Iterator<Item = &PublishResult> {
        self.results.iter().filter(|r| !r.success)
    }
}

/// Connect/disconnect actions taken by [`RelayPool::reconcile`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: Vec<RelayUrl>,
    pub removed: Vec<RelayUrl>,
    /// Kept connections whose read/write policy changed.
    pub updated: Vec<RelayUrl>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayInfo {
    pub url: RelayUrl,
    pub status: ConnectionStatus,
    pub can_read: bool,
    pub can_write: bool,
}

/// Event from a long-lived subscription, with the relay that delivered it first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEvent {
    pub relay: RelayUrl,
    pub event: Event,
}

/// Long-lived subscription. Sends `CLOSE` to every relay when dropped.
pub struct RelaySubscription {
    id: SubscriptionId,
    rx: flume::Receiver<RelayEvent>,
    connections: Vec<Connection>,
}

impl RelaySubscription {
    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    /// Next new event, or `None` once every relay is gone.
    pub async fn recv(&self) -> Option<RelayEvent> {
        self.rx.recv_async().await.ok()
    }

    pub fn try_recv(&self) -> Option<RelayEvent> {
        self.rx.try_recv().ok()
    }

    pub fn receiver(&self) -> &flume::Receiver<RelayEvent> {
        &self.rx
    }

    pub fn close(self) {}
}

impl Drop for RelaySubscription {
    fn drop(&mut self) {
        for connection in &self.connections {
            connection.unsubscribe(self.id.clone());
        }
    }
}

struct PoolInner {
    options: PoolOptions,
    relays: RwLock<HashMap<RelayUrl, Connection>>,
    statuses: Arc<StatusRegistry>,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        for connection in self.relays.get_mut().values() {
            connection.shutdown();
        }
    }
}

/// Set of relay connections. Clones share the same connections.
///
/// Connection tasks are spawned on the ambient Tokio runtime, so
/// [`RelayPool::reconcile`] must be called from within one.
#[derive(Clone)]
pub struct RelayPool {
    inner: Arc<PoolInner>,
}

impl Default for RelayPool {
    fn default() -> Self {
        Self::new(PoolOptions::default())
    }
}

impl RelayPool {
    pub fn new(options: PoolOptions) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                options,
                relays: RwLock::new(HashMap::new()),
                statuses: StatusRegistry::new(),
            }),
        }
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    /// Bring live connections in line with `configs`.
    ///
    /// Absent or disabled endpoints are shut down, newly enabled ones are
    /// connected and policy changes apply in place. Calling it again with the
    /// same configs does nothing.
    pub fn reconcile(&self, configs: &[RelayConfig]) -> ReconcileReport {
        let mut desired: HashMap<&RelayUrl, &RelayConfig> = HashMap::new();
        for config in configs.iter().filter(|c| c.enabled) {
            desired.entry(&config.endpoint).or_insert(config);
        }

        let mut report = ReconcileReport::default();
        {
            let mut relays = self.inner.relays.write();
            relays.retain(|url, connection| {
                if desired.contains_key(url) {
                    return true;
                }
                connection.shutdown();
                report.removed.push(url.clone());
                false
            });

            for (url, config) in desired {
                let policy = RelayPolicy::of(config);
                match relays.get(url) {
                    Some(connection) => {
                        if connection.policy() != policy {
                            connection.set_policy(policy);
                            report.updated.push(url.clone());
                        }
                    }
                    None => {
                        let connection =
                            Connection::spawn(config, &self.inner.options, self.inner.statuses.clone());
                        relays.insert(url.clone(), connection);
                        report.added.push(url.clone());
                    }
                }
            }
        }

        report.added.sort();
        report.removed.sort();
        report.updated.sort();
        if !report.is_noop() {
            info!(
                added = report.added.len(),
                removed = report.removed.len(),
                updated = report.updated.len(),
                "reconciled relays"
            );
        }
        report
    }

    pub fn connection(&self, url: &RelayUrl) -> Option<Connection> {
        self.inner.relays.read().get(url).cloned()
    }

    /// Snapshot of every configured relay, sorted by url.
    pub fn relays(&self) -> Vec<RelayInfo> {
        let mut infos: Vec<RelayInfo> = self
            .inner
            .relays
            .read()
            .values()
            .map(|c| RelayInfo {
                url: c.url().clone(),
                status: c.status(),
                can_read: c.can_read(),
                can_write: c.can_write(),
            })
            .collect();
        infos.sort_by(|a, b| a.url.cmp(&b.url));
        infos
    }

    pub fn readable_relays(&self) -> Vec<RelayUrl> {
        self.relays()
            .into_iter()
            .filter(|r| r.can_read)
            .map(|r| r.url)
            .collect()
    }

    pub fn writable_relays(&self) -> Vec<RelayUrl> {
        self.relays()
            .into_iter()
            .filter(|r| r.can_write)
            .map(|r| r.url)
            .collect()
    }

    pub fn relay_status(&self, url: &RelayUrl) -> Option<ConnectionStatus> {
        self.inner.statuses.get(url)
    }

    /// Status changes, starting with the current status of every relay.
    pub fn status_stream(&self) -> StatusSubscription {
        self.inner.statuses.subscribe()
    }

    /// Re-arm a relay that exhausted its reconnect attempts.
    pub fn retry(&self, url: &RelayUrl) -> bool {
        match self.connection(url) {
            Some(connection) => {
                connection.retry();
                true
            }
            None => false,
        }
    }

    /// Disconnect every relay. Reconnection stops; a later `reconcile`
    /// starts fresh connections.
    pub fn shutdown(&self) {
        let drained: Vec<Connection> = self.inner.relays.write().drain().map(|(_, c)| c).collect();
        for connection in &drained {
            connection.shutdown();
        }
        info!(relays = drained.len(), "relay pool shut down");
    }

    fn targets(&self, relays: &[RelayUrl], usable: impl Fn(&Connection) -> bool) -> Vec<Connection> {
        let map = self.inner.relays.read();
        let mut picked = HashSet::new();
        relays
            .iter()
            .filter(|url| picked.insert(*url))
            .filter_map(|url| map.get(url))
            .filter(|c| usable(*c))
            .cloned()
            .collect()
    }

    /// Fetch stored events from the connected, readable relays among `relays`.
    ///
    /// Waits for every relay's EOSE or the deadline, whichever comes first,
    /// then closes the subscription everywhere. Never fails: relays that did
    /// not finish are listed in [`QueryOutput::timed_out`].
    pub async fn query(&self, relays: &[RelayUrl], filters: Vec<Filter>, opts: QueryOptions) -> QueryOutput {
        let max_wait = opts
            .max_wait
            .unwrap_or_else(|| self.inner.options.query_max_wait());
        let targets = self.targets(relays, |c| c.can_read() && c.is_connected());
        if targets.is_empty() {
            debug!("query skipped: no connected relays");
            return QueryOutput {
                max_wait,
                ..Default::default()
            };
        }

        let id = SubscriptionId::generate();
        let (tx, rx) = flume::unbounded::<SubscriptionItem>();
        let mut pending: HashSet<RelayUrl> = HashSet::new();
        for connection in &targets {
            if connection.subscribe(id.clone(), filters.clone(), tx.clone()) {
                pending.insert(connection.url().clone());
            }
        }
        drop(tx);

        let deadline = Instant::now() + max_wait;
        let mut accepted: HashMap<EventId, Event> = HashMap::new();
        let mut completed = Vec::new();
        while !pending.is_empty() {
            let item = match tokio::time::timeout_at(deadline, rx.recv_async()).await {
                Ok(Ok(item)) => item,
                Ok(Err(_)) | Err(_) => break,
            };
            match item.message {
                SubscriptionMessage::Event(event) => {
                    if let Entry::Vacant(slot) = accepted.entry(event.id) {
                        if let Some(progress) = &opts.progress {
                            let _ = progress.send((*event).clone());
                        }
                        slot.insert(*event);
                    }
                }
                SubscriptionMessage::EndOfStoredEvents | SubscriptionMessage::Closed(_) => {
                    if pending.remove(&item.relay) {
                        completed.push(item.relay);
                    }
                }
            }
        }

        for connection in &targets {
            connection.unsubscribe(id.clone());
        }

        let mut timed_out: Vec<RelayUrl> = pending.into_iter().collect();
        timed_out.sort();
        completed.sort();
        if !timed_out.is_empty() {
            warn!(sub = %id, ?timed_out, "query deadline hit before EOSE");
        }

        let mut events: Vec<Event> = accepted.into_values().collect();
        events.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        debug!(sub = %id, events = events.len(), "query finished");

        QueryOutput {
            events,
            completed,
            timed_out,
            max_wait,
        }
    }

    /// Send `event` to the connected, writable relays among `relays`.
    pub async fn publish(&self, relays: &[RelayUrl], event: &Event, opts: PublishOptions) -> PublishOutput {
        let timeout = opts
            .timeout
            .unwrap_or_else(|| self.inner.options.publish_timeout());
        let targets = self.targets(relays, |c| c.can_write() && c.is_connected());

        let attempts = targets.iter().map(|connection| {
            let ack = connection.publish(event, opts.wait_for_ok);
            let relay = connection.url().clone();
            async move {
                let outcome = match tokio::time::timeout(timeout, ack).await {
                    Ok(Ok(PublishAck::Sent)) => Ok(String::new()),
                    Ok(Ok(PublishAck::Accepted(message))) => Ok(message),
                    Ok(Ok(PublishAck::Rejected(message))) => Err(RelayError::Rejected(message)),
                    Ok(Err(_)) => Err(RelayError::ConnectionClosed),
                    Err(_) => Err(RelayError::PublishTimeout(timeout)),
                };
                PublishResult::new(relay, outcome)
            }
        });
        let mut results = join_all(attempts).await;
        results.sort_by(|a, b| a.relay.cmp(&b.relay));

        for failure in results.iter().filter(|r| !r.success) {
            warn!(relay = %failure.relay, id = %event.id, "publish failed: {}", failure.message);
        }
        let output = PublishOutput {
            event_id: event.id,
            results,
        };
        debug!(
            id = %event.id,
            ok = output.successes().count(),
            total = output.results.len(),
            "publish finished"
        );
        output
    }

    /// Open a long-lived subscription on the readable relays among `relays`.
    ///
    /// Relays that are not connected yet receive the `REQ` once they are, and
    /// again after every reconnect. Events are deduplicated across relays.
    pub fn subscribe(&self, relays: &[RelayUrl], filters: Vec<Filter>) -> RelaySubscription {
        let id = SubscriptionId::generate();
        let connections = self.targets(relays, |c| c.can_read());
        let (raw_tx, raw_rx) = flume::unbounded::<SubscriptionItem>();
        let (tx, rx) = flume::unbounded::<RelayEvent>();
        for connection in &connections {
            connection.subscribe(id.clone(), filters.clone(), raw_tx.clone());
        }
        drop(raw_tx);

        let mut seen = SeenCache::new(self.inner.options.seen_cache_capacity);
        let sub = id.clone();
        tokio::spawn(async move {
            while let Ok(item) = raw_rx.recv_async().await {
                match item.message {
                    SubscriptionMessage::Event(event) => {
                        if !seen.insert(event.id) {
                            continue;
                        }
                        let delivered = RelayEvent {
                            relay: item.relay,
                            event: *event,
                        };
                        if tx.send(delivered).is_err() {
                            break;
                        }
                    }
                    SubscriptionMessage::EndOfStoredEvents => {
                        debug!(%sub, relay = %item.relay, "stored events done, now live");
                    }
                    SubscriptionMessage::Closed(reason) => {
                        debug!(%sub, relay = %item.relay, "subscription closed: {reason}");
                    }
                }
            }
        });

        RelaySubscription {
            id,
            rx,
            connections,
        }
    }
}

impl std::fmt::Debug for RelayPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayPool")
            .field("relays", &self.relays())
            .finish()
    }
}
