//! Connection status and change notifications

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use pika_relay_profiles::RelayUrl;

/// Connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionStatus {
    /// Edges of the connection state machine.
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Error)
                | (Connecting, Disconnected)
                | (Connected, Error)
                | (Connected, Disconnected)
                | (Error, Connecting)
                | (Error, Disconnected)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `(relay, status)` notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub relay: RelayUrl,
    pub status: ConnectionStatus,
}

struct Entry {
    connection_id: u64,
    status: ConnectionStatus,
}

#[derive(Default)]
struct RegistryInner {
    entries: BTreeMap<RelayUrl, Entry>,
    listeners: HashMap<u64, flume::Sender<StatusChange>>,
    next_listener: u64,
}

/// Latest status per relay plus the set of listeners.
///
/// Updates carry the id of the connection that produced them, so a connection
/// being torn down cannot overwrite the status of its replacement.
#[derive(Default)]
pub(crate) struct StatusRegistry {
    inner: Mutex<RegistryInner>,
}

impl StatusRegistry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn update(&self, relay: &RelayUrl, connection_id: u64, status: ConnectionStatus) {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(relay) {
            Some(entry) if entry.connection_id > connection_id => return,
            Some(entry) => {
                entry.connection_id = connection_id;
                entry.status = status;
            }
            None => {
                inner.entries.insert(
                    relay.clone(),
                    Entry {
                        connection_id,
                        status,
                    },
                );
            }
        }
        let change = StatusChange {
            relay: relay.clone(),
            status,
        };
        inner
            .listeners
            .retain(|_, tx| tx.send(change.clone()).is_ok());
    }

    /// Drop the entry if it still belongs to `connection_id`.
    pub(crate) fn forget(&self, relay: &RelayUrl, connection_id: u64) {
        let mut inner = self.inner.lock();
        if inner
            .entries
            .get(relay)
            .is_some_and(|e| e.connection_id == connection_id)
        {
            inner.entries.remove(relay);
        }
    }

    pub(crate) fn get(&self, relay: &RelayUrl) -> Option<ConnectionStatus> {
        self.inner.lock().entries.get(relay).map(|e| e.status)
    }

    /// Current statuses are queued on the new channel before it is registered,
    /// under the same lock, so no change can slip in between.
    pub(crate) fn subscribe(self: &Arc<Self>) -> StatusSubscription {
        let (tx, rx) = flume::unbounded();
        let mut inner = self.inner.lock();
        for (relay, entry) in &inner.entries {
            let _ = tx.send(StatusChange {
                relay: relay.clone(),
                status: entry.status,
            });
        }
        let id = inner.next_listener;
        inner.next_listener += 1;
        inner.listeners.insert(id, tx);
        StatusSubscription {
            id,
            rx,
            registry: Arc::downgrade(self),
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.inner.lock().listeners.remove(&id);
    }

    #[cfg(test)]
    fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }
}

/// Status change stream. Unsubscribes when dropped.
pub struct StatusSubscription {
    id: u64,
    rx: flume::Receiver<StatusChange>,
    registry: Weak<StatusRegistry>,
}

impl StatusSubscription {
    /// Next change, or `None` once the pool is gone.
    pub async fn recv(&self) -> Option<StatusChange> {
        self.rx.recv_async().await.ok()
    }

    pub fn try_recv(&self) -> Option<StatusChange> {
        self.rx.try_recv().ok()
    }

    pub fn receiver(&self) -> &flume::Receiver<StatusChange> {
        &self.rx
    }

    pub fn unsubscribe(self) {}
}

impl Drop for StatusSubscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionStatus::*;

    fn url(s: &str) -> RelayUrl {
        RelayUrl::parse(s).unwrap()
    }

    #[test]
    fn transition_table() {
        let all = [Disconnected, Connecting, Connected, Error];
        let allowed: Vec<_> = all
            .iter()
            .flat_map(|from| all.iter().map(move |to| (*from, *to)))
            .filter(|(from, to)| from.can_transition_to(*to))
            .collect();
        assert_eq!(allowed.len(), 8);
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Error.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Connected.can_transition_to(Connected));
    }

    #[test]
    fn late_subscriber_gets_current_statuses_first() {
        let registry = StatusRegistry::new();
        let a = url("wss://a.example.com");
        let b = url("wss://b.example.com");
        registry.update(&a, 1, Connecting);
        registry.update(&a, 1, Connected);
        registry.update(&b, 2, Error);

        let sub = registry.subscribe();
        assert_eq!(
            sub.try_recv(),
            Some(StatusChange {
                relay: a.clone(),
                status: Connected
            })
        );
        assert_eq!(
            sub.try_recv(),
            Some(StatusChange {
                relay: b.clone(),
                status: Error
            })
        );
        assert_eq!(sub.try_recv(), None);

        registry.update(&b, 2, Connecting);
        assert_eq!(sub.try_recv().map(|c| c.status), Some(Connecting));
    }

    #[test]
    fn stale_connection_cannot_overwrite_replacement() {
        let registry = StatusRegistry::new();
        let a = url("wss://a.example.com");
        registry.update(&a, 1, Connected);
        registry.update(&a, 2, Connecting);
        registry.update(&a, 1, Disconnected);
        registry.forget(&a, 1);
        assert_eq!(registry.get(&a), Some(Connecting));
        registry.forget(&a, 2);
        assert_eq!(registry.get(&a), None);
    }

    #[test]
    fn dropping_subscription_unregisters() {
        let registry = StatusRegistry::new();
        let sub = registry.subscribe();
        let other = registry.subscribe();
        assert_eq!(registry.listener_count(), 2);
        drop(sub);
        other.unsubscribe();
        assert_eq!(registry.listener_count(), 0);
    }
}
