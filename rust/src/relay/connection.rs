//! One websocket session to one relay, driven by its own task
//!
//! The [`Connection`] handle is cheap to clone and only sends commands; the
//! task owns the socket, the subscription table and the outbound queue.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use pika_relay_profiles::{RelayConfig, RelayUrl};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::backoff::{ReconnectDecision, ReconnectPolicy};
use super::status::{ConnectionStatus, StatusRegistry};
use super::RelayError;
use crate::event::{Event, EventId, Filter};
use crate::message::{ClientMessage, RelayMessage, SubscriptionId};
use crate::options::PoolOptions;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Read/write policy of a relay. Changed in place by reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RelayPolicy {
    pub(crate) can_read: bool,
    pub(crate) can_write: bool,
}

impl RelayPolicy {
    pub(crate) fn of(config: &RelayConfig) -> Self {
        Self {
            can_read: config.can_read,
            can_write: config.can_write,
        }
    }
}

#[derive(Debug)]
pub(crate) enum SubscriptionMessage {
    Event(Box<Event>),
    EndOfStoredEvents,
    Closed(String),
}

#[derive(Debug)]
pub(crate) struct SubscriptionItem {
    pub(crate) relay: RelayUrl,
    pub(crate) message: SubscriptionMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PublishAck {
    /// Written to the socket; no `OK` requested.
    Sent,
    Accepted(String),
    Rejected(String),
}

enum Command {
    Subscribe {
        id: SubscriptionId,
        filters: Vec<Filter>,
        sink: flume::Sender<SubscriptionItem>,
    },
    Unsubscribe(SubscriptionId),
    Publish {
        event: Box<Event>,
        wait_for_ok: bool,
        reply: oneshot::Sender<PublishAck>,
    },
    Retry,
    Shutdown,
}

/// Handle to a relay connection task.
#[derive(Clone)]
pub struct Connection {
    url: RelayUrl,
    commands: flume::Sender<Command>,
    status: Arc<RwLock<ConnectionStatus>>,
    policy: Arc<RwLock<RelayPolicy>>,
}

impl Connection {
    /// Spawn the connection task. Must be called inside a Tokio runtime.
    pub(crate) fn spawn(config: &RelayConfig, options: &PoolOptions, registry: Arc<StatusRegistry>) -> Self {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let url = config.endpoint.clone();
        let (tx, rx) = flume::unbounded();
        let status = Arc::new(RwLock::new(ConnectionStatus::Disconnected));
        registry.update(&url, id, ConnectionStatus::Disconnected);

        let task = ConnectionTask {
            id,
            url: url.clone(),
            connect_timeout: options.connect_timeout(),
            stable_after: options.reconnect_stable_after(),
            commands: rx,
            status: status.clone(),
            registry,
            subscriptions: HashMap::new(),
            outbound: VecDeque::new(),
            pending_ok: HashMap::new(),
            reconnect: ReconnectPolicy::from_options(options),
        };
        tokio::spawn(task.run());

        Self {
            url,
            commands: tx,
            status,
            policy: Arc::new(RwLock::new(RelayPolicy::of(config))),
        }
    }

    pub fn url(&self) -> &RelayUrl {
        &self.url
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.read()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn can_read(&self) -> bool {
        self.policy.read().can_read
    }

    pub fn can_write(&self) -> bool {
        self.policy.read().can_write
    }

    /// Re-arm a connection that gave up reconnecting.
    pub fn retry(&self) {
        let _ = self.commands.send(Command::Retry);
    }

    pub(crate) fn policy(&self) -> RelayPolicy {
        *self.policy.read()
    }

    pub(crate) fn set_policy(&self, policy: RelayPolicy) {
        *self.policy.write() = policy;
    }

    pub(crate) fn subscribe(
        &self,
        id: SubscriptionId,
        filters: Vec<Filter>,
        sink: flume::Sender<SubscriptionItem>,
    ) -> bool {
        self.commands
            .send(Command::Subscribe { id, filters, sink })
            .is_ok()
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) {
        let _ = self.commands.send(Command::Unsubscribe(id));
    }

    /// The receiver errors if the connection shuts down before answering.
    pub(crate) fn publish(&self, event: &Event, wait_for_ok: bool) -> oneshot::Receiver<PublishAck> {
        let (reply, rx) = oneshot::channel();
        let _ = self.commands.send(Command::Publish {
            event: Box::new(event.clone()),
            wait_for_ok,
            reply,
        });
        rx
    }

    /// Disconnect for good: cancels any pending reconnect and drops queued frames.
    pub(crate) fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("url", &self.url)
            .field("status", &self.status())
            .finish()
    }
}

struct ActiveSubscription {
    filters: Vec<Filter>,
    sink: flume::Sender<SubscriptionItem>,
}

struct PendingPublish {
    event_id: EventId,
    wait_for_ok: bool,
    reply: oneshot::Sender<PublishAck>,
}

struct Outbound {
    frame: String,
    publish: PendingPublish,
}

enum SessionEnd {
    Closed,
    Failed(String),
    Shutdown,
}

enum Wake {
    Elapsed,
    Retry,
    Shutdown,
}

struct ConnectionTask {
    id: u64,
    url: RelayUrl,
    connect_timeout: Duration,
    stable_after: Duration,
    commands: flume::Receiver<Command>,
    status: Arc<RwLock<ConnectionStatus>>,
    registry: Arc<StatusRegistry>,
    subscriptions: HashMap<SubscriptionId, ActiveSubscription>,
    outbound: VecDeque<Outbound>,
    pending_ok: HashMap<EventId, Vec<oneshot::Sender<PublishAck>>>,
    reconnect: ReconnectPolicy,
}

impl ConnectionTask {
    async fn run(mut self) {
        loop {
            self.transition(ConnectionStatus::Connecting);

            let Some(result) = self.connect().await else {
                break;
            };
            match result {
                Ok(ws) => {
                    self.transition(ConnectionStatus::Connected);
                    let opened = Instant::now();
                    let end = self.session(ws).await;
                    self.pending_ok.clear();
                    if opened.elapsed() >= self.stable_after {
                        self.reconnect.reset();
                    }
                    match end {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Closed => {
                            info!(relay = %self.url, "relay closed the connection");
                            self.transition(ConnectionStatus::Disconnected);
                        }
                        SessionEnd::Failed(reason) => {
                            warn!(relay = %self.url, "relay connection failed: {reason}");
                            self.transition(ConnectionStatus::Error);
                        }
                    }
                }
                Err(e) => {
                    warn!(relay = %self.url, "connect failed: {e}");
                    self.transition(ConnectionStatus::Error);
                }
            }

            let wake = match self.reconnect.on_failure() {
                ReconnectDecision::Retry { attempt, delay } => {
                    debug!(relay = %self.url, attempt, ?delay, "reconnect scheduled");
                    self.wait_offline(Some(delay)).await
                }
                ReconnectDecision::GiveUp => {
                    warn!(
                        relay = %self.url,
                        attempts = self.reconnect.attempts(),
                        "giving up on relay until retried"
                    );
                    if self.current() != ConnectionStatus::Disconnected {
                        self.transition(ConnectionStatus::Disconnected);
                    }
                    self.wait_offline(None).await
                }
            };
            match wake {
                Wake::Elapsed => {}
                Wake::Retry => self.reconnect.reset(),
                Wake::Shutdown => break,
            }
        }
        self.finish();
    }

    fn current(&self) -> ConnectionStatus {
        *self.status.read()
    }

    fn transition(&mut self, next: ConnectionStatus) -> bool {
        let current = self.current();
        if !current.can_transition_to(next) {
            warn!(relay = %self.url, %current, %next, "refusing illegal status transition");
            return false;
        }
        *self.status.write() = next;
        self.registry.update(&self.url, self.id, next);
        info!(relay = %self.url, status = %next, "relay status changed");
        true
    }

    /// Open the socket while still serving commands. `None` means shut down.
    async fn connect(&mut self) -> Option<Result<WsStream, RelayError>> {
        let opening = open_socket(self.url.clone(), self.connect_timeout);
        tokio::pin!(opening);
        loop {
            tokio::select! {
                result = &mut opening => return Some(result),
                command = self.commands.recv_async() => match command {
                    Ok(Command::Shutdown) | Err(_) => return None,
                    Ok(Command::Retry) => {}
                    Ok(other) => self.handle_offline(other),
                },
            }
        }
    }

    /// Sleep for `delay` (or until retried when `None`) while serving commands.
    async fn wait_offline(&mut self, delay: Option<Duration>) -> Wake {
        let sleep = async move {
            match delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Wake::Elapsed,
                command = self.commands.recv_async() => match command {
                    Ok(Command::Shutdown) | Err(_) => return Wake::Shutdown,
                    Ok(Command::Retry) => return Wake::Retry,
                    Ok(other) => self.handle_offline(other),
                },
            }
        }
    }

    fn handle_offline(&mut self, command: Command) {
        match command {
            Command::Subscribe { id, filters, sink } => {
                self.subscriptions
                    .insert(id, ActiveSubscription { filters, sink });
            }
            Command::Unsubscribe(id) => {
                self.subscriptions.remove(&id);
            }
            Command::Publish {
                event,
                wait_for_ok,
                reply,
            } => {
                debug!(relay = %self.url, id = %event.id, "queueing event until connected");
                self.outbound.push_back(Outbound {
                    frame: ClientMessage::Event(event.clone()).as_json(),
                    publish: PendingPublish {
                        event_id: event.id,
                        wait_for_ok,
                        reply,
                    },
                });
            }
            Command::Retry | Command::Shutdown => {}
        }
    }

    async fn session(&mut self, ws: WsStream) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();

        // Live subscriptions first, then whatever queued up while offline.
        let reqs: Vec<String> = self
            .subscriptions
            .iter()
            .map(|(id, sub)| ClientMessage::req(id.clone(), sub.filters.clone()).as_json())
            .collect();
        for frame in reqs {
            if let Err(reason) = write(&mut sink, frame).await {
                return SessionEnd::Failed(reason);
            }
        }
        if let Err(reason) = self.flush(&mut sink).await {
            return SessionEnd::Failed(reason);
        }

        loop {
            tokio::select! {
                command = self.commands.recv_async() => {
                    let command = match command {
                        Ok(Command::Shutdown) | Err(_) => {
                            let _ = sink.send(Message::Close(None)).await;
                            return SessionEnd::Shutdown;
                        }
                        Ok(command) => command,
                    };
                    if let Err(reason) = self.handle_connected(command, &mut sink).await {
                        return SessionEnd::Failed(reason);
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(orphan) = self.handle_frame(text.as_str()) {
                            let close = ClientMessage::close(orphan).as_json();
                            if let Err(reason) = write(&mut sink, close).await {
                                return SessionEnd::Failed(reason);
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(e) = sink.send(Message::Pong(payload)).await {
                            return SessionEnd::Failed(e.to_string());
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Closed,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Failed(e.to_string()),
                },
            }
        }
    }

    async fn handle_connected(&mut self, command: Command, sink: &mut WsSink) -> Result<(), String> {
        match command {
            Command::Subscribe { id, filters, sink: items } => {
                let frame = ClientMessage::req(id.clone(), filters.clone()).as_json();
                self.subscriptions.insert(
                    id,
                    ActiveSubscription {
                        filters,
                        sink: items,
                    },
                );
                write(sink, frame).await
            }
            Command::Unsubscribe(id) => {
                if self.subscriptions.remove(&id).is_some() {
                    write(sink, ClientMessage::close(id).as_json()).await
                } else {
                    Ok(())
                }
            }
            publish @ Command::Publish { .. } => {
                self.handle_offline(publish);
                self.flush(sink).await
            }
            Command::Retry => {
                self.reconnect.reset();
                Ok(())
            }
            Command::Shutdown => Ok(()),
        }
    }

    /// Write queued frames in FIFO order. A frame that fails to send goes back
    /// to the front of the queue.
    async fn flush(&mut self, sink: &mut WsSink) -> Result<(), String> {
        while let Some(outbound) = self.outbound.pop_front() {
            if let Err(reason) = write(sink, outbound.frame.clone()).await {
                self.outbound.push_front(outbound);
                return Err(reason);
            }
            let PendingPublish {
                event_id,
                wait_for_ok,
                reply,
            } = outbound.publish;
            if wait_for_ok {
                prune_abandoned(&mut self.pending_ok);
                self.pending_ok.entry(event_id).or_default().push(reply);
            } else {
                let _ = reply.send(PublishAck::Sent);
            }
        }
        Ok(())
    }

    /// Returns a subscription whose consumer went away and should be closed.
    fn handle_frame(&mut self, text: &str) -> Option<SubscriptionId> {
        let message = match RelayMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(relay = %self.url, "dropping malformed frame: {e}");
                return None;
            }
        };

        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                if let Err(e) = event.verify() {
                    warn!(relay = %self.url, id = %event.id, "dropping unverifiable event: {e}");
                    return None;
                }
                self.deliver(subscription_id, SubscriptionMessage::Event(event))
            }
            RelayMessage::EndOfStoredEvents(subscription_id) => {
                debug!(relay = %self.url, sub = %subscription_id, "eose");
                self.deliver(subscription_id, SubscriptionMessage::EndOfStoredEvents)
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                info!(relay = %self.url, sub = %subscription_id, "subscription closed by relay: {message}");
                self.deliver(subscription_id.clone(), SubscriptionMessage::Closed(message));
                self.subscriptions.remove(&subscription_id);
                None
            }
            RelayMessage::Notice(notice) => {
                info!(relay = %self.url, "notice: {notice}");
                None
            }
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => {
                match self.pending_ok.remove(&event_id) {
                    Some(replies) => {
                        for reply in replies {
                            let ack = if accepted {
                                PublishAck::Accepted(message.clone())
                            } else {
                                PublishAck::Rejected(message.clone())
                            };
                            let _ = reply.send(ack);
                        }
                    }
                    None => debug!(relay = %self.url, id = %event_id, "unsolicited OK"),
                }
                None
            }
            RelayMessage::Auth { .. } => {
                debug!(relay = %self.url, "ignoring auth challenge");
                None
            }
        }
    }

    fn deliver(&mut self, id: SubscriptionId, message: SubscriptionMessage) -> Option<SubscriptionId> {
        let Some(sub) = self.subscriptions.get(&id) else {
            debug!(relay = %self.url, sub = %id, "frame for unknown subscription");
            return None;
        };
        let item = SubscriptionItem {
            relay: self.url.clone(),
            message,
        };
        if sub.sink.send(item).is_err() {
            debug!(relay = %self.url, sub = %id, "subscriber gone, closing");
            self.subscriptions.remove(&id);
            return Some(id);
        }
        None
    }

    fn finish(mut self) {
        for (_, sub) in self.subscriptions.drain() {
            let _ = sub.sink.send(SubscriptionItem {
                relay: self.url.clone(),
                message: SubscriptionMessage::Closed("connection shut down".to_string()),
            });
        }
        self.outbound.clear();
        self.pending_ok.clear();
        if self.current() != ConnectionStatus::Disconnected {
            self.transition(ConnectionStatus::Disconnected);
        }
        self.registry.forget(&self.url, self.id);
        info!(relay = %self.url, "relay connection stopped");
    }
}

async fn open_socket(url: RelayUrl, timeout: Duration) -> Result<WsStream, RelayError> {
    let connector = url
        .is_secure()
        .then(|| Connector::Rustls(pika_tls::client_config()));
    let attempt =
        tokio_tungstenite::connect_async_tls_with_config(url.as_str(), None, false, connector);
    match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok((ws, _response))) => Ok(ws),
        Ok(Err(e)) => Err(RelayError::ConnectRefused(e.to_string())),
        Err(_) => Err(RelayError::ConnectTimeout(timeout)),
    }
}

/// Drop waiters whose publish call already gave up on an `OK`.
fn prune_abandoned(pending: &mut HashMap<EventId, Vec<oneshot::Sender<PublishAck>>>) {
    pending.retain(|_, replies| {
        replies.retain(|reply| !reply.is_closed());
        !replies.is_empty()
    });
}

async fn write(sink: &mut WsSink, frame: String) -> Result<(), String> {
    debug!("-> {frame}");
    sink.send(Message::Text(frame.into()))
        .await
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventBuilder, Keys, Timestamp};
    use pika_test_utils::{MockRelay, MockRelayOptions};

    fn relay_url(relay: &MockRelay) -> RelayUrl {
        RelayUrl::parse(relay.url()).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stalled_handshake_hits_connect_timeout() {
        let relay = MockRelay::start_with(MockRelayOptions {
            stall_handshakes: true,
            ..MockRelayOptions::default()
        });
        let timeout = Duration::from_millis(200);
        let started = Instant::now();
        let Err(err) = open_socket(relay_url(&relay), timeout).await else {
            panic!("handshake completed against a stalled relay");
        };
        assert_eq!(err, RelayError::ConnectTimeout(timeout));
        assert!(started.elapsed() >= timeout);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn events_queued_offline_are_flushed_in_order() {
        let relay = MockRelay::start_with(MockRelayOptions {
            accept_connections: false,
            ..MockRelayOptions::default()
        });
        let options = PoolOptions {
            reconnect_base_delay_ms: 20,
            reconnect_max_delay_ms: 50,
            max_reconnect_attempts: 100,
            ..PoolOptions::default()
        };
        let connection = Connection::spawn(
            &RelayConfig::new(relay_url(&relay)),
            &options,
            StatusRegistry::new(),
        );

        let keys = Keys::generate();
        let events: Vec<Event> = (0..5)
            .map(|i| {
                EventBuilder::text_note(format!("queued {i}"))
                    .custom_created_at(Timestamp::from_secs(100 + i))
                    .sign_with_keys(&keys)
                    .unwrap()
            })
            .collect();
        let acks: Vec<_> = events.iter().map(|e| connection.publish(e, false)).collect();
        assert!(!connection.is_connected());

        relay.set_accept_connections(true);
        for ack in acks {
            let ack = tokio::time::timeout(Duration::from_secs(5), ack)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(ack, PublishAck::Sent);
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while relay.received_of("EVENT").len() < events.len() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        let sent: Vec<String> = relay
            .received_of("EVENT")
            .iter()
            .map(|frame| frame[1]["id"].as_str().unwrap().to_string())
            .collect();
        let expected: Vec<String> = events.iter().map(|e| e.id.to_hex()).collect();
        assert_eq!(sent, expected);
        connection.shutdown();
    }

    #[test]
    fn abandoned_ok_waiters_are_pruned() {
        let kept = EventId::from_byte_array([1u8; 32]);
        let gone = EventId::from_byte_array([2u8; 32]);
        let mut pending: HashMap<EventId, Vec<oneshot::Sender<PublishAck>>> = HashMap::new();

        let (alive, _alive_rx) = oneshot::channel();
        let (stale, stale_rx) = oneshot::channel();
        let (also_stale, also_stale_rx) = oneshot::channel();
        drop(stale_rx);
        drop(also_stale_rx);
        pending.entry(kept).or_default().push(alive);
        pending.entry(kept).or_default().push(stale);
        pending.entry(gone).or_default().push(also_stale);

        prune_abandoned(&mut pending);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[&kept].len(), 1);
    }
}
