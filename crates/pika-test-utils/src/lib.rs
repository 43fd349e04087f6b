//! In-process Nostr relay for tests.
//!
//! [`MockRelay`] speaks just enough NIP-01 (`EVENT`, `REQ`, `CLOSE`) for the
//! pool tests, on its own thread and runtime so it outlives whichever runtime
//! the test uses. Events are handled as raw JSON; nothing here verifies ids
//! or signatures.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

/// Behaviour switches, settable before start or at any time after.
#[derive(Debug, Clone)]
pub struct MockRelayOptions {
    /// Answer `REQ` with `EOSE` once stored events are sent.
    pub send_eose: bool,
    /// Answer every `EVENT` with `OK false` and this reason.
    pub reject_publishes: Option<String>,
    /// Complete websocket handshakes. When false, sockets are dropped on accept.
    pub accept_connections: bool,
    /// Accept TCP but never answer the websocket handshake.
    pub stall_handshakes: bool,
    /// Close every socket right after its handshake completes.
    pub close_after_handshake: bool,
    /// Swallow `EVENT`s: nothing is stored and no `OK` is sent.
    pub ignore_publishes: bool,
}

impl Default for MockRelayOptions {
    fn default() -> Self {
        Self {
            send_eose: true,
            reject_publishes: None,
            accept_connections: true,
            stall_handshakes: false,
            close_after_handshake: false,
            ignore_publishes: false,
        }
    }
}

struct RelayState {
    options: MockRelayOptions,
    events: Vec<Value>,
    event_ids: HashSet<String>,
    conns: HashMap<u64, ConnEntry>,
    received: Vec<Value>,
    handshakes: usize,
}

struct ConnEntry {
    tx: mpsc::UnboundedSender<Message>,
    subs: HashMap<String, Vec<Value>>,
}

/// Handle to a running relay. Dropping it stops the relay and closes every
/// client socket.
pub struct MockRelay {
    url: String,
    shutdown: Option<oneshot::Sender<()>>,
    state: Arc<Mutex<RelayState>>,
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl MockRelay {
    pub fn start() -> Self {
        Self::start_with(MockRelayOptions::default())
    }

    pub fn start_with(options: MockRelayOptions) -> Self {
        let (url_tx, url_rx) = std::sync::mpsc::channel::<(String, oneshot::Sender<()>)>();
        let state = Arc::new(Mutex::new(RelayState {
            options,
            events: Vec::new(),
            event_ids: HashSet::new(),
            conns: HashMap::new(),
            received: Vec::new(),
            handshakes: 0,
        }));

        let state_for_thread = state.clone();
        std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("mock relay runtime");

            rt.block_on(async move {
                let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind relay");
                let addr: SocketAddr = listener.local_addr().expect("local addr");
                let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
                url_tx
                    .send((format!("ws://{addr}"), shutdown_tx))
                    .expect("report relay url");

                let next_conn_id = Arc::new(AtomicU64::new(1));
                let state = state_for_thread;

                loop {
                    tokio::select! {
                        _ = &mut shutdown_rx => {
                            close_all(&state);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            break;
                        }
                        accept = listener.accept() => {
                            let Ok((stream, _)) = accept else { continue };
                            let options = state.lock().unwrap().options.clone();
                            if !options.accept_connections {
                                drop(stream);
                                continue;
                            }
                            if options.stall_handshakes {
                                tokio::spawn(async move {
                                    let _held = stream;
                                    std::future::pending::<()>().await;
                                });
                                continue;
                            }
                            let conn_id = next_conn_id.fetch_add(1, Ordering::Relaxed);
                            tokio::spawn(serve_connection(state.clone(), conn_id, stream));
                        }
                    }
                }
            });
        });

        let (url, shutdown_tx) = url_rx.recv().expect("mock relay start");
        tracing::debug!(%url, "mock relay listening");
        Self {
            url,
            shutdown: Some(shutdown_tx),
            state,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Store an event without broadcasting it.
    pub fn preload(&self, event: Value) {
        let mut st = self.state.lock().unwrap();
        store(&mut st, event);
    }

    /// Store an event and push it to every matching live subscription, as if
    /// another client had published it.
    pub fn inject(&self, event: Value) {
        let is_new = {
            let mut st = self.state.lock().unwrap();
            store(&mut st, event.clone())
        };
        if is_new {
            broadcast_event(&self.state, &event);
        }
    }

    pub fn stored_events(&self) -> Vec<Value> {
        self.state.lock().unwrap().events.clone()
    }

    /// Every client frame received so far, in arrival order.
    pub fn received(&self) -> Vec<Value> {
        self.state.lock().unwrap().received.clone()
    }

    /// Received frames whose first element is `kind` (`"REQ"`, `"CLOSE"`, ...).
    pub fn received_of(&self, kind: &str) -> Vec<Value> {
        self.received()
            .into_iter()
            .filter(|frame| frame.get(0).and_then(Value::as_str) == Some(kind))
            .collect()
    }

    /// Websocket handshakes completed since start.
    pub fn handshake_count(&self) -> usize {
        self.state.lock().unwrap().handshakes
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().unwrap().conns.len()
    }

    /// Subscription ids currently open across all connections.
    pub fn open_subscriptions(&self) -> Vec<String> {
        let st = self.state.lock().unwrap();
        let mut subs: Vec<String> = st
            .conns
            .values()
            .flat_map(|c| c.subs.keys().cloned())
            .collect();
        subs.sort();
        subs
    }

    pub fn set_send_eose(&self, send_eose: bool) {
        self.state.lock().unwrap().options.send_eose = send_eose;
    }

    pub fn set_reject_publishes(&self, reason: Option<&str>) {
        self.state.lock().unwrap().options.reject_publishes = reason.map(str::to_string);
    }

    pub fn set_ignore_publishes(&self, ignore: bool) {
        self.state.lock().unwrap().options.ignore_publishes = ignore;
    }

    pub fn set_close_after_handshake(&self, close: bool) {
        self.state.lock().unwrap().options.close_after_handshake = close;
    }

    pub fn set_accept_connections(&self, accept: bool) {
        self.state.lock().unwrap().options.accept_connections = accept;
    }

    /// Close every client socket. Clients are free to reconnect.
    pub fn drop_connections(&self) {
        close_all(&self.state);
    }
}

async fn serve_connection(
    state: Arc<Mutex<RelayState>>,
    conn_id: u64,
    stream: tokio::net::TcpStream,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(_) => return,
    };
    let (mut ws_tx, mut ws_rx) = ws.split();
    let close_now = {
        let mut st = state.lock().unwrap();
        st.handshakes += 1;
        st.options.close_after_handshake
    };
    if close_now {
        let _ = ws_tx.send(Message::Close(None)).await;
        return;
    }
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

    state.lock().unwrap().conns.insert(
        conn_id,
        ConnEntry {
            tx: out_tx.clone(),
            subs: HashMap::new(),
        },
    );

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_tx.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = ws_rx.next().await {
        match msg {
            Message::Text(text) => handle_client_msg(&state, conn_id, text.as_str()),
            Message::Ping(p) => {
                let _ = out_tx.send(Message::Pong(p));
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.lock().unwrap().conns.remove(&conn_id);
    writer.abort();
}

fn close_all(state: &Arc<Mutex<RelayState>>) {
    let conns: Vec<mpsc::UnboundedSender<Message>> = {
        let mut st = state.lock().unwrap();
        st.conns.drain().map(|(_, c)| c.tx).collect()
    };
    for tx in conns {
        let _ = tx.send(Message::Close(None));
    }
}

fn store(st: &mut RelayState, event: Value) -> bool {
    let Some(id) = event.get("id").and_then(Value::as_str) else {
        return false;
    };
    if !st.event_ids.insert(id.to_string()) {
        return false;
    }
    st.events.push(event);
    true
}

fn send_json(state: &Arc<Mutex<RelayState>>, conn_id: u64, v: Value) -> bool {
    let tx = {
        let st = state.lock().unwrap();
        st.conns.get(&conn_id).map(|c| c.tx.clone())
    };
    match tx {
        Some(tx) => tx.send(Message::Text(v.to_string().into())).is_ok(),
        None => false,
    }
}

type SubSnapshot = Vec<(String, Vec<Value>)>;

fn broadcast_event(state: &Arc<Mutex<RelayState>>, ev: &Value) {
    let conns: Vec<(u64, SubSnapshot)> = {
        let st = state.lock().unwrap();
        st.conns
            .iter()
            .map(|(id, c)| {
                let subs = c
                    .subs
                    .iter()
                    .map(|(sid, filters)| (sid.clone(), filters.clone()))
                    .collect();
                (*id, subs)
            })
            .collect()
    };

    for (conn_id, subs) in conns {
        for (sub_id, filters) in subs {
            if filters.iter().any(|f| matches_filter(f, ev)) {
                send_json(state, conn_id, json!(["EVENT", sub_id, ev]));
            }
        }
    }
}

fn handle_client_msg(state: &Arc<Mutex<RelayState>>, conn_id: u64, text: &str) {
    let Ok(v) = serde_json::from_str::<Value>(text) else {
        return;
    };
    state.lock().unwrap().received.push(v.clone());
    let Some(arr) = v.as_array() else {
        return;
    };
    let Some(typ) = arr.first().and_then(Value::as_str) else {
        return;
    };

    match typ {
        "EVENT" => {
            let Some(ev) = arr.get(1).cloned() else { return };
            let Some(id) = ev.get("id").and_then(Value::as_str).map(str::to_string) else {
                return;
            };

            let (reject, ignore) = {
                let st = state.lock().unwrap();
                (st.options.reject_publishes.clone(), st.options.ignore_publishes)
            };
            if ignore {
                return;
            }
            if let Some(reason) = reject {
                send_json(state, conn_id, json!(["OK", id, false, reason]));
                return;
            }

            let is_new = {
                let mut st = state.lock().unwrap();
                store(&mut st, ev.clone())
            };
            let note = if is_new { "" } else { "duplicate: already have this event" };
            send_json(state, conn_id, json!(["OK", id, true, note]));
            if is_new {
                broadcast_event(state, &ev);
            }
        }
        "REQ" => {
            let Some(sub_id) = arr.get(1).and_then(Value::as_str).map(str::to_string) else {
                return;
            };
            let filters: Vec<Value> = arr.iter().skip(2).cloned().collect();
            if filters.is_empty() {
                send_json(state, conn_id, json!(["CLOSED", sub_id, "error: no filters"]));
                return;
            }

            let (stored, send_eose) = {
                let mut st = state.lock().unwrap();
                if let Some(conn) = st.conns.get_mut(&conn_id) {
                    conn.subs.insert(sub_id.clone(), filters.clone());
                }
                (st.events.clone(), st.options.send_eose)
            };

            for ev in stored_matches(&filters, &stored) {
                send_json(state, conn_id, json!(["EVENT", sub_id, ev]));
            }
            if send_eose {
                send_json(state, conn_id, json!(["EOSE", sub_id]));
            }
        }
        "CLOSE" => {
            let Some(sub_id) = arr.get(1).and_then(Value::as_str) else {
                return;
            };
            let mut st = state.lock().unwrap();
            if let Some(conn) = st.conns.get_mut(&conn_id) {
                conn.subs.remove(sub_id);
            }
        }
        _ => {}
    }
}

/// Stored events matching any filter, newest first, each filter's `limit`
/// applied to its own matches.
fn stored_matches<'a>(filters: &[Value], stored: &'a [Value]) -> Vec<&'a Value> {
    let mut picked: Vec<&Value> = Vec::new();
    let mut ids: HashSet<&str> = HashSet::new();
    for filter in filters {
        let mut hits: Vec<&Value> = stored.iter().filter(|ev| matches_filter(filter, ev)).collect();
        hits.sort_by_key(|ev| std::cmp::Reverse(created_at(ev)));
        if let Some(limit) = filter.get("limit").and_then(Value::as_u64) {
            hits.truncate(limit as usize);
        }
        for ev in hits {
            if let Some(id) = ev.get("id").and_then(Value::as_str) {
                if ids.insert(id) {
                    picked.push(ev);
                }
            }
        }
    }
    picked.sort_by_key(|ev| std::cmp::Reverse(created_at(ev)));
    picked
}

fn created_at(ev: &Value) -> u64 {
    ev.get("created_at").and_then(Value::as_u64).unwrap_or(0)
}

fn contains(list: &Value, needle: Option<&Value>) -> bool {
    match (list.as_array(), needle) {
        (Some(items), Some(needle)) => items.iter().any(|item| item == needle),
        _ => false,
    }
}

/// NIP-01 filter matching over raw JSON.
pub fn matches_filter(filter: &Value, ev: &Value) -> bool {
    let Some(fields) = filter.as_object() else {
        return false;
    };
    fields.iter().all(|(key, want)| match key.as_str() {
        "ids" => contains(want, ev.get("id")),
        "authors" => contains(want, ev.get("pubkey")),
        "kinds" => contains(want, ev.get("kind")),
        "since" => want.as_u64().is_some_and(|since| created_at(ev) >= since),
        "until" => want.as_u64().is_some_and(|until| created_at(ev) <= until),
        "limit" => true,
        tag if tag.len() == 2 && tag.starts_with('#') => {
            let name = &tag[1..];
            let Some(values) = want.as_array() else {
                return false;
            };
            ev.get("tags")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(Value::as_array)
                .filter(|t| t.first().and_then(Value::as_str) == Some(name))
                .any(|t| t.get(1).is_some_and(|v| values.contains(v)))
        }
        _ => true,
    })
}
