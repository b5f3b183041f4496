//! Realtime connection ownership.
//!
//! Exactly one WebSocket exists process-wide, owned by a background task
//! behind the `ConnectionManager` handle. The task announces interest in the
//! full desired conversation set after every (re)connect, parses inbound
//! frames into envelopes, and retries on a fixed delay while at least one
//! subscriber remains interested. Consumers never touch the socket directly.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use agent_events::EventEnvelope;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Callback invoked after interest has been re-announced on a connection that
/// replaced a previously established one. Used by consumers to re-fetch
/// history and reconcile events lost while disconnected.
pub type ReconnectHook = Arc<dyn Fn() + Send + Sync>;

/// Outbound interest-registration frame.
#[derive(Serialize)]
struct RegisterInterest<'a> {
    conversation_id: &'a str,
}

/// Bookkeeping for the currently running connection task.
struct ActiveTask {
    generation: u64,
    cancel: CancellationToken,
    outbound_tx: mpsc::UnboundedSender<String>,
    handle: tokio::task::JoinHandle<()>,
}

struct ConnectionInner {
    ws_url: String,
    reconnect_delay: Duration,
    /// Parsed envelopes flow out to the registry's dispatch loop.
    event_tx: mpsc::UnboundedSender<EventEnvelope>,
    /// Conversation ids to (re-)announce after every connect.
    desired: Mutex<HashSet<String>>,
    task: Mutex<Option<ActiveTask>>,
    hook: Mutex<Option<ReconnectHook>>,
    generations: AtomicU64,
}

/// Handle to the process-wide realtime connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ConnectionInner>,
}

impl ConnectionManager {
    pub fn new(
        ws_url: String,
        reconnect_delay: Duration,
        event_tx: mpsc::UnboundedSender<EventEnvelope>,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                ws_url,
                reconnect_delay,
                event_tx,
                desired: Mutex::new(HashSet::new()),
                task: Mutex::new(None),
                hook: Mutex::new(None),
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// Establish the connection if none is open or opening. Idempotent.
    pub fn connect(&self) {
        let mut task = lock(&self.inner.task);
        if let Some(active) = task.as_ref() {
            if !active.cancel.is_cancelled() && !active.handle.is_finished() {
                debug!("realtime connection already open or opening");
                return;
            }
        }
        *task = Some(spawn_task(self.inner.clone()));
    }

    /// Force-close any existing connection and open a new one.
    pub fn reset(&self) {
        let mut task = lock(&self.inner.task);
        if let Some(active) = task.take() {
            active.cancel.cancel();
        }
        info!("resetting realtime connection");
        *task = Some(spawn_task(self.inner.clone()));
    }

    /// Tear the connection down without respawning.
    pub fn close(&self) {
        let mut task = lock(&self.inner.task);
        if let Some(active) = task.take() {
            active.cancel.cancel();
            info!("realtime connection closed");
        }
    }

    /// Add a conversation to the desired set and announce it on the live
    /// connection, if any.
    pub fn watch(&self, conversation_id: &str) {
        lock(&self.inner.desired).insert(conversation_id.to_string());
        self.announce(std::iter::once(conversation_id));
    }

    /// Remove a conversation from the desired set. The connection stays up
    /// while other conversations remain desired.
    pub fn unwatch(&self, conversation_id: &str) {
        lock(&self.inner.desired).remove(conversation_id);
    }

    /// Send one interest-registration frame per id on the live connection.
    /// A no-op while no connection task is running; the task announces the
    /// whole desired set itself on connect.
    pub fn announce<'a>(&self, conversation_ids: impl IntoIterator<Item = &'a str>) {
        let task = lock(&self.inner.task);
        let Some(active) = task.as_ref() else {
            return;
        };
        for conversation_id in conversation_ids {
            match serde_json::to_string(&RegisterInterest { conversation_id }) {
                Ok(frame) => {
                    let _ = active.outbound_tx.send(frame);
                }
                Err(e) => warn!(error = %e, "failed to encode interest frame"),
            }
        }
    }

    pub fn set_reconnect_hook(&self, hook: ReconnectHook) {
        *lock(&self.inner.hook) = Some(hook);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn spawn_task(inner: Arc<ConnectionInner>) -> ActiveTask {
    let generation = inner.generations.fetch_add(1, Ordering::Relaxed);
    let cancel = CancellationToken::new();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(run_connection(
        inner.clone(),
        generation,
        cancel.clone(),
        outbound_rx,
    ));
    ActiveTask {
        generation,
        cancel,
        outbound_tx,
        handle,
    }
}

enum SessionEnd {
    Cancelled,
    Closed,
}

/// Connect-announce-read loop. Lives until cancelled or until demand drains
/// after a close; transport failures feed the fixed-delay retry path.
async fn run_connection(
    inner: Arc<ConnectionInner>,
    generation: u64,
    cancel: CancellationToken,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
) {
    let mut had_session = false;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let attempt = tokio::select! {
            _ = cancel.cancelled() => break,
            attempt = tokio_tungstenite::connect_async(&inner.ws_url) => attempt,
        };

        match attempt {
            Ok((ws_stream, _)) => {
                info!(url = %inner.ws_url, "realtime connection established");
                match run_session(&inner, &cancel, ws_stream, &mut outbound_rx, had_session).await {
                    SessionEnd::Cancelled => break,
                    SessionEnd::Closed => {}
                }
                had_session = true;
            }
            Err(e) => {
                warn!(url = %inner.ws_url, error = %e, "realtime connect failed");
            }
        }

        if cancel.is_cancelled() {
            break;
        }
        if lock(&inner.desired).is_empty() {
            info!("no subscribers remain; leaving realtime connection closed");
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(inner.reconnect_delay) => {}
        }
    }

    // Clear the slot if this task is still the current one. Demand that
    // arrived while we were deciding to exit is handed off to a fresh task.
    let mut task = lock(&inner.task);
    if task.as_ref().is_some_and(|t| t.generation == generation) {
        *task = None;
        if !cancel.is_cancelled() && !lock(&inner.desired).is_empty() {
            *task = Some(spawn_task(inner.clone()));
        }
    }
}

/// One established session: announce the full desired set, then pump frames
/// both ways until the peer closes or we are cancelled.
async fn run_session(
    inner: &ConnectionInner,
    cancel: &CancellationToken,
    ws_stream: WsStream,
    outbound_rx: &mut mpsc::UnboundedReceiver<String>,
    reconnected: bool,
) -> SessionEnd {
    let (mut ws_write, mut ws_read) = ws_stream.split();

    // Re-announce interest in every desired conversation, not just the first.
    let desired: Vec<String> = lock(&inner.desired).iter().cloned().collect();
    for conversation_id in desired.iter().map(String::as_str) {
        let frame = match serde_json::to_string(&RegisterInterest { conversation_id }) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "failed to encode interest frame");
                continue;
            }
        };
        if ws_write
            .send(tungstenite::Message::Text(frame.into()))
            .await
            .is_err()
        {
            return SessionEnd::Closed;
        }
    }
    debug!(count = desired.len(), "announced interest registrations");

    if reconnected {
        let hook = lock(&inner.hook).as_ref().cloned();
        if let Some(hook) = hook {
            debug!("running post-reconnect hook");
            hook();
        }
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws_write.send(tungstenite::Message::Close(None)).await;
                return SessionEnd::Cancelled;
            }

            Some(frame) = outbound_rx.recv() => {
                if ws_write.send(tungstenite::Message::Text(frame.into())).await.is_err() {
                    return SessionEnd::Closed;
                }
            }

            msg = ws_read.next() => match msg {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    match serde_json::from_str::<EventEnvelope>(&text) {
                        Ok(envelope) => {
                            let _ = inner.event_tx.send(envelope);
                        }
                        Err(e) => warn!(error = %e, "dropping malformed realtime frame"),
                    }
                }
                Some(Ok(tungstenite::Message::Close(_))) | None => {
                    info!("realtime connection closed by server");
                    return SessionEnd::Closed;
                }
                // Binary, ping and pong frames carry no envelopes.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "realtime read error");
                    return SessionEnd::Closed;
                }
            }
        }
    }
}
