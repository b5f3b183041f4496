//! Subscription registry.
//!
//! Multiplexes the single realtime connection across per-conversation
//! listeners: fan-out by conversation id, folding each tool envelope into the
//! conversation's invocation map before listeners run. Delivery is
//! synchronous and wire-ordered within a conversation; nothing is buffered
//! for listeners that register later (seed from history instead).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use agent_events::aggregate::InvocationMap;
use agent_events::{ChatMessage, EventEnvelope, Invocation, StoredAction, TimelineItem, aggregate, timeline};

use crate::config::MuxConfig;
use crate::connection::ConnectionManager;

/// Conversation-scoped event callback.
pub type Listener = Arc<dyn Fn(&EventEnvelope) + Send + Sync>;

struct ConversationSubscription {
    /// Registration-ordered listeners.
    listeners: Vec<(Uuid, Listener)>,
    invocations: InvocationMap,
    messages: Vec<ChatMessage>,
}

impl ConversationSubscription {
    fn new() -> Self {
        Self {
            listeners: Vec::new(),
            invocations: InvocationMap::new(),
            messages: Vec::new(),
        }
    }
}

#[derive(Default)]
struct MuxState {
    conversations: HashMap<String, ConversationSubscription>,
}

/// The live-update multiplexer exposed to the rendering layer.
pub struct UpdateMux {
    state: Arc<Mutex<MuxState>>,
    connection: ConnectionManager,
}

impl UpdateMux {
    /// Create the multiplexer and start its dispatch loop. The realtime
    /// connection itself is opened lazily by the first `subscribe`.
    pub fn new(config: &MuxConfig) -> Self {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let connection =
            ConnectionManager::new(config.ws_url.clone(), config.reconnect_delay, event_tx);
        let state = Arc::new(Mutex::new(MuxState::default()));

        let dispatch_state = state.clone();
        tokio::spawn(async move {
            while let Some(envelope) = event_rx.recv().await {
                dispatch(&dispatch_state, &envelope);
            }
        });

        Self { state, connection }
    }

    /// Register a listener for a conversation. Opens the realtime connection
    /// on the first subscriber overall and announces interest in the
    /// conversation. The returned guard removes exactly this listener when
    /// unsubscribed (or dropped).
    pub fn subscribe(
        &self,
        conversation_id: &str,
        listener: impl Fn(&EventEnvelope) + Send + Sync + 'static,
    ) -> ListenerGuard {
        let listener_id = Uuid::new_v4();
        {
            let mut state = lock(&self.state);
            state
                .conversations
                .entry(conversation_id.to_string())
                .or_insert_with(ConversationSubscription::new)
                .listeners
                .push((listener_id, Arc::new(listener)));
        }
        self.connection.watch(conversation_id);
        self.connection.connect();
        debug!(conversation_id = %conversation_id, %listener_id, "listener subscribed");

        ListenerGuard {
            state: self.state.clone(),
            connection: self.connection.clone(),
            conversation_id: conversation_id.to_string(),
            listener_id,
            active: AtomicBool::new(true),
        }
    }

    /// Replace a conversation's historical state: the message list verbatim,
    /// and the invocation map rebuilt by replaying the stored actions.
    pub fn seed_from_history(
        &self,
        conversation_id: &str,
        messages: Vec<ChatMessage>,
        actions: &[StoredAction],
    ) {
        let invocations = aggregate::seed(actions);
        let mut state = lock(&self.state);
        let subscription = state
            .conversations
            .entry(conversation_id.to_string())
            .or_insert_with(ConversationSubscription::new);
        subscription.messages = messages;
        subscription.invocations = invocations;
        debug!(
            conversation_id = %conversation_id,
            messages = subscription.messages.len(),
            invocations = subscription.invocations.len(),
            "seeded from history"
        );
    }

    /// The merged, render-ready sequence for a conversation. Empty when the
    /// conversation is unknown.
    pub fn get_timeline(&self, conversation_id: &str) -> Vec<TimelineItem> {
        let state = lock(&self.state);
        match state.conversations.get(conversation_id) {
            Some(subscription) => timeline::merge(&subscription.messages, &subscription.invocations),
            None => Vec::new(),
        }
    }

    /// Snapshot of a conversation's folded invocations, first-seen order.
    pub fn invocations(&self, conversation_id: &str) -> Vec<Invocation> {
        let state = lock(&self.state);
        let Some(subscription) = state.conversations.get(conversation_id) else {
            return Vec::new();
        };
        let mut list: Vec<Invocation> = subscription.invocations.values().cloned().collect();
        list.sort_by(|a, b| {
            a.first_seen_at
                .cmp(&b.first_seen_at)
                .then_with(|| a.invocation_id.cmp(&b.invocation_id))
        });
        list
    }

    /// Tear down and re-open the realtime connection (clean slate on mount).
    pub fn reset_connection(&self) {
        self.connection.reset();
    }

    /// Register a hook invoked after every successful re-announce on a
    /// reconnected connection. Events emitted while disconnected are lost to
    /// the live path; the hook is the place to re-fetch history and
    /// `seed_from_history` to reconcile.
    pub fn on_reconnect(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.connection.set_reconnect_hook(Arc::new(hook));
    }

    #[cfg(test)]
    pub(crate) fn deliver(&self, envelope: &EventEnvelope) {
        dispatch(&self.state, envelope);
    }
}

/// Fold (conversation-scoped envelopes only), then notify listeners in
/// registration order. Broadcast frames reach every conversation's listeners
/// but never fold — there is no conversation map to scope them to.
fn dispatch(state: &Mutex<MuxState>, envelope: &EventEnvelope) {
    let listeners: Vec<Listener> = {
        let mut state = lock(state);
        match &envelope.conversation_id {
            Some(conversation_id) => match state.conversations.get_mut(conversation_id) {
                Some(subscription) => {
                    aggregate::fold(&mut subscription.invocations, envelope, Utc::now());
                    subscription
                        .listeners
                        .iter()
                        .map(|(_, listener)| listener.clone())
                        .collect()
                }
                None => {
                    debug!(
                        conversation_id = %conversation_id,
                        "dropping envelope for conversation with no subscribers"
                    );
                    Vec::new()
                }
            },
            None => state
                .conversations
                .values()
                .flat_map(|subscription| {
                    subscription
                        .listeners
                        .iter()
                        .map(|(_, listener)| listener.clone())
                })
                .collect(),
        }
    };

    for listener in listeners {
        listener(envelope);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Unsubscribe capability returned by `UpdateMux::subscribe`. Removing the
/// last listener of a conversation drops that conversation's state.
pub struct ListenerGuard {
    state: Arc<Mutex<MuxState>>,
    connection: ConnectionManager,
    conversation_id: String,
    listener_id: Uuid,
    active: AtomicBool,
}

impl ListenerGuard {
    /// Remove this listener. Idempotent; also runs on drop.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let remove_entry = {
            let mut state = lock(&self.state);
            match state.conversations.get_mut(&self.conversation_id) {
                Some(subscription) => {
                    subscription
                        .listeners
                        .retain(|(id, _)| *id != self.listener_id);
                    if subscription.listeners.is_empty() {
                        state.conversations.remove(&self.conversation_id);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if remove_entry {
            self.connection.unwatch(&self.conversation_id);
            debug!(
                conversation_id = %self.conversation_id,
                "last listener gone; conversation state dropped"
            );
        }
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_events::{EventKind, InvocationState, Role};
    use chrono::TimeZone;
    use serde_json::json;

    fn test_config() -> MuxConfig {
        // Discard port: connect attempts fail fast and only produce warnings.
        MuxConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            request_timeout: std::time::Duration::from_secs(1),
            ws_url: "ws://127.0.0.1:9/ws".to_string(),
            reconnect_delay: std::time::Duration::from_millis(50),
        }
    }

    fn scoped(id: &str, conversation_id: &str, kind: EventKind) -> EventEnvelope {
        EventEnvelope {
            conversation_id: Some(conversation_id.to_string()),
            ..EventEnvelope::new(id, kind)
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<EventEnvelope>>>, impl Fn(&EventEnvelope) + Send + Sync) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        (received, move |envelope: &EventEnvelope| {
            sink.lock().unwrap().push(envelope.clone());
        })
    }

    #[tokio::test]
    async fn test_dispatch_reaches_all_listeners_in_order() {
        let mux = UpdateMux::new(&test_config());
        let (first, first_listener) = recorder();
        let (second, second_listener) = recorder();
        let _g1 = mux.subscribe("c1", first_listener);
        let _g2 = mux.subscribe("c1", second_listener);

        mux.deliver(&scoped("t1", "c1", EventKind::ToolStart));
        mux.deliver(&scoped("t1", "c1", EventKind::ToolResult));

        assert_eq!(first.lock().unwrap().len(), 2);
        assert_eq!(second.lock().unwrap().len(), 2);
        assert_eq!(first.lock().unwrap()[0].kind, EventKind::ToolStart);
        assert_eq!(first.lock().unwrap()[1].kind, EventKind::ToolResult);
    }

    #[tokio::test]
    async fn test_unsubscribe_silences_only_that_listener() {
        let mux = UpdateMux::new(&test_config());
        let (first, first_listener) = recorder();
        let (second, second_listener) = recorder();
        let g1 = mux.subscribe("c1", first_listener);
        let _g2 = mux.subscribe("c1", second_listener);

        mux.deliver(&scoped("t1", "c1", EventKind::ToolStart));
        g1.unsubscribe();
        g1.unsubscribe(); // idempotent
        mux.deliver(&scoped("t2", "c1", EventKind::ToolStart));

        assert_eq!(first.lock().unwrap().len(), 1);
        assert_eq!(second.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_resubscribe_sees_no_replay() {
        let mux = UpdateMux::new(&test_config());
        let (first, first_listener) = recorder();
        let guard = mux.subscribe("c1", first_listener);
        mux.deliver(&scoped("t1", "c1", EventKind::ToolStart));
        guard.unsubscribe();

        let (second, second_listener) = recorder();
        let _guard = mux.subscribe("c1", second_listener);
        mux.deliver(&scoped("t2", "c1", EventKind::ToolStart));

        // No implicit buffering: only the post-resubscribe envelope arrives,
        // and the torn-down invocation state did not survive.
        assert_eq!(first.lock().unwrap().len(), 1);
        let seen: Vec<String> = second
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.invocation_id.clone())
            .collect();
        assert_eq!(seen, vec!["t2".to_string()]);
        let invocations = mux.invocations("c1");
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].invocation_id, "t2");
    }

    #[tokio::test]
    async fn test_dispatch_folds_before_notifying() {
        let mux = UpdateMux::new(&test_config());
        let (_received, listener) = recorder();
        let _guard = mux.subscribe("c1", listener);

        mux.deliver(&scoped("t1", "c1", EventKind::ToolStart));
        let envelope = EventEnvelope {
            result: Some(json!({"hits": 3})),
            ..scoped("t1", "c1", EventKind::ToolResult)
        };
        mux.deliver(&envelope);

        let invocations = mux.invocations("c1");
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].state, InvocationState::Done);
        assert_eq!(invocations[0].result, Some(json!({"hits": 3})));
    }

    #[tokio::test]
    async fn test_broadcast_frames_reach_everyone_without_folding() {
        let mux = UpdateMux::new(&test_config());
        let (first, first_listener) = recorder();
        let (second, second_listener) = recorder();
        let _g1 = mux.subscribe("c1", first_listener);
        let _g2 = mux.subscribe("c2", second_listener);

        let thinking = EventEnvelope {
            message: Some("warming up".to_string()),
            ..EventEnvelope::new("", EventKind::Thinking)
        };
        mux.deliver(&thinking);

        assert_eq!(first.lock().unwrap().len(), 1);
        assert_eq!(second.lock().unwrap().len(), 1);
        assert!(mux.invocations("c1").is_empty());
        assert!(mux.invocations("c2").is_empty());
    }

    #[tokio::test]
    async fn test_envelope_for_unknown_conversation_is_dropped() {
        let mux = UpdateMux::new(&test_config());
        let (received, listener) = recorder();
        let _guard = mux.subscribe("c1", listener);

        mux.deliver(&scoped("t1", "other", EventKind::ToolStart));

        assert!(received.lock().unwrap().is_empty());
        assert!(mux.invocations("other").is_empty());
    }

    #[tokio::test]
    async fn test_seed_then_timeline() {
        let mux = UpdateMux::new(&test_config());
        let ts = |secs: u32| Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, secs).unwrap();

        let messages = vec![
            ChatMessage::new("m1", "what's the weather?", Role::User, ts(0)),
            ChatMessage::new("m2", "Let me check.", Role::Assistant, ts(1)),
        ];
        let actions = vec![StoredAction {
            id: "a1".to_string(),
            action_type: "tool_start".to_string(),
            data: EventEnvelope {
                tool: Some("weather".to_string()),
                correlation_id: Some("m2".to_string()),
                ..EventEnvelope::new("t1", EventKind::ToolStart)
            },
            created_at: ts(2),
            metadata: Default::default(),
        }];

        mux.seed_from_history("c1", messages, &actions);

        let items = mux.get_timeline("c1");
        assert_eq!(items.len(), 3);
        assert!(matches!(&items[0], TimelineItem::Message { message, .. } if message.id == "m1"));
        assert!(matches!(&items[1], TimelineItem::Message { message, .. } if message.id == "m2"));
        assert!(matches!(
            &items[2],
            TimelineItem::Invocation { invocation, .. } if invocation.invocation_id == "t1"
        ));

        // Live envelopes keep folding into the seeded state.
        let _guard = mux.subscribe("c1", |_| {});
        let done = EventEnvelope {
            result: Some(json!({"temperature": 71})),
            ..scoped("t1", "c1", EventKind::ToolResult)
        };
        mux.deliver(&done);
        let invocations = mux.invocations("c1");
        assert_eq!(invocations[0].state, InvocationState::Done);
    }

    #[tokio::test]
    async fn test_timeline_for_unknown_conversation_is_empty() {
        let mux = UpdateMux::new(&test_config());
        assert!(mux.get_timeline("nope").is_empty());
    }
}
