use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// One realtime frame describing a step of a tool invocation (or an
/// out-of-band status frame such as `thinking` / `subscription_ack`).
///
/// Field names mirror the backend wire format: the invocation id travels as
/// `id` and the kind as `type`. Immutable once received.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    /// Invocation identifier. Empty for frames that are not tied to a tool
    /// invocation (thinking updates, subscription acks, broadcasts).
    #[serde(rename = "id", default, skip_serializing_if = "String::is_empty")]
    pub invocation_id: String,

    #[serde(rename = "type")]
    pub kind: EventKind,

    /// Routing key. Frames without one are broadcast to every subscriber.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,

    /// Completion fraction in `0..=1`, carried by progress updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Id of the assistant message that triggered this invocation, when the
    /// backend correlates them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl EventEnvelope {
    /// Minimal envelope with just an invocation id and a kind; the remaining
    /// fields default to absent. Mostly useful in tests and fixtures.
    pub fn new(invocation_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            kind,
            conversation_id: None,
            tool: None,
            args: None,
            progress: None,
            message: None,
            result: None,
            error: None,
            correlation_id: None,
        }
    }
}

/// Wire-level frame kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ToolStart,
    ProgressUpdate,
    ToolResult,
    /// Free-text "the agent is thinking" status; never folded.
    Thinking,
    /// Server confirmation of an interest registration; never folded.
    SubscriptionAck,
    /// Catch-all for frame kinds this client does not know about.
    #[serde(other)]
    Unknown,
}

impl EventKind {
    /// Whether this kind participates in invocation folding.
    pub fn is_tool_kind(self) -> bool {
        matches!(
            self,
            EventKind::ToolStart | EventKind::ProgressUpdate | EventKind::ToolResult
        )
    }
}

/// Lifecycle of one tool invocation. Ordered so that state only ever advances
/// (`Pending < Running < Done/Error`); see `aggregate::fold`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum InvocationState {
    Pending,
    Running,
    Done,
    Error,
}

impl InvocationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, InvocationState::Done | InvocationState::Error)
    }
}

/// The replay-folded state of one tool call across its start/progress/result
/// events. Derived from envelopes by `aggregate::fold`; keyed by
/// `invocation_id` in the per-conversation map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Invocation {
    pub invocation_id: String,
    pub tool: Option<String>,
    pub args: Option<Value>,
    pub state: InvocationState,
    pub progress: Option<f64>,
    pub latest_message: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Arrival-ordered envelopes, with at most one progress entry retained
    /// (the newest overwrites the stored one in place).
    pub events: Vec<EventEnvelope>,
    pub first_seen_at: DateTime<Utc>,
    pub correlation_id: Option<String>,
}

impl Invocation {
    pub fn new(invocation_id: impl Into<String>, first_seen_at: DateTime<Utc>) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            tool: None,
            args: None,
            state: InvocationState::Pending,
            progress: None,
            latest_message: None,
            result: None,
            error: None,
            events: Vec::new(),
            first_seen_at,
            correlation_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            _ => Err(format!("Invalid message role: {}", s)),
        }
    }
}

/// One persisted conversation message, as served by the history endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub id: String,
    pub content: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl ChatMessage {
    pub fn new(
        id: impl Into<String>,
        content: impl Into<String>,
        role: Role,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            role,
            created_at,
            metadata: HashMap::new(),
        }
    }

    /// Invocation ids this message claims to have triggered, read from the
    /// `tool_invocations` metadata array the backend attaches to assistant
    /// messages. Empty when the metadata is absent or not a string array.
    pub fn tool_refs(&self) -> Vec<&str> {
        self.metadata
            .get("tool_invocations")
            .and_then(|v| v.as_array())
            .map(|refs| refs.iter().filter_map(|r| r.as_str()).collect())
            .unwrap_or_default()
    }
}

/// A persisted conversation action (tool call step) from history. The
/// `data` payload is the original envelope; `action_type` repeats its kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredAction {
    #[serde(default)]
    pub id: String,
    pub action_type: String,
    pub data: EventEnvelope,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl StoredAction {
    /// Whether this action is one of the three replayable tool kinds.
    pub fn is_tool_action(&self) -> bool {
        matches!(
            self.action_type.as_str(),
            "tool_start" | "progress_update" | "tool_result"
        )
    }
}

/// A conversation as served by `GET /api/conversations`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredConversation {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub actions: Vec<StoredAction>,
}
