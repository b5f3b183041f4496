//! # Agent Events
//!
//! Typed building blocks for agent-conversation live updates: the wire-level
//! event envelope, the per-invocation folding that collapses a raw event
//! stream into coherent tool-call state, and the timeline merge that combines
//! folded invocations with historical messages into one render-ready
//! sequence.
//!
//! This crate is pure data and logic — no I/O, no async. The `live_mux`
//! package owns the realtime connection and feeds envelopes through these
//! functions.
//!
//! ## Quick Start
//!
//! ```rust
//! use agent_events::{EventEnvelope, EventKind, InvocationState, aggregate, timeline};
//! use chrono::Utc;
//!
//! let mut invocations = aggregate::InvocationMap::new();
//!
//! // Fold a raw event stream into invocation state.
//! let start = EventEnvelope {
//!     tool: Some("search".to_string()),
//!     ..EventEnvelope::new("t1", EventKind::ToolStart)
//! };
//! aggregate::fold(&mut invocations, &start, Utc::now());
//!
//! let done = EventEnvelope {
//!     result: Some(serde_json::json!({"hits": 3})),
//!     ..EventEnvelope::new("t1", EventKind::ToolResult)
//! };
//! aggregate::fold(&mut invocations, &done, Utc::now());
//!
//! assert_eq!(invocations["t1"].state, InvocationState::Done);
//!
//! // Merge with history into a renderable timeline.
//! let items = timeline::merge(&[], &invocations);
//! assert_eq!(items.len(), 1);
//! ```

pub mod aggregate;
pub mod timeline;
pub mod types;

pub use aggregate::{InvocationMap, fold, seed};
pub use timeline::{TimelineItem, merge};
pub use types::{
    ChatMessage, EventEnvelope, EventKind, Invocation, InvocationState, Role, StoredAction,
    StoredConversation,
};
