//! Invocation folding.
//!
//! Collapses the raw event stream into per-invocation state: one `Invocation`
//! per id, advancing `pending -> running -> done/error`, with repeated
//! progress frames replacing rather than accumulating. `fold` is a pure state
//! transition (the clock is an explicit argument), so replaying the same
//! envelopes over the same map always produces the same result.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::types::{EventEnvelope, EventKind, Invocation, InvocationState, StoredAction};

/// Per-conversation aggregate: invocation id -> folded state.
pub type InvocationMap = HashMap<String, Invocation>;

/// Fold one envelope into the map. Returns whether the envelope was applied.
///
/// Envelopes without an invocation id, and kinds outside
/// `tool_start`/`progress_update`/`tool_result`, are dropped without creating
/// an aggregate.
pub fn fold(map: &mut InvocationMap, envelope: &EventEnvelope, seen_at: DateTime<Utc>) -> bool {
    if envelope.invocation_id.is_empty() {
        debug!(kind = ?envelope.kind, "dropping envelope without invocation id");
        return false;
    }
    if !envelope.kind.is_tool_kind() {
        debug!(
            kind = ?envelope.kind,
            invocation_id = %envelope.invocation_id,
            "ignoring non-tool envelope"
        );
        return false;
    }

    let invocation = map
        .entry(envelope.invocation_id.clone())
        .or_insert_with(|| Invocation::new(envelope.invocation_id.clone(), seen_at));

    if invocation.correlation_id.is_none() {
        invocation.correlation_id = envelope.correlation_id.clone();
    }
    if let Some(tool) = &envelope.tool {
        invocation.tool = Some(tool.clone());
    }

    match envelope.kind {
        EventKind::ToolStart => {
            if let Some(args) = &envelope.args {
                invocation.args = Some(args.clone());
            }
            invocation.events.push(envelope.clone());
            advance(invocation, InvocationState::Running);
        }
        EventKind::ProgressUpdate => {
            // A single retained progress entry: overwrite in place, keeping
            // the event's original position in the arrival order.
            match invocation
                .events
                .iter_mut()
                .find(|e| e.kind == EventKind::ProgressUpdate)
            {
                Some(slot) => *slot = envelope.clone(),
                None => invocation.events.push(envelope.clone()),
            }
            if envelope.progress.is_some() {
                invocation.progress = envelope.progress;
            }
            if let Some(message) = &envelope.message {
                invocation.latest_message = Some(message.clone());
            }
            advance(invocation, InvocationState::Running);
        }
        EventKind::ToolResult => {
            if invocation.state.is_terminal() {
                warn!(
                    invocation_id = %invocation.invocation_id,
                    prior = ?invocation.state,
                    "duplicate terminal event for invocation; last result wins"
                );
            }
            invocation.events.push(envelope.clone());
            invocation.result = envelope.result.clone();
            invocation.error = envelope.error.clone();
            invocation.state = if envelope.error.is_some() {
                InvocationState::Error
            } else {
                InvocationState::Done
            };
        }
        // Unreachable: guarded by is_tool_kind above.
        _ => return false,
    }

    true
}

/// Advance the state monotonically: never regress, never leave a terminal
/// state (a late progress frame after the result keeps the result's state).
fn advance(invocation: &mut Invocation, next: InvocationState) {
    if invocation.state.is_terminal() {
        return;
    }
    if next > invocation.state {
        invocation.state = next;
    }
}

/// Rebuild an invocation map from persisted actions by replaying each one
/// through `fold` in stored order, using the action's own `created_at` as the
/// fold timestamp. Actions outside the three tool kinds are skipped.
pub fn seed(actions: &[StoredAction]) -> InvocationMap {
    let mut map = InvocationMap::new();
    for action in actions {
        if !action.is_tool_action() {
            continue;
        }
        fold(&mut map, &action.data, action.created_at);
    }
    map
}
