//! Timeline merging.
//!
//! Combines a conversation's historical messages with its folded invocations
//! into one chronologically ordered, render-ready sequence. Invocations
//! correlated to an assistant message sort immediately after that message;
//! everything else lands at its own first-seen time. The merge is a pure
//! function of its inputs and is recomputed wholesale, never patched.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashSet;

use crate::aggregate::InvocationMap;
use crate::types::{ChatMessage, Invocation, Role};

/// Nudge applied to an attached invocation so it sorts right after the
/// message that triggered it.
const ATTACH_OFFSET_MS: i64 = 1;

/// One renderable entry of the merged conversation view.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimelineItem {
    Message {
        at: DateTime<Utc>,
        message: ChatMessage,
    },
    Invocation {
        at: DateTime<Utc>,
        invocation: Invocation,
    },
}

impl TimelineItem {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            TimelineItem::Message { at, .. } | TimelineItem::Invocation { at, .. } => *at,
        }
    }
}

/// Merge messages and invocations into one ordered timeline.
///
/// Stable sort by timestamp ascending; ties keep emission order, which puts
/// each message before the invocation cards attached to it.
pub fn merge(messages: &[ChatMessage], invocations: &InvocationMap) -> Vec<TimelineItem> {
    let mut items = Vec::with_capacity(messages.len() + invocations.len());
    let mut attached: HashSet<&str> = HashSet::new();

    for message in messages {
        items.push(TimelineItem::Message {
            at: message.created_at,
            message: message.clone(),
        });
        if message.role != Role::Assistant {
            continue;
        }

        let mut matched: Vec<&Invocation> = invocations
            .values()
            .filter(|inv| {
                !attached.contains(inv.invocation_id.as_str()) && correlates(message, inv)
            })
            .collect();
        sort_invocations(&mut matched);

        for invocation in matched {
            attached.insert(invocation.invocation_id.as_str());
            items.push(TimelineItem::Invocation {
                at: message.created_at + Duration::milliseconds(ATTACH_OFFSET_MS),
                invocation: invocation.clone(),
            });
        }
    }

    // Orphan tool activity (e.g. background actions) at its own timestamp.
    let mut orphans: Vec<&Invocation> = invocations
        .values()
        .filter(|inv| !attached.contains(inv.invocation_id.as_str()))
        .collect();
    sort_invocations(&mut orphans);
    for invocation in orphans {
        items.push(TimelineItem::Invocation {
            at: invocation.first_seen_at,
            invocation: invocation.clone(),
        });
    }

    items.sort_by_key(TimelineItem::at);
    items
}

/// Whether `invocation` was triggered by `message`. Primary key is the
/// envelope's correlation id; fallback is the message's own
/// `tool_invocations` metadata.
fn correlates(message: &ChatMessage, invocation: &Invocation) -> bool {
    if invocation.correlation_id.as_deref() == Some(message.id.as_str()) {
        return true;
    }
    message
        .tool_refs()
        .iter()
        .any(|r| *r == invocation.invocation_id)
}

fn sort_invocations(invocations: &mut [&Invocation]) {
    invocations.sort_by(|a, b| {
        a.first_seen_at
            .cmp(&b.first_seen_at)
            .then_with(|| a.invocation_id.cmp(&b.invocation_id))
    });
}
