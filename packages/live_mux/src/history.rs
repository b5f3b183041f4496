//! REST boundary to the agent backend.
//!
//! Pull-based history (`GET /api/conversations`) and message send
//! (`POST /api/message`). Failures surface to the caller as `HistoryError`;
//! the core performs no retries — reconciliation policy belongs to the
//! rendering layer.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use agent_events::StoredConversation;

use crate::config::MuxConfig;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("request failed: {message}")]
    Request { message: String },
    #[error("server returned {status}: {body}")]
    Http { status: StatusCode, body: String },
    #[error("response decode failed: {message}")]
    Decode { message: String },
}

#[derive(Debug, Deserialize)]
struct ConversationsResponse {
    conversations: Vec<StoredConversation>,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    conversation_id: &'a str,
    message: &'a str,
}

#[derive(Debug, Deserialize)]
struct SendMessageResponse {
    response: String,
}

/// Client for the backend's REST endpoints.
#[derive(Debug, Clone)]
pub struct HistoryClient {
    base_url: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl HistoryClient {
    pub fn new(config: &MuxConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: config.request_timeout,
            http: reqwest::Client::new(),
        }
    }

    /// Fetch every conversation with its messages and persisted actions.
    pub async fn fetch_conversations(&self) -> Result<Vec<StoredConversation>, HistoryError> {
        let url = format!("{}/api/conversations", self.base_url);
        let response = self
            .http
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| HistoryError::Request {
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HistoryError::Http { status, body });
        }

        let decoded: ConversationsResponse =
            response.json().await.map_err(|e| HistoryError::Decode {
                message: e.to_string(),
            })?;
        Ok(decoded.conversations)
    }

    /// Fetch a single conversation by id, or `None` if the backend does not
    /// know it. The backend only exposes the full listing, so this filters
    /// client-side.
    pub async fn fetch_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<StoredConversation>, HistoryError> {
        Ok(self
            .fetch_conversations()
            .await?
            .into_iter()
            .find(|conversation| conversation.id == conversation_id))
    }

    /// Send a user message. The synchronous response text comes back here;
    /// tool activity triggered by it arrives over the realtime channel.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        message: &str,
    ) -> Result<String, HistoryError> {
        let url = format!("{}/api/message", self.base_url);
        let response = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .json(&SendMessageRequest {
                conversation_id,
                message,
            })
            .send()
            .await
            .map_err(|e| HistoryError::Request {
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HistoryError::Http { status, body });
        }

        let decoded: SendMessageResponse =
            response.json().await.map_err(|e| HistoryError::Decode {
                message: e.to_string(),
            })?;
        Ok(decoded.response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_events::{EventKind, Role};

    #[test]
    fn test_conversations_response_decodes() {
        let json = r#"{
            "conversations": [{
                "id": "c1",
                "title": "Conversation c1",
                "messages": [
                    {"id": "m1", "content": "hi", "role": "user", "created_at": "2024-01-01T00:00:00Z"}
                ],
                "actions": [
                    {"action_type": "tool_start",
                     "data": {"id": "t1", "type": "tool_start", "tool": "search"},
                     "created_at": "2024-01-01T00:00:01Z"}
                ]
            }]
        }"#;
        let decoded: ConversationsResponse = serde_json::from_str(json).unwrap();
        assert_eq!(decoded.conversations.len(), 1);
        let convo = &decoded.conversations[0];
        assert_eq!(convo.messages[0].role, Role::User);
        assert_eq!(convo.actions[0].data.kind, EventKind::ToolStart);
    }

    #[test]
    fn test_conversations_response_tolerates_missing_actions() {
        let json = r#"{"conversations": [{"id": "c1", "title": "", "messages": []}]}"#;
        let decoded: ConversationsResponse = serde_json::from_str(json).unwrap();
        assert!(decoded.conversations[0].actions.is_empty());
    }

    #[test]
    fn test_send_request_wire_shape() {
        let body = serde_json::to_value(SendMessageRequest {
            conversation_id: "c1",
            message: "hello",
        })
        .unwrap();
        assert_eq!(
            body,
            serde_json::json!({"conversation_id": "c1", "message": "hello"})
        );
    }
}
