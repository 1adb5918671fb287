//! Downstream handoffs: the payloads and handler traits through which admitted,
//! deduplicated and classified events leave this crate.
//!
//! Implementations own all business logic (response generation, card updates,
//! persistence). They are always invoked on a spawned task; an `Err` or a panic is
//! caught at the router's dispatch boundary and logged.

mod forward;

pub use forward::ForwardingHandler;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

/// A chat message routed to one of the message paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageHandoff {
    pub conversation_id: String,
    pub message_id: String,
    /// Thread root; the message's own id when it starts a new thread.
    pub thread_root_id: String,
    /// Message this one directly replies to, when it is a reply.
    pub parent_id: Option<String>,
    /// Platform message type (`text`, `post`, `image`, ...).
    pub message_type: Option<String>,
    /// Text with mention placeholders resolved to concrete identities.
    pub text: String,
    pub sender_id: String,
    pub mentioned_ids: Vec<String>,
}

/// A card button click resolved to the conversation it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ButtonFollowup {
    pub conversation_id: String,
    pub thread_root_id: String,
    pub clicked_value: String,
    pub operator_id: String,
    /// Component that was clicked (`button`, `select_static`, ...).
    pub action_tag: Option<String>,
}

/// A task lifecycle notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskChange {
    pub event_type: String,
    pub task_id: Option<String>,
    pub payload: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("downstream request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("downstream rejected handoff: {0}")]
    Rejected(String),
    #[error("{0}")]
    Other(String),
}

/// Receives chat messages, one call per admitted, non-duplicate, classified event.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_direct_message(&self, msg: MessageHandoff) -> Result<(), HandlerError>;
    async fn on_group_mention(&self, msg: MessageHandoff) -> Result<(), HandlerError>;
    async fn on_thread_reply(&self, msg: MessageHandoff) -> Result<(), HandlerError>;
}

/// Receives card-action clicks whose context could be fully resolved.
#[async_trait]
pub trait CardActionHandler: Send + Sync {
    async fn on_button_followup(&self, followup: ButtonFollowup) -> Result<(), HandlerError>;
}

/// Receives task lifecycle notifications.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn on_task_changed(&self, change: TaskChange) -> Result<(), HandlerError>;
}
