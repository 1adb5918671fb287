//! Button context resolution for card-action events.
//!
//! Priority order:
//! 1. The `ctx` string the application embedded in the button value at render time
//!    (`"conversationId|threadRootId"`). Authoritative.
//! 2. The platform's callback context (open chat id + open message id). Less accurate:
//!    the "current message" is usually the card's own message, not the thread root.
//!
//! A context missing either identifier is never used.

use serde_json::Value;

use crate::event::CardActionEvent;

/// Key inside the button value holding the embedded context string.
pub const EMBEDDED_CONTEXT_KEY: &str = "ctx";
const CONTEXT_DELIMITER: char = '|';

/// Addressing derived for one click. Recomputed per event, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ButtonContext {
    pub conversation_id: String,
    pub thread_root_id: String,
    pub clicked_value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextSource {
    Embedded,
    PlatformCallback,
}

/// Resolve the reply context for a click, or `None` if no source yields both ids.
pub fn resolve_button_context(event: &CardActionEvent) -> Option<(ButtonContext, ContextSource)> {
    let clicked_value = clicked_value(event);
    if let Some((conversation_id, thread_root_id)) = embedded_context(&event.value) {
        return Some((
            ButtonContext {
                conversation_id,
                thread_root_id,
                clicked_value,
            },
            ContextSource::Embedded,
        ));
    }
    match (
        event.context_chat_id.as_deref(),
        event.context_message_id.as_deref(),
    ) {
        (Some(chat), Some(message)) => Some((
            ButtonContext {
                conversation_id: chat.to_string(),
                thread_root_id: message.to_string(),
                clicked_value,
            },
            ContextSource::PlatformCallback,
        )),
        _ => None,
    }
}

/// Split `"conversationId|threadRootId"`. Either half empty counts as absent.
pub fn parse_context_string(raw: &str) -> Option<(String, String)> {
    let (conversation, root) = raw.split_once(CONTEXT_DELIMITER)?;
    let conversation = conversation.trim();
    let root = root.trim();
    if conversation.is_empty() || root.is_empty() {
        return None;
    }
    Some((conversation.to_string(), root.to_string()))
}

fn embedded_context(value: &Value) -> Option<(String, String)> {
    let raw = match value {
        Value::Object(map) => map.get(EMBEDDED_CONTEXT_KEY)?.as_str()?,
        // Some clients serialize the button value as a JSON string.
        Value::String(s) => {
            let parsed: Value = serde_json::from_str(s).ok()?;
            return embedded_context(&parsed);
        }
        _ => return None,
    };
    parse_context_string(raw)
}

/// Select option, then `value.action`, then the value itself minus the embedded context.
fn clicked_value(event: &CardActionEvent) -> String {
    if let Some(option) = event.option.as_deref() {
        return option.to_string();
    }
    match &event.value {
        Value::Object(map) => {
            if let Some(action) = map.get("action").and_then(|v| v.as_str()) {
                return action.to_string();
            }
            let mut rest = map.clone();
            rest.remove(EMBEDDED_CONTEXT_KEY);
            Value::Object(rest).to_string()
        }
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
