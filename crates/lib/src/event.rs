//! Inbound platform events: a closed set of kinds decoded from the JSON envelope
//! delivered over the subscription connection.
//!
//! Decoding never fails. Fields the payload does not carry become `None`, and the
//! admission filter and dedup key derivation decide what to do with an event that
//! is missing its identity or creation time.

use serde::Deserialize;
use serde_json::Value;

use crate::ingest::normalize_epoch_ms;

pub const MESSAGE_RECEIVED: &str = "im.message.receive_v1";
pub const CARD_ACTION_TRIGGERED: &str = "card.action.trigger";
const TASK_EVENT_PREFIX: &str = "task.";

/// Fields common to every event kind.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventMeta {
    /// Per-delivery id; may differ between redeliveries of the same logical event.
    pub event_id: Option<String>,
    pub event_type: String,
    /// Platform-declared creation time, normalized to milliseconds.
    pub occurred_at_ms: Option<i64>,
}

/// Discriminator used in logs and handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MessageReceived,
    CardActionTriggered,
    TaskLifecycleChanged,
    Unknown,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageReceived => "message",
            Self::CardActionTriggered => "card_action",
            Self::TaskLifecycleChanged => "task",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatType {
    /// One-on-one conversation with the bot.
    Direct,
    Group,
    Other(String),
}

impl ChatType {
    fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some("p2p") => Self::Direct,
            Some("group") | Some("topic_group") => Self::Group,
            Some(other) => Self::Other(other.to_string()),
            None => Self::Other(String::new()),
        }
    }
}

/// One entry of the structured mention list: `key` is the placeholder used in the text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mention {
    pub key: String,
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    pub meta: EventMeta,
    pub conversation_id: Option<String>,
    pub chat_type: ChatType,
    /// Stable across reconnect-induced redelivery.
    pub message_id: Option<String>,
    pub root_id: Option<String>,
    pub parent_id: Option<String>,
    pub sender_id: Option<String>,
    pub sender_type: Option<String>,
    pub message_type: Option<String>,
    pub text: String,
    /// `None` when the payload carried no mention list at all.
    pub mentions: Option<Vec<Mention>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CardActionEvent {
    pub meta: EventMeta,
    pub operator_id: Option<String>,
    pub token: Option<String>,
    pub value: Value,
    pub option: Option<String>,
    pub tag: Option<String>,
    /// Platform callback context ("current chat"), from `event.context` or the legacy top-level field.
    pub context_chat_id: Option<String>,
    /// Platform callback context ("current message"); usually the card's own message.
    pub context_message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskEvent {
    pub meta: EventMeta,
    pub task_id: Option<String>,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    MessageReceived(MessageEvent),
    CardActionTriggered(CardActionEvent),
    TaskLifecycleChanged(TaskEvent),
    Unknown(EventMeta),
}

impl InboundEvent {
    pub fn meta(&self) -> &EventMeta {
        match self {
            Self::MessageReceived(m) => &m.meta,
            Self::CardActionTriggered(c) => &c.meta,
            Self::TaskLifecycleChanged(t) => &t.meta,
            Self::Unknown(meta) => meta,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::MessageReceived(_) => EventKind::MessageReceived,
            Self::CardActionTriggered(_) => EventKind::CardActionTriggered,
            Self::TaskLifecycleChanged(_) => EventKind::TaskLifecycleChanged,
            Self::Unknown(_) => EventKind::Unknown,
        }
    }

    /// Event id for log lines; `-` when the delivery carried none.
    pub fn log_id(&self) -> &str {
        self.meta().event_id.as_deref().unwrap_or("-")
    }

    /// Decode a raw envelope (`{ header, event }`) into a typed event.
    pub fn from_envelope(raw: &Value) -> Self {
        let envelope: WireEnvelope = decode(raw);
        let header = envelope.header.unwrap_or_default();
        let event_type = header.event_type.unwrap_or_default();
        let mut meta = EventMeta {
            event_id: non_empty(header.event_id),
            event_type: event_type.clone(),
            occurred_at_ms: header.create_time.as_ref().and_then(parse_epoch),
        };

        if event_type == MESSAGE_RECEIVED {
            let wire: WireMessageEvent = decode(&envelope.event);
            let message = wire.message.unwrap_or_default();
            if meta.occurred_at_ms.is_none() {
                meta.occurred_at_ms = message.create_time.as_ref().and_then(parse_epoch);
            }
            let sender = wire.sender.unwrap_or_default();
            InboundEvent::MessageReceived(MessageEvent {
                meta,
                conversation_id: non_empty(message.chat_id),
                chat_type: ChatType::parse(message.chat_type.as_deref()),
                message_id: non_empty(message.message_id),
                root_id: non_empty(message.root_id),
                parent_id: non_empty(message.parent_id),
                sender_id: sender.sender_id.and_then(WireUserId::into_id),
                sender_type: non_empty(sender.sender_type),
                text: message_text(message.content.as_deref()),
                message_type: non_empty(message.message_type),
                mentions: message.mentions.map(|list| {
                    list.into_iter()
                        .filter_map(WireMention::into_mention)
                        .collect()
                }),
            })
        } else if event_type == CARD_ACTION_TRIGGERED {
            let wire: WireCardEvent = decode(&envelope.event);
            let action = wire.action.unwrap_or_default();
            let context = wire.context.unwrap_or_default();
            InboundEvent::CardActionTriggered(CardActionEvent {
                meta,
                operator_id: wire.operator.and_then(WireUserId::into_id),
                token: non_empty(wire.token),
                value: action.value,
                option: non_empty(action.option),
                tag: non_empty(action.tag),
                context_chat_id: non_empty(context.open_chat_id).or(non_empty(wire.open_chat_id)),
                context_message_id: non_empty(context.open_message_id)
                    .or(non_empty(wire.open_message_id)),
            })
        } else if event_type.starts_with(TASK_EVENT_PREFIX) {
            let wire: WireTaskEvent = decode(&envelope.event);
            let task_id = non_empty(wire.task_id).or(wire.task.and_then(|t| non_empty(t.guid)));
            InboundEvent::TaskLifecycleChanged(TaskEvent {
                meta,
                task_id,
                payload: envelope.event,
            })
        } else {
            InboundEvent::Unknown(meta)
        }
    }
}

/// Parse a creation timestamp given as number or numeric string, normalized to ms.
pub fn parse_epoch(raw: &Value) -> Option<i64> {
    let value = match raw {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?,
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))?
        }
        _ => return None,
    };
    if value <= 0 {
        return None;
    }
    Some(normalize_epoch_ms(value))
}

/// Text messages carry `content` as a JSON string `{"text": "..."}`; anything else is used raw.
fn message_text(content: Option<&str>) -> String {
    let Some(content) = content else {
        return String::new();
    };
    match serde_json::from_str::<Value>(content) {
        Ok(Value::Object(map)) => map
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        _ => content.to_string(),
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn decode<T: for<'de> Deserialize<'de> + Default>(value: &Value) -> T {
    if value.is_null() {
        return T::default();
    }
    match serde_json::from_value(value.clone()) {
        Ok(v) => v,
        Err(e) => {
            log::debug!("event: payload did not match expected shape: {}", e);
            T::default()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct WireEnvelope {
    #[serde(default)]
    header: Option<WireHeader>,
    #[serde(default)]
    event: Value,
}

#[derive(Debug, Default, Deserialize)]
struct WireHeader {
    #[serde(default)]
    event_id: Option<String>,
    #[serde(default)]
    event_type: Option<String>,
    #[serde(default)]
    create_time: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct WireUserId {
    #[serde(default)]
    open_id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

impl WireUserId {
    fn into_id(self) -> Option<String> {
        non_empty(self.open_id).or(non_empty(self.user_id))
    }
}

#[derive(Debug, Default, Deserialize)]
struct WireSender {
    #[serde(default)]
    sender_id: Option<WireUserId>,
    #[serde(default)]
    sender_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireMention {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    id: Option<WireUserId>,
    #[serde(default)]
    name: Option<String>,
}

impl WireMention {
    fn into_mention(self) -> Option<Mention> {
        Some(Mention {
            key: non_empty(self.key).unwrap_or_default(),
            id: self.id.and_then(WireUserId::into_id)?,
            name: self.name.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct WireMessage {
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    root_id: Option<String>,
    #[serde(default)]
    parent_id: Option<String>,
    #[serde(default)]
    chat_id: Option<String>,
    #[serde(default)]
    chat_type: Option<String>,
    #[serde(default)]
    message_type: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    create_time: Option<Value>,
    #[serde(default)]
    mentions: Option<Vec<WireMention>>,
}

#[derive(Debug, Default, Deserialize)]
struct WireMessageEvent {
    #[serde(default)]
    sender: Option<WireSender>,
    #[serde(default)]
    message: Option<WireMessage>,
}

#[derive(Debug, Default, Deserialize)]
struct WireAction {
    #[serde(default)]
    value: Value,
    #[serde(default)]
    option: Option<String>,
    #[serde(default)]
    tag: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireCardContext {
    #[serde(default)]
    open_chat_id: Option<String>,
    #[serde(default)]
    open_message_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireCardEvent {
    #[serde(default)]
    operator: Option<WireUserId>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    action: Option<WireAction>,
    #[serde(default)]
    context: Option<WireCardContext>,
    #[serde(default)]
    open_chat_id: Option<String>,
    #[serde(default)]
    open_message_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireTaskRef {
    #[serde(default)]
    guid: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireTaskEvent {
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    task: Option<WireTaskRef>,
}
