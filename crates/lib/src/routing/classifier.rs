//! Message path classification: direct message, group mention, thread reply, or ignored.

use std::sync::Arc;

use crate::event::{ChatType, Mention, MessageEvent};
use crate::routing::participation::{ThreadKey, ThreadRelevance};

const APP_SENDER_TYPE: &str = "app";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessagePath {
    DirectMessage,
    GroupMention,
    ThreadReply,
    Ignored,
}

impl MessagePath {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DirectMessage => "direct_message",
            Self::GroupMention => "group_mention",
            Self::ThreadReply => "thread_reply",
            Self::Ignored => "ignored",
        }
    }
}

/// Path plus the message text with mention placeholders resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub path: MessagePath,
    pub text: String,
}

pub struct MessageClassifier {
    bot_id: Option<String>,
    bypass_commands: Vec<String>,
    relevance: Arc<dyn ThreadRelevance>,
}

impl MessageClassifier {
    pub fn new(
        bot_id: Option<String>,
        bypass_commands: Vec<String>,
        relevance: Arc<dyn ThreadRelevance>,
    ) -> Self {
        let bypass_commands = bypass_commands
            .into_iter()
            .map(|c| c.trim().to_lowercase())
            .filter(|c| !c.is_empty())
            .collect();
        Self {
            bot_id: bot_id.filter(|id| !id.trim().is_empty()),
            bypass_commands,
            relevance,
        }
    }

    pub fn relevance(&self) -> &Arc<dyn ThreadRelevance> {
        &self.relevance
    }

    pub async fn classify(&self, msg: &MessageEvent) -> Classification {
        let text = match msg.mentions.as_deref() {
            Some(mentions) => resolve_mentions(&msg.text, mentions),
            None => msg.text.clone(),
        };
        let path = self.classify_path(msg, &text).await;
        Classification { path, text }
    }

    async fn classify_path(&self, msg: &MessageEvent, resolved_text: &str) -> MessagePath {
        if self.is_own_message(msg) {
            return MessagePath::Ignored;
        }
        if msg.chat_type == ChatType::Direct {
            return MessagePath::DirectMessage;
        }
        if self.mentions_bot(msg) {
            return MessagePath::GroupMention;
        }
        let Some(root) = msg.root_id.as_deref() else {
            return MessagePath::Ignored;
        };
        if msg.message_id.as_deref() == Some(root) {
            return MessagePath::Ignored;
        }
        let Some(conversation) = msg.conversation_id.as_deref() else {
            return MessagePath::Ignored;
        };
        let key = ThreadKey::new(conversation, root);
        if self.relevance.is_participating(&key).await {
            return MessagePath::ThreadReply;
        }
        if self.is_bypass_command(resolved_text) {
            log::debug!(
                "router: bypass command in unrelated thread {}/{}",
                conversation,
                root
            );
            return MessagePath::ThreadReply;
        }
        MessagePath::Ignored
    }

    fn is_own_message(&self, msg: &MessageEvent) -> bool {
        if msg.sender_type.as_deref() == Some(APP_SENDER_TYPE) {
            return true;
        }
        matches!((&self.bot_id, &msg.sender_id), (Some(bot), Some(sender)) if bot == sender)
    }

    /// Structured mention list first; only when it is empty or absent, the raw text.
    fn mentions_bot(&self, msg: &MessageEvent) -> bool {
        let Some(bot) = self.bot_id.as_deref() else {
            return false;
        };
        match msg.mentions.as_deref() {
            Some(mentions) if !mentions.is_empty() => mentions.iter().any(|m| m.id == bot),
            _ => at_tag_ids(&msg.text).iter().any(|id| id == bot),
        }
    }

    /// First token of the text (mention markup removed) matches a bypass command.
    pub fn is_bypass_command(&self, text: &str) -> bool {
        let stripped = strip_at_tags(text);
        let Some(first) = stripped.split_whitespace().next() else {
            return false;
        };
        let first = first.to_lowercase();
        self.bypass_commands.iter().any(|c| *c == first)
    }
}

/// Replace placeholders (`@_user_1`) with `<at user_id="ID">NAME</at>`.
pub fn resolve_mentions(text: &str, mentions: &[Mention]) -> String {
    let mut ordered: Vec<&Mention> = mentions.iter().filter(|m| !m.key.is_empty()).collect();
    // Longer keys first so "@_user_1" does not clobber "@_user_10".
    ordered.sort_by(|a, b| b.key.len().cmp(&a.key.len()));
    let mut out = text.to_string();
    for m in ordered {
        let tag = format!("<at user_id=\"{}\">{}</at>", m.id, m.name);
        out = out.replace(&m.key, &tag);
    }
    out
}

/// Ids referenced by `<at user_id="..">`, `<at open_id="..">` or `<at id="..">` markup.
pub fn at_tag_ids(text: &str) -> Vec<String> {
    let mut ids = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("<at ") {
        let after = &rest[start + 4..];
        let Some(end) = after.find('>') else {
            break;
        };
        let attrs = &after[..end];
        for name in ["user_id", "open_id", "id"] {
            if let Some(value) = attr_value(attrs, name) {
                ids.push(value);
                break;
            }
        }
        rest = &after[end + 1..];
    }
    ids
}

fn attr_value(attrs: &str, name: &str) -> Option<String> {
    for part in attrs.split_whitespace() {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        if key != name {
            continue;
        }
        let value = value.trim_matches(|c| c == '"' || c == '\'');
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    None
}

/// Remove `<at ...>...</at>` segments (and stray placeholders) from text.
pub fn strip_at_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<at ") {
        out.push_str(&rest[..start]);
        let after = &rest[start..];
        match after.find("</at>") {
            Some(close) => rest = &after[close + "</at>".len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out.split_whitespace()
        .filter(|token| !token.starts_with("@_user_"))
        .collect::<Vec<_>>()
        .join(" ")
}
