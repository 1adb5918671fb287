//! Event routing: the router that gates and dispatches every inbound event, the
//! message path classifier, the button context resolver, and thread participation.
//!
//! Inbound: raw envelope -> admission -> dedup -> spawned task -> classifier or
//! context resolver -> registered collaborator.

mod classifier;
mod context;
mod participation;
mod router;

pub use classifier::{
    at_tag_ids, resolve_mentions, strip_at_tags, Classification, MessageClassifier, MessagePath,
};
pub use context::{
    parse_context_string, resolve_button_context, ButtonContext, ContextSource,
    EMBEDDED_CONTEXT_KEY,
};
pub use participation::{ParticipationStore, ThreadKey, ThreadRelevance};
pub use router::{DispatchOutcome, EventRouter, HandlerRegistry, RouteOutcome};
