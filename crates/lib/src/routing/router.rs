//! Event router: admission, deduplication, then a spawned, guarded handoff per event.
//!
//! `dispatch` never blocks on a handler and never returns an error. Everything after
//! the dedup check (classification, context resolution, the collaborator call) runs on
//! its own task, wrapped so that an `Err` or a panic is logged with the event's
//! identity and goes no further.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use serde_json::Value;
use tokio::runtime::Handle;

use crate::clock::Clock;
use crate::event::{CardActionEvent, EventKind, InboundEvent, MessageEvent, TaskEvent};
use crate::handoff::{
    ButtonFollowup, CardActionHandler, HandlerError, MessageHandler, MessageHandoff, TaskChange,
    TaskHandler,
};
use crate::ingest::{dedup_key, Admission, AdmissionPolicy, DedupCache};
use crate::routing::classifier::{MessageClassifier, MessagePath};
use crate::routing::context::{resolve_button_context, ContextSource};
use crate::routing::participation::ThreadKey;

/// Collaborators registered per event kind. A kind without a handler is logged and dropped.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    messages: Option<Arc<dyn MessageHandler>>,
    card_actions: Option<Arc<dyn CardActionHandler>>,
    tasks: Option<Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_messages(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.messages = Some(handler);
        self
    }

    pub fn with_card_actions(mut self, handler: Arc<dyn CardActionHandler>) -> Self {
        self.card_actions = Some(handler);
        self
    }

    pub fn with_tasks(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.tasks = Some(handler);
        self
    }

    pub fn is_registered(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::MessageReceived => self.messages.is_some(),
            EventKind::CardActionTriggered => self.card_actions.is_some(),
            EventKind::TaskLifecycleChanged => self.tasks.is_some(),
            EventKind::Unknown => false,
        }
    }
}

/// What `dispatch` did with one raw event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Admitted, first sight, handed to a spawned task.
    Dispatched { kind: EventKind, key: String },
    Rejected(Admission),
    Duplicate { key: String },
    /// No delivery identity could be derived.
    Unidentifiable { kind: EventKind },
    /// No handler registered for this kind.
    Unrouted { kind: EventKind },
    /// Called outside an async runtime; nothing was recorded.
    NoRuntime { kind: EventKind },
}

/// Where a dispatched event ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    DirectMessage,
    GroupMention,
    ThreadReply,
    ButtonFollowup(ContextSource),
    TaskChanged,
    Ignored,
    UnresolvableContext,
    Unrouted,
}

pub struct EventRouter {
    clock: Arc<dyn Clock>,
    admission: AdmissionPolicy,
    dedup: Arc<DedupCache>,
    classifier: MessageClassifier,
    handlers: HandlerRegistry,
}

impl EventRouter {
    pub fn new(
        clock: Arc<dyn Clock>,
        admission: AdmissionPolicy,
        dedup: Arc<DedupCache>,
        classifier: MessageClassifier,
        handlers: HandlerRegistry,
    ) -> Self {
        Self {
            clock,
            admission,
            dedup,
            classifier,
            handlers,
        }
    }

    pub fn dedup(&self) -> &Arc<DedupCache> {
        &self.dedup
    }

    /// Decode a raw envelope and dispatch it.
    pub fn dispatch(self: &Arc<Self>, raw: &Value) -> DispatchOutcome {
        self.dispatch_event(InboundEvent::from_envelope(raw))
    }

    pub fn dispatch_event(self: &Arc<Self>, event: InboundEvent) -> DispatchOutcome {
        let kind = event.kind();
        let admission = self
            .admission
            .admit(event.meta().occurred_at_ms, self.clock.now_ms());
        if !admission.is_admitted() {
            log::debug!(
                "router: {} event {} not admitted ({:?})",
                kind.as_str(),
                event.log_id(),
                admission
            );
            return DispatchOutcome::Rejected(admission);
        }

        let Some(key) = dedup_key(&event) else {
            log::warn!(
                "router: dropping {} event {} with no delivery identity",
                kind.as_str(),
                event.log_id()
            );
            return DispatchOutcome::Unidentifiable { kind };
        };
        // Without a runtime the handler cannot run; leave the key unrecorded so a
        // redelivery is still processed.
        let runtime = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                log::error!(
                    "router: no async runtime to run handler for {} event {} (key {}): {}",
                    kind.as_str(),
                    event.log_id(),
                    key,
                    e
                );
                return DispatchOutcome::NoRuntime { kind };
            }
        };
        if !self.dedup.check_and_record(&key) {
            log::debug!(
                "router: duplicate {} event {} (key {})",
                kind.as_str(),
                event.log_id(),
                key
            );
            return DispatchOutcome::Duplicate { key };
        }

        if !self.handlers.is_registered(kind) {
            log::info!(
                "router: no handler for {} event {} (type {:?}), dropped",
                kind.as_str(),
                event.log_id(),
                event.meta().event_type
            );
            return DispatchOutcome::Unrouted { kind };
        }

        self.spawn_guarded(&runtime, event, key.clone());
        DispatchOutcome::Dispatched { kind, key }
    }

    /// Run `route` on its own task; failures and panics stop at this boundary.
    fn spawn_guarded(self: &Arc<Self>, runtime: &Handle, event: InboundEvent, key: String) {
        let router = Arc::clone(self);
        runtime.spawn(async move {
            let kind = event.kind();
            let event_id = event.log_id().to_string();
            match AssertUnwindSafe(router.route(event)).catch_unwind().await {
                Ok(Ok(outcome)) => {
                    log::debug!(
                        "router: {} event {} (key {}) -> {:?}",
                        kind.as_str(),
                        event_id,
                        key,
                        outcome
                    );
                }
                Ok(Err(e)) => {
                    log::error!(
                        "router: handler failed for {} event {} (key {}): {}",
                        kind.as_str(),
                        event_id,
                        key,
                        e
                    );
                }
                Err(panic) => {
                    log::error!(
                        "router: handler panicked for {} event {} (key {}): {}",
                        kind.as_str(),
                        event_id,
                        key,
                        panic_message(panic.as_ref())
                    );
                }
            }
        });
    }

    /// Classify an admitted event and invoke its collaborator. Called on the spawned task.
    pub async fn route(&self, event: InboundEvent) -> Result<RouteOutcome, HandlerError> {
        match event {
            InboundEvent::MessageReceived(msg) => self.route_message(msg).await,
            InboundEvent::CardActionTriggered(action) => self.route_card_action(action).await,
            InboundEvent::TaskLifecycleChanged(task) => self.route_task(task).await,
            InboundEvent::Unknown(_) => Ok(RouteOutcome::Unrouted),
        }
    }

    async fn route_message(&self, msg: MessageEvent) -> Result<RouteOutcome, HandlerError> {
        let Some(handler) = self.handlers.messages.as_ref() else {
            return Ok(RouteOutcome::Unrouted);
        };
        let classification = self.classifier.classify(&msg).await;
        if classification.path == MessagePath::Ignored {
            log::debug!(
                "router: message {} ignored",
                msg.message_id.as_deref().unwrap_or("-")
            );
            return Ok(RouteOutcome::Ignored);
        }
        let (Some(conversation_id), Some(message_id)) =
            (msg.conversation_id.clone(), msg.message_id.clone())
        else {
            log::warn!(
                "router: {} message in event {} lacks conversation or message id, dropped",
                classification.path.as_str(),
                msg.meta.event_id.as_deref().unwrap_or("-")
            );
            return Ok(RouteOutcome::Ignored);
        };
        let thread_root_id = msg.root_id.clone().unwrap_or_else(|| message_id.clone());
        let handoff = MessageHandoff {
            conversation_id: conversation_id.clone(),
            message_id,
            thread_root_id: thread_root_id.clone(),
            parent_id: msg.parent_id.clone(),
            message_type: msg.message_type.clone(),
            text: classification.text,
            sender_id: msg.sender_id.clone().unwrap_or_default(),
            mentioned_ids: msg
                .mentions
                .as_deref()
                .unwrap_or_default()
                .iter()
                .map(|m| m.id.clone())
                .collect(),
        };
        self.classifier
            .relevance()
            .mark_participating(ThreadKey::new(conversation_id, thread_root_id))
            .await;
        match classification.path {
            MessagePath::DirectMessage => {
                handler.on_direct_message(handoff).await?;
                Ok(RouteOutcome::DirectMessage)
            }
            MessagePath::GroupMention => {
                handler.on_group_mention(handoff).await?;
                Ok(RouteOutcome::GroupMention)
            }
            MessagePath::ThreadReply => {
                handler.on_thread_reply(handoff).await?;
                Ok(RouteOutcome::ThreadReply)
            }
            MessagePath::Ignored => Ok(RouteOutcome::Ignored),
        }
    }

    async fn route_card_action(&self, action: CardActionEvent) -> Result<RouteOutcome, HandlerError> {
        let Some(handler) = self.handlers.card_actions.as_ref() else {
            return Ok(RouteOutcome::Unrouted);
        };
        let Some((context, source)) = resolve_button_context(&action) else {
            log::warn!(
                "router: card action {} by {} has no resolvable context, skipped",
                action.meta.event_id.as_deref().unwrap_or("-"),
                action.operator_id.as_deref().unwrap_or("-")
            );
            return Ok(RouteOutcome::UnresolvableContext);
        };
        if source == ContextSource::PlatformCallback {
            log::debug!(
                "router: card action {} resolved from platform context; reply may land outside the original thread",
                action.meta.event_id.as_deref().unwrap_or("-")
            );
        }
        handler
            .on_button_followup(ButtonFollowup {
                conversation_id: context.conversation_id,
                thread_root_id: context.thread_root_id,
                clicked_value: context.clicked_value,
                operator_id: action.operator_id.unwrap_or_default(),
                action_tag: action.tag,
            })
            .await?;
        Ok(RouteOutcome::ButtonFollowup(source))
    }

    async fn route_task(&self, task: TaskEvent) -> Result<RouteOutcome, HandlerError> {
        let Some(handler) = self.handlers.tasks.as_ref() else {
            return Ok(RouteOutcome::Unrouted);
        };
        handler
            .on_task_changed(TaskChange {
                event_type: task.meta.event_type,
                task_id: task.task_id,
                payload: task.payload,
            })
            .await?;
        Ok(RouteOutcome::TaskChanged)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ingest::DedupSettings;
    use crate::routing::participation::ParticipationStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const NOW: i64 = 1_700_000_000_000;
    const BOT: &str = "ou_bot";

    /// Records every handoff as `(route, conversation, thread root, text-or-value)`.
    struct Recorder {
        tx: mpsc::UnboundedSender<(String, String, String, String)>,
        fail: bool,
    }

    impl Recorder {
        fn send(&self, route: &str, conv: &str, root: &str, text: &str) -> Result<(), HandlerError> {
            let _ = self
                .tx
                .send((route.into(), conv.into(), root.into(), text.into()));
            if self.fail {
                Err(HandlerError::Other("boom".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn on_direct_message(&self, m: MessageHandoff) -> Result<(), HandlerError> {
            self.send("dm", &m.conversation_id, &m.thread_root_id, &m.text)
        }
        async fn on_group_mention(&self, m: MessageHandoff) -> Result<(), HandlerError> {
            self.send("mention", &m.conversation_id, &m.thread_root_id, &m.text)
        }
        async fn on_thread_reply(&self, m: MessageHandoff) -> Result<(), HandlerError> {
            self.send("thread", &m.conversation_id, &m.thread_root_id, &m.text)
        }
    }

    #[async_trait]
    impl CardActionHandler for Recorder {
        async fn on_button_followup(&self, f: ButtonFollowup) -> Result<(), HandlerError> {
            self.send("button", &f.conversation_id, &f.thread_root_id, &f.clicked_value)
        }
    }

    struct Panicker;

    #[async_trait]
    impl TaskHandler for Panicker {
        async fn on_task_changed(&self, _change: TaskChange) -> Result<(), HandlerError> {
            panic!("task handler exploded");
        }
    }

    fn router(
        fail: bool,
    ) -> (
        Arc<EventRouter>,
        Arc<ManualClock>,
        Arc<ParticipationStore>,
        mpsc::UnboundedReceiver<(String, String, String, String)>,
    ) {
        let clock = Arc::new(ManualClock::new(NOW));
        let (tx, rx) = mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder { tx, fail });
        let store = Arc::new(ParticipationStore::new(64));
        let classifier = MessageClassifier::new(Some(BOT.into()), vec!["/new".into()], store.clone());
        let dedup = Arc::new(DedupCache::new(DedupSettings::default(), clock.clone()));
        let handlers = HandlerRegistry::new()
            .with_messages(recorder.clone())
            .with_card_actions(recorder)
            .with_tasks(Arc::new(Panicker));
        let router = EventRouter::new(
            clock.clone(),
            AdmissionPolicy::default(),
            dedup,
            classifier,
            handlers,
        );
        (Arc::new(router), clock, store, rx)
    }

    fn dm(event_id: &str, message_id: &str, ts: i64) -> Value {
        json!({
            "header": { "event_id": event_id, "event_type": "im.message.receive_v1", "create_time": ts.to_string() },
            "event": {
                "sender": { "sender_id": { "open_id": "ou_alice" }, "sender_type": "user" },
                "message": {
                    "message_id": message_id, "chat_id": "oc_dm", "chat_type": "p2p",
                    "message_type": "text", "content": "{\"text\":\"hi\"}"
                }
            }
        })
    }

    async fn next(
        rx: &mut mpsc::UnboundedReceiver<(String, String, String, String)>,
    ) -> (String, String, String, String) {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("handoff within 2s")
            .expect("recorder channel open")
    }

    #[tokio::test]
    async fn redelivery_with_new_event_id_reaches_handler_once() {
        let (router, _clock, _store, mut rx) = router(false);
        let first = router.dispatch(&dm("ev-1", "om_1", NOW));
        assert_eq!(
            first,
            DispatchOutcome::Dispatched {
                kind: EventKind::MessageReceived,
                key: "msg:om_1".into()
            }
        );
        assert_eq!(
            router.dispatch(&dm("ev-2", "om_1", NOW)),
            DispatchOutcome::Duplicate {
                key: "msg:om_1".into()
            }
        );
        let (route, conv, root, text) = next(&mut rx).await;
        assert_eq!((route.as_str(), conv.as_str(), root.as_str(), text.as_str()), ("dm", "oc_dm", "om_1", "hi"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stale_and_undated_events_are_rejected_before_dedup() {
        let (router, _clock, _store, _rx) = router(false);
        let stale = router.dispatch(&dm("ev-1", "om_1", NOW - 301_000));
        assert!(matches!(stale, DispatchOutcome::Rejected(Admission::RejectStale { .. })));
        let mut undated = dm("ev-2", "om_2", NOW);
        undated["header"]["create_time"] = Value::Null;
        assert_eq!(
            router.dispatch(&undated),
            DispatchOutcome::Rejected(Admission::RejectUnknown)
        );
        assert!(router.dedup().is_empty());
    }

    #[tokio::test]
    async fn unidentifiable_card_action_is_dropped() {
        let (router, _clock, _store, _rx) = router(false);
        let raw = json!({
            "header": { "event_type": "card.action.trigger", "create_time": NOW },
            "event": { "action": { "value": { "ctx": "oc|om" } } }
        });
        assert_eq!(
            router.dispatch(&raw),
            DispatchOutcome::Unidentifiable {
                kind: EventKind::CardActionTriggered
            }
        );
    }

    #[tokio::test]
    async fn unknown_kind_is_unrouted() {
        let (router, _clock, _store, _rx) = router(false);
        let raw = json!({ "header": { "event_id": "ev-9", "event_type": "drive.file.edit_v1", "create_time": NOW } });
        assert_eq!(
            router.dispatch(&raw),
            DispatchOutcome::Unrouted {
                kind: EventKind::Unknown
            }
        );
    }

    #[tokio::test]
    async fn button_click_uses_embedded_context() {
        let (router, _clock, _store, mut rx) = router(false);
        let raw = json!({
            "header": { "event_id": "ev-c", "event_type": "card.action.trigger", "create_time": NOW },
            "event": {
                "operator": { "open_id": "ou_op" },
                "token": "tok-1",
                "action": { "value": { "ctx": "oc_team|om_root", "action": "approve" } },
                "context": { "open_chat_id": "oc_team", "open_message_id": "om_card" }
            }
        });
        router.dispatch(&raw);
        let (route, conv, root, value) = next(&mut rx).await;
        assert_eq!(route, "button");
        assert_eq!(conv, "oc_team");
        assert_eq!(root, "om_root");
        assert_eq!(value, "approve");
    }

    #[tokio::test]
    async fn mention_marks_thread_so_later_replies_route() {
        let (router, _clock, store, mut rx) = router(false);
        let mention = json!({
            "header": { "event_id": "ev-m", "event_type": "im.message.receive_v1", "create_time": NOW },
            "event": {
                "sender": { "sender_id": { "open_id": "ou_alice" }, "sender_type": "user" },
                "message": {
                    "message_id": "om_root", "chat_id": "oc_team", "chat_type": "group",
                    "content": "{\"text\":\"@_user_1 help\"}",
                    "mentions": [{ "key": "@_user_1", "id": { "open_id": BOT }, "name": "Hark" }]
                }
            }
        });
        router.dispatch(&mention);
        let (route, _, root, text) = next(&mut rx).await;
        assert_eq!(route, "mention");
        assert_eq!(root, "om_root");
        assert_eq!(text, "<at user_id=\"ou_bot\">Hark</at> help");
        assert!(store.contains(&ThreadKey::new("oc_team", "om_root")).await);

        let reply = json!({
            "header": { "event_id": "ev-r", "event_type": "im.message.receive_v1", "create_time": NOW },
            "event": {
                "sender": { "sender_id": { "open_id": "ou_bob" }, "sender_type": "user" },
                "message": {
                    "message_id": "om_reply", "root_id": "om_root", "chat_id": "oc_team",
                    "chat_type": "group", "content": "{\"text\":\"me too\"}", "mentions": []
                }
            }
        });
        router.dispatch(&reply);
        let (route, _, root, _) = next(&mut rx).await;
        assert_eq!(route, "thread");
        assert_eq!(root, "om_root");
    }

    #[tokio::test]
    async fn handler_error_and_panic_stay_inside_the_task() {
        let (router, _clock, _store, mut rx) = router(true);
        assert!(matches!(
            router.dispatch(&dm("ev-1", "om_1", NOW)),
            DispatchOutcome::Dispatched { .. }
        ));
        next(&mut rx).await;

        let task = json!({
            "header": { "event_id": "ev-t", "event_type": "task.task.updated_v1", "create_time": NOW },
            "event": { "task_id": "t-1" }
        });
        assert!(matches!(router.dispatch(&task), DispatchOutcome::Dispatched { .. }));
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The router keeps working after both failures.
        assert!(matches!(
            router.dispatch(&dm("ev-2", "om_2", NOW)),
            DispatchOutcome::Dispatched { .. }
        ));
        next(&mut rx).await;
    }

    /// Keeps whole handoffs for field-level assertions.
    struct Capture {
        tx: mpsc::UnboundedSender<Value>,
    }

    #[async_trait]
    impl MessageHandler for Capture {
        async fn on_direct_message(&self, m: MessageHandoff) -> Result<(), HandlerError> {
            let _ = self.tx.send(serde_json::to_value(m).unwrap());
            Ok(())
        }
        async fn on_group_mention(&self, m: MessageHandoff) -> Result<(), HandlerError> {
            let _ = self.tx.send(serde_json::to_value(m).unwrap());
            Ok(())
        }
        async fn on_thread_reply(&self, m: MessageHandoff) -> Result<(), HandlerError> {
            let _ = self.tx.send(serde_json::to_value(m).unwrap());
            Ok(())
        }
    }

    #[async_trait]
    impl CardActionHandler for Capture {
        async fn on_button_followup(&self, f: ButtonFollowup) -> Result<(), HandlerError> {
            let _ = self.tx.send(serde_json::to_value(f).unwrap());
            Ok(())
        }
    }

    #[tokio::test]
    async fn handoffs_carry_reply_parent_message_type_and_action_tag() {
        let clock = Arc::new(ManualClock::new(NOW));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let capture = Arc::new(Capture { tx });
        let classifier = MessageClassifier::new(
            Some(BOT.into()),
            Vec::new(),
            Arc::new(ParticipationStore::new(8)),
        );
        let router = EventRouter::new(
            clock.clone(),
            AdmissionPolicy::default(),
            Arc::new(DedupCache::new(DedupSettings::default(), clock)),
            classifier,
            HandlerRegistry::new()
                .with_messages(capture.clone())
                .with_card_actions(capture),
        );

        let reply = InboundEvent::from_envelope(&json!({
            "header": { "event_id": "ev-p", "event_type": "im.message.receive_v1", "create_time": NOW },
            "event": {
                "sender": { "sender_id": { "open_id": "ou_alice" }, "sender_type": "user" },
                "message": {
                    "message_id": "om_2", "root_id": "om_root", "parent_id": "om_1",
                    "chat_id": "oc_dm", "chat_type": "p2p", "message_type": "post",
                    "content": "{\"text\":\"see above\"}"
                }
            }
        }));
        assert_eq!(router.route(reply).await.unwrap(), RouteOutcome::DirectMessage);
        let handoff = rx.try_recv().unwrap();
        assert_eq!(handoff["threadRootId"], "om_root");
        assert_eq!(handoff["parentId"], "om_1");
        assert_eq!(handoff["messageType"], "post");

        let click = InboundEvent::from_envelope(&json!({
            "header": { "event_id": "ev-s", "event_type": "card.action.trigger", "create_time": NOW },
            "event": {
                "operator": { "open_id": "ou_op" },
                "token": "tok-2",
                "action": { "tag": "select_static", "option": "blue", "value": { "ctx": "oc_team|om_root" } }
            }
        }));
        assert!(matches!(
            router.route(click).await.unwrap(),
            RouteOutcome::ButtonFollowup(_)
        ));
        let followup = rx.try_recv().unwrap();
        assert_eq!(followup["actionTag"], "select_static");
        assert_eq!(followup["conversationId"], "oc_team");
    }

    #[tokio::test]
    async fn route_reports_unresolvable_context() {
        let (router, _clock, _store, _rx) = router(false);
        let event = InboundEvent::from_envelope(&json!({
            "header": { "event_id": "ev-u", "event_type": "card.action.trigger", "create_time": NOW },
            "event": { "operator": { "open_id": "ou_op" }, "token": "t", "action": { "value": {} } }
        }));
        assert_eq!(
            router.route(event).await.unwrap(),
            RouteOutcome::UnresolvableContext
        );
    }

    #[test]
    fn dispatch_outside_runtime_keeps_the_key_for_redelivery() {
        let (router, _clock, _store, mut rx) = router(false);
        assert_eq!(
            router.dispatch(&dm("ev-1", "om_1", NOW)),
            DispatchOutcome::NoRuntime {
                kind: EventKind::MessageReceived
            }
        );
        assert!(router.dedup().is_empty());

        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            assert!(matches!(
                router.dispatch(&dm("ev-2", "om_1", NOW)),
                DispatchOutcome::Dispatched { .. }
            ));
            let (route, _, root, _) = next(&mut rx).await;
            assert_eq!(route, "dm");
            assert_eq!(root, "om_1");
        });
    }
}
