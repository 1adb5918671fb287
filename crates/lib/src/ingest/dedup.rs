//! Time-windowed, size-bounded deduplication cache keyed by platform delivery identity.
//!
//! First sight of a key wins: `check_and_record` is a single check-and-insert under one
//! lock, so two concurrent deliveries of the same key can never both observe "absent".
//! Expired entries are swept lazily, at most once per cleanup interval, unless the
//! cache is at its hard cap, in which case the sweep runs immediately and the oldest
//! entries are dropped if the sweep alone does not make room.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::clock::Clock;
use crate::config::IngestConfig;
use crate::event::InboundEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupSettings {
    pub ttl_ms: i64,
    pub cleanup_interval_ms: i64,
    pub max_entries: usize,
}

impl DedupSettings {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            ttl_ms: secs_to_ms(config.dedup_ttl_secs),
            cleanup_interval_ms: secs_to_ms(config.dedup_cleanup_interval_secs),
            max_entries: config.dedup_max_entries.max(1),
        }
    }
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self::from_config(&IngestConfig::default())
    }
}

#[derive(Default)]
struct DedupState {
    /// key -> first-seen time of the live entry.
    entries: HashMap<String, i64>,
    /// Insertion order; may hold superseded records for keys re-inserted after expiry.
    order: VecDeque<(String, i64)>,
    last_cleanup_ms: i64,
}

impl DedupState {
    fn is_live(seen_at_ms: i64, now_ms: i64, ttl_ms: i64) -> bool {
        now_ms.saturating_sub(seen_at_ms) <= ttl_ms
    }

    fn pop_front(&mut self) -> bool {
        let Some((key, seen_at)) = self.order.pop_front() else {
            return false;
        };
        if self.entries.get(&key) == Some(&seen_at) {
            self.entries.remove(&key);
        }
        true
    }

    fn evict_expired(&mut self, now_ms: i64, ttl_ms: i64) -> usize {
        let before = self.entries.len();
        while let Some((_, seen_at)) = self.order.front() {
            if Self::is_live(*seen_at, now_ms, ttl_ms) {
                break;
            }
            self.pop_front();
        }
        before - self.entries.len()
    }

    fn evict_oldest_until_below(&mut self, max_entries: usize) -> usize {
        let before = self.entries.len();
        while self.entries.len() >= max_entries {
            if !self.pop_front() {
                break;
            }
        }
        before - self.entries.len()
    }
}

pub struct DedupCache {
    settings: DedupSettings,
    clock: Arc<dyn Clock>,
    state: Mutex<DedupState>,
}

impl DedupCache {
    pub fn new(settings: DedupSettings, clock: Arc<dyn Clock>) -> Self {
        let state = DedupState {
            last_cleanup_ms: clock.now_ms(),
            ..DedupState::default()
        };
        Self {
            settings,
            clock,
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DedupState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// True if `key` has a live entry.
    pub fn seen(&self, key: &str) -> bool {
        let now = self.clock.now_ms();
        self.lock()
            .entries
            .get(key)
            .is_some_and(|seen_at| DedupState::is_live(*seen_at, now, self.settings.ttl_ms))
    }

    /// Insert `key` with the current time if it has no live entry. Never overwrites a live entry.
    pub fn record(&self, key: &str) {
        self.check_and_record(key);
    }

    /// Atomically record `key`. Returns true on first sight (caller should process the
    /// event), false if a live entry already exists (duplicate delivery).
    pub fn check_and_record(&self, key: &str) -> bool {
        let now = self.clock.now_ms();
        let settings = self.settings;
        let mut state = self.lock();

        let at_cap = state.entries.len() >= settings.max_entries;
        if at_cap || now.saturating_sub(state.last_cleanup_ms) >= settings.cleanup_interval_ms {
            let evicted = state.evict_expired(now, settings.ttl_ms);
            state.last_cleanup_ms = now;
            if evicted > 0 {
                log::debug!("ingest: dedup sweep evicted {} expired key(s)", evicted);
            }
        }

        if let Some(seen_at) = state.entries.get(key) {
            if DedupState::is_live(*seen_at, now, settings.ttl_ms) {
                return false;
            }
            state.entries.remove(key);
        }

        let dropped = state.evict_oldest_until_below(settings.max_entries);
        if dropped > 0 {
            log::warn!(
                "ingest: dedup cache at capacity ({}), dropped {} oldest live key(s)",
                settings.max_entries,
                dropped
            );
        }
        state.entries.insert(key.to_string(), now);
        state.order.push_back((key.to_string(), now));
        true
    }

    /// Number of entries currently held (live or awaiting lazy eviction).
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn settings(&self) -> DedupSettings {
        self.settings
    }
}

/// Derive the delivery-identity key for an event. `None` means the event cannot be
/// deduplicated and must be rejected.
///
/// Messages prefer the message id (stable across redelivery) over the per-delivery
/// event id. Card actions prefer the action token, then action time plus operator.
pub fn dedup_key(event: &InboundEvent) -> Option<String> {
    let event_id = event.meta().event_id.as_deref();
    match event {
        InboundEvent::MessageReceived(m) => m
            .message_id
            .as_deref()
            .map(|id| format!("msg:{}", id))
            .or_else(|| event_id.map(|id| format!("evt:{}", id))),
        InboundEvent::CardActionTriggered(c) => {
            if let Some(token) = c.token.as_deref() {
                return Some(format!("card:token:{}", token));
            }
            match (c.meta.occurred_at_ms, c.operator_id.as_deref()) {
                (Some(ts), Some(operator)) => Some(format!("card:{}:{}", ts, operator)),
                _ => None,
            }
        }
        InboundEvent::TaskLifecycleChanged(_) => event_id.map(|id| format!("task:{}", id)),
        InboundEvent::Unknown(_) => event_id.map(|id| format!("evt:{}", id)),
    }
}

fn secs_to_ms(secs: u64) -> i64 {
    i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::event::{CardActionEvent, ChatType, EventMeta, MessageEvent};
    use serde_json::Value;

    const T0: i64 = 1_700_000_000_000;

    fn cache(ttl_ms: i64, cleanup_interval_ms: i64, max_entries: usize) -> (Arc<ManualClock>, DedupCache) {
        let clock = Arc::new(ManualClock::new(T0));
        let cache = DedupCache::new(
            DedupSettings {
                ttl_ms,
                cleanup_interval_ms,
                max_entries,
            },
            clock.clone(),
        );
        (clock, cache)
    }

    fn meta(event_id: Option<&str>, ts: Option<i64>) -> EventMeta {
        EventMeta {
            event_id: event_id.map(String::from),
            event_type: String::new(),
            occurred_at_ms: ts,
        }
    }

    fn message(event_id: Option<&str>, message_id: Option<&str>) -> InboundEvent {
        InboundEvent::MessageReceived(MessageEvent {
            meta: meta(event_id, Some(T0)),
            conversation_id: Some("oc_1".into()),
            chat_type: ChatType::Group,
            message_id: message_id.map(String::from),
            root_id: None,
            parent_id: None,
            sender_id: Some("ou_a".into()),
            sender_type: Some("user".into()),
            message_type: Some("text".into()),
            text: String::new(),
            mentions: None,
        })
    }

    fn card(token: Option<&str>, operator: Option<&str>, ts: Option<i64>) -> InboundEvent {
        InboundEvent::CardActionTriggered(CardActionEvent {
            meta: meta(Some("ev-card"), ts),
            operator_id: operator.map(String::from),
            token: token.map(String::from),
            value: Value::Null,
            option: None,
            tag: None,
            context_chat_id: None,
            context_message_id: None,
        })
    }

    #[test]
    fn first_sight_wins_and_duplicates_are_dropped() {
        let (clock, cache) = cache(60_000, 1_000, 100);
        assert!(cache.check_and_record("msg:om_1"));
        clock.advance(10);
        assert!(!cache.check_and_record("msg:om_1"));
        assert!(cache.seen("msg:om_1"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn entry_expires_after_ttl_and_key_is_fresh_again() {
        let (clock, cache) = cache(60_000, 1_000, 100);
        assert!(cache.check_and_record("k"));
        clock.advance(60_000);
        assert!(cache.seen("k"));
        clock.advance(1);
        assert!(!cache.seen("k"));
        assert!(cache.check_and_record("k"));
        assert!(!cache.check_and_record("k"));
    }

    #[test]
    fn sweep_is_throttled_to_cleanup_interval() {
        let (clock, cache) = cache(1_000, 10_000, 100);
        cache.record("a");
        clock.advance(2_000);
        cache.record("b");
        // "a" is expired but the sweep has not run yet.
        assert_eq!(cache.len(), 2);
        assert!(!cache.seen("a"));
        clock.advance(8_000);
        cache.record("c");
        assert_eq!(cache.len(), 1);
        assert!(cache.seen("c"));
    }

    #[test]
    fn size_never_exceeds_cap_under_burst() {
        let (clock, cache) = cache(3_600_000, 3_600_000, 50);
        for i in 0..500 {
            assert!(cache.check_and_record(&format!("k{}", i)));
            assert!(cache.len() <= 50);
            clock.advance(1);
        }
        assert_eq!(cache.len(), 50);
        assert!(cache.seen("k499"));
        assert!(!cache.seen("k0"));
    }

    #[test]
    fn at_cap_expired_entries_are_swept_before_dropping_live_ones() {
        let (clock, cache) = cache(1_000, 3_600_000, 2);
        cache.record("old");
        clock.advance(500);
        cache.record("young");
        clock.advance(600);
        assert!(cache.check_and_record("new"));
        assert!(cache.seen("young"));
        assert!(cache.seen("new"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn concurrent_deliveries_admit_exactly_one() {
        let (_clock, cache) = cache(60_000, 1_000, 1_000);
        let cache = Arc::new(cache);
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || cache.check_and_record("msg:race"))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn message_key_prefers_message_id() {
        assert_eq!(
            dedup_key(&message(Some("ev-1"), Some("om_1"))).as_deref(),
            Some("msg:om_1")
        );
        assert_eq!(
            dedup_key(&message(Some("ev-1"), None)).as_deref(),
            Some("evt:ev-1")
        );
        assert_eq!(dedup_key(&message(None, None)), None);
    }

    #[test]
    fn card_key_prefers_token_then_time_and_operator() {
        assert_eq!(
            dedup_key(&card(Some("tok"), Some("ou_op"), Some(T0))).as_deref(),
            Some("card:token:tok")
        );
        assert_eq!(
            dedup_key(&card(None, Some("ou_op"), Some(T0))),
            Some(format!("card:{}:ou_op", T0))
        );
        assert_eq!(dedup_key(&card(None, None, Some(T0))), None);
        assert_eq!(dedup_key(&card(None, Some("ou_op"), None)), None);
    }
}
