//! Thread relevance: which (conversation, thread root) pairs the bot has engaged in.
//!
//! The classifier consults a `ThreadRelevance` before routing a reply inside a thread.
//! `ParticipationStore` is the in-memory default; a deployment can plug in a
//! persistent lookup instead.

use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Key for one thread: conversation id + thread root message id.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct ThreadKey {
    pub conversation_id: String,
    pub thread_root_id: String,
}

impl ThreadKey {
    pub fn new(conversation_id: impl Into<String>, thread_root_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            thread_root_id: thread_root_id.into(),
        }
    }
}

#[async_trait]
pub trait ThreadRelevance: Send + Sync {
    /// True if the system previously participated in this thread.
    async fn is_participating(&self, key: &ThreadKey) -> bool;

    /// Called after a message in this thread was handed off. Default: no-op.
    async fn mark_participating(&self, _key: ThreadKey) {}
}

#[derive(Default)]
struct Participation {
    threads: HashSet<ThreadKey>,
    /// Insertion order for capacity eviction.
    order: VecDeque<ThreadKey>,
}

/// In-memory, bounded set of participated threads. Oldest threads are forgotten first.
pub struct ParticipationStore {
    inner: Arc<RwLock<Participation>>,
    capacity: usize,
}

impl Default for ParticipationStore {
    fn default() -> Self {
        Self::new(5_000)
    }
}

impl ParticipationStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Participation::default())),
            capacity: capacity.max(1),
        }
    }

    /// Record a thread. Returns false if it was already known.
    pub async fn insert(&self, key: ThreadKey) -> bool {
        let mut g = self.inner.write().await;
        if !g.threads.insert(key.clone()) {
            return false;
        }
        g.order.push_back(key);
        while g.threads.len() > self.capacity {
            let Some(oldest) = g.order.pop_front() else {
                break;
            };
            g.threads.remove(&oldest);
        }
        true
    }

    pub async fn contains(&self, key: &ThreadKey) -> bool {
        self.inner.read().await.threads.contains(key)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.threads.len()
    }
}

#[async_trait]
impl ThreadRelevance for ParticipationStore {
    async fn is_participating(&self, key: &ThreadKey) -> bool {
        self.contains(key).await
    }

    async fn mark_participating(&self, key: ThreadKey) {
        if self.insert(key.clone()).await {
            log::debug!(
                "router: now participating in thread {}/{}",
                key.conversation_id,
                key.thread_root_id
            );
        }
    }
}
