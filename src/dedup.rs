use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use tracing::debug;

use crate::{LocalId, ServerMessageId, SyncConfig, UnixTimeMs};

/// A message identifier as observed by either delivery path: the client's
/// own `local_id` for messages it sent, or the server-assigned id for
/// inbound ones.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DeliveryKey {
    Local(LocalId),
    Server(ServerMessageId),
}

/// Bounded set of recently observed message identifiers, shared by the
/// foreground receive path and the background push bridge so the same
/// message is never rendered or notified twice. Purely a de-dup window,
/// not a message store: entries age out after the retention period and the
/// LRU bound caps memory.
pub struct DeliveryRecord {
    seen: Mutex<LruCache<DeliveryKey, UnixTimeMs>>,
    retention_ms: u64,
}

impl DeliveryRecord {
    #[must_use]
    pub fn new(config: &SyncConfig) -> Self {
        let capacity =
            NonZeroUsize::new(config.dedup_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: Mutex::new(LruCache::new(capacity)),
            retention_ms: config.dedup_retention_ms,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<DeliveryKey, UnixTimeMs>> {
        match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Atomic check-then-insert: returns `true` when the key was novel (the
    /// caller observed this message first and should render/notify), `false`
    /// when another path already did.
    pub fn add_if_absent(&self, key: DeliveryKey, now: UnixTimeMs) -> bool {
        let mut seen = self.lock();
        match seen.get(&key) {
            Some(&seen_at) if now.elapsed_since(seen_at) < self.retention_ms => false,
            _ => {
                debug!(?key, "recording first observation");
                seen.put(key, now);
                true
            }
        }
    }

    #[must_use]
    pub fn contains(&self, key: &DeliveryKey, now: UnixTimeMs) -> bool {
        let seen = self.lock();
        seen.peek(key)
            .is_some_and(|&seen_at| now.elapsed_since(seen_at) < self.retention_ms)
    }
}
