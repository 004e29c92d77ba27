use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, instrument, warn};

use crate::storage::{QueueStorage, StorageError};
use crate::{ConversationId, LocalId, SyncConfig, MAX_BODY_LENGTH};

/// Reference to an attachment blob staged elsewhere; message payloads never
/// inline attachment bytes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AttachmentRef {
    pub blob_id: String,
    pub size_bytes: u64,
}

/// Conversation-specific content of an outbound message. Opaque to the
/// queue and coordinator; only the transport interprets it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MessagePayload {
    pub conversation_id: ConversationId,
    pub body: String,
    pub attachment: Option<AttachmentRef>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    Pending,
    Sending,
    Sent,
    Failed,
}

impl MessageState {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

/// Outcome record of a failed send attempt. `permanent` marks the message
/// terminally failed: rejected content, or the retry ceiling was reached.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SendFailure {
    pub code: String,
    pub message: Option<String>,
    pub permanent: bool,
}

impl SendFailure {
    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: None,
            permanent: false,
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::new("NETWORK_ERROR").with_message(message)
    }

    #[must_use]
    pub fn timeout() -> Self {
        Self::new("TIMEOUT")
    }

    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        let mut failure = Self::new("REJECTED").with_message(reason);
        failure.permanent = true;
        failure
    }
}

/// A message not yet confirmed delivered.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct QueuedMessage {
    pub local_id: LocalId,
    pub payload: MessagePayload,
    /// Monotonic logical enqueue sequence; establishes total send order.
    /// Not a wall clock.
    pub seq: u64,
    pub attempts: u32,
    pub state: MessageState,
    pub last_error: Option<SendFailure>,
}

impl QueuedMessage {
    #[must_use]
    pub fn is_permanently_failed(&self) -> bool {
        self.state == MessageState::Failed
            && self.last_error.as_ref().is_some_and(|e| e.permanent)
    }

    /// Still awaiting delivery: pending, or failed with retries remaining.
    #[must_use]
    pub fn is_sendable(&self) -> bool {
        match self.state {
            MessageState::Pending => true,
            MessageState::Failed => !self.is_permanently_failed(),
            MessageState::Sending | MessageState::Sent => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("outbox is full (maximum {max} messages)")]
    CapacityExceeded { max: usize },

    #[error("duplicate local id: {0}")]
    DuplicateLocalId(String),

    #[error("message not found: {0}")]
    NotFound(String),

    #[error("invalid state transition from {from:?} to {to}: {reason}")]
    InvalidStateTransition {
        from: MessageState,
        to: &'static str,
        reason: &'static str,
    },

    #[error("message body exceeds {max} bytes")]
    BodyTooLarge { max: usize },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

struct QueueState {
    by_seq: BTreeMap<u64, QueuedMessage>,
    seq_by_id: HashMap<String, u64>,
    next_seq: u64,
}

impl QueueState {
    fn get_by_id(&self, id: &LocalId) -> Option<&QueuedMessage> {
        self.seq_by_id
            .get(id.as_str())
            .and_then(|seq| self.by_seq.get(seq))
    }
}

/// Durable pending-message queue. Every mutation is persisted before it
/// returns; a crash mid-offline-period loses nothing. Reads never touch the
/// network and never fail due to connectivity.
pub struct Outbox<S: QueueStorage> {
    storage: Arc<S>,
    max_depth: usize,
    max_attempts: u32,
    state: RwLock<QueueState>,
    len_tx: watch::Sender<usize>,
}

impl<S: QueueStorage> Outbox<S> {
    /// Load the queue from storage. Messages left `Sending` by a crash or
    /// kill are conservatively reset to `Pending`; their outcome was never
    /// observed, and the transport is idempotent per `local_id`.
    #[instrument(skip(storage, config))]
    pub async fn open(storage: Arc<S>, config: &SyncConfig) -> Result<Self, QueueError> {
        let mut loaded = storage.load_all().await?;
        loaded.sort_by_key(|m| m.seq);

        let mut by_seq = BTreeMap::new();
        let mut seq_by_id = HashMap::new();
        let mut next_seq = 0u64;
        let mut reset = 0usize;

        for mut message in loaded {
            if message.state == MessageState::Sending {
                message.state = MessageState::Pending;
                storage.save(&message).await?;
                reset += 1;
            }
            next_seq = next_seq.max(message.seq.saturating_add(1));
            seq_by_id.insert(message.local_id.as_str().to_string(), message.seq);
            by_seq.insert(message.seq, message);
        }

        if reset > 0 {
            warn!(reset, "reset in-flight messages to pending after restart");
        }
        info!(count = by_seq.len(), "outbox loaded");

        let (len_tx, _) = watch::channel(by_seq.len());
        Ok(Self {
            storage,
            max_depth: config.max_queue_depth,
            max_attempts: config.max_attempts,
            state: RwLock::new(QueueState {
                by_seq,
                seq_by_id,
                next_seq,
            }),
            len_tx,
        })
    }

    /// Queue a message for delivery. Callable regardless of connectivity;
    /// returns as soon as the message is durable.
    #[instrument(skip(self, payload), fields(conversation = %payload.conversation_id))]
    pub async fn enqueue(&self, payload: MessagePayload) -> Result<LocalId, QueueError> {
        if payload.body.len() > MAX_BODY_LENGTH {
            return Err(QueueError::BodyTooLarge {
                max: MAX_BODY_LENGTH,
            });
        }

        let mut state = self.state.write().await;
        if state.by_seq.len() >= self.max_depth {
            return Err(QueueError::CapacityExceeded {
                max: self.max_depth,
            });
        }

        let local_id = LocalId::generate();
        if state.seq_by_id.contains_key(local_id.as_str()) {
            return Err(QueueError::DuplicateLocalId(local_id.0));
        }

        let seq = state.next_seq;
        let message = QueuedMessage {
            local_id: local_id.clone(),
            payload,
            seq,
            attempts: 0,
            state: MessageState::Pending,
            last_error: None,
        };

        // Memory first, then persist; roll back on storage failure so a
        // failed enqueue leaves no ghost entry.
        state.next_seq += 1;
        state
            .seq_by_id
            .insert(local_id.as_str().to_string(), seq);
        state.by_seq.insert(seq, message.clone());

        if let Err(e) = self.storage.save(&message).await {
            state.by_seq.remove(&seq);
            state.seq_by_id.remove(local_id.as_str());
            state.next_seq = seq;
            error!(error = %e, "failed to persist enqueued message");
            return Err(e.into());
        }

        self.len_tx.send_replace(state.by_seq.len());
        debug!(local_id = %local_id, seq, "message enqueued");
        Ok(local_id)
    }

    /// Oldest message still awaiting delivery: `Pending`, or `Failed` with
    /// retries remaining.
    pub async fn peek_oldest_pending(&self) -> Option<QueuedMessage> {
        self.next_eligible(None).await
    }

    /// Flush-cursor variant of [`Self::peek_oldest_pending`]: the oldest
    /// sendable message with `seq` strictly greater than `after_seq`, so a
    /// transiently failed message does not wedge the pass that skipped it.
    pub async fn next_eligible(&self, after_seq: Option<u64>) -> Option<QueuedMessage> {
        let state = self.state.read().await;
        let lower = after_seq.map_or(0, |s| s.saturating_add(1));
        state
            .by_seq
            .range(lower..)
            .map(|(_, m)| m)
            .find(|m| m.is_sendable())
            .cloned()
    }

    #[instrument(skip(self), fields(local_id = %local_id))]
    pub async fn mark_sending(&self, local_id: &LocalId) -> Result<(), QueueError> {
        let mut state = self.state.write().await;

        if let Some(in_flight) = state
            .by_seq
            .values()
            .find(|m| m.state == MessageState::Sending)
        {
            return Err(QueueError::InvalidStateTransition {
                from: in_flight.state,
                to: "sending",
                reason: "another message is already in flight",
            });
        }

        let seq = *state
            .seq_by_id
            .get(local_id.as_str())
            .ok_or_else(|| QueueError::NotFound(local_id.0.clone()))?;
        let message = state
            .by_seq
            .get_mut(&seq)
            .ok_or_else(|| QueueError::NotFound(local_id.0.clone()))?;

        if !message.is_sendable() {
            return Err(QueueError::InvalidStateTransition {
                from: message.state,
                to: "sending",
                reason: "message is not awaiting delivery",
            });
        }

        let previous = message.state;
        message.state = MessageState::Sending;
        let snapshot = message.clone();

        if let Err(e) = self.storage.save(&snapshot).await {
            if let Some(message) = state.by_seq.get_mut(&seq) {
                message.state = previous;
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Confirmed delivered: the message leaves the queue for good.
    #[instrument(skip(self), fields(local_id = %local_id))]
    pub async fn mark_sent(&self, local_id: &LocalId) -> Result<QueuedMessage, QueueError> {
        let mut state = self.state.write().await;

        let seq = *state
            .seq_by_id
            .get(local_id.as_str())
            .ok_or_else(|| QueueError::NotFound(local_id.0.clone()))?;
        let message = state
            .by_seq
            .get(&seq)
            .ok_or_else(|| QueueError::NotFound(local_id.0.clone()))?;

        if message.state != MessageState::Sending {
            return Err(QueueError::InvalidStateTransition {
                from: message.state,
                to: "sent",
                reason: "only an in-flight message can be confirmed",
            });
        }

        self.storage.remove(local_id).await?;
        let mut removed = state
            .by_seq
            .remove(&seq)
            .ok_or_else(|| QueueError::NotFound(local_id.0.clone()))?;
        state.seq_by_id.remove(local_id.as_str());
        removed.state = MessageState::Sent;

        self.len_tx.send_replace(state.by_seq.len());
        info!(seq, "message confirmed sent");
        Ok(removed)
    }

    /// Record a failed attempt. Marks the message permanently failed when
    /// the failure itself is permanent or the retry ceiling is reached.
    #[instrument(skip(self, failure), fields(local_id = %local_id, code = %failure.code))]
    pub async fn mark_failed(
        &self,
        local_id: &LocalId,
        mut failure: SendFailure,
    ) -> Result<QueuedMessage, QueueError> {
        let mut state = self.state.write().await;

        let seq = *state
            .seq_by_id
            .get(local_id.as_str())
            .ok_or_else(|| QueueError::NotFound(local_id.0.clone()))?;
        let message = state
            .by_seq
            .get_mut(&seq)
            .ok_or_else(|| QueueError::NotFound(local_id.0.clone()))?;

        if message.state != MessageState::Sending {
            return Err(QueueError::InvalidStateTransition {
                from: message.state,
                to: "failed",
                reason: "only an in-flight message can fail",
            });
        }

        let previous_state = message.state;
        let previous_attempts = message.attempts;
        let previous_error = message.last_error.clone();

        message.attempts = message.attempts.saturating_add(1);
        if message.attempts >= self.max_attempts {
            failure.permanent = true;
        }
        message.state = MessageState::Failed;
        message.last_error = Some(failure);
        let snapshot = message.clone();

        if let Err(e) = self.storage.save(&snapshot).await {
            if let Some(message) = state.by_seq.get_mut(&seq) {
                message.state = previous_state;
                message.attempts = previous_attempts;
                message.last_error = previous_error;
            }
            return Err(e.into());
        }

        if snapshot.is_permanently_failed() {
            warn!(seq, attempts = snapshot.attempts, "message permanently failed");
        }
        Ok(snapshot)
    }

    /// Offline reset rule: any message left `Sending` when connectivity
    /// drops has an unobserved outcome and must be retried, not assumed
    /// lost or delivered.
    #[instrument(skip(self))]
    pub async fn reset_in_flight(&self) -> Result<usize, QueueError> {
        let mut state = self.state.write().await;
        let seqs: Vec<u64> = state
            .by_seq
            .values()
            .filter(|m| m.state == MessageState::Sending)
            .map(|m| m.seq)
            .collect();

        for seq in &seqs {
            if let Some(message) = state.by_seq.get_mut(seq) {
                message.state = MessageState::Pending;
                let snapshot = message.clone();
                self.storage.save(&snapshot).await?;
            }
        }

        if !seqs.is_empty() {
            debug!(count = seqs.len(), "reset in-flight messages to pending");
        }
        Ok(seqs.len())
    }

    /// User-initiated retry of a failed message; clears its attempt history
    /// so the backoff schedule starts over.
    #[instrument(skip(self), fields(local_id = %local_id))]
    pub async fn retry_now(&self, local_id: &LocalId) -> Result<(), QueueError> {
        let mut state = self.state.write().await;

        let seq = *state
            .seq_by_id
            .get(local_id.as_str())
            .ok_or_else(|| QueueError::NotFound(local_id.0.clone()))?;
        let message = state
            .by_seq
            .get_mut(&seq)
            .ok_or_else(|| QueueError::NotFound(local_id.0.clone()))?;

        if message.state != MessageState::Failed {
            return Err(QueueError::InvalidStateTransition {
                from: message.state,
                to: "pending",
                reason: "only a failed message can be retried manually",
            });
        }

        message.state = MessageState::Pending;
        message.attempts = 0;
        message.last_error = None;
        let snapshot = message.clone();
        self.storage.save(&snapshot).await?;
        Ok(())
    }

    /// User-initiated removal of a queued or failed message. Refused while
    /// the message is in flight.
    #[instrument(skip(self), fields(local_id = %local_id))]
    pub async fn discard(&self, local_id: &LocalId) -> Result<QueuedMessage, QueueError> {
        let mut state = self.state.write().await;

        let seq = *state
            .seq_by_id
            .get(local_id.as_str())
            .ok_or_else(|| QueueError::NotFound(local_id.0.clone()))?;
        let message = state
            .by_seq
            .get(&seq)
            .ok_or_else(|| QueueError::NotFound(local_id.0.clone()))?;

        if message.state == MessageState::Sending {
            return Err(QueueError::InvalidStateTransition {
                from: message.state,
                to: "discarded",
                reason: "cannot discard an in-flight message",
            });
        }

        self.storage.remove(local_id).await?;
        let removed = state
            .by_seq
            .remove(&seq)
            .ok_or_else(|| QueueError::NotFound(local_id.0.clone()))?;
        state.seq_by_id.remove(local_id.as_str());

        self.len_tx.send_replace(state.by_seq.len());
        info!(seq, "message discarded");
        Ok(removed)
    }

    /// All queued messages, oldest first.
    pub async fn list(&self) -> Vec<QueuedMessage> {
        let state = self.state.read().await;
        state.by_seq.values().cloned().collect()
    }

    pub async fn get(&self, local_id: &LocalId) -> Option<QueuedMessage> {
        let state = self.state.read().await;
        state.get_by_id(local_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.by_seq.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.by_seq.is_empty()
    }

    /// Queue-size signal for the status reporter.
    #[must_use]
    pub fn watch_len(&self) -> watch::Receiver<usize> {
        self.len_tx.subscribe()
    }
}
