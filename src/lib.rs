//! Offline-first message delivery core for a chat client: a durable outbox,
//! a debounced connectivity monitor, and a reconnection sync engine that
//! flushes queued messages in order without loss or duplication.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod bridge;
pub mod coordinator;
pub mod dedup;
pub mod engine;
pub mod network;
pub mod queue;
pub mod status;
pub mod storage;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

pub use bridge::{BackgroundDeliveryBridge, Notification, NotificationAction, Notifier};
pub use coordinator::{FlushState, SendOutcome, Sender, SyncCoordinator};
pub use dedup::{DeliveryKey, DeliveryRecord};
pub use engine::{EngineError, SyncEngine};
pub use network::{
    ConnectivitySnapshot, ConnectivityStatus, NetworkEvent, NetworkMonitor, ReachabilityProbe,
};
pub use queue::{
    AttachmentRef, MessagePayload, MessageState, Outbox, QueueError, QueuedMessage, SendFailure,
};
pub use status::{SyncActivity, SyncStatus, SyncStatusReporter};
pub use storage::{FileStorage, MemoryStorage, QueueStorage, StorageError};
#[cfg(feature = "sqlite")]
pub use storage::SqliteStorage;

pub const MAX_QUEUE_DEPTH: usize = 500;
pub const MAX_RETRY_ATTEMPTS: u32 = 5;
pub const BASE_RETRY_DELAY_MS: u64 = 1000;
pub const MAX_RETRY_DELAY_MS: u64 = 60_000;
pub const JITTER_MAX_MS: u64 = 1000;
pub const DEBOUNCE_PROBES: u32 = 2;
pub const PROBE_INTERVAL_MS: u64 = 5000;
pub const DEDUP_CAPACITY: usize = 1024;
pub const DEDUP_RETENTION_MS: u64 = 10 * 60 * 1000;
pub const MAX_STORE_BYTES: usize = 16 * 1024 * 1024;
pub const MAX_BODY_LENGTH: usize = 8192;

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
        pub struct $name(pub String);

        impl $name {
            #[must_use]
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(LocalId);
typed_id!(ServerMessageId);
typed_id!(ConversationId);

impl LocalId {
    /// Client-generated identifier, assigned once at enqueue time and never
    /// reused for the lifetime of the queue.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Unix timestamp in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    #[must_use]
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
        )
    }

    #[must_use]
    pub fn add_millis(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    #[must_use]
    pub fn elapsed_since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

/// Exponential retry delay: base doubled per attempt, capped, plus caller
/// supplied jitter.
#[must_use]
pub fn calculate_retry_delay(base_ms: u64, max_ms: u64, attempt: u32, jitter_ms: u64) -> u64 {
    let exponential = base_ms.saturating_mul(2u64.saturating_pow(attempt.min(16)));
    exponential.min(max_ms).saturating_add(jitter_ms)
}

#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

/// Engine-wide tuning knobs. Defaults match the `lib.rs` constants.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub max_queue_depth: usize,
    pub max_attempts: u32,
    pub base_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub jitter_max_ms: u64,
    /// Consecutive agreeing reachability readings required before a
    /// connectivity transition is published.
    pub debounce_probes: u32,
    pub probe_interval_ms: u64,
    pub dedup_capacity: usize,
    pub dedup_retention_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_queue_depth: MAX_QUEUE_DEPTH,
            max_attempts: MAX_RETRY_ATTEMPTS,
            base_retry_delay_ms: BASE_RETRY_DELAY_MS,
            max_retry_delay_ms: MAX_RETRY_DELAY_MS,
            jitter_max_ms: JITTER_MAX_MS,
            debounce_probes: DEBOUNCE_PROBES,
            probe_interval_ms: PROBE_INTERVAL_MS,
            dedup_capacity: DEDUP_CAPACITY,
            dedup_retention_ms: DEDUP_RETENTION_MS,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_queue_depth == 0 {
            return Err(ConfigError::Invalid("max_queue_depth must be > 0"));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be > 0"));
        }
        if self.base_retry_delay_ms == 0 {
            return Err(ConfigError::Invalid("base_retry_delay_ms must be > 0"));
        }
        if self.max_retry_delay_ms < self.base_retry_delay_ms {
            return Err(ConfigError::Invalid(
                "max_retry_delay_ms must be >= base_retry_delay_ms",
            ));
        }
        if self.debounce_probes == 0 {
            return Err(ConfigError::Invalid("debounce_probes must be > 0"));
        }
        if self.dedup_capacity == 0 {
            return Err(ConfigError::Invalid("dedup_capacity must be > 0"));
        }
        Ok(())
    }
}
