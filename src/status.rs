use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::coordinator::FlushState;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncActivity {
    Idle,
    Syncing,
    WaitingRetry,
}

/// User-visible sync snapshot: how many messages still await delivery, and
/// whether the engine is idle, actively flushing, or waiting out a retry
/// delay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub queued_count: usize,
    pub state: SyncActivity,
}

/// Pure derived view over the queue size and the coordinator machine. No
/// state of its own, no failure modes.
pub struct SyncStatusReporter {
    len_rx: watch::Receiver<usize>,
    machine_rx: watch::Receiver<FlushState>,
    tx: watch::Sender<SyncStatus>,
}

impl SyncStatusReporter {
    #[must_use]
    pub fn new(len_rx: watch::Receiver<usize>, machine_rx: watch::Receiver<FlushState>) -> Self {
        let initial = Self::derive(*len_rx.borrow(), *machine_rx.borrow());
        let (tx, _) = watch::channel(initial);
        Self {
            len_rx,
            machine_rx,
            tx,
        }
    }

    fn derive(queued_count: usize, machine: FlushState) -> SyncStatus {
        let state = match machine {
            FlushState::Idle => SyncActivity::Idle,
            FlushState::Flushing => SyncActivity::Syncing,
            FlushState::Backoff => SyncActivity::WaitingRetry,
        };
        SyncStatus {
            queued_count,
            state,
        }
    }

    /// Point-in-time read, always current even when the republishing loop
    /// is not running.
    #[must_use]
    pub fn status(&self) -> SyncStatus {
        Self::derive(*self.len_rx.borrow(), *self.machine_rx.borrow())
    }

    /// Subscription surface for the UI; snapshots are delivered whenever
    /// either input changes while [`Self::run`] is driving the channel.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    /// Republishing loop: recompute on every input change.
    pub async fn run(&self, mut shutdown: mpsc::Receiver<()>) {
        let mut len_rx = self.len_rx.clone();
        let mut machine_rx = self.machine_rx.clone();

        loop {
            tokio::select! {
                changed = len_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                changed = machine_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = shutdown.recv() => {
                    info!("status reporter shutting down");
                    break;
                }
            }
            self.tx
                .send_replace(Self::derive(*len_rx.borrow(), *machine_rx.borrow()));
        }
    }
}
