use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bridge::{
    BackgroundDeliveryBridge, MessageSummary, NotificationActionEvent, Notifier, OpenConversation,
};
use crate::coordinator::{Sender, SyncCoordinator};
use crate::dedup::DeliveryRecord;
use crate::network::{ConnectivitySnapshot, NetworkMonitor, ReachabilityProbe};
use crate::queue::{MessagePayload, Outbox, QueueError, QueuedMessage};
use crate::status::{SyncStatus, SyncStatusReporter};
use crate::storage::QueueStorage;
use crate::{ConfigError, LocalId, ServerMessageId, SyncConfig};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Wires the outbox, network monitor, coordinator, push bridge and status
/// reporter together and owns their background tasks. The send API returns
/// immediately regardless of connectivity; delivery happens whenever the
/// link allows.
pub struct SyncEngine<S, T, N>
where
    S: QueueStorage,
    T: Sender,
    N: Notifier,
{
    outbox: Arc<Outbox<S>>,
    monitor: Arc<NetworkMonitor>,
    coordinator: Arc<SyncCoordinator<S, T>>,
    bridge: BackgroundDeliveryBridge<N>,
    reporter: Arc<SyncStatusReporter>,
    shutdown_txs: Vec<mpsc::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<S, T, N> SyncEngine<S, T, N>
where
    S: QueueStorage + 'static,
    T: Sender + 'static,
    N: Notifier + 'static,
{
    /// Build the full stack and spawn its loops. The initial connectivity
    /// state comes from a real probe, never an assumption.
    pub async fn start<P: ReachabilityProbe + 'static>(
        storage: Arc<S>,
        sender: Arc<T>,
        notifier: Arc<N>,
        probe: Arc<P>,
        config: SyncConfig,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let outbox = Arc::new(Outbox::open(storage, &config).await?);
        let monitor = Arc::new(NetworkMonitor::start(probe.as_ref(), &config).await);
        let dedup = Arc::new(DeliveryRecord::new(&config));
        let coordinator = Arc::new(SyncCoordinator::new(
            Arc::clone(&outbox),
            Arc::clone(&monitor),
            sender,
            Arc::clone(&dedup),
            config,
        ));
        let bridge = BackgroundDeliveryBridge::new(dedup, notifier);
        let reporter = Arc::new(SyncStatusReporter::new(
            outbox.watch_len(),
            coordinator.watch_state(),
        ));

        let mut shutdown_txs = Vec::new();
        let mut tasks = Vec::new();

        let (tx, rx) = mpsc::channel(1);
        shutdown_txs.push(tx);
        let run_monitor = Arc::clone(&monitor);
        tasks.push(tokio::spawn(async move {
            run_monitor.run(probe.as_ref(), rx).await;
        }));

        let (tx, rx) = mpsc::channel(1);
        shutdown_txs.push(tx);
        let events = monitor.subscribe();
        let run_coordinator = Arc::clone(&coordinator);
        tasks.push(tokio::spawn(async move {
            run_coordinator.run(events, rx).await;
        }));

        let (tx, rx) = mpsc::channel(1);
        shutdown_txs.push(tx);
        let run_reporter = Arc::clone(&reporter);
        tasks.push(tokio::spawn(async move {
            run_reporter.run(rx).await;
        }));

        info!("sync engine started");
        Ok(Self {
            outbox,
            monitor,
            coordinator,
            bridge,
            reporter,
            shutdown_txs,
            tasks,
        })
    }

    /// Queue a message for delivery; durable before this returns. When
    /// connectivity already allows, a flush is nudged in the background so
    /// the message does not wait for the next online transition.
    pub async fn send(&self, payload: MessagePayload) -> Result<LocalId, QueueError> {
        let local_id = self.outbox.enqueue(payload).await?;
        let coordinator = Arc::clone(&self.coordinator);
        tokio::spawn(async move { coordinator.handle_online().await });
        Ok(local_id)
    }

    pub async fn queued(&self) -> Vec<QueuedMessage> {
        self.outbox.list().await
    }

    pub async fn discard(&self, local_id: &LocalId) -> Result<QueuedMessage, QueueError> {
        self.outbox.discard(local_id).await
    }

    pub async fn retry_now(&self, local_id: &LocalId) -> Result<(), QueueError> {
        self.outbox.retry_now(local_id).await
    }

    #[must_use]
    pub fn status(&self) -> SyncStatus {
        self.reporter.status()
    }

    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.reporter.subscribe()
    }

    #[must_use]
    pub fn connectivity(&self) -> ConnectivitySnapshot {
        self.monitor.current_state()
    }

    /// Foreground receive path: `true` means the message is novel and
    /// should be rendered.
    pub fn note_incoming(&self, server_id: ServerMessageId) -> bool {
        self.coordinator.note_incoming(server_id)
    }

    /// Background push path: `true` means a notification was requested.
    pub fn on_background_message(
        &self,
        server_id: ServerMessageId,
        summary: &MessageSummary,
    ) -> bool {
        self.bridge.on_background_message(server_id, summary)
    }

    #[must_use]
    pub fn handle_notification_action(
        &self,
        event: &NotificationActionEvent,
    ) -> Option<OpenConversation> {
        self.bridge.handle_action(event)
    }

    /// Stop the background loops and wait for them to finish.
    pub async fn shutdown(self) {
        for tx in &self.shutdown_txs {
            let _ = tx.send(()).await;
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "engine task ended abnormally");
            }
        }
        info!("sync engine stopped");
    }
}
