use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tracing::{debug, info};

use crate::SyncConfig;

const EVENT_CHANNEL_CAPACITY: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityStatus {
    Online,
    Offline,
}

impl ConnectivityStatus {
    #[must_use]
    pub const fn is_online(self) -> bool {
        matches!(self, Self::Online)
    }
}

/// Point-in-time connectivity read. The epoch increments on every
/// transition, letting a flush distinguish "my online period" from a stale
/// one after a flap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectivitySnapshot {
    pub status: ConnectivityStatus,
    pub epoch: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkEvent {
    Online { epoch: u64 },
    Offline { epoch: u64 },
}

/// Lightweight reachability check, injectable so tests can script flapping
/// connectivity deterministically.
#[async_trait::async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn check(&self) -> ConnectivityStatus;
}

#[derive(Default)]
struct Debounce {
    candidate: Option<ConnectivityStatus>,
    agreeing: u32,
}

/// Sole owner and writer of the process-wide connectivity state. Emits
/// exactly one event per real transition; readings that flap back before
/// the debounce window ends are absorbed.
pub struct NetworkMonitor {
    state_tx: watch::Sender<ConnectivitySnapshot>,
    event_tx: broadcast::Sender<NetworkEvent>,
    debounce: Mutex<Debounce>,
    debounce_probes: u32,
    probe_interval: Duration,
}

impl NetworkMonitor {
    /// Determine the initial state with a real probe; assuming `Online` at
    /// launch would make the coordinator attempt a doomed send immediately.
    pub async fn start<P: ReachabilityProbe>(probe: &P, config: &SyncConfig) -> Self {
        let initial = probe.check().await;
        info!(status = ?initial, "network monitor started");

        let (state_tx, _) = watch::channel(ConnectivitySnapshot {
            status: initial,
            epoch: 0,
        });
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            state_tx,
            event_tx,
            debounce: Mutex::new(Debounce::default()),
            debounce_probes: config.debounce_probes,
            probe_interval: Duration::from_millis(config.probe_interval_ms),
        }
    }

    #[must_use]
    pub fn current_state(&self) -> ConnectivitySnapshot {
        *self.state_tx.borrow()
    }

    #[must_use]
    pub fn watch(&self) -> watch::Receiver<ConnectivitySnapshot> {
        self.state_tx.subscribe()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.event_tx.subscribe()
    }

    /// Feed one reachability reading. A transition is published only after
    /// `debounce_probes` consecutive readings agree on the new state; a
    /// reading matching the published state resets the candidate.
    pub async fn observe(&self, raw: ConnectivityStatus) {
        let current = self.current_state();
        let mut debounce = self.debounce.lock().await;

        if raw == current.status {
            debounce.candidate = None;
            debounce.agreeing = 0;
            return;
        }

        match debounce.candidate {
            Some(candidate) if candidate == raw => debounce.agreeing += 1,
            _ => {
                debounce.candidate = Some(raw);
                debounce.agreeing = 1;
            }
        }

        if debounce.agreeing < self.debounce_probes {
            debug!(candidate = ?raw, agreeing = debounce.agreeing, "transition pending debounce");
            return;
        }

        debounce.candidate = None;
        debounce.agreeing = 0;

        let epoch = current.epoch + 1;
        self.state_tx.send_replace(ConnectivitySnapshot { status: raw, epoch });

        let event = match raw {
            ConnectivityStatus::Online => NetworkEvent::Online { epoch },
            ConnectivityStatus::Offline => NetworkEvent::Offline { epoch },
        };
        // No subscribers is fine; the snapshot is still current.
        let _ = self.event_tx.send(event);
        info!(status = ?raw, epoch, "connectivity transition");
    }

    /// Probe loop. Runs until the shutdown channel closes or signals.
    pub async fn run<P: ReachabilityProbe>(
        &self,
        probe: &P,
        mut shutdown: mpsc::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(self.probe_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let raw = probe.check().await;
                    self.observe(raw).await;
                }
                _ = shutdown.recv() => {
                    info!("network monitor shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;

    struct ScriptedProbe {
        readings: Mutex<VecDeque<ConnectivityStatus>>,
        fallback: ConnectivityStatus,
    }

    impl ScriptedProbe {
        fn new(
            readings: impl IntoIterator<Item = ConnectivityStatus>,
            fallback: ConnectivityStatus,
        ) -> Self {
            Self {
                readings: Mutex::new(readings.into_iter().collect()),
                fallback,
            }
        }
    }

    #[async_trait::async_trait]
    impl ReachabilityProbe for ScriptedProbe {
        async fn check(&self) -> ConnectivityStatus {
            self.readings
                .lock()
                .await
                .pop_front()
                .unwrap_or(self.fallback)
        }
    }

    fn config() -> SyncConfig {
        SyncConfig::default()
    }

    async fn offline_monitor() -> NetworkMonitor {
        let probe = ScriptedProbe::new([], ConnectivityStatus::Offline);
        NetworkMonitor::start(&probe, &config()).await
    }

    #[tokio::test]
    async fn initial_state_comes_from_probe() {
        let probe = ScriptedProbe::new([ConnectivityStatus::Offline], ConnectivityStatus::Online);
        let monitor = NetworkMonitor::start(&probe, &config()).await;

        let state = monitor.current_state();
        assert_eq!(state.status, ConnectivityStatus::Offline);
        assert_eq!(state.epoch, 0);
    }

    #[tokio::test]
    async fn transition_requires_stable_readings() {
        let monitor = offline_monitor().await;
        let mut events = monitor.subscribe();

        monitor.observe(ConnectivityStatus::Online).await;
        assert_eq!(monitor.current_state().status, ConnectivityStatus::Offline);
        assert!(events.try_recv().is_err());

        monitor.observe(ConnectivityStatus::Online).await;
        assert_eq!(monitor.current_state().status, ConnectivityStatus::Online);
        assert_eq!(events.try_recv().unwrap(), NetworkEvent::Online { epoch: 1 });
    }

    #[tokio::test]
    async fn flapping_readings_produce_no_event() {
        let monitor = offline_monitor().await;
        let mut events = monitor.subscribe();

        for _ in 0..4 {
            monitor.observe(ConnectivityStatus::Online).await;
            monitor.observe(ConnectivityStatus::Offline).await;
        }

        assert_eq!(monitor.current_state().status, ConnectivityStatus::Offline);
        assert_eq!(monitor.current_state().epoch, 0);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn exactly_one_event_per_transition() {
        let monitor = offline_monitor().await;
        let mut events = monitor.subscribe();

        for _ in 0..5 {
            monitor.observe(ConnectivityStatus::Online).await;
        }

        assert_eq!(events.try_recv().unwrap(), NetworkEvent::Online { epoch: 1 });
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn epoch_increments_on_every_transition() {
        let monitor = offline_monitor().await;
        let mut events = monitor.subscribe();

        monitor.observe(ConnectivityStatus::Online).await;
        monitor.observe(ConnectivityStatus::Online).await;
        monitor.observe(ConnectivityStatus::Offline).await;
        monitor.observe(ConnectivityStatus::Offline).await;
        monitor.observe(ConnectivityStatus::Online).await;
        monitor.observe(ConnectivityStatus::Online).await;

        assert_eq!(events.try_recv().unwrap(), NetworkEvent::Online { epoch: 1 });
        assert_eq!(events.try_recv().unwrap(), NetworkEvent::Offline { epoch: 2 });
        assert_eq!(events.try_recv().unwrap(), NetworkEvent::Online { epoch: 3 });
        assert_eq!(monitor.current_state().epoch, 3);
    }

    #[tokio::test]
    async fn probe_loop_publishes_transition() {
        let start_probe = ScriptedProbe::new([ConnectivityStatus::Offline], ConnectivityStatus::Online);
        let config = SyncConfig {
            probe_interval_ms: 1,
            ..SyncConfig::default()
        };
        let monitor = Arc::new(NetworkMonitor::start(&start_probe, &config).await);
        let mut events = monitor.subscribe();

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let loop_probe = ScriptedProbe::new([], ConnectivityStatus::Online);
        let run_monitor = Arc::clone(&monitor);
        let handle = tokio::spawn(async move {
            run_monitor.run(&loop_probe, shutdown_rx).await;
        });

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("probe loop should publish a transition")
            .unwrap();
        assert_eq!(event, NetworkEvent::Online { epoch: 1 });

        shutdown_tx.send(()).await.unwrap();
        handle.await.unwrap();
    }
}
