use pkg_constants::state::DEPLOYMENTS_PREFIX;
use pkg_state::client::StateStore;
use pkg_state::watch::{EventType, WatchEvent};
use pkg_types::deployment::WorkloadRef;
use std::collections::BTreeSet;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::queue::{EventQueue, WorkloadEvent};

/// Create the initial-sync signal pair.
pub fn sync_channel() -> (SyncNotifier, SyncSignal) {
    let (tx, rx) = watch::channel(false);
    (SyncNotifier { tx }, SyncSignal { rx })
}

/// Raised by the watch once the initial listing has been delivered.
pub struct SyncNotifier {
    tx: watch::Sender<bool>,
}

impl SyncNotifier {
    pub fn mark_synced(&self) {
        self.tx.send_replace(true);
    }
}

/// Lets the worker block until the watch has completed its initial sync.
#[derive(Clone)]
pub struct SyncSignal {
    rx: watch::Receiver<bool>,
}

impl SyncSignal {
    pub fn is_synced(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait for the initial sync. Returns false if the watch went away first.
    pub async fn wait(&mut self) -> bool {
        self.rx.wait_for(|synced| *synced).await.is_ok()
    }
}

/// Watches Deployments in the state store and feeds the event queue.
///
/// On start it lists every Deployment and reports each as `Added`, then
/// raises the sync signal. Afterwards each registry write is reported as
/// `Added`, `Updated` or `Deleted`.
pub struct WorkloadInformer {
    store: StateStore,
    queue: EventQueue,
    notifier: SyncNotifier,
    known: BTreeSet<WorkloadRef>,
    last_seq: u64,
}

impl WorkloadInformer {
    pub fn new(store: StateStore, queue: EventQueue) -> (Self, SyncSignal) {
        let (notifier, signal) = sync_channel();
        let informer = Self {
            store,
            queue,
            notifier,
            known: BTreeSet::new(),
            last_seq: 0,
        };
        (informer, signal)
    }

    /// Start the watch loop as a background task.
    ///
    /// The task resolves to an error if the watch could not be established
    /// or recovered; the caller decides whether that is fatal.
    pub fn start(
        mut self,
        shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            info!("WorkloadInformer started (prefix={})", DEPLOYMENTS_PREFIX);
            let result = self.run(shutdown).await;
            if let Err(e) = &result {
                error!("WorkloadInformer stopped: {:#}", e);
            }
            result
        })
    }

    async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        // Subscribe before listing so nothing written in between is missed
        let mut events = self.store.event_log.subscribe();
        self.relist().await?;
        self.notifier.mark_synced();
        info!(
            "WorkloadInformer synced ({} workloads)",
            self.known.len()
        );

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                result = events.recv() => match result {
                    Ok(event) => self.observe(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("WorkloadInformer lagged by {} events, recovering", skipped);
                        self.recover().await?;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        info!("WorkloadInformer stopped");
        Ok(())
    }

    /// Turn one registry event into a workload event.
    fn observe(&mut self, event: WatchEvent) {
        // Replays after a lag may overlap with the live stream
        if event.seq <= self.last_seq {
            return;
        }
        self.last_seq = event.seq;

        let Some(workload) = event
            .key
            .strip_prefix(DEPLOYMENTS_PREFIX)
            .and_then(WorkloadRef::from_key_suffix)
        else {
            return;
        };

        let change = match event.event_type {
            EventType::Put if self.known.insert(workload.clone()) => WorkloadEvent::Added(workload),
            EventType::Put => WorkloadEvent::Updated(workload),
            EventType::Delete => {
                self.known.remove(&workload);
                WorkloadEvent::Deleted(workload)
            }
        };
        debug!("Workload event: {:?}", change);
        self.queue.dispatch(change);
    }

    /// Replay missed events from the log, or relist when they are gone.
    async fn recover(&mut self) -> anyhow::Result<()> {
        match self.store.event_log.events_since(self.last_seq).await {
            Some(missed) => {
                for event in missed {
                    self.observe(event);
                }
                Ok(())
            }
            None => self.relist().await,
        }
    }

    /// Reconcile `known` against a full listing of Deployments.
    async fn relist(&mut self) -> anyhow::Result<()> {
        self.last_seq = self.store.event_log.current_seq().await;
        let entries = self.store.list_prefix(DEPLOYMENTS_PREFIX).await?;
        let current: BTreeSet<WorkloadRef> = entries
            .iter()
            .filter_map(|(key, _)| {
                key.strip_prefix(DEPLOYMENTS_PREFIX)
                    .and_then(WorkloadRef::from_key_suffix)
            })
            .collect();

        for gone in self.known.difference(&current) {
            self.queue.dispatch(WorkloadEvent::Deleted(gone.clone()));
        }
        for workload in &current {
            let change = if self.known.contains(workload) {
                WorkloadEvent::Updated(workload.clone())
            } else {
                WorkloadEvent::Added(workload.clone())
            };
            self.queue.dispatch(change);
        }
        self.known = current;
        Ok(())
    }
}
