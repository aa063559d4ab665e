use pkg_types::deployment::WorkloadRef;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// A workload change delivered by the watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadEvent {
    Added(WorkloadRef),
    Updated(WorkloadRef),
    /// Deletions need no rebalancing; the variant exists so the watch can
    /// report them explicitly.
    Deleted(WorkloadRef),
}

/// Create a connected queue pair.
///
/// Workloads whose name is in `excluded` are dropped at enqueue time.
pub fn event_queue<I, S>(excluded: I) -> (EventQueue, EventReceiver)
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let queue = EventQueue {
        tx,
        excluded: Arc::new(excluded.into_iter().map(Into::into).collect()),
    };
    (queue, EventReceiver { rx })
}

/// Producer side of the workload event queue. Cheap to clone; every watch
/// callback may hold its own handle.
#[derive(Clone)]
pub struct EventQueue {
    tx: mpsc::UnboundedSender<WorkloadRef>,
    excluded: Arc<HashSet<String>>,
}

impl EventQueue {
    pub fn is_excluded(&self, name: &str) -> bool {
        self.excluded.contains(name)
    }

    /// Queue a workload for reconciliation without blocking.
    ///
    /// Returns false if the workload is excluded or the worker is gone.
    pub fn enqueue(&self, workload: WorkloadRef) -> bool {
        if self.is_excluded(&workload.name) {
            debug!("Skipping excluded workload {}", workload);
            return false;
        }
        match self.tx.send(workload) {
            Ok(()) => true,
            Err(mpsc::error::SendError(workload)) => {
                debug!("Event queue closed, dropping {}", workload);
                false
            }
        }
    }

    /// Route a watch event into the queue.
    pub fn dispatch(&self, event: WorkloadEvent) -> bool {
        match event {
            WorkloadEvent::Added(workload) | WorkloadEvent::Updated(workload) => {
                self.enqueue(workload)
            }
            WorkloadEvent::Deleted(workload) => {
                debug!("Workload {} deleted, nothing to rebalance", workload);
                false
            }
        }
    }
}

/// Consumer side of the workload event queue, owned by the single worker.
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<WorkloadRef>,
}

impl EventReceiver {
    /// Wait for the next workload in FIFO order.
    ///
    /// Returns `None` once every producer has been dropped and the queue is drained.
    pub async fn dequeue(&mut self) -> Option<WorkloadRef> {
        self.rx.recv().await
    }

    /// Number of events waiting.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
