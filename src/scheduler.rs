use crate::batch::{BatchCoordinator, BatchState};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{info, warn};

/// Re-enter the state machine at `target` and drive it until quiescent.
pub struct StateEntry {
    pub ctx: Arc<BatchCoordinator>,
    pub target: BatchState,
}

/// Check whether the in-flight statement is now fully resolved, carrying
/// the resolving sub-client's result packets when there are any.
pub struct Resolution {
    pub ctx: Arc<BatchCoordinator>,
    pub packets: Option<VecDeque<Vec<u8>>>,
}

/// One unit of asynchronous coordinator work. Callbacks never run the
/// state machine on their own thread; they post one of these instead.
pub enum WorkItem {
    Enter(StateEntry),
    Resolve(Resolution),
}

impl WorkItem {
    pub fn run(self) {
        match self {
            WorkItem::Enter(StateEntry { ctx, target }) => {
                ctx.enter(target);
                ctx.drive();
            }
            WorkItem::Resolve(Resolution { ctx, packets }) => {
                if ctx.try_resolve(packets) {
                    ctx.drive();
                }
            }
        }
    }
}

impl From<StateEntry> for WorkItem {
    fn from(entry: StateEntry) -> Self {
        WorkItem::Enter(entry)
    }
}

impl From<Resolution> for WorkItem {
    fn from(resolution: Resolution) -> Self {
        WorkItem::Resolve(resolution)
    }
}

/// Scheduling collaborator boundary. Work items posted for the same
/// coordinator are expected to execute in post order; nothing is assumed
/// across different coordinators.
pub trait Scheduler: Send + Sync {
    fn post(&self, item: WorkItem);
}

/// Production scheduler: a bounded flume queue drained by a dedicated
/// runtime thread. One drain loop serializes all state advancement for
/// every coordinator posting to it.
pub struct QueuedScheduler {
    sender: flume::Sender<WorkItem>,
}

impl QueuedScheduler {
    pub fn start(capacity: usize) -> QueuedScheduler {
        let (sender, receiver) = flume::bounded::<WorkItem>(capacity);

        std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .build()
                .expect("Failed to create Tokio Runtime");

            rt.block_on(async move {
                info!("Starting");
                while let Ok(item) = receiver.recv_async().await {
                    item.run();
                }
                info!("All work queue handles have been dropped");
            });
        });

        QueuedScheduler { sender }
    }
}

impl Scheduler for QueuedScheduler {
    fn post(&self, item: WorkItem) {
        if self.sender.send(item).is_err() {
            warn!("Work queue receiver is gone, discarding work item");
        }
    }
}
