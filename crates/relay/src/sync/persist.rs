use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, warn};

use super::Fragment;
use crate::{history::HistoryStore, metrics};

enum WriteJob {
    Append { doc_id: String, fragment: Fragment },
    Flush(oneshot::Sender<()>),
}

/// Detached, bounded queue in front of the history store.
///
/// Enqueueing never waits on the store. Jobs run one at a time in the order
/// they were queued, so each document's durable list matches its buffer
/// order. A fragment that finds the queue full is dropped and counted as a
/// persistence failure; nothing is reported to the sender.
#[derive(Clone)]
pub struct HistoryWriter {
    jobs: mpsc::Sender<WriteJob>,
    failures: Arc<AtomicU64>,
}

impl HistoryWriter {
    pub fn spawn(store: HistoryStore, capacity: usize) -> (Self, JoinHandle<()>) {
        let (jobs, receiver) = mpsc::channel(capacity.max(1));
        let failures = Arc::new(AtomicU64::new(0));
        let worker = tokio::spawn(run_writer(store, receiver, Arc::clone(&failures)));
        (Self { jobs, failures }, worker)
    }

    pub fn enqueue(&self, doc_id: &str, fragment: Fragment) {
        let job = WriteJob::Append { doc_id: doc_id.to_string(), fragment };
        match self.jobs.try_send(job) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(doc_id = %doc_id, "history writer queue full, fragment not persisted");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(doc_id = %doc_id, "history writer stopped, fragment not persisted");
            }
        }
        self.failures.fetch_add(1, Ordering::SeqCst);
        metrics::record_persist_failure();
    }

    /// Resolves once every job queued before this call has been attempted.
    /// Waits for queue space; returns `false` if the worker is gone.
    pub async fn flush(&self) -> bool {
        let (done, wait) = oneshot::channel();
        if self.jobs.send(WriteJob::Flush(done)).await.is_err() {
            return false;
        }
        wait.await.is_ok()
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }
}

async fn run_writer(
    store: HistoryStore,
    mut jobs: mpsc::Receiver<WriteJob>,
    failures: Arc<AtomicU64>,
) {
    while let Some(job) = jobs.recv().await {
        match job {
            WriteJob::Append { doc_id, fragment } => {
                if let Err(error) = store.append(&doc_id, &fragment).await {
                    warn!(
                        doc_id = %doc_id,
                        bytes = fragment.len(),
                        error = %error,
                        "failed to persist update fragment"
                    );
                    failures.fetch_add(1, Ordering::SeqCst);
                    metrics::record_persist_failure();
                }
            }
            WriteJob::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("history writer stopped");
}
