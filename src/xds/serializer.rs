//! Work serializer: a serial job queue backing all cache mutations,
//! subscription-set updates, validator invocations, watcher notifications,
//! and timer callbacks for one logical group (one per client, one per
//! dependency manager).
//!
//! Jobs are synchronous closures executed in post order by a single drain
//! task. `post` enqueues and returns immediately; callers never observe
//! their job running inline. Jobs must not block.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Cloneable handle to a serial job queue.
#[derive(Clone)]
pub(crate) struct WorkSerializer {
    tx: mpsc::UnboundedSender<Job>,
    closed: Arc<AtomicBool>,
}

impl WorkSerializer {
    /// Spawn the drain task and return a handle to it.
    pub fn new(label: &'static str) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let closed = Arc::new(AtomicBool::new(false));
        let closed_for_task = closed.clone();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if closed_for_task.load(Ordering::Acquire) {
                    // Shutdown: drop remaining jobs without running them.
                    continue;
                }
                job();
            }
            debug!(serializer = label, "work serializer drained");
        });
        Self { tx, closed }
    }

    /// Enqueue a job. Never blocks. Jobs posted after `close` are dropped.
    pub fn post<F: FnOnce() + Send + 'static>(&self, job: F) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        // The receiver lives until every sender is dropped, so this only
        // fails during runtime teardown.
        let _ = self.tx.send(Box::new(job));
    }

    /// Stop executing jobs. Already-queued and future jobs are discarded;
    /// the job currently running (if any) completes.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn jobs_run_in_post_order() {
        let serializer = WorkSerializer::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let seen = seen.clone();
            serializer.post(move || seen.lock().unwrap().push(i));
        }
        let (tx, rx) = tokio::sync::oneshot::channel();
        serializer.post(move || {
            let _ = tx.send(());
        });
        rx.await.unwrap();
        assert_eq!(*seen.lock().unwrap(), (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn close_discards_pending_jobs() {
        let serializer = WorkSerializer::new("test");
        let ran = Arc::new(AtomicBool::new(false));
        serializer.close();
        let ran_clone = ran.clone();
        serializer.post(move || ran_clone.store(true, Ordering::SeqCst));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!ran.load(Ordering::SeqCst));
    }
}
