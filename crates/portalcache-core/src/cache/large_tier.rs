//! Ordered access to the large-item tier.
//!
//! Every write, delete and clear goes through one queue drained by a single
//! worker task, so two operations on the same key land in the order they were
//! issued. Keys whose large copy has been replaced by a newer small write (or
//! removed) are tracked as superseded until the queued delete completes, and
//! reads treat them as misses in the meantime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::storage::LargeItemStore;

pub(crate) enum LargeOp {
    Put { key: String, raw: String },
    /// `generation` is set when the delete retires a superseded marker
    Delete { key: String, generation: Option<u64> },
    ClearPrefix { prefix: String },
    Clear,
}

struct Job {
    op: LargeOp,
    done: Option<oneshot::Sender<usize>>,
}

/// Keys whose large copy is stale, with the generation that marked them.
#[derive(Default)]
struct Superseded {
    keys: Mutex<HashMap<String, u64>>,
    next: AtomicU64,
}

impl Superseded {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        self.keys.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mark(&self, key: &str) -> u64 {
        let generation = self.next.fetch_add(1, Ordering::SeqCst);
        self.lock().insert(key.to_string(), generation);
        generation
    }

    fn unmark(&self, key: &str) {
        self.lock().remove(key);
    }

    /// Only a delete issued for the latest marker may retire it
    fn retire(&self, key: &str, generation: u64) {
        let mut keys = self.lock();
        if keys.get(key) == Some(&generation) {
            keys.remove(key);
        }
    }

    fn generation(&self, key: &str) -> Option<u64> {
        self.lock().get(key).copied()
    }
}

#[derive(Default)]
pub(crate) struct LargeTier {
    store: RwLock<Option<Arc<dyn LargeItemStore>>>,
    queue: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    superseded: Arc<Superseded>,
}

impl LargeTier {
    /// Publish `store` and start its worker on the current runtime.
    /// Without a runtime the store still serves reads and async callers
    /// apply operations inline.
    pub(crate) fn attach(&self, store: Arc<dyn LargeItemStore>) {
        let sender = match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let (sender, receiver) = mpsc::unbounded_channel();
                handle.spawn(run_worker(store.clone(), self.superseded.clone(), receiver));
                Some(sender)
            }
            Err(_) => {
                warn!("No async runtime, large-item operations will not run in the background");
                None
            }
        };
        *self.store.write().unwrap_or_else(|e| e.into_inner()) = Some(store);
        *self.queue.lock().unwrap_or_else(|e| e.into_inner()) = sender;
    }

    pub(crate) fn store(&self) -> Option<Arc<dyn LargeItemStore>> {
        self.store.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.store().is_some()
    }

    /// Generation of the marker if `key`'s large copy must not be served
    pub(crate) fn superseded(&self, key: &str) -> Option<u64> {
        self.superseded.generation(key)
    }

    /// Build the op that writes `key`. The new large copy is authoritative
    /// from here on.
    pub(crate) fn put(&self, key: &str, raw: String) -> LargeOp {
        self.superseded.unmark(key);
        LargeOp::Put {
            key: key.to_string(),
            raw,
        }
    }

    /// Build the op that drops `key`. Reads miss from here on.
    pub(crate) fn supersede(&self, key: &str) -> LargeOp {
        LargeOp::Delete {
            key: key.to_string(),
            generation: Some(self.superseded.mark(key)),
        }
    }

    /// Queue `op` without waiting. A put that cannot be queued leaves the
    /// previous large copy behind, so the key is marked superseded.
    pub(crate) fn submit(&self, op: LargeOp) {
        if let Err(op) = self.enqueue(op, None) {
            match op {
                LargeOp::Put { key, .. } => {
                    warn!(key = %key, "Large-item queue unavailable, write skipped");
                    self.superseded.mark(&key);
                }
                _ => debug!("Large-item queue unavailable, operation skipped"),
            }
        }
    }

    /// Queue `op` and wait for the worker to apply it. Falls back to
    /// applying it directly when no worker is running.
    pub(crate) async fn run(&self, op: LargeOp) -> usize {
        let (done, applied) = oneshot::channel();
        let op = match self.enqueue(op, Some(done)) {
            Ok(()) => match applied.await {
                Ok(count) => return count,
                Err(_) => {
                    debug!("Large-item worker stopped before finishing an operation");
                    return 0;
                }
            },
            Err(op) => op,
        };
        let Some(store) = self.store() else {
            return 0;
        };
        apply(store.as_ref(), &self.superseded, op).await
    }

    fn enqueue(&self, op: LargeOp, done: Option<oneshot::Sender<usize>>) -> Result<(), LargeOp> {
        let queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        let Some(sender) = queue.as_ref() else {
            return Err(op);
        };
        sender.send(Job { op, done }).map_err(|e| e.0.op)
    }
}

async fn run_worker(
    store: Arc<dyn LargeItemStore>,
    superseded: Arc<Superseded>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
) {
    while let Some(job) = jobs.recv().await {
        let count = apply(store.as_ref(), &superseded, job.op).await;
        if let Some(done) = job.done {
            let _ = done.send(count);
        }
    }
    debug!("Large-item queue closed");
}

/// Returns how many records the operation wrote or removed.
async fn apply(store: &dyn LargeItemStore, superseded: &Superseded, op: LargeOp) -> usize {
    match op {
        LargeOp::Put { key, raw } => match store.put(&key, raw).await {
            Ok(()) => 1,
            Err(e) => {
                warn!(key = %key, error = %e, "Large-item write failed, entry kept in memory only");
                // Whatever copy is still on disk is older than memory
                superseded.mark(&key);
                0
            }
        },
        LargeOp::Delete { key, generation } => match store.delete(&key).await {
            Ok(()) => {
                if let Some(generation) = generation {
                    superseded.retire(&key, generation);
                }
                1
            }
            Err(e) => {
                debug!(key = %key, error = %e, "Large-item delete failed");
                0
            }
        },
        LargeOp::ClearPrefix { prefix } => {
            let keys = match store.keys().await {
                Ok(keys) => keys,
                Err(e) => {
                    warn!(prefix = %prefix, error = %e, "Failed to list large-item tier");
                    return 0;
                }
            };
            let mut removed = 0;
            for key in keys.iter().filter(|k| k.starts_with(&prefix)) {
                match store.delete(key).await {
                    Ok(()) => removed += 1,
                    Err(e) => debug!(key = %key, error = %e, "Large-item delete failed"),
                }
            }
            removed
        }
        LargeOp::Clear => match store.clear().await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(error = %e, "Failed to clear large-item tier");
                0
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryLargeStore;

    #[tokio::test]
    async fn test_operations_apply_in_issue_order() {
        let tier = LargeTier::default();
        let store = Arc::new(MemoryLargeStore::new());
        tier.attach(store.clone());

        tier.submit(tier.put("k", "v1".into()));
        tier.submit(tier.supersede("k"));
        tier.submit(tier.put("k", "v2".into()));
        tier.run(LargeOp::ClearPrefix { prefix: "none:".into() }).await;

        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v2"));
        assert_eq!(tier.superseded("k"), None);
    }

    #[tokio::test]
    async fn test_delete_retires_only_its_own_marker() {
        let tier = LargeTier::default();
        tier.attach(Arc::new(MemoryLargeStore::new()));

        let LargeOp::Delete { generation: Some(first), .. } = tier.supersede("k") else {
            panic!("supersede builds a delete");
        };
        let second = tier.supersede("k");
        tier.superseded.retire("k", first);
        assert!(tier.superseded("k").is_some());

        tier.run(second).await;
        assert_eq!(tier.superseded("k"), None);
    }

    #[test]
    fn test_put_without_worker_marks_key_superseded() {
        let tier = LargeTier::default();
        tier.submit(tier.put("k", "v".into()));
        assert!(tier.superseded("k").is_some());
    }

    #[tokio::test]
    async fn test_run_without_worker_applies_inline() {
        let tier = LargeTier::default();
        let store = Arc::new(MemoryLargeStore::new());
        *tier.store.write().unwrap() = Some(store.clone() as Arc<dyn LargeItemStore>);

        assert_eq!(tier.run(tier.put("k", "v".into())).await, 1);
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
    }
}
