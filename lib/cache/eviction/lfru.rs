//! Implements the LFRU eviction policy.
//!
//! A recency/frequency hybrid over inode ids: candidates are kept in
//! last-access order, and each access also bumps a small frequency count.
//! When memory pressure asks for bytes back, the worker walks from the cold
//! end; an entry with remaining frequency pays half of it and gets another
//! trip around instead of being evicted, so a frequently-read inode
//! survives longer than a one-shot scan of the same age.
//!
//! The tracker runs as a dedicated worker task fed by a bounded channel.
//! Senders never block and never lose messages to cancellation: they
//! `try_send` synchronously and fall back to a spawned send when the
//! channel is momentarily full.

use std::future::Future;

use hashlink::LinkedHashMap;
use tokio::sync::mpsc::{Receiver, Sender, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::trace;

use crate::fs::InodeId;

/// How the tracker sheds memory once it picks a victim.
pub trait EvictionDeleter: Send + Clone + 'static {
    /// Evict up to `max_bytes` from the given inode, returning what was
    /// actually freed.
    fn evict(&mut self, ino: InodeId, max_bytes: u64) -> impl Future<Output = u64> + Send;
}

#[derive(Debug, Clone, Copy)]
enum Message {
    /// An inode's buffers were touched.
    Accessed(InodeId),
    /// The inode left the table; stop tracking it.
    Forget(InodeId),
    /// Free roughly this many bytes.
    Cull(u64),
}

/// Per-entry eviction credit. Capped so a hot inode cannot build unbounded
/// immunity against future pressure.
const MAX_FREQUENCY: u32 = 8;

struct LfruWorker<D: EvictionDeleter> {
    receiver: Receiver<Message>,
    /// Iteration order is access order; the value is the frequency credit.
    entries: LinkedHashMap<InodeId, u32>,
    deleter: D,
}

impl<D: EvictionDeleter> LfruWorker<D> {
    fn spawn_task(deleter: D, receiver: Receiver<Message>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut worker = Self {
                receiver,
                entries: LinkedHashMap::new(),
                deleter,
            };
            while let Some(msg) = worker.receiver.recv().await {
                worker.service_message(msg).await;
            }
        })
    }

    async fn service_message(&mut self, message: Message) {
        match message {
            Message::Accessed(ino) => {
                let hits = self.entries.remove(&ino).unwrap_or(0);
                self.entries.insert(ino, (hits + 1).min(MAX_FREQUENCY));
            }
            Message::Forget(ino) => {
                self.entries.remove(&ino);
            }
            Message::Cull(mut wanted) => {
                // Bounded by the current population: every entry gets at
                // most a handful of second chances before the round ends.
                let mut budget = self
                    .entries
                    .len()
                    .saturating_mul(MAX_FREQUENCY as usize + 1);
                while wanted > 0 && budget > 0 {
                    let Some((ino, hits)) = self.entries.pop_front() else {
                        break;
                    };
                    budget -= 1;
                    if hits > 1 {
                        // Frequency buys another trip around the ring.
                        self.entries.insert(ino, hits / 2);
                        continue;
                    }
                    let freed = self.deleter.evict(ino, wanted).await;
                    trace!(ino, freed, "lfru eviction");
                    wanted = wanted.saturating_sub(freed.max(1));
                    // The inode may be touched again later; it re-enters
                    // the map on its next access.
                }
            }
        }
    }
}

/// Handle for feeding the eviction worker.
#[derive(Debug)]
pub struct LfruTracker {
    sender: Sender<Message>,
}

impl LfruTracker {
    /// Spawn the worker task. Must be called within a tokio runtime.
    pub fn spawn<D: EvictionDeleter>(deleter: D) -> Self {
        let (tx, rx) = tokio::sync::mpsc::channel(1024);
        let _worker = LfruWorker::spawn_task(deleter, rx);
        Self { sender: tx }
    }

    fn send(&self, msg: Message) {
        match self.sender.try_send(msg) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(msg)) => {
                let sender = self.sender.clone();
                tokio::spawn(async move {
                    let _ = sender.send(msg).await;
                });
            }
        }
    }

    /// Record an access to an inode's buffers.
    pub fn access(&self, ino: InodeId) {
        self.send(Message::Accessed(ino));
    }

    /// Stop tracking an inode that left the table.
    pub fn forget(&self, ino: InodeId) {
        self.send(Message::Forget(ino));
    }

    /// Request that roughly `bytes` of buffer memory be shed.
    pub fn cull(&self, bytes: u64) {
        self.send(Message::Cull(bytes));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;

    /// Records evictions instead of performing them.
    #[derive(Clone, Default)]
    struct RecordingDeleter {
        evicted: Arc<Mutex<Vec<InodeId>>>,
    }

    impl EvictionDeleter for RecordingDeleter {
        async fn evict(&mut self, ino: InodeId, _max_bytes: u64) -> u64 {
            self.evicted.lock().expect("lock").push(ino);
            4096
        }
    }

    async fn drain() {
        // Give the worker task a chance to process queued messages.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cull_evicts_coldest_first() {
        let deleter = RecordingDeleter::default();
        let tracker = LfruTracker::spawn(deleter.clone());

        tracker.access(1);
        tracker.access(2);
        tracker.access(3);
        tracker.cull(4096);
        drain().await;

        let evicted = deleter.evicted.lock().expect("lock").clone();
        assert_eq!(evicted, vec![1], "oldest single-access entry goes first");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn frequency_buys_survival() {
        let deleter = RecordingDeleter::default();
        let tracker = LfruTracker::spawn(deleter.clone());

        tracker.access(1);
        tracker.access(1);
        tracker.access(1);
        tracker.access(2);
        // Entry 1 is older but hot; entry 2 is cold.
        tracker.cull(4096);
        drain().await;

        let evicted = deleter.evicted.lock().expect("lock").clone();
        assert_eq!(evicted, vec![2], "the cold entry should lose");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn forgotten_inodes_are_not_evicted() {
        let deleter = RecordingDeleter::default();
        let tracker = LfruTracker::spawn(deleter.clone());

        tracker.access(1);
        tracker.forget(1);
        tracker.cull(4096);
        drain().await;

        assert!(
            deleter.evicted.lock().expect("lock").is_empty(),
            "a forgotten inode must never be handed to the deleter"
        );
    }
}
